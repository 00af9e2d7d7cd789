pub mod conversation;
pub mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub use conversation::{Conversation, ConversationStatus, Message, MessageFlags, MessageSource, Priority};

/// Prefix that marks a locally generated id. Server ids never carry it.
pub const TEMP_ID_PREFIX: &str = "tmp_";

/// Generate a fresh temporary id for a staged entity
pub fn new_temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4().simple())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Roster reference. Owned by the roster service, only referenced here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Teammate {
    pub id: String,
    pub name: String,
}

/// Represents a message or comment attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub id: Option<String>,
    pub filename: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub url: Option<String>,
}

/// Internal annotation on a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub message_id: String,
    /// Teammate id of the author
    pub author: String,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub mentions: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub is_internal: bool,
}

impl Comment {
    pub fn is_pending(&self) -> bool {
        is_temp_id(&self.id)
    }
}

fn default_true() -> bool {
    true
}

/// Identity of the signed-in teammate for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub tenant_id: String,
    pub teammate: Teammate,
    /// Primary sending address
    pub email: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl SessionIdentity {
    pub fn user_id(&self) -> &str {
        &self.teammate.id
    }

    /// Every address that counts as "me" when building recipients or views
    pub fn own_addresses(&self) -> Vec<String> {
        let mut addrs = Vec::with_capacity(1 + self.aliases.len());
        addrs.push(self.email.clone());
        addrs.extend(self.aliases.iter().cloned());
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_ids_are_distinguishable() {
        let a = new_temp_id();
        let b = new_temp_id();
        assert!(is_temp_id(&a));
        assert_ne!(a, b);
        assert!(!is_temp_id("42"));
        assert!(!is_temp_id("msg_tmp_1"));
    }

    #[test]
    fn test_comment_defaults_internal() {
        let comment: Comment = serde_json::from_str(
            r#"{"id":"k1","message_id":"m1","author":"u1","timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(comment.is_internal);
        assert!(!comment.is_pending());
    }
}
