use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{is_temp_id, Attachment};

/// Lifecycle status of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Open,
    Pending,
    Closed,
    Spam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A thread-level grouping of messages sharing one `thread_id`
///
/// `last_message` and `last_activity` are not stored: they are computed from the
/// tail of `messages`, so they can never disagree with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub subject: String,
    /// Chronological, non-decreasing by timestamp
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub participants: BTreeSet<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Teammate id, resolved by the roster owner
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub snoozed: bool,
    #[serde(default)]
    pub snooze_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            subject: String::new(),
            messages: Vec::new(),
            participants: BTreeSet::new(),
            tags: Vec::new(),
            assigned_to: None,
            status: ConversationStatus::Open,
            priority: Priority::Normal,
            snoozed: false,
            snooze_until: None,
            is_archived: false,
            created_at: None,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Timestamp of the newest message, falling back to creation time
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message()
            .map(|m| m.timestamp)
            .or(self.created_at)
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    /// Insert keeping chronological order; equal timestamps keep arrival order.
    /// Returns the index the message landed at.
    pub(crate) fn insert_message_ordered(&mut self, message: Message) -> usize {
        let idx = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(idx, message);
        idx
    }

    pub(crate) fn remove_message(&mut self, message_id: &str) -> Option<Message> {
        let idx = self.messages.iter().position(|m| m.id == message_id)?;
        Some(self.messages.remove(idx))
    }

    /// Stable sort so messages delivered with identical timestamps keep their order
    pub(crate) fn sort_messages(&mut self) {
        self.messages.sort_by_key(|m| m.timestamp);
    }

    pub fn has_pending_messages(&self) -> bool {
        self.messages.iter().any(|m| m.is_pending())
    }
}

/// Where a message came from relative to the team inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    #[default]
    Incoming,
    Outgoing,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageFlags {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    /// RFC 5322 Message-ID
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub html_content: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub flags: MessageFlags,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub source: MessageSource,
}

impl Message {
    /// True while this is a locally staged message awaiting confirmation
    pub fn is_pending(&self) -> bool {
        is_temp_id(&self.id)
    }

    pub fn is_unread(&self) -> bool {
        !self.flags.read && self.source == MessageSource::Incoming
    }
}
