//! Derived views over the store
//!
//! Views are pure functions of the store and the session identity; nothing
//! here is cached, so a view can never go stale relative to the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::services::addresses::is_own_address;
use crate::sync::store::ConversationStore;
use crate::types::error::InboxError;
use crate::types::{Conversation, MessageSource, SessionIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewFilter {
    /// Everything not archived
    #[default]
    Default,
    Unread,
    Unassigned,
    AssignedToMe,
    Snoozed,
    /// Conversations containing a message sent by the current user
    Sent,
    Archived,
}

impl ViewFilter {
    pub const ALL: [ViewFilter; 7] = [
        ViewFilter::Default,
        ViewFilter::Unread,
        ViewFilter::Unassigned,
        ViewFilter::AssignedToMe,
        ViewFilter::Snoozed,
        ViewFilter::Sent,
        ViewFilter::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewFilter::Default => "default",
            ViewFilter::Unread => "unread",
            ViewFilter::Unassigned => "unassigned",
            ViewFilter::AssignedToMe => "assigned_to_me",
            ViewFilter::Snoozed => "snoozed",
            ViewFilter::Sent => "sent",
            ViewFilter::Archived => "archived",
        }
    }
}

impl fmt::Display for ViewFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewFilter {
    type Err = InboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ViewFilter::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| InboxError::InvalidInput(format!("Unknown view: {}", s)))
    }
}

/// Whether `conversation` belongs in `filter` for the given user
pub fn matches(conversation: &Conversation, filter: ViewFilter, identity: &SessionIdentity) -> bool {
    match filter {
        ViewFilter::Archived => conversation.is_archived,
        ViewFilter::Sent => sent_by(conversation, identity),
        _ if conversation.is_archived => false,
        ViewFilter::Default => true,
        ViewFilter::Unread => conversation.messages.iter().any(|m| m.is_unread()),
        ViewFilter::Unassigned => conversation.assigned_to.is_none(),
        ViewFilter::AssignedToMe => {
            conversation.assigned_to.as_deref() == Some(identity.user_id())
        }
        ViewFilter::Snoozed => conversation.snoozed,
    }
}

fn sent_by(conversation: &Conversation, identity: &SessionIdentity) -> bool {
    let own = identity.own_addresses();
    conversation
        .messages
        .iter()
        .any(|m| m.source == MessageSource::Outgoing && is_own_address(&m.from, &own))
}

/// Conversations in `filter`, most recent first
pub fn filter<'a>(
    store: &'a ConversationStore,
    filter: ViewFilter,
    identity: &SessionIdentity,
) -> Vec<&'a Conversation> {
    store
        .conversations()
        .filter(|c| matches(c, filter, identity))
        .collect()
}

/// Size of every view, for status lines and badges
pub fn counts(store: &ConversationStore, identity: &SessionIdentity) -> Vec<(ViewFilter, usize)> {
    ViewFilter::ALL
        .into_iter()
        .map(|f| (f, filter(store, f, identity).len()))
        .collect()
}
