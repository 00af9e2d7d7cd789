//! Canonical in-memory model of conversations, messages and comments
//!
//! Invariants held by every mutator:
//! - one conversation per id and per thread id
//! - a message id appears at most once across the whole store
//! - messages never move between conversations
//! - a conversation's messages stay chronologically ordered
//! - a comment id appears at most once across the whole store
//!
//! Mutators are crate-private; the [`Reconciler`](crate::sync::reconciler::Reconciler)
//! is the only writer.

use std::collections::HashMap;

use crate::types::error::{InboxError, Result};
use crate::types::{Comment, Conversation, Message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConversationInsert {
    /// Inserted at the head. `dropped` messages were already owned elsewhere.
    Inserted { dropped: usize },
    Duplicate,
    /// Another conversation already owns the thread id
    ThreadConflict { owner: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MessageInsert {
    Inserted { conversation_id: String },
    Duplicate { conversation_id: String },
    UnknownThread,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MergeResult {
    pub fields_changed: bool,
    pub messages_added: usize,
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<String, Conversation>,
    /// Conversation ids, most recent first
    order: Vec<String>,
    by_thread: HashMap<String, String>,
    /// message id -> owning conversation id
    message_index: HashMap<String, String>,
    /// message id -> comments in timestamp order
    comments: HashMap<String, Vec<Comment>>,
    /// comment id -> message id
    comment_index: HashMap<String, String>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn conversation_by_thread(&self, thread_id: &str) -> Option<&Conversation> {
        self.by_thread
            .get(thread_id)
            .and_then(|id| self.conversations.get(id))
    }

    /// All conversations, most recent first
    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> + '_ {
        self.order.iter().filter_map(|id| self.conversations.get(id))
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.message_index.contains_key(message_id)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        let conv_id = self.message_index.get(message_id)?;
        self.conversations.get(conv_id)?.message(message_id)
    }

    /// Id of the conversation that owns `message_id`
    pub fn conversation_of_message(&self, message_id: &str) -> Option<&str> {
        self.message_index.get(message_id).map(String::as_str)
    }

    pub fn message_count(&self) -> usize {
        self.message_index.len()
    }

    pub fn comments(&self, message_id: &str) -> &[Comment] {
        self.comments
            .get(message_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn comment_count(&self, message_id: &str) -> usize {
        self.comments(message_id).len()
    }

    pub fn contains_comment(&self, comment_id: &str) -> bool {
        self.comment_index.contains_key(comment_id)
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn insert_conversation(&mut self, mut conversation: Conversation) -> ConversationInsert {
        if self.conversations.contains_key(&conversation.id) {
            return ConversationInsert::Duplicate;
        }
        if let Some(owner) = self.by_thread.get(&conversation.thread_id) {
            return ConversationInsert::ThreadConflict {
                owner: owner.clone(),
            };
        }

        let incoming = std::mem::take(&mut conversation.messages);
        let total = incoming.len();
        let mut seen = std::collections::HashSet::new();
        for mut message in incoming {
            if self.message_index.contains_key(&message.id) || !seen.insert(message.id.clone()) {
                continue;
            }
            message.thread_id = conversation.thread_id.clone();
            conversation.messages.push(message);
        }
        conversation.sort_messages();
        let dropped = total - conversation.messages.len();

        for message in &conversation.messages {
            self.message_index
                .insert(message.id.clone(), conversation.id.clone());
        }
        self.by_thread
            .insert(conversation.thread_id.clone(), conversation.id.clone());
        self.order.insert(0, conversation.id.clone());
        self.conversations
            .insert(conversation.id.clone(), conversation);

        ConversationInsert::Inserted { dropped }
    }

    /// Insert into the conversation owning `message.thread_id`
    pub(crate) fn insert_message(&mut self, message: Message) -> MessageInsert {
        if let Some(owner) = self.message_index.get(&message.id) {
            return MessageInsert::Duplicate {
                conversation_id: owner.clone(),
            };
        }
        let Some(conv_id) = self.by_thread.get(&message.thread_id).cloned() else {
            return MessageInsert::UnknownThread;
        };
        let Some(conversation) = self.conversations.get_mut(&conv_id) else {
            return MessageInsert::UnknownThread;
        };

        let message_id = message.id.clone();
        let idx = conversation.insert_message_ordered(message);
        let became_tail = idx + 1 == conversation.messages.len();
        self.message_index.insert(message_id, conv_id.clone());
        if became_tail {
            self.touch(&conv_id);
        }

        MessageInsert::Inserted {
            conversation_id: conv_id,
        }
    }

    pub(crate) fn remove_message(&mut self, message_id: &str) -> Option<Message> {
        let conv_id = self.message_index.remove(message_id)?;
        self.conversations
            .get_mut(&conv_id)
            .and_then(|c| c.remove_message(message_id))
    }

    /// Patch mutable fields and merge in messages the store has not seen
    ///
    /// Local messages missing from `incoming` are kept: listings may be partial
    /// and staged messages are never part of a server payload.
    pub(crate) fn merge_conversation(&mut self, incoming: Conversation) -> Result<MergeResult> {
        let existing = self
            .conversations
            .get_mut(&incoming.id)
            .ok_or_else(|| InboxError::ConversationNotFound(incoming.id.clone()))?;

        if existing.thread_id != incoming.thread_id {
            return Err(InboxError::Consistency(format!(
                "conversation {} moved from thread {} to {}",
                incoming.id, existing.thread_id, incoming.thread_id
            )));
        }

        let mut result = MergeResult::default();
        let before = (
            existing.subject.clone(),
            existing.participants.clone(),
            existing.tags.clone(),
            existing.assigned_to.clone(),
            existing.status,
            existing.priority,
            existing.snoozed,
            existing.snooze_until,
            existing.is_archived,
        );

        if !incoming.subject.is_empty() {
            existing.subject = incoming.subject;
        }
        existing.participants = incoming.participants;
        existing.tags = incoming.tags;
        existing.assigned_to = incoming.assigned_to;
        existing.status = incoming.status;
        existing.priority = incoming.priority;
        existing.snoozed = incoming.snoozed;
        existing.snooze_until = incoming.snooze_until;
        existing.is_archived = incoming.is_archived;
        if incoming.created_at.is_some() {
            existing.created_at = incoming.created_at;
        }

        result.fields_changed = before
            != (
                existing.subject.clone(),
                existing.participants.clone(),
                existing.tags.clone(),
                existing.assigned_to.clone(),
                existing.status,
                existing.priority,
                existing.snoozed,
                existing.snooze_until,
                existing.is_archived,
            );

        let thread_id = existing.thread_id.clone();
        for mut message in incoming.messages {
            message.thread_id = thread_id.clone();
            if let MessageInsert::Inserted { .. } = self.insert_message(message) {
                result.messages_added += 1;
            }
        }

        Ok(result)
    }

    /// Set the assignee, returning the previous one
    pub(crate) fn set_assignment(
        &mut self,
        conversation_id: &str,
        assignee: Option<String>,
    ) -> Result<Option<String>> {
        let conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| InboxError::ConversationNotFound(conversation_id.to_string()))?;
        Ok(std::mem::replace(&mut conversation.assigned_to, assignee))
    }

    /// Returns false if a comment with this id already exists
    pub(crate) fn insert_comment(&mut self, comment: Comment) -> bool {
        if self.comment_index.contains_key(&comment.id) {
            return false;
        }
        self.comment_index
            .insert(comment.id.clone(), comment.message_id.clone());
        let list = self.comments.entry(comment.message_id.clone()).or_default();
        let idx = list.partition_point(|c| c.timestamp <= comment.timestamp);
        list.insert(idx, comment);
        true
    }

    pub(crate) fn remove_comment(&mut self, comment_id: &str) -> Option<Comment> {
        let message_id = self.comment_index.remove(comment_id)?;
        let list = self.comments.get_mut(&message_id)?;
        let idx = list.iter().position(|c| c.id == comment_id)?;
        let removed = list.remove(idx);
        if list.is_empty() {
            self.comments.remove(&message_id);
        }
        Some(removed)
    }

    /// Ids ranked ahead of a conversation in the recency order
    pub(crate) fn ranked_ahead_of(&self, conversation_id: &str) -> Option<Vec<String>> {
        let pos = self.order.iter().position(|id| id == conversation_id)?;
        Some(self.order[..pos].to_vec())
    }

    /// Move a conversation back behind every id in `ahead`
    ///
    /// Conversations already ranked ahead of it stay ahead, so anything touched
    /// in the meantime keeps its place.
    pub(crate) fn place_after(&mut self, conversation_id: &str, ahead: &[String]) {
        let Some(pos) = self.order.iter().position(|id| id == conversation_id) else {
            return;
        };
        let id = self.order.remove(pos);
        let target = self
            .order
            .iter()
            .enumerate()
            .filter(|(_, other)| ahead.contains(*other))
            .map(|(idx, _)| idx + 1)
            .fold(pos, usize::max);
        self.order.insert(target, id);
    }

    /// Move a conversation to the head of the recency order
    fn touch(&mut self, conversation_id: &str) {
        if let Some(pos) = self.order.iter().position(|id| id == conversation_id) {
            if pos != 0 {
                let id = self.order.remove(pos);
                self.order.insert(0, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageFlags, MessageSource};
    use chrono::{TimeZone, Utc};

    fn msg(id: &str, thread: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            thread_id: thread.to_string(),
            message_id: None,
            from: "alice@client.com".to_string(),
            to: vec![],
            cc: vec![],
            content: String::new(),
            html_content: None,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            flags: MessageFlags::default(),
            attachments: vec![],
            in_reply_to: None,
            source: MessageSource::Incoming,
        }
    }

    fn comment(id: &str, message_id: &str, secs: i64) -> Comment {
        Comment {
            id: id.to_string(),
            message_id: message_id.to_string(),
            author: "u1".to_string(),
            content: "note".to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            attachments: vec![],
            mentions: Default::default(),
            is_internal: true,
        }
    }

    #[test]
    fn test_insert_conversation_is_idempotent() {
        let mut store = ConversationStore::new();
        assert_eq!(
            store.insert_conversation(Conversation::new("c1", "t1")),
            ConversationInsert::Inserted { dropped: 0 }
        );
        assert_eq!(
            store.insert_conversation(Conversation::new("c1", "t1")),
            ConversationInsert::Duplicate
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_thread_has_single_owner() {
        let mut store = ConversationStore::new();
        store.insert_conversation(Conversation::new("c1", "t1"));
        assert_eq!(
            store.insert_conversation(Conversation::new("c2", "t1")),
            ConversationInsert::ThreadConflict {
                owner: "c1".to_string()
            }
        );
        assert!(store.conversation("c2").is_none());
    }

    #[test]
    fn test_embedded_messages_deduplicated_globally() {
        let mut store = ConversationStore::new();
        let mut c1 = Conversation::new("c1", "t1");
        c1.messages.push(msg("m1", "t1", 10));
        store.insert_conversation(c1);

        let mut c2 = Conversation::new("c2", "t2");
        c2.messages.push(msg("m1", "t2", 10));
        c2.messages.push(msg("m2", "t2", 20));
        assert_eq!(
            store.insert_conversation(c2),
            ConversationInsert::Inserted { dropped: 1 }
        );
        assert_eq!(store.conversation_of_message("m1"), Some("c1"));
        assert_eq!(store.conversation("c2").unwrap().messages.len(), 1);
    }

    #[test]
    fn test_insert_message_orders_and_dedups() {
        let mut store = ConversationStore::new();
        store.insert_conversation(Conversation::new("c1", "t1"));
        store.insert_message(msg("m2", "t1", 20));
        store.insert_message(msg("m1", "t1", 10));
        store.insert_message(msg("m3", "t1", 30));
        assert!(matches!(
            store.insert_message(msg("m1", "t1", 10)),
            MessageInsert::Duplicate { .. }
        ));

        let conv = store.conversation("c1").unwrap();
        let ids: Vec<&str> = conv.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(conv.last_message().unwrap().id, "m3");
        assert_eq!(store.message_count(), 3);
    }

    #[test]
    fn test_unknown_thread() {
        let mut store = ConversationStore::new();
        assert_eq!(store.insert_message(msg("m1", "t9", 1)), MessageInsert::UnknownThread);
        assert!(!store.contains_message("m1"));
    }

    #[test]
    fn test_new_tail_moves_conversation_to_head() {
        let mut store = ConversationStore::new();
        store.insert_conversation(Conversation::new("c1", "t1"));
        store.insert_conversation(Conversation::new("c2", "t2"));
        let order: Vec<&str> = store.conversations().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["c2", "c1"]);

        store.insert_message(msg("m1", "t1", 10));
        let order: Vec<&str> = store.conversations().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["c1", "c2"]);
    }

    #[test]
    fn test_place_after_restores_recency() {
        let mut store = ConversationStore::new();
        store.insert_conversation(Conversation::new("c1", "t1"));
        store.insert_conversation(Conversation::new("c2", "t2"));
        let ahead = store.ranked_ahead_of("c1").unwrap();
        assert_eq!(ahead, vec!["c2"]);

        store.insert_message(msg("m1", "t1", 10));
        store.insert_conversation(Conversation::new("c3", "t3"));
        let order: Vec<&str> = store.conversations().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["c3", "c1", "c2"]);

        store.place_after("c1", &ahead);
        let order: Vec<&str> = store.conversations().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["c3", "c2", "c1"]);

        // already behind everything it followed before
        store.place_after("c1", &ahead);
        let order: Vec<&str> = store.conversations().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["c3", "c2", "c1"]);
    }

    #[test]
    fn test_merge_patches_fields_and_messages() {
        let mut store = ConversationStore::new();
        let mut c1 = Conversation::new("c1", "t1");
        c1.messages.push(msg("m1", "t1", 10));
        store.insert_conversation(c1);

        let mut update = Conversation::new("c1", "t1");
        update.assigned_to = Some("u7".to_string());
        update.messages.push(msg("m1", "t1", 10));
        update.messages.push(msg("m2", "t1", 20));
        let result = store.merge_conversation(update).unwrap();
        assert!(result.fields_changed);
        assert_eq!(result.messages_added, 1);

        let conv = store.conversation("c1").unwrap();
        assert_eq!(conv.assigned_to.as_deref(), Some("u7"));
        assert_eq!(conv.messages.len(), 2);
    }

    #[test]
    fn test_merge_rejects_thread_change() {
        let mut store = ConversationStore::new();
        store.insert_conversation(Conversation::new("c1", "t1"));
        let err = store.merge_conversation(Conversation::new("c1", "t2")).unwrap_err();
        assert!(matches!(err, InboxError::Consistency(_)));
    }

    #[test]
    fn test_comments_dedup_and_remove() {
        let mut store = ConversationStore::new();
        assert!(store.insert_comment(comment("k2", "m1", 20)));
        assert!(store.insert_comment(comment("k1", "m1", 10)));
        assert!(!store.insert_comment(comment("k1", "m1", 10)));
        let ids: Vec<&str> = store.comments("m1").iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["k1", "k2"]);

        assert!(store.remove_comment("k1").is_some());
        assert!(store.remove_comment("k1").is_none());
        assert_eq!(store.comment_count("m1"), 1);
    }
}
