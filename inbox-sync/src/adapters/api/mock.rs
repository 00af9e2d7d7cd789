use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::InboxApi;
use crate::sync::codec::{ConversationPatch, CreateCommentRequest, CreateMessageRequest, CreatedMessage};
use crate::types::error::{InboxError, Result};
use crate::types::{Comment, Conversation, Message, MessageFlags, MessageSource};

/// In-memory server double
#[derive(Default)]
pub struct MockApi {
    /// Returned by `list_conversations`, also patched by `update_conversation`
    pub listing: Mutex<Vec<Conversation>>,
    /// Returned by `fetch_conversation`, keyed by thread id
    pub fetchable: Mutex<HashMap<String, Conversation>>,
    pub comments: Mutex<HashMap<String, Vec<Comment>>>,
    pub fail_commits: AtomicBool,
    pub calls: Mutex<Vec<String>>,
    pub tenant: Mutex<String>,
    next_id: AtomicU64,
}

impl MockApi {
    pub fn with_listing(listing: Vec<Conversation>) -> Self {
        Self {
            listing: Mutex::new(listing),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn server_id(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check_failure(&self) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(InboxError::Network("HTTP 500".to_string()));
        }
        Ok(())
    }
}

impl InboxApi for MockApi {
    async fn create_message(&self, request: CreateMessageRequest) -> Result<CreatedMessage> {
        self.record("create_message");
        self.check_failure()?;
        let message = Message {
            id: self.server_id("srv_m"),
            thread_id: request.thread_id,
            message_id: None,
            from: request.from,
            to: request.to,
            cc: request.cc,
            content: request.content,
            html_content: request.html_content,
            timestamp: Utc::now(),
            flags: MessageFlags {
                read: true,
                ..MessageFlags::default()
            },
            attachments: vec![],
            in_reply_to: request.in_reply_to,
            source: MessageSource::Outgoing,
        };
        Ok(CreatedMessage {
            message,
            conversation: None,
        })
    }

    async fn create_comment(&self, request: CreateCommentRequest) -> Result<Comment> {
        self.record("create_comment");
        self.check_failure()?;
        Ok(Comment {
            id: self.server_id("srv_k"),
            message_id: request.message_id,
            author: "u1".to_string(),
            content: request.content,
            timestamp: Utc::now(),
            attachments: vec![],
            mentions: request.mentions,
            is_internal: true,
        })
    }

    async fn update_conversation(
        &self,
        conversation_id: String,
        patch: ConversationPatch,
    ) -> Result<Conversation> {
        self.record("update_conversation");
        self.check_failure()?;
        let mut listing = self.listing.lock().unwrap();
        let conversation = listing
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or(InboxError::ConversationNotFound(conversation_id))?;
        conversation.assigned_to = patch.assigned_to;
        Ok(conversation.clone())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.record("list_conversations");
        Ok(self.listing.lock().unwrap().clone())
    }

    async fn fetch_conversation(&self, thread_id: String) -> Result<Option<Conversation>> {
        self.record("fetch_conversation");
        Ok(self.fetchable.lock().unwrap().get(&thread_id).cloned())
    }

    async fn list_comments(&self, message_id: String) -> Result<Vec<Comment>> {
        self.record("list_comments");
        Ok(self
            .comments
            .lock()
            .unwrap()
            .get(&message_id)
            .cloned()
            .unwrap_or_default())
    }

    fn set_tenant(&self, tenant_id: &str) {
        *self.tenant.lock().unwrap() = tenant_id.to_string();
    }
}
