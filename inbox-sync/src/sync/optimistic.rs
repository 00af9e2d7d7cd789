//! Optimistic local mutations
//!
//! A mutation is staged in the store under a temporary id, committed through
//! the REST collaborator, then either replaced by the server's confirmed
//! entity or rolled back. Every step runs on the reconciler's write path, so
//! a reader sees the staged entity or the confirmed one, never both and never
//! neither.

use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::services::recipients::{explicit_recipients, reply_recipients, Recipients, ReplyMode};
use crate::sync::codec::{ConversationPatch, CreateCommentRequest, CreateMessageRequest, CreatedMessage};
use crate::sync::reconciler::Reconciler;
use crate::sync::store::{ConversationStore, MessageInsert};
use crate::types::error::{InboxError, Result};
use crate::types::{
    is_temp_id, new_temp_id, Comment, Conversation, Message, MessageFlags, MessageSource,
    SessionIdentity,
};

/// One reversible change to the store
pub trait StagedMutation: Send {
    /// Authoritative entity returned by the server on success
    type Confirmed: Clone + Send;

    fn operation(&self) -> &'static str;

    /// Identifies the staged entity while it is in flight. Two mutations with
    /// the same key never run at once.
    fn key(&self) -> String;

    fn stage(&mut self, store: &mut ConversationStore) -> Result<()>;

    /// Swap the staged entity for the confirmed one
    fn confirm(&mut self, store: &mut ConversationStore, confirmed: Self::Confirmed) -> Result<()>;

    /// Undo `stage`, leaving the store as it was before
    fn rollback(&mut self, store: &mut ConversationStore);
}

/// Internal comment staged on a message
#[derive(Debug, Clone)]
pub struct StagedComment {
    temp: Comment,
}

impl StagedComment {
    pub fn new(
        message_id: &str,
        author: &str,
        content: &str,
        mentions: BTreeSet<String>,
    ) -> (Self, CreateCommentRequest) {
        let temp = Comment {
            id: new_temp_id(),
            message_id: message_id.to_string(),
            author: author.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            attachments: Vec::new(),
            mentions: mentions.clone(),
            is_internal: true,
        };
        let request = CreateCommentRequest {
            message_id: message_id.to_string(),
            content: content.to_string(),
            mentions,
        };
        (Self { temp }, request)
    }

    pub fn temp(&self) -> &Comment {
        &self.temp
    }
}

impl StagedMutation for StagedComment {
    type Confirmed = Comment;

    fn operation(&self) -> &'static str {
        "add_comment"
    }

    fn key(&self) -> String {
        self.temp.id.clone()
    }

    fn stage(&mut self, store: &mut ConversationStore) -> Result<()> {
        let message_id = &self.temp.message_id;
        if is_temp_id(message_id) {
            return Err(InboxError::InvalidInput(
                "Cannot comment on a message that is still sending".to_string(),
            ));
        }
        if !store.contains_message(message_id) {
            return Err(InboxError::MessageNotFound(message_id.clone()));
        }
        if !store.insert_comment(self.temp.clone()) {
            return Err(InboxError::Consistency(format!(
                "temporary comment id {} already in use",
                self.temp.id
            )));
        }
        Ok(())
    }

    fn confirm(&mut self, store: &mut ConversationStore, confirmed: Comment) -> Result<()> {
        store.remove_comment(&self.temp.id);
        if confirmed.message_id != self.temp.message_id {
            return Err(InboxError::Consistency(format!(
                "comment {} confirmed on message {} instead of {}",
                confirmed.id, confirmed.message_id, self.temp.message_id
            )));
        }
        // false when the push channel delivered it first
        store.insert_comment(confirmed);
        Ok(())
    }

    fn rollback(&mut self, store: &mut ConversationStore) {
        store.remove_comment(&self.temp.id);
    }
}

/// Outgoing message or reply staged at the tail of a conversation
#[derive(Debug, Clone)]
pub struct StagedMessage {
    temp: Message,
    displaced: Option<Displaced>,
}

/// Recency slot a conversation held before a staged message moved it up
#[derive(Debug, Clone)]
struct Displaced {
    conversation_id: String,
    ahead: Vec<String>,
    tail: Option<String>,
}

impl StagedMessage {
    /// Stage a reply to `original` within `conversation`
    pub fn reply(
        conversation: &Conversation,
        original: &Message,
        content: &str,
        mode: ReplyMode,
        identity: &SessionIdentity,
    ) -> Result<(Self, CreateMessageRequest)> {
        let recipients = reply_recipients(original, mode, &identity.own_addresses());
        let reference = original.message_id.clone().or_else(|| Some(original.id.clone()));
        Self::build(conversation, recipients, content, reference, identity)
    }

    /// Stage a new message to explicit recipients within `conversation`
    pub fn compose(
        conversation: &Conversation,
        to: &[String],
        cc: &[String],
        content: &str,
        identity: &SessionIdentity,
    ) -> Result<(Self, CreateMessageRequest)> {
        let recipients = explicit_recipients(to, cc, &identity.own_addresses());
        let reference = conversation
            .last_message()
            .and_then(|m| m.message_id.clone());
        Self::build(conversation, recipients, content, reference, identity)
    }

    fn build(
        conversation: &Conversation,
        recipients: Recipients,
        content: &str,
        in_reply_to: Option<String>,
        identity: &SessionIdentity,
    ) -> Result<(Self, CreateMessageRequest)> {
        if recipients.is_empty() {
            return Err(InboxError::InvalidInput("Message has no recipients".to_string()));
        }
        if content.trim().is_empty() {
            return Err(InboxError::InvalidInput("Message body is empty".to_string()));
        }

        // never sort before the current tail, even with a lagging local clock
        let now = Utc::now();
        let timestamp = conversation.last_activity().map_or(now, |t| t.max(now));

        let temp = Message {
            id: new_temp_id(),
            thread_id: conversation.thread_id.clone(),
            message_id: None,
            from: identity.email.clone(),
            to: recipients.to.clone(),
            cc: recipients.cc.clone(),
            content: content.to_string(),
            html_content: None,
            timestamp,
            flags: MessageFlags {
                read: true,
                ..MessageFlags::default()
            },
            attachments: Vec::new(),
            in_reply_to: in_reply_to.clone(),
            source: MessageSource::Outgoing,
        };
        let request = CreateMessageRequest {
            thread_id: conversation.thread_id.clone(),
            from: identity.email.clone(),
            to: recipients.to,
            cc: recipients.cc,
            subject: reply_subject(&conversation.subject),
            content: content.to_string(),
            html_content: None,
            in_reply_to,
        };
        Ok((
            Self {
                temp,
                displaced: None,
            },
            request,
        ))
    }

    pub fn temp(&self) -> &Message {
        &self.temp
    }
}

fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.get(..3).map_or(false, |p| p.eq_ignore_ascii_case("re:")) {
        trimmed.to_string()
    } else {
        format!("Re: {}", trimmed)
    }
}

impl StagedMutation for StagedMessage {
    type Confirmed = CreatedMessage;

    fn operation(&self) -> &'static str {
        "send_message"
    }

    fn key(&self) -> String {
        self.temp.id.clone()
    }

    fn stage(&mut self, store: &mut ConversationStore) -> Result<()> {
        let displaced = store
            .conversation_by_thread(&self.temp.thread_id)
            .and_then(|conv| {
                let ahead = store.ranked_ahead_of(&conv.id)?;
                Some(Displaced {
                    conversation_id: conv.id.clone(),
                    ahead,
                    tail: conv.last_message().map(|m| m.id.clone()),
                })
            })
            .filter(|d| !d.ahead.is_empty());

        match store.insert_message(self.temp.clone()) {
            MessageInsert::Inserted { .. } => {
                self.displaced = displaced;
                Ok(())
            }
            MessageInsert::UnknownThread => {
                Err(InboxError::ConversationNotFound(self.temp.thread_id.clone()))
            }
            MessageInsert::Duplicate { .. } => Err(InboxError::Consistency(format!(
                "temporary message id {} already in use",
                self.temp.id
            ))),
        }
    }

    fn confirm(&mut self, store: &mut ConversationStore, confirmed: CreatedMessage) -> Result<()> {
        store.remove_message(&self.temp.id);

        // messages never change conversation; keep the staged slot's thread
        let mut message = confirmed.message;
        message.thread_id = self.temp.thread_id.clone();
        match store.insert_message(message) {
            MessageInsert::Inserted { .. } | MessageInsert::Duplicate { .. } => Ok(()),
            MessageInsert::UnknownThread => {
                Err(InboxError::ConversationNotFound(self.temp.thread_id.clone()))
            }
        }
    }

    fn rollback(&mut self, store: &mut ConversationStore) {
        store.remove_message(&self.temp.id);

        let Some(displaced) = self.displaced.take() else {
            return;
        };
        // a newer message since staging earns the conversation its new rank
        let tail_unchanged = store
            .conversation(&displaced.conversation_id)
            .map_or(false, |c| c.last_message().map(|m| &m.id) == displaced.tail.as_ref());
        if tail_unchanged {
            store.place_after(&displaced.conversation_id, &displaced.ahead);
        }
    }
}

/// Assignee change, restored on failure
///
/// Keyed by conversation, so a second assignment is refused while one is in
/// flight and a rollback always restores a value the server accepted.
#[derive(Debug, Clone)]
pub struct StagedAssignment {
    conversation_id: String,
    assignee: Option<String>,
    previous: Option<Option<String>>,
}

impl StagedAssignment {
    pub fn new(conversation_id: &str, assignee: Option<String>) -> (Self, ConversationPatch) {
        let patch = ConversationPatch {
            assigned_to: assignee.clone(),
        };
        let staged = Self {
            conversation_id: conversation_id.to_string(),
            assignee,
            previous: None,
        };
        (staged, patch)
    }
}

impl StagedMutation for StagedAssignment {
    type Confirmed = Conversation;

    fn operation(&self) -> &'static str {
        "assign"
    }

    fn key(&self) -> String {
        format!("assign:{}", self.conversation_id)
    }

    fn stage(&mut self, store: &mut ConversationStore) -> Result<()> {
        let previous = store.set_assignment(&self.conversation_id, self.assignee.clone())?;
        self.previous = Some(previous);
        Ok(())
    }

    fn confirm(&mut self, store: &mut ConversationStore, confirmed: Conversation) -> Result<()> {
        if confirmed.id != self.conversation_id {
            return Err(InboxError::Consistency(format!(
                "assignment of {} confirmed for {}",
                self.conversation_id, confirmed.id
            )));
        }
        store.merge_conversation(confirmed)?;
        Ok(())
    }

    fn rollback(&mut self, store: &mut ConversationStore) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        // a push update may have superseded the staged value meanwhile
        let still_ours = store
            .conversation(&self.conversation_id)
            .map_or(false, |c| c.assigned_to == self.assignee);
        if still_ours {
            if let Err(e) = store.set_assignment(&self.conversation_id, previous) {
                warn!("Could not restore assignee of {}: {}", self.conversation_id, e);
            }
        }
    }
}

/// Runs staged mutations against the reconciler with a bounded commit
pub struct OptimisticMutationTracker {
    reconciler: Arc<Reconciler>,
    timeout: Duration,
    in_flight: Mutex<HashSet<String>>,
}

impl OptimisticMutationTracker {
    pub fn new(reconciler: Arc<Reconciler>, timeout: Duration) -> Self {
        Self {
            reconciler,
            timeout,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Keys of mutations staged but not yet confirmed or rolled back
    pub fn in_flight(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Stage `mutation`, await `commit`, then confirm or roll back
    ///
    /// Failure, including a commit that outlives the timeout, rolls the
    /// staged change back and is returned as [`InboxError::Commit`]. If the
    /// store is reset while the commit is in flight the outcome is dropped.
    pub async fn run<M, F, Fut>(&self, mut mutation: M, commit: F) -> Result<M::Confirmed>
    where
        M: StagedMutation,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<M::Confirmed>>,
    {
        let operation = mutation.operation();
        let key = mutation.key();
        let epoch = self.reconciler.epoch();

        // held until the outcome is applied to the store
        let _claim = self.claim(&key).ok_or_else(|| {
            InboxError::InvalidInput(format!("{} {} is already in flight", operation, key))
        })?;
        self.reconciler
            .write_in_epoch(epoch, |store| mutation.stage(store))
            .unwrap_or_else(|| Err(InboxError::Consistency("store reset while staging".to_string())))?;
        debug!("Staged {} {}", operation, key);

        let outcome = match tokio::time::timeout(self.timeout, commit()).await {
            Ok(result) => result,
            Err(_) => Err(InboxError::Timeout(self.timeout.as_secs())),
        };

        match outcome {
            Ok(confirmed) => {
                let applied = self.reconciler.write_in_epoch(epoch, |store| {
                    match mutation.confirm(store, confirmed.clone()) {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            mutation.rollback(store);
                            Err(e)
                        }
                    }
                });
                match applied {
                    Some(Ok(())) => info!("{} {} confirmed", operation, key),
                    Some(Err(e)) => warn!(
                        "{} {} committed but could not be reconciled locally: {}",
                        operation, key, e
                    ),
                    None => debug!("Store reset during {} {}; confirmation dropped", operation, key),
                }
                Ok(confirmed)
            }
            Err(e) => {
                self.reconciler
                    .write_in_epoch(epoch, |store| mutation.rollback(store));
                warn!("{} {} rolled back: {}", operation, key, e);
                Err(InboxError::commit(operation, e))
            }
        }
    }

    /// None if a mutation with this key is already in flight
    fn claim(&self, key: &str) -> Option<InFlightClaim<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
        inserted.then(|| InFlightClaim {
            keys: &self.in_flight,
            key: key.to_string(),
        })
    }
}

/// Releases an in-flight key on drop, including when `run` is cancelled
struct InFlightClaim<'a> {
    keys: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
