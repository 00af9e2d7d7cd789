//! Single writer for the conversation store
//!
//! Inbound push events, catch-up snapshots and staged optimistic mutations all
//! go through one write lock, so no two applies interleave and readers never
//! observe a half-applied event.
//!
//! A `new_message` for a thread the store does not know is parked and a
//! [`FetchRequest`] is emitted. When the conversation arrives (fetched, pushed
//! or listed) the parked messages are replayed through the normal path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use flume::{Receiver, Sender};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::sync::codec::InboundEvent;
use crate::sync::dispatcher::{EventDispatcher, Subscription};
use crate::sync::selectors::{self, ViewFilter};
use crate::sync::store::{ConversationInsert, ConversationStore, MessageInsert};
use crate::types::error::Result;
use crate::types::{Comment, Conversation, Message, SessionIdentity};

/// What applying one intent did to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    /// Already present; nothing changed
    Duplicate,
    Updated,
    Unchanged,
    /// Held back until the owning conversation is known
    Parked { thread_id: String },
    Rejected { reason: String },
    Ignored,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// Ask the session to load the conversation owning `thread_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub thread_id: String,
}

/// Summary of a catch-up merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub updated: usize,
    pub messages_added: usize,
    pub rejected: usize,
}

#[derive(Default)]
struct ReconcilerState {
    store: ConversationStore,
    /// thread id -> messages waiting for their conversation
    parked: HashMap<String, Vec<Message>>,
}

pub struct Reconciler {
    state: RwLock<ReconcilerState>,
    fetch_tx: Sender<FetchRequest>,
    /// Bumped by every write that changed the store
    revision: watch::Sender<u64>,
    /// Bumped by `reset`; staged mutations from an older epoch are discarded
    epoch: AtomicU64,
}

impl Reconciler {
    pub fn new() -> (Self, Receiver<FetchRequest>) {
        let (fetch_tx, fetch_rx) = flume::unbounded();
        let (revision, _) = watch::channel(0);

        let reconciler = Self {
            state: RwLock::new(ReconcilerState::default()),
            fetch_tx,
            revision,
            epoch: AtomicU64::new(0),
        };

        (reconciler, fetch_rx)
    }

    /// Register as a dispatcher listener applying every inbound event
    pub fn attach(self: &Arc<Self>, dispatcher: &Arc<EventDispatcher>) -> Subscription {
        let reconciler = Arc::clone(self);
        dispatcher.subscribe(move |event| {
            let outcome = reconciler.apply_event(event);
            debug!("Applied {} event: {:?}", event.kind(), outcome);
        })
    }

    /// Receiver that changes whenever the store changes
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Run `f` with shared read access to the store
    pub fn read<R>(&self, f: impl FnOnce(&ConversationStore) -> R) -> R {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state.store)
    }

    /// All conversations, most recent first
    pub fn snapshot(&self) -> Vec<Conversation> {
        self.read(|store| store.conversations().cloned().collect())
    }

    pub fn view(&self, filter: ViewFilter, identity: &SessionIdentity) -> Vec<Conversation> {
        self.read(|store| {
            selectors::filter(store, filter, identity)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn parked_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.parked.values().map(Vec::len).sum()
    }

    /// Threads with messages still waiting for their conversation
    pub fn parked_threads(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut threads: Vec<String> = state.parked.keys().cloned().collect();
        threads.sort();
        threads
    }

    /// Serialized write path. `f` reports whether it changed anything.
    fn apply<R>(&self, f: impl FnOnce(&mut ReconcilerState) -> (R, bool)) -> R {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let (result, changed) = f(&mut state);
        drop(state);
        if changed {
            self.revision.send_modify(|rev| *rev += 1);
        }
        result
    }

    /// Write access for staged mutations, skipped if the store was reset
    /// since `epoch`
    pub(crate) fn write_in_epoch<R>(
        &self,
        epoch: u64,
        f: impl FnOnce(&mut ConversationStore) -> R,
    ) -> Option<R> {
        self.apply(|state| {
            if self.epoch() != epoch {
                return (None, false);
            }
            (Some(f(&mut state.store)), true)
        })
    }

    pub fn apply_event(&self, event: &InboundEvent) -> ApplyOutcome {
        match event {
            InboundEvent::NewConversation { conversation } => {
                self.apply_new_conversation(conversation.clone())
            }
            InboundEvent::NewMessage {
                message,
                conversation,
            } => self.apply(|state| {
                let mut adopted = false;
                if let Some(conv) = conversation {
                    if state.store.conversation_by_thread(&conv.thread_id).is_none() {
                        adopted = self
                            .insert_conversation(state, conv.clone())
                            .changed();
                    }
                }
                let outcome =
                    self.insert_message(state, message.thread_id.clone(), message.clone());
                let changed = adopted || outcome.changed();
                (outcome, changed)
            }),
            InboundEvent::ConversationUpdated { conversation } => {
                self.apply_conversation_update(conversation.clone())
            }
            InboundEvent::Unhandled { kind } => {
                debug!("Ignoring unhandled event type: {}", kind);
                ApplyOutcome::Ignored
            }
        }
    }

    /// Insert at the head unless the id is already known
    pub fn apply_new_conversation(&self, conversation: Conversation) -> ApplyOutcome {
        self.apply(|state| {
            let outcome = self.insert_conversation(state, conversation);
            let changed = outcome.changed();
            (outcome, changed)
        })
    }

    /// Insert `message` into the conversation owning `thread_id`
    pub fn apply_new_message(&self, thread_id: &str, message: Message) -> ApplyOutcome {
        self.apply(|state| {
            let outcome = self.insert_message(state, thread_id.to_string(), message);
            let changed = outcome.changed();
            (outcome, changed)
        })
    }

    /// Direct patch of the assignee. Last writer wins.
    pub fn apply_assignment(
        &self,
        conversation_id: &str,
        assignee: Option<String>,
    ) -> Result<ApplyOutcome> {
        self.apply(|state| {
            match state.store.set_assignment(conversation_id, assignee.clone()) {
                Ok(previous) if previous == assignee => (Ok(ApplyOutcome::Unchanged), false),
                Ok(_) => {
                    info!(
                        "Conversation {} assigned to {:?}",
                        conversation_id, assignee
                    );
                    (Ok(ApplyOutcome::Updated), true)
                }
                Err(e) => (Err(e), false),
            }
        })
    }

    /// Merge an authoritative conversation; unknown ids are inserted
    pub fn apply_conversation_update(&self, conversation: Conversation) -> ApplyOutcome {
        self.apply(|state| {
            let outcome = self.upsert_conversation(state, conversation);
            let changed = outcome.changed();
            (outcome, changed)
        })
    }

    /// [`apply_conversation_update`](Self::apply_conversation_update) for a
    /// result requested before `epoch` ended; dropped after a reset
    pub fn apply_conversation_update_at(
        &self,
        epoch: u64,
        conversation: Conversation,
    ) -> Option<ApplyOutcome> {
        self.apply(|state| {
            if self.epoch() != epoch {
                return (None, false);
            }
            let outcome = self.upsert_conversation(state, conversation);
            let changed = outcome.changed();
            (Some(outcome), changed)
        })
    }

    /// Merge a full listing (catch-up after connect) as a diff
    ///
    /// Conversations absent from the listing are kept, as are staged entities.
    pub fn apply_snapshot(&self, conversations: Vec<Conversation>) -> ReconcileReport {
        self.apply(|state| {
            let report = self.merge_listing(state, conversations);
            let changed = report.inserted + report.updated > 0;
            (report, changed)
        })
    }

    /// [`apply_snapshot`](Self::apply_snapshot) for a listing requested
    /// during `epoch`; dropped after a reset
    pub fn apply_snapshot_at(
        &self,
        epoch: u64,
        conversations: Vec<Conversation>,
    ) -> Option<ReconcileReport> {
        self.apply(|state| {
            if self.epoch() != epoch {
                return (None, false);
            }
            let report = self.merge_listing(state, conversations);
            let changed = report.inserted + report.updated > 0;
            (Some(report), changed)
        })
    }

    /// Merge a list-comments result for one message
    pub fn apply_comments(&self, message_id: &str, comments: Vec<Comment>) -> usize {
        self.apply(|state| {
            let mut added = 0;
            for comment in comments {
                if comment.message_id != message_id {
                    warn!(
                        "Comment {} belongs to message {}, not {}; skipping",
                        comment.id, comment.message_id, message_id
                    );
                    continue;
                }
                if state.store.insert_comment(comment) {
                    added += 1;
                }
            }
            (added, added > 0)
        })
    }

    /// Forget parked messages for a thread the server does not know
    pub fn discard_parked(&self, thread_id: &str) -> usize {
        self.apply(|state| {
            let dropped = state.parked.remove(thread_id).map_or(0, |v| v.len());
            if dropped > 0 {
                warn!(
                    "Dropping {} message(s) for unknown thread {}",
                    dropped, thread_id
                );
            }
            (dropped, false)
        })
    }

    /// Clear everything for a new session context
    pub fn reset(&self) {
        self.apply(|state| {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            state.store.clear();
            state.parked.clear();
            ((), true)
        });
        info!("Conversation store reset");
    }

    fn merge_listing(
        &self,
        state: &mut ReconcilerState,
        conversations: Vec<Conversation>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        // Listings are newest first; insert oldest first so the head ends up newest
        for conversation in conversations.into_iter().rev() {
            let before = state.store.message_count();
            match self.upsert_conversation(state, conversation) {
                ApplyOutcome::Inserted => report.inserted += 1,
                ApplyOutcome::Updated => report.updated += 1,
                ApplyOutcome::Rejected { .. } => report.rejected += 1,
                _ => {}
            }
            report.messages_added += state.store.message_count() - before;
        }
        report
    }

    fn insert_conversation(
        &self,
        state: &mut ReconcilerState,
        conversation: Conversation,
    ) -> ApplyOutcome {
        let id = conversation.id.clone();
        let thread_id = conversation.thread_id.clone();

        match state.store.insert_conversation(conversation) {
            ConversationInsert::Inserted { dropped } => {
                if dropped > 0 {
                    warn!(
                        "Conversation {} carried {} message(s) already owned elsewhere",
                        id, dropped
                    );
                }
                info!("New conversation {} (thread {})", id, thread_id);
                self.replay_parked(state, &thread_id);
                ApplyOutcome::Inserted
            }
            ConversationInsert::Duplicate => {
                debug!("Conversation {} already known, skipping", id);
                ApplyOutcome::Duplicate
            }
            ConversationInsert::ThreadConflict { owner } => {
                let reason = format!(
                    "thread {} already owned by conversation {}",
                    thread_id, owner
                );
                warn!("Rejecting conversation {}: {}", id, reason);
                ApplyOutcome::Rejected { reason }
            }
        }
    }

    fn upsert_conversation(
        &self,
        state: &mut ReconcilerState,
        conversation: Conversation,
    ) -> ApplyOutcome {
        if state.store.conversation(&conversation.id).is_none() {
            return self.insert_conversation(state, conversation);
        }

        let id = conversation.id.clone();
        match state.store.merge_conversation(conversation) {
            Ok(result) if result.fields_changed || result.messages_added > 0 => {
                debug!(
                    "Merged conversation {} ({} new message(s))",
                    id, result.messages_added
                );
                ApplyOutcome::Updated
            }
            Ok(_) => ApplyOutcome::Unchanged,
            Err(e) => {
                warn!("Rejecting update for conversation {}: {}", id, e);
                ApplyOutcome::Rejected {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn insert_message(
        &self,
        state: &mut ReconcilerState,
        thread_id: String,
        mut message: Message,
    ) -> ApplyOutcome {
        message.thread_id = thread_id;

        match state.store.insert_message(message.clone()) {
            MessageInsert::Inserted { conversation_id } => {
                debug!(
                    "Message {} added to conversation {}",
                    message.id, conversation_id
                );
                ApplyOutcome::Inserted
            }
            MessageInsert::Duplicate { conversation_id } => {
                debug!(
                    "Message {} already in conversation {}, skipping",
                    message.id, conversation_id
                );
                ApplyOutcome::Duplicate
            }
            MessageInsert::UnknownThread => self.park(state, message),
        }
    }

    fn park(&self, state: &mut ReconcilerState, message: Message) -> ApplyOutcome {
        let thread_id = message.thread_id.clone();
        let waiting = state.parked.entry(thread_id.clone()).or_default();

        if waiting.iter().any(|m| m.id == message.id) {
            return ApplyOutcome::Duplicate;
        }

        let first = waiting.is_empty();
        warn!(
            "Message {} references unknown thread {}; parking until it is fetched",
            message.id, thread_id
        );
        waiting.push(message);

        if first {
            if let Err(e) = self.fetch_tx.send(FetchRequest {
                thread_id: thread_id.clone(),
            }) {
                warn!("Could not request fetch for thread {}: {}", thread_id, e);
            }
        }

        ApplyOutcome::Parked { thread_id }
    }

    fn replay_parked(&self, state: &mut ReconcilerState, thread_id: &str) {
        let Some(waiting) = state.parked.remove(thread_id) else {
            return;
        };
        info!(
            "Replaying {} parked message(s) for thread {}",
            waiting.len(),
            thread_id
        );
        for message in waiting {
            if let MessageInsert::Duplicate { .. } = state.store.insert_message(message) {
                debug!("Parked message already delivered with its conversation");
            }
        }
    }
}
