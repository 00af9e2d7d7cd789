//! Inbox session state
//!
//! Owns the push connection, the reconciler and the optimistic tracker for
//! one tenant/user context, plus a supervisor task that:
//! - runs a catch-up listing every time the push channel opens
//! - reconnects with backoff when the channel drops on its own
//! - fetches conversations for messages parked on an unknown thread

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::api::InboxApi;
use crate::config::{AppConfig, ReconnectPolicy};
use crate::services::recipients::ReplyMode;
use crate::sync::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::sync::dispatcher::{EventDispatcher, Subscription};
use crate::sync::optimistic::{
    OptimisticMutationTracker, StagedAssignment, StagedComment, StagedMessage,
};
use crate::sync::reconciler::{ApplyOutcome, FetchRequest, ReconcileReport, Reconciler};
use crate::sync::selectors::ViewFilter;
use crate::types::error::{InboxError, Result};
use crate::types::{Comment, Conversation, Message, SessionIdentity};

struct SessionInner<A: InboxApi> {
    identity: RwLock<SessionIdentity>,
    api: Arc<A>,
    reconciler: Arc<Reconciler>,
    tracker: OptimisticMutationTracker,
    connection: ConnectionManager,
    policy: ReconnectPolicy,
    connection_events: flume::Receiver<ConnectionEvent>,
    fetch_requests: flume::Receiver<FetchRequest>,
}

/// One signed-in teammate's live view of a tenant inbox
pub struct InboxSession<A: InboxApi> {
    inner: Arc<SessionInner<A>>,
    dispatcher: Arc<EventDispatcher>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    _subscription: Subscription,
}

impl<A: InboxApi> InboxSession<A> {
    pub fn new(
        identity: SessionIdentity,
        ws_url: &str,
        policy: ReconnectPolicy,
        commit_timeout: Duration,
        api: A,
    ) -> Result<Self> {
        let dispatcher = EventDispatcher::new();
        let (reconciler, fetch_requests) = Reconciler::new();
        let reconciler = Arc::new(reconciler);
        let subscription = reconciler.attach(&dispatcher);
        let (connection, connection_events) =
            ConnectionManager::new(ws_url, Arc::clone(&dispatcher))?;
        let tracker = OptimisticMutationTracker::new(Arc::clone(&reconciler), commit_timeout);

        api.set_tenant(&identity.tenant_id);
        info!(
            "Session created for {} in tenant {}",
            identity.user_id(),
            identity.tenant_id
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                identity: RwLock::new(identity),
                api: Arc::new(api),
                reconciler,
                tracker,
                connection,
                policy,
                connection_events,
                fetch_requests,
            }),
            dispatcher,
            supervisor: Mutex::new(None),
            _subscription: subscription,
        })
    }

    pub fn from_config(config: &AppConfig, api: A) -> Result<Self> {
        Self::new(
            config.identity(),
            &config.session.ws_url,
            config.reconnect.clone(),
            config.http.timeout(),
            api,
        )
    }

    /// Start the supervisor and open the push channel
    pub async fn start(&self) -> Result<()> {
        {
            let mut supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
            if supervisor.is_none() {
                *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.inner))));
            }
        }
        self.inner.connect().await
    }

    /// Close the push channel and stop background work
    pub fn shutdown(&self) {
        self.inner.connection.disconnect();
        if let Some(task) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        info!("Session shut down");
    }

    fn is_started(&self) -> bool {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Move the session to another tenant or user
    ///
    /// The old connection is closed and the store cleared before the new
    /// identity is installed, so nothing from the previous context leaks in.
    pub async fn switch_context(&self, identity: SessionIdentity) -> Result<()> {
        info!(
            "Switching session to tenant {} as {}",
            identity.tenant_id,
            identity.user_id()
        );
        self.inner.connection.disconnect();
        self.inner.reconciler.reset();
        self.inner.api.set_tenant(&identity.tenant_id);
        *self.inner.identity.write().await = identity;

        if self.is_started() {
            self.inner.connect().await?;
        }
        Ok(())
    }

    pub async fn identity(&self) -> SessionIdentity {
        self.inner.identity.read().await.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.inner.reconciler
    }

    /// Dispatcher for additional push listeners
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Keys of optimistic mutations awaiting the server
    pub fn in_flight(&self) -> Vec<String> {
        self.inner.tracker.in_flight()
    }

    pub async fn view(&self, filter: ViewFilter) -> Vec<Conversation> {
        let identity = self.inner.identity.read().await;
        self.inner.reconciler.view(filter, &identity)
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.inner
            .reconciler
            .read(|store| store.conversation(conversation_id).cloned())
    }

    pub fn comments(&self, message_id: &str) -> Vec<Comment> {
        self.inner
            .reconciler
            .read(|store| store.comments(message_id).to_vec())
    }

    /// Pull the current listing and merge it into the store
    pub async fn catch_up(&self) -> Result<ReconcileReport> {
        self.inner.catch_up().await
    }

    /// Load the comments of one message from the server
    pub async fn load_comments(&self, message_id: &str) -> Result<usize> {
        let comments = self.inner.api.list_comments(message_id.to_string()).await?;
        let added = self.inner.reconciler.apply_comments(message_id, comments);
        debug!("Loaded {} new comment(s) for message {}", added, message_id);
        Ok(added)
    }

    /// Reply to `message_id`, staging the reply until the server confirms it
    pub async fn send_reply(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
        mode: ReplyMode,
    ) -> Result<Message> {
        let identity = self.inner.identity.read().await.clone();
        let (staged, request) = self.inner.reconciler.read(|store| {
            let conversation = store
                .conversation(conversation_id)
                .ok_or_else(|| InboxError::ConversationNotFound(conversation_id.to_string()))?;
            let original = conversation
                .message(message_id)
                .ok_or_else(|| InboxError::MessageNotFound(message_id.to_string()))?;
            StagedMessage::reply(conversation, original, content, mode, &identity)
        })?;

        let api = Arc::clone(&self.inner.api);
        let created = self
            .inner
            .tracker
            .run(staged, move || async move { api.create_message(request).await })
            .await?;
        Ok(created.message)
    }

    /// Send a new message into an existing conversation
    pub async fn send_message(
        &self,
        conversation_id: &str,
        to: &[String],
        cc: &[String],
        content: &str,
    ) -> Result<Message> {
        let identity = self.inner.identity.read().await.clone();
        let (staged, request) = self.inner.reconciler.read(|store| {
            let conversation = store
                .conversation(conversation_id)
                .ok_or_else(|| InboxError::ConversationNotFound(conversation_id.to_string()))?;
            StagedMessage::compose(conversation, to, cc, content, &identity)
        })?;

        let api = Arc::clone(&self.inner.api);
        let created = self
            .inner
            .tracker
            .run(staged, move || async move { api.create_message(request).await })
            .await?;
        Ok(created.message)
    }

    /// Add an internal comment to a message
    pub async fn add_comment(
        &self,
        message_id: &str,
        content: &str,
        mentions: BTreeSet<String>,
    ) -> Result<Comment> {
        if content.trim().is_empty() {
            return Err(InboxError::InvalidInput("Comment is empty".to_string()));
        }
        let author = self.inner.identity.read().await.user_id().to_string();
        let (staged, request) = StagedComment::new(message_id, &author, content, mentions);

        let api = Arc::clone(&self.inner.api);
        self.inner
            .tracker
            .run(staged, move || async move { api.create_comment(request).await })
            .await
    }

    /// Assign or, with `None`, unassign a conversation
    pub async fn assign(
        &self,
        conversation_id: &str,
        assignee: Option<String>,
    ) -> Result<Conversation> {
        let (staged, patch) = StagedAssignment::new(conversation_id, assignee);

        let api = Arc::clone(&self.inner.api);
        let id = conversation_id.to_string();
        self.inner
            .tracker
            .run(staged, move || async move { api.update_conversation(id, patch).await })
            .await
    }
}

impl<A: InboxApi> Drop for InboxSession<A> {
    fn drop(&mut self) {
        if let Some(task) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.inner.connection.disconnect();
    }
}

impl<A: InboxApi> SessionInner<A> {
    async fn connect(&self) -> Result<()> {
        let identity = self.identity.read().await.clone();
        self.connection
            .connect(&identity.tenant_id, identity.user_id())?;
        Ok(())
    }

    async fn catch_up(&self) -> Result<ReconcileReport> {
        let epoch = self.reconciler.epoch();
        let conversations = self.api.list_conversations().await?;

        let Some(report) = self.reconciler.apply_snapshot_at(epoch, conversations) else {
            debug!("Discarding catch-up listing from a previous context");
            return Ok(ReconcileReport::default());
        };
        info!(
            "Catch-up: {} new, {} updated, {} new message(s)",
            report.inserted, report.updated, report.messages_added
        );

        // Parked messages whose fetch failed earlier get another chance
        for thread_id in self.reconciler.parked_threads() {
            self.fetch_thread(&thread_id).await;
        }
        Ok(report)
    }

    async fn fetch_thread(&self, thread_id: &str) {
        let epoch = self.reconciler.epoch();
        match self.api.fetch_conversation(thread_id.to_string()).await {
            Ok(Some(conversation)) => {
                match self.reconciler.apply_conversation_update_at(epoch, conversation) {
                    Some(ApplyOutcome::Rejected { reason }) => {
                        warn!("Fetched conversation for thread {} rejected: {}", thread_id, reason)
                    }
                    Some(outcome) => debug!("Fetched thread {}: {:?}", thread_id, outcome),
                    None => debug!("Discarding fetch for thread {} from a previous context", thread_id),
                }
            }
            Ok(None) => {
                self.reconciler.discard_parked(thread_id);
            }
            Err(e) => warn!(
                "Fetching thread {} failed: {}; retrying on next catch-up",
                thread_id, e
            ),
        }
    }

    async fn on_connection_event(&self, event: ConnectionEvent, failures: &mut u32) {
        match event.state {
            ConnectionState::Open => {
                *failures = 0;
                if let Err(e) = self.catch_up().await {
                    warn!("Catch-up after connect failed: {}", e);
                }
            }
            ConnectionState::Closed | ConnectionState::Error if !event.requested => {
                if let Some(error) = &event.error {
                    warn!("Push channel lost: {}", error);
                }
                if !self.policy.allows(*failures) {
                    warn!(
                        "Not reconnecting push channel after {} attempt(s)",
                        failures
                    );
                    return;
                }
                let delay = self.policy.delay(*failures);
                *failures += 1;
                info!("Reconnecting in {:?} (attempt {})", delay, failures);
                tokio::time::sleep(delay).await;

                // A connect, disconnect or context switch in the meantime wins
                if self.connection.generation() != event.generation {
                    debug!("Reconnect superseded");
                    return;
                }
                if let Err(e) = self.connect().await {
                    warn!("Reconnect failed: {}", e);
                }
            }
            _ => {}
        }
    }
}

/// Background loop serving connection events and fetch requests
async fn supervise<A: InboxApi>(inner: Arc<SessionInner<A>>) {
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            event = inner.connection_events.recv_async() => {
                let Ok(event) = event else { break };
                inner.on_connection_event(event, &mut failures).await;
            }
            request = inner.fetch_requests.recv_async() => {
                let Ok(request) = request else { break };
                inner.fetch_thread(&request.thread_id).await;
            }
        }
    }
    debug!("Session supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::api::mock::MockApi;
    use crate::types::{MessageFlags, MessageSource, Teammate};
    use chrono::{TimeZone, Utc};
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::Ordering;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn identity(tenant: &str) -> SessionIdentity {
        SessionIdentity {
            tenant_id: tenant.to_string(),
            teammate: Teammate {
                id: "u1".to_string(),
                name: "Una".to_string(),
            },
            email: "support@acme.io".to_string(),
            aliases: vec![],
        }
    }

    fn incoming(id: &str, thread: &str) -> Message {
        Message {
            id: id.to_string(),
            thread_id: thread.to_string(),
            message_id: None,
            from: "alice@client.com".to_string(),
            to: vec!["support@acme.io".to_string()],
            cc: vec![],
            content: "hello".to_string(),
            html_content: None,
            timestamp: Utc.timestamp_opt(100, 0).unwrap(),
            flags: MessageFlags::default(),
            attachments: vec![],
            in_reply_to: None,
            source: MessageSource::Incoming,
        }
    }

    fn listing() -> Vec<Conversation> {
        let mut c1 = Conversation::new("c1", "t1");
        c1.subject = "Login".to_string();
        c1.messages.push(incoming("m1", "t1"));
        vec![c1]
    }

    /// A push URL nothing listens on
    async fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("ws://{}/ws/inbox/", listener.local_addr().unwrap())
    }

    fn session(url: &str, policy: ReconnectPolicy, api: MockApi) -> InboxSession<MockApi> {
        InboxSession::new(identity("acme"), url, policy, Duration::from_secs(5), api).unwrap()
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_catch_up_populates_store() {
        let s = session(&dead_url().await, ReconnectPolicy::disabled(), MockApi::with_listing(listing()));
        let report = s.catch_up().await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(s.view(ViewFilter::Default).await.len(), 1);
        assert_eq!(s.catch_up().await.unwrap(), ReconcileReport::default());
        assert_eq!(s.inner.api.calls(), vec!["list_conversations", "list_conversations"]);
    }

    #[tokio::test]
    async fn test_send_reply_confirms() {
        let s = session(&dead_url().await, ReconnectPolicy::disabled(), MockApi::with_listing(listing()));
        s.catch_up().await.unwrap();

        let sent = s.send_reply("c1", "m1", "On it", ReplyMode::Reply).await.unwrap();
        assert!(sent.id.starts_with("srv_m"));
        assert_eq!(sent.to, vec!["alice@client.com"]);

        let conv = s.conversation("c1").unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.last_message().unwrap().id, sent.id);
        assert!(s.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_failed_comment_leaves_store_unchanged() {
        let api = MockApi::with_listing(listing());
        api.fail_commits.store(true, Ordering::SeqCst);
        let s = session(&dead_url().await, ReconnectPolicy::disabled(), api);
        s.catch_up().await.unwrap();

        let err = s.add_comment("m1", "hmm", BTreeSet::new()).await.unwrap_err();
        assert!(matches!(err, InboxError::Commit { .. }));
        assert!(s.comments("m1").is_empty());
    }

    #[tokio::test]
    async fn test_add_comment_and_load_comments() {
        let s = session(&dead_url().await, ReconnectPolicy::disabled(), MockApi::with_listing(listing()));
        s.catch_up().await.unwrap();

        let comment = s.add_comment("m1", "checking", BTreeSet::new()).await.unwrap();
        assert_eq!(s.comments("m1"), vec![comment.clone()]);

        // the listing returns the same comment; nothing new is added
        s.inner
            .api
            .comments
            .lock()
            .unwrap()
            .insert("m1".to_string(), vec![comment]);
        assert_eq!(s.load_comments("m1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_assign_and_unassign() {
        let s = session(&dead_url().await, ReconnectPolicy::disabled(), MockApi::with_listing(listing()));
        s.catch_up().await.unwrap();

        s.assign("c1", Some("u1".to_string())).await.unwrap();
        assert_eq!(s.view(ViewFilter::AssignedToMe).await.len(), 1);

        s.assign("c1", None).await.unwrap();
        assert_eq!(s.view(ViewFilter::Unassigned).await.len(), 1);
    }

    #[tokio::test]
    async fn test_parked_message_fetched_by_supervisor() {
        let api = MockApi::default();
        let mut c9 = Conversation::new("c9", "t9");
        c9.messages.push(incoming("m0", "t9"));
        api.fetchable.lock().unwrap().insert("t9".to_string(), c9);
        let s = session(&dead_url().await, ReconnectPolicy::disabled(), api);
        s.start().await.unwrap();

        let outcome = s.reconciler().apply_new_message("t9", incoming("m9", "t9"));
        assert!(matches!(outcome, ApplyOutcome::Parked { .. }));

        let reconciler = Arc::clone(s.reconciler());
        eventually("parked message replay", || reconciler.read(|st| st.contains_message("m9"))).await;
        assert_eq!(reconciler.parked_count(), 0);
        assert_eq!(s.conversation("c9").unwrap().messages.len(), 2);
        s.shutdown();
    }

    #[tokio::test]
    async fn test_switch_context_clears_store() {
        let s = session(&dead_url().await, ReconnectPolicy::disabled(), MockApi::with_listing(listing()));
        s.catch_up().await.unwrap();
        assert_eq!(s.reconciler().read(|st| st.len()), 1);

        s.switch_context(identity("globex")).await.unwrap();
        assert!(s.reconciler().read(|st| st.is_empty()));
        assert_eq!(s.identity().await.tenant_id, "globex");
        assert_eq!(*s.inner.api.tenant.lock().unwrap(), "globex");
        // never started, so no connection attempt
        assert_eq!(s.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_live_push_and_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/inbox/", listener.local_addr().unwrap());
        let (handshake_tx, handshake_rx) = flume::unbounded::<String>();

        tokio::spawn(async move {
            // first connection pushes one message then drops, second stays open
            for round in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                if let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                    handshake_tx.send(text.to_string()).unwrap();
                }
                if round == 0 {
                    let frame = r#"{"type":"new_message",
                        "message":{"id":"m5","thread_id":"t5","from":"eve@client.com","timestamp":"2024-03-01T10:00:00Z"},
                        "conversation":{"id":"c5","thread_id":"t5","subject":"Refund"}}"#;
                    ws.send(WsMessage::text(frame)).await.unwrap();
                    let _ = ws.close(None).await;
                    while let Some(Ok(_)) = ws.next().await {}
                } else {
                    while let Some(Ok(_)) = ws.next().await {}
                }
            }
        });

        let policy = ReconnectPolicy {
            base_delay_ms: 10,
            jitter: 0.0,
            ..ReconnectPolicy::default()
        };
        let s = session(&url, policy, MockApi::with_listing(listing()));
        s.start().await.unwrap();

        let reconciler = Arc::clone(s.reconciler());
        eventually("pushed conversation", || reconciler.read(|st| st.contains_message("m5"))).await;
        // catch-up ran on open
        eventually("catch-up", || reconciler.read(|st| st.conversation("c1").is_some())).await;

        for _ in 0..2 {
            let handshake = tokio::time::timeout(Duration::from_secs(5), handshake_rx.recv_async())
                .await
                .unwrap()
                .unwrap();
            assert!(handshake.contains(r#""tenant":"acme""#));
        }
        eventually("reopen", || s.connection_state() == ConnectionState::Open).await;

        s.shutdown();
        assert_eq!(s.connection_state(), ConnectionState::Closed);
    }
}
