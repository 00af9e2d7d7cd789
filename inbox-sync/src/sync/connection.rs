//! Push channel connection lifecycle
//!
//! One WebSocket per manager. The manager owns the state machine
//!
//! ```text
//! Idle -> Connecting -> Open -> Closed
//!              \          \
//!               `-> Error  `-> Error
//! Closed | Error -> Connecting   (explicit connect only)
//! ```
//!
//! It never reconnects by itself; the owning session decides when and how
//! often. Every connect bumps a generation counter and frames read by an
//! older generation's task are dropped, so a stale socket cannot deliver into
//! a session that has since switched context.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::sync::codec::{self, encode_frame, OutboundFrame};
use crate::sync::dispatcher::EventDispatcher;
use crate::types::error::{InboxError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle | Closed | Error, Connecting)
                | (Connecting, Open)
                | (Connecting | Open, Closed)
                | (Connecting | Open, Error)
        )
    }

    /// Connecting or open; a new connect is a no-op
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Emitted on every state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub generation: u64,
    pub state: ConnectionState,
    /// True when caused by an explicit connect or disconnect call
    pub requested: bool,
    pub error: Option<String>,
}

struct Link {
    state: ConnectionState,
    last_error: Option<String>,
    close_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(InboxError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

/// State shared between the manager and its reader task
///
/// Lock order is always `generation` then `link`.
struct Shared {
    /// Held for reading while a frame is dispatched, so bumping it waits for
    /// in-progress deliveries of the previous generation
    generation: RwLock<u64>,
    link: Mutex<Link>,
    dispatcher: Arc<EventDispatcher>,
    events: flume::Sender<ConnectionEvent>,
}

impl Shared {
    fn emit(&self, generation: u64, state: ConnectionState, requested: bool, error: Option<String>) {
        let _ = self.events.send(ConnectionEvent {
            generation,
            state,
            requested,
            error,
        });
    }

    /// Apply a transition reported by the reader task of `generation`.
    /// Returns false if that task has been superseded.
    fn settle(&self, generation: u64, next: ConnectionState, error: Option<String>) -> bool {
        let current = self.generation.read().unwrap_or_else(PoisonError::into_inner);
        if *current != generation {
            debug!("Ignoring {} from superseded connection {}", next, generation);
            return false;
        }
        let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = link.transition(next) {
            debug!("Connection {}: {}", generation, e);
            return false;
        }
        if error.is_some() {
            link.last_error = error.clone();
        }
        if next != ConnectionState::Open {
            link.close_tx = None;
        }
        drop(link);
        self.emit(generation, next, false, error);
        true
    }

    /// Decode and publish one text frame if `generation` is still current
    fn deliver(&self, generation: u64, text: &str) {
        let current = self.generation.read().unwrap_or_else(PoisonError::into_inner);
        if *current != generation {
            debug!("Dropping frame from superseded connection {}", generation);
            return;
        }
        match codec::decode(text) {
            Ok(event) => {
                let delivered = self.dispatcher.publish(&event);
                debug!("Dispatched {} to {} listener(s)", event.kind(), delivered);
            }
            Err(e) => warn!("Dropping malformed push frame: {}", e),
        }
    }
}

/// Owns the push connection for one session context
///
/// Listeners on the dispatcher run while a delivery holds the generation
/// lock; they must not call `connect` or `disconnect` synchronously.
pub struct ConnectionManager {
    ws_url: Url,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        ws_url: &str,
        dispatcher: Arc<EventDispatcher>,
    ) -> Result<(Self, flume::Receiver<ConnectionEvent>)> {
        let ws_url = Url::parse(ws_url)?;
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(InboxError::Config(format!(
                "Push URL must use ws or wss, got {}",
                ws_url.scheme()
            )));
        }

        let (events_tx, events_rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            generation: RwLock::new(0),
            link: Mutex::new(Link {
                state: ConnectionState::Idle,
                last_error: None,
                close_tx: None,
                task: None,
            }),
            dispatcher,
            events: events_tx,
        });

        Ok((Self { ws_url, shared }, events_rx))
    }

    pub fn state(&self) -> ConnectionState {
        self.shared
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn generation(&self) -> u64 {
        *self
            .shared
            .generation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }

    /// Push endpoint for one tenant and user
    pub fn endpoint_for(&self, tenant_id: &str, user_id: &str) -> Url {
        let mut url = self.ws_url.clone();
        url.query_pairs_mut()
            .append_pair("tenant", tenant_id)
            .append_pair("user_id", user_id);
        url
    }

    /// Open the push channel for `tenant_id` / `user_id`
    ///
    /// Returns `Ok(false)` without side effects when already connecting or
    /// open. Must be called from within a Tokio runtime.
    pub fn connect(&self, tenant_id: &str, user_id: &str) -> Result<bool> {
        let handshake = encode_frame(&OutboundFrame::Handshake {
            tenant: tenant_id.to_string(),
            user_id: user_id.to_string(),
        })?;
        let url = self.endpoint_for(tenant_id, user_id);

        let mut generation = self
            .shared
            .generation
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut link = self.shared.link.lock().unwrap_or_else(PoisonError::into_inner);

        if link.state.is_active() {
            debug!("Connect ignored: connection already {}", link.state);
            return Ok(false);
        }
        link.transition(ConnectionState::Connecting)?;

        *generation += 1;
        let current = *generation;
        let (close_tx, close_rx) = oneshot::channel();
        link.close_tx = Some(close_tx);
        link.last_error = None;
        if let Some(old) = link.task.take() {
            old.abort();
        }

        info!(
            "Connecting push channel for tenant {} (generation {})",
            tenant_id, current
        );
        let shared = Arc::clone(&self.shared);
        link.task = Some(tokio::spawn(run_link(shared, current, url, handshake, close_rx)));

        // emitted under the locks so it precedes anything the task reports
        self.shared
            .emit(current, ConnectionState::Connecting, true, None);
        Ok(true)
    }

    /// Close the push channel. Idempotent; returns false if nothing was open.
    ///
    /// Always invalidates the current generation, so frames still in flight
    /// from the old socket are discarded.
    pub fn disconnect(&self) -> bool {
        let mut generation = self
            .shared
            .generation
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut link = self.shared.link.lock().unwrap_or_else(PoisonError::into_inner);

        *generation += 1;
        let current = *generation;

        if let Some(close_tx) = link.close_tx.take() {
            let _ = close_tx.send(());
        }
        // the task finishes on its own after sending the close frame
        link.task = None;

        if !link.state.is_active() {
            return false;
        }
        link.state = ConnectionState::Closed;
        self.shared.emit(current, ConnectionState::Closed, true, None);
        info!("Push channel disconnected");
        true
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut link = self.shared.link.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = link.task.take() {
            task.abort();
        }
    }
}

/// Reader task for one connection generation
async fn run_link(
    shared: Arc<Shared>,
    generation: u64,
    url: Url,
    handshake: String,
    mut close_rx: oneshot::Receiver<()>,
) {
    let connect = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()));
    let mut ws = match connect.await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(tungstenite::Error::Http(response))) => {
            let message = match response.status().as_u16() {
                401 => "Unauthorized: push channel rejected credentials".to_string(),
                403 => "Forbidden: push channel access denied".to_string(),
                code => format!("Push channel HTTP error: {}", code),
            };
            error!("{}", message);
            shared.settle(generation, ConnectionState::Error, Some(message));
            return;
        }
        Ok(Err(e)) => {
            error!("Push connection failed: {}", e);
            shared.settle(generation, ConnectionState::Error, Some(e.to_string()));
            return;
        }
        Err(_) => {
            let message = format!("Connection timeout ({:?})", CONNECT_TIMEOUT);
            error!("{}", message);
            shared.settle(generation, ConnectionState::Error, Some(message));
            return;
        }
    };

    if let Err(e) = ws.send(WsMessage::text(handshake)).await {
        error!("Failed to send handshake: {}", e);
        shared.settle(generation, ConnectionState::Error, Some(e.to_string()));
        return;
    }
    if !shared.settle(generation, ConnectionState::Open, None) {
        let _ = ws.close(None).await;
        return;
    }
    info!("Push channel open (generation {})", generation);

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                debug!("Closing push channel (generation {})", generation);
                let _ = ws.close(None).await;
                return;
            }
            frame = ws.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => shared.deliver(generation, &text),
                Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => shared.deliver(generation, text),
                    Err(_) => warn!("Dropping non UTF-8 binary frame ({} bytes)", data.len()),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    info!("Server closed push channel: {}", reason);
                    shared.settle(generation, ConnectionState::Closed, None);
                    return;
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = ws.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Push channel error: {}", e);
                    shared.settle(generation, ConnectionState::Error, Some(e.to_string()));
                    return;
                }
                None => {
                    info!("Push channel stream ended");
                    shared.settle(generation, ConnectionState::Closed, None);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::codec::InboundEvent;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(5);

    /// Accept one client, report its handshake, push `frames`, then either
    /// close or hold the socket open until the client goes away
    async fn serve(frames: Vec<&'static str>, close_after: bool) -> (String, flume::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handshake_tx, handshake_rx) = flume::unbounded();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                handshake_tx.send(text.to_string()).unwrap();
            }
            for frame in frames {
                ws.send(WsMessage::text(frame)).await.unwrap();
            }
            if close_after {
                let _ = ws.close(None).await;
            }
            while let Some(Ok(_)) = ws.next().await {}
        });

        (format!("ws://{}/ws/inbox/", addr), handshake_rx)
    }

    async fn wait_for(events: &flume::Receiver<ConnectionEvent>, state: ConnectionState) -> ConnectionEvent {
        loop {
            let event = tokio::time::timeout(WAIT, events.recv_async())
                .await
                .expect("timed out waiting for connection event")
                .unwrap();
            if event.state == state {
                return event;
            }
        }
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Open));
        assert!(Open.can_transition_to(Closed));
        assert!(Open.can_transition_to(Error));
        assert!(Closed.can_transition_to(Connecting));
        assert!(Error.can_transition_to(Connecting));

        assert!(!Idle.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Error.can_transition_to(Open));
        assert!(!Open.can_transition_to(Connecting));
    }

    #[test]
    fn test_rejects_http_url() {
        let result = ConnectionManager::new("https://inbox.example.com/ws", EventDispatcher::new());
        assert!(matches!(result, Err(InboxError::Config(_))));
    }

    #[test]
    fn test_endpoint_carries_tenant_and_user() {
        let (manager, _events) =
            ConnectionManager::new("wss://inbox.example.com/ws/inbox/", EventDispatcher::new()).unwrap();
        let url = manager.endpoint_for("acme", "42");
        assert_eq!(url.query(), Some("tenant=acme&user_id=42"));
    }

    #[tokio::test]
    async fn test_connect_handshake_and_dispatch() {
        let (url, handshakes) = serve(
            vec![
                r#"{"type":"new_conversation","message":{"id":"c1","thread_id":"t1"}}"#,
                "{ not json",
                r#"{"type":"new_message","message":{"id":"m1","thread_id":"t1","timestamp":"2024-03-01T10:00:00Z"}}"#,
            ],
            false,
        )
        .await;

        let dispatcher = EventDispatcher::new();
        let (received_tx, received_rx) = flume::unbounded();
        let _sub = dispatcher.subscribe(move |event: &InboundEvent| {
            let _ = received_tx.send(event.kind().to_string());
        });

        let (manager, events) = ConnectionManager::new(&url, dispatcher).unwrap();
        assert!(manager.connect("acme", "42").unwrap());
        // already connecting: no second socket
        assert!(!manager.connect("acme", "42").unwrap());

        wait_for(&events, ConnectionState::Open).await;
        assert_eq!(manager.state(), ConnectionState::Open);

        let handshake: serde_json::Value =
            serde_json::from_str(&tokio::time::timeout(WAIT, handshakes.recv_async()).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(handshake["type"], "handshake");
        assert_eq!(handshake["message"]["tenant"], "acme");
        assert_eq!(handshake["message"]["user_id"], "42");

        let mut kinds = Vec::new();
        for _ in 0..2 {
            kinds.push(tokio::time::timeout(WAIT, received_rx.recv_async()).await.unwrap().unwrap());
        }
        assert_eq!(kinds, vec!["new_conversation", "new_message"]);

        assert!(manager.disconnect());
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(!manager.disconnect());
        let closed = wait_for(&events, ConnectionState::Closed).await;
        assert!(closed.requested);
    }

    #[tokio::test]
    async fn test_server_close_is_reported() {
        let (url, _handshakes) = serve(vec![], true).await;
        let (manager, events) = ConnectionManager::new(&url, EventDispatcher::new()).unwrap();
        manager.connect("acme", "42").unwrap();

        wait_for(&events, ConnectionState::Open).await;
        let closed = wait_for(&events, ConnectionState::Closed).await;
        assert!(!closed.requested);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_and_allows_retry() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("ws://127.0.0.1:{}/ws/inbox/", port);
        let (manager, events) = ConnectionManager::new(&url, EventDispatcher::new()).unwrap();

        manager.connect("acme", "42").unwrap();
        let failed = wait_for(&events, ConnectionState::Error).await;
        assert!(failed.error.is_some());
        assert_eq!(manager.state(), ConnectionState::Error);
        assert!(manager.last_error().is_some());

        // no automatic reconnect, but an explicit connect is allowed again
        assert!(manager.connect("acme", "42").unwrap());
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_noop() {
        let (manager, events) =
            ConnectionManager::new("ws://127.0.0.1:9/ws/", EventDispatcher::new()).unwrap();
        assert!(!manager.disconnect());
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(events.try_recv().is_err());
    }
}
