//! Push socket: one long-lived connection per manager, reconnected with exponential
//! backoff, inbound envelopes decoded and fanned out by kind.

mod event;
mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::status::ConnectionStatus;

pub use event::{
    ConversationUpdated, DecodeSkip, ModuleDataChanged, Reminder, SocketEvent, SocketEventKind,
    StreamChunk, StreamEnd, StreamStart, TaskCompleted, TaskFailed, TaskProgress,
};
pub use ws::WebSocketConnector;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SocketError {
    #[error("invalid socket url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("socket connect failed: {0}")]
    Connect(String),
    #[error("socket closed: {0}")]
    Closed(String),
}

/// Inbound text messages of one open connection. The stream ends when the
/// connection closes.
pub type MessageStream = BoxStream<'static, Result<String, SocketError>>;

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<MessageStream, SocketError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.ceiling)
    }
}

/// Builds `<server>/ws?token=<credential>`, mapping `http`→`ws` and `https`→`wss`.
pub fn socket_url(server_url: &str, credential: &str) -> Result<Url, SocketError> {
    let invalid = |reason: String| SocketError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };
    let mut url = Url::parse(server_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to websocket scheme".into()))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_fragment(None);
    url.query_pairs_mut().clear().append_pair("token", credential);
    Ok(url)
}

pub type HandlerId = u64;

type EventHandler = Arc<dyn Fn(&SocketEvent) + Send + Sync>;
type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

struct State {
    status: ConnectionStatus,
    delay: Duration,
    should_reconnect: bool,
    generation: u64,
    target: Option<Url>,
    driver: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn SocketConnector>,
    policy: ReconnectPolicy,
    state: Mutex<State>,
    // Held across a state change and its notification so listeners see transitions
    // in order. Reentrant so a callback may call back into the manager.
    transitions: ReentrantMutex<()>,
    handlers: RwLock<HashMap<SocketEventKind, Vec<(HandlerId, EventHandler)>>>,
    listeners: Mutex<Vec<(u64, StatusCallback)>>,
    next_id: AtomicU64,
}

/// Owns the push connection. Dropping the manager disconnects it.
pub struct SocketManager {
    inner: Arc<Inner>,
}

impl SocketManager {
    pub fn new(connector: Arc<dyn SocketConnector>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                state: Mutex::new(State {
                    status: ConnectionStatus::Disconnected,
                    delay: policy.floor,
                    should_reconnect: false,
                    generation: 0,
                    target: None,
                    driver: None,
                }),
                transitions: ReentrantMutex::new(()),
                handlers: RwLock::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn websocket(policy: ReconnectPolicy) -> Self {
        Self::new(Arc::new(WebSocketConnector), policy)
    }

    /// Starts the connection driver on the current runtime. A no-op while a
    /// connection to the same endpoint is open or being established. A new server
    /// or credential, or a call during backoff, restarts the driver right away.
    pub fn connect(&self, server_url: &str, credential: &str) -> Result<(), SocketError> {
        let url = socket_url(server_url, credential)?;
        let _ordered = self.inner.transitions.lock();
        let (generation, changed) = {
            let mut state = self.inner.state.lock();
            if state.should_reconnect {
                let same_target = state.target.as_ref() == Some(&url);
                if same_target && state.status != ConnectionStatus::Reconnecting {
                    trace!(target: "clawchat::socket", "connect ignored; already active");
                    return Ok(());
                }
                if let Some(driver) = state.driver.take() {
                    driver.abort();
                }
                debug!(target: "clawchat::socket", same_target, "restarting socket driver");
            }
            state.should_reconnect = true;
            state.generation += 1;
            state.delay = self.inner.policy.floor;
            let changed = state.status != ConnectionStatus::Connecting;
            state.status = ConnectionStatus::Connecting;
            state.target = Some(url.clone());
            let generation = state.generation;
            state.driver = Some(tokio::spawn(drive(self.inner.clone(), generation, url)));
            (generation, changed)
        };
        debug!(target: "clawchat::socket", generation, "socket driver started");
        if changed {
            self.inner.notify(ConnectionStatus::Connecting);
        }
        Ok(())
    }

    /// Stops reconnecting, cancels any pending timer and closes the connection.
    pub fn disconnect(&self) {
        let _ordered = self.inner.transitions.lock();
        let changed = {
            let mut state = self.inner.state.lock();
            state.should_reconnect = false;
            state.generation += 1;
            state.target = None;
            if let Some(driver) = state.driver.take() {
                driver.abort();
            }
            let changed = state.status != ConnectionStatus::Disconnected;
            state.status = ConnectionStatus::Disconnected;
            state.delay = self.inner.policy.floor;
            changed
        };
        if changed {
            info!(target: "clawchat::socket", "socket disconnected");
            self.inner.notify(ConnectionStatus::Disconnected);
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Delay the next reconnect attempt will wait for.
    pub fn reconnect_delay(&self) -> Duration {
        self.inner.state.lock().delay
    }

    pub fn on<F>(&self, kind: SocketEventKind, handler: F) -> HandlerId
    where
        F: Fn(&SocketEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns false when no such handler was registered.
    pub fn off(&self, kind: SocketEventKind, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    pub fn on_status_change<F>(&self, callback: F) -> StatusSubscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(callback)));
        StatusSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Keeps a status callback registered until dropped.
#[must_use = "dropping the subscription unregisters the callback"]
pub struct StatusSubscription {
    inner: Weak<Inner>,
    id: u64,
}

impl StatusSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl Inner {
    fn notify(&self, status: ConnectionStatus) {
        let listeners: Vec<StatusCallback> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in listeners {
            callback(status);
        }
    }

    /// Applies a driver transition unless the driver has been superseded.
    fn opened(&self, generation: u64) -> bool {
        let _ordered = self.transitions.lock();
        let changed = {
            let mut state = self.state.lock();
            if state.generation != generation || !state.should_reconnect {
                return false;
            }
            state.delay = self.policy.floor;
            let changed = state.status != ConnectionStatus::Connected;
            state.status = ConnectionStatus::Connected;
            changed
        };
        if changed {
            self.notify(ConnectionStatus::Connected);
        }
        true
    }

    /// Returns the delay to wait before the next attempt and doubles the stored one.
    fn schedule_reconnect(&self, generation: u64) -> Option<Duration> {
        let _ordered = self.transitions.lock();
        let (delay, changed) = {
            let mut state = self.state.lock();
            if state.generation != generation || !state.should_reconnect {
                return None;
            }
            let delay = state.delay;
            state.delay = self.policy.next_delay(delay);
            let changed = state.status != ConnectionStatus::Reconnecting;
            state.status = ConnectionStatus::Reconnecting;
            (delay, changed)
        };
        if changed {
            self.notify(ConnectionStatus::Reconnecting);
        }
        Some(delay)
    }

    fn dispatch(&self, text: &str) {
        let event = match SocketEvent::decode(text) {
            Ok(event) => event,
            Err(DecodeSkip::Malformed(reason)) => {
                debug!(target: "clawchat::socket", %reason, "dropping malformed envelope");
                return;
            }
            Err(DecodeSkip::UnknownType(kind)) => {
                trace!(target: "clawchat::socket", %kind, "no dispatch for event type");
                return;
            }
        };
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        trace!(
            target: "clawchat::socket",
            kind = event.kind().as_str(),
            handlers = handlers.len(),
            "dispatching event"
        );
        for handler in handlers {
            handler(&event);
        }
    }
}

async fn drive(inner: Arc<Inner>, generation: u64, url: Url) {
    loop {
        match inner.connector.connect(&url).await {
            Ok(mut messages) => {
                if !inner.opened(generation) {
                    return;
                }
                info!(target: "clawchat::socket", host = url.host_str().unwrap_or(""), "socket connected");
                while let Some(message) = messages.next().await {
                    match message {
                        Ok(text) => inner.dispatch(&text),
                        Err(err) => {
                            debug!(target: "clawchat::socket", error = %err, "socket read failed");
                            break;
                        }
                    }
                }
                debug!(target: "clawchat::socket", "socket closed");
            }
            Err(err) => {
                warn!(target: "clawchat::socket", error = %err, "socket connect failed");
            }
        }

        let Some(delay) = inner.schedule_reconnect(generation) else {
            return;
        };
        debug!(
            target: "clawchat::socket",
            delay_ms = delay.as_millis() as u64,
            "scheduling socket reconnect"
        );
        sleep(delay).await;
    }
}
