//! Ties connectivity transitions and socket status to queue replay and data refresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::connectivity::Connectivity;
use crate::executor::RequestExecutor;
use crate::queue::{FlushReport, MutationQueue};
use crate::socket::{SocketManager, StatusSubscription};
use crate::status::{ConnectionStatus, LinkStatus};

pub const DEFAULT_PENDING_POLL: Duration = Duration::from_secs(2);

/// Pulls fresh server state after a replay.
#[async_trait]
pub trait DataRefresh: Send + Sync {
    async fn refresh(&self);
}

/// Refreshes several stores one after another.
pub struct RefreshChain(Vec<Arc<dyn DataRefresh>>);

impl RefreshChain {
    pub fn new(targets: Vec<Arc<dyn DataRefresh>>) -> Self {
        Self(targets)
    }
}

#[async_trait]
impl DataRefresh for RefreshChain {
    async fn refresh(&self) {
        for target in &self.0 {
            target.refresh().await;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushAttempt {
    NoServer,
    AlreadyFlushing,
    Completed(FlushReport),
    Failed(String),
}

struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushGuard(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncCoordinator {
    queue: Arc<MutationQueue>,
    executor: Arc<dyn RequestExecutor>,
    refresh: Arc<dyn DataRefresh>,
    server_configured: bool,
    link: LinkStatus,
    pending: watch::Sender<usize>,
    flushing: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<MutationQueue>,
        executor: Arc<dyn RequestExecutor>,
        refresh: Arc<dyn DataRefresh>,
        link: LinkStatus,
        server_configured: bool,
    ) -> Arc<Self> {
        let initial = queue.count().unwrap_or_default();
        let (pending, _rx) = watch::channel(initial);
        Arc::new(Self {
            queue,
            executor,
            refresh,
            server_configured,
            link,
            pending,
            flushing: AtomicBool::new(false),
        })
    }

    pub fn link(&self) -> &LinkStatus {
        &self.link
    }

    pub fn pending_count(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending.subscribe()
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Replays the queue, then refreshes. At most one runs at a time.
    pub async fn handle_online(&self) -> FlushAttempt {
        if !self.server_configured {
            return FlushAttempt::NoServer;
        }
        info!(target: "clawchat::sync", "back online");
        self.link.set(ConnectionStatus::Reconnecting);

        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            debug!(target: "clawchat::sync", "flush already in flight");
            return FlushAttempt::AlreadyFlushing;
        };

        match self.queue.flush(self.executor.as_ref()).await {
            Ok(report) => {
                self.update_pending();
                self.refresh.refresh().await;
                self.link.set(ConnectionStatus::Connected);
                FlushAttempt::Completed(report)
            }
            Err(err) => {
                error!(target: "clawchat::sync", error = %err, "offline queue flush failed");
                self.update_pending();
                self.link.set(ConnectionStatus::Disconnected);
                FlushAttempt::Failed(err.to_string())
            }
        }
    }

    pub fn handle_offline(&self) {
        info!(target: "clawchat::sync", "went offline");
        self.link.set(ConnectionStatus::Disconnected);
    }

    /// Follows a connectivity signal until it ends. Replays run in their own task so
    /// an `Offline` arriving mid-flush is applied immediately.
    pub fn spawn<S>(self: &Arc<Self>, signal: S) -> JoinHandle<()>
    where
        S: Stream<Item = Connectivity> + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut signal = Box::pin(signal);
            while let Some(transition) = signal.next().await {
                match transition {
                    Connectivity::Online => {
                        let this = Arc::clone(&this);
                        tokio::spawn(async move {
                            this.handle_online().await;
                        });
                    }
                    Connectivity::Offline => this.handle_offline(),
                }
            }
        })
    }

    pub fn spawn_pending_poller(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else {
                    return;
                };
                this.update_pending();
            }
        })
    }

    /// Mirrors socket status: a transition into `connected` triggers a replay,
    /// `reconnecting` and `disconnected` are copied into the link status.
    pub fn attach_socket(self: &Arc<Self>, socket: &SocketManager) -> StatusSubscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        let runtime = Handle::current();
        let previous = Mutex::new(socket.status());
        socket.on_status_change(move |status| {
            let was = std::mem::replace(&mut *previous.lock(), status);
            let Some(this) = weak.upgrade() else {
                return;
            };
            match status {
                ConnectionStatus::Connected if was != ConnectionStatus::Connected => {
                    runtime.spawn(async move {
                        this.handle_online().await;
                    });
                }
                ConnectionStatus::Reconnecting | ConnectionStatus::Disconnected => {
                    this.link.set(status);
                }
                _ => {}
            }
        })
    }

    fn update_pending(&self) {
        match self.queue.count() {
            Ok(count) => {
                self.pending.send_if_modified(|current| {
                    let changed = *current != count;
                    *current = count;
                    changed
                });
            }
            Err(err) => debug!(target: "clawchat::sync", error = %err, "pending count unavailable"),
        }
    }
}
