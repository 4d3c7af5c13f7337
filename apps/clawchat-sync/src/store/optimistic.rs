//! Apply-now, confirm-later mutations with exact rollback.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::notice::{Notice, Notifier};
use crate::executor::{ApiRequest, ExecutorError, RequestExecutor};
use crate::queue::MutationQueue;
use crate::status::LinkStatus;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MutationError {
    #[error(transparent)]
    Remote(ExecutorError),
    #[error("could not queue mutation: {0}")]
    Queue(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// No server configured; the local change is final.
    LocalOnly,
    Confirmed,
    /// Offline; recorded for replay and kept locally.
    Queued,
    RolledBack(MutationError),
    Undone,
}

/// The prior values an optimistic change overwrote, as a closure that puts them back.
pub struct OptimisticEdit<S> {
    restore: Box<dyn FnOnce(&mut S) + Send>,
}

impl<S> OptimisticEdit<S> {
    pub fn new(restore: impl FnOnce(&mut S) + Send + 'static) -> Self {
        Self {
            restore: Box::new(restore),
        }
    }

    pub fn restore(self, state: &mut S) {
        (self.restore)(state)
    }
}

/// Where confirmed mutations go: the executor when reachable, the queue otherwise.
#[derive(Clone)]
pub struct Remote {
    pub executor: Arc<dyn RequestExecutor>,
    pub queue: Arc<MutationQueue>,
    pub link: LinkStatus,
}

pub struct MutationHandle {
    inner: HandleInner,
}

enum HandleInner {
    Ready(MutationOutcome),
    Running(JoinHandle<MutationOutcome>),
}

impl MutationHandle {
    pub fn ready(outcome: MutationOutcome) -> Self {
        Self {
            inner: HandleInner::Ready(outcome),
        }
    }

    pub(crate) fn running(task: JoinHandle<MutationOutcome>) -> Self {
        Self {
            inner: HandleInner::Running(task),
        }
    }

    pub async fn outcome(self) -> MutationOutcome {
        match self.inner {
            HandleInner::Ready(outcome) => outcome,
            HandleInner::Running(task) => match task.await {
                Ok(outcome) => outcome,
                Err(err) => MutationOutcome::RolledBack(MutationError::Remote(
                    ExecutorError::Network(err.to_string()),
                )),
            },
        }
    }
}

/// Sends an already-applied change to the server. On failure the edit is restored
/// under the state lock and a notice is emitted.
pub(crate) fn commit<S: Send + 'static>(
    state: Arc<Mutex<S>>,
    remote: Option<&Remote>,
    notifier: Arc<dyn Notifier>,
    request: ApiRequest,
    edit: OptimisticEdit<S>,
    failure: String,
) -> MutationHandle {
    let Some(remote) = remote else {
        return MutationHandle::ready(MutationOutcome::LocalOnly);
    };

    if !remote.link.is_online() {
        return match remote
            .queue
            .enqueue(request.method, request.path.clone(), request.body.clone())
        {
            Ok(_) => MutationHandle::ready(MutationOutcome::Queued),
            Err(err) => {
                warn!(target: "clawchat::store", error = %err, "could not queue mutation; reverting");
                edit.restore(&mut state.lock());
                notifier.notify(Notice::error(failure));
                MutationHandle::ready(MutationOutcome::RolledBack(MutationError::Queue(
                    err.to_string(),
                )))
            }
        };
    }

    let executor = remote.executor.clone();
    MutationHandle::running(tokio::spawn(async move {
        let method = request.method;
        let path = request.path.clone();
        match executor.execute(request).await {
            Ok(_) => {
                debug!(target: "clawchat::store", %method, %path, "mutation confirmed");
                MutationOutcome::Confirmed
            }
            Err(err) => {
                warn!(
                    target: "clawchat::store",
                    %method,
                    %path,
                    error = %err,
                    "mutation rejected; reverting"
                );
                edit.restore(&mut state.lock());
                notifier.notify(Notice::error(failure));
                MutationOutcome::RolledBack(MutationError::Remote(err))
            }
        }
    }))
}
