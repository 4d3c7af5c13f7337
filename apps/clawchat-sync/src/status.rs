use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared view of whether the server is reachable.
///
/// The coordinator writes it; stores read it to choose between calling the server
/// now and queuing the mutation for replay.
#[derive(Clone)]
pub struct LinkStatus {
    tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl LinkStatus {
    pub fn new(initial: ConnectionStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    /// Reachable unless a transition to offline has been observed. A reconnect in
    /// progress still counts as reachable so mutations are attempted, not queued.
    pub fn is_online(&self) -> bool {
        self.get() != ConnectionStatus::Disconnected
    }

    /// Returns true when the value changed.
    pub fn set(&self, status: ConnectionStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new(ConnectionStatus::Connected)
    }
}
