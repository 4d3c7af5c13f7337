use std::fmt;
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};
use url::{Host, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectivity::Online => f.write_str("online"),
            Connectivity::Offline => f.write_str("offline"),
        }
    }
}

/// Treats the server as reachable when a TCP connection to its host and port opens.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    target: String,
    interval: Duration,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn for_server(server_url: &str) -> Option<Self> {
        let url = Url::parse(server_url).ok()?;
        let port = url.port_or_known_default()?;
        let target = match url.host()? {
            Host::Ipv6(addr) => format!("[{addr}]:{port}"),
            Host::Ipv4(addr) => format!("{addr}:{port}"),
            Host::Domain(name) => format!("{name}:{port}"),
        };
        Some(Self {
            target,
            interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn check(&self) -> Connectivity {
        match timeout(self.connect_timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_)) => Connectivity::Online,
            Ok(Err(err)) => {
                debug!(target: "clawchat::sync", target_addr = %self.target, error = %err, "probe failed");
                Connectivity::Offline
            }
            Err(_) => Connectivity::Offline,
        }
    }

    /// Emits the first observation, then only transitions.
    pub fn watch(self) -> BoxStream<'static, Connectivity> {
        stream::unfold((self, None::<Connectivity>), |(probe, last)| async move {
            loop {
                if last.is_some() {
                    sleep(probe.interval).await;
                }
                let now = probe.check().await;
                if last != Some(now) {
                    info!(target: "clawchat::sync", target_addr = %probe.target, state = %now, "connectivity changed");
                    return Some((now, (probe, Some(now))));
                }
            }
        })
        .boxed()
    }
}
