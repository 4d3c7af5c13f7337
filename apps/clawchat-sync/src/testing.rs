//! Doubles shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use time::OffsetDateTime;

use crate::executor::{ApiRequest, ExecutorError, HttpMethod, RequestExecutor};
use crate::queue::Clock;
use crate::socket::{MessageStream, SocketConnector, SocketError};
use crate::stream::{ByteStream, StreamConnector, StreamError, StreamRequest};

/// Records every request. Routed requests always get their fixed response; the
/// rest consume scripted results in order, then succeed with `null`.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    calls: Mutex<Vec<ApiRequest>>,
    scripted: Mutex<VecDeque<Result<Value, ExecutorError>>>,
    routes: Mutex<HashMap<(HttpMethod, String), Result<Value, ExecutorError>>>,
}

impl ScriptedExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(self, result: Result<Value, ExecutorError>) -> Self {
        self.scripted.lock().push_back(result);
        self
    }

    pub(crate) fn route(
        self,
        method: HttpMethod,
        path: &str,
        result: Result<Value, ExecutorError>,
    ) -> Self {
        self.routes.lock().insert((method, path.to_string()), result);
        self
    }

    pub(crate) fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().clone()
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|call| format!("{} {}", call.method, call.path))
            .collect()
    }
}

#[async_trait]
impl RequestExecutor for ScriptedExecutor {
    async fn execute(&self, request: ApiRequest) -> Result<Value, ExecutorError> {
        let routed = self
            .routes
            .lock()
            .get(&(request.method, request.path.clone()))
            .cloned();
        self.calls.lock().push(request);
        if let Some(result) = routed {
            return result;
        }
        let next = self.scripted.lock().pop_front();
        next.unwrap_or(Ok(Value::Null))
    }
}

pub(crate) struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: Mutex::new(OffsetDateTime::now_utc()),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

/// Socket connector whose first connection is fed from a test-held channel. Later
/// attempts never complete.
pub(crate) struct ChannelConnector {
    feed: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<String>>>,
}

impl ChannelConnector {
    pub(crate) fn new() -> (std::sync::Arc<Self>, tokio::sync::mpsc::UnboundedSender<String>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            std::sync::Arc::new(Self {
                feed: Mutex::new(Some(rx)),
            }),
            tx,
        )
    }
}

#[async_trait]
impl SocketConnector for ChannelConnector {
    async fn connect(&self, _url: &url::Url) -> Result<MessageStream, SocketError> {
        let feed = self.feed.lock().take();
        match feed {
            Some(rx) => Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|text| (Ok(text), rx))
            })
            .boxed()),
            None => std::future::pending().await,
        }
    }
}

/// Stream connector that replays fixed chunks, then either ends or stays open.
pub(crate) struct FixedBody {
    pub(crate) chunks: Vec<&'static str>,
    pub(crate) hang: bool,
}

#[async_trait]
impl StreamConnector for FixedBody {
    async fn open(&self, _request: &StreamRequest) -> Result<ByteStream, StreamError> {
        let head = futures_util::stream::iter(
            self.chunks
                .iter()
                .map(|chunk| Ok(bytes::Bytes::from_static(chunk.as_bytes())))
                .collect::<Vec<_>>(),
        );
        Ok(if self.hang {
            head.chain(futures_util::stream::pending()).boxed()
        } else {
            head.boxed()
        })
    }
}

pub(crate) struct Refusing(pub(crate) StreamError);

#[async_trait]
impl StreamConnector for Refusing {
    async fn open(&self, _request: &StreamRequest) -> Result<ByteStream, StreamError> {
        Err(self.0.clone())
    }
}

/// Polls `check` every few milliseconds until it holds, for up to two seconds.
pub(crate) async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
