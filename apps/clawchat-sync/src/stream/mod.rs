//! Generation-stream transport: one request per send, frames parsed incrementally,
//! retries before any progress, salvage after it.

mod frame;
mod http;
mod session;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

pub use frame::{
    extract_data, parse_payload, Frame, FrameDecoder, FrameFields, StreamMeta, DONE_SENTINEL,
};
pub use http::HttpStreamConnector;
pub use session::{FrameEffect, Recovery, RetryPolicy, StreamPhase, StreamRequest, StreamSession};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    #[error("unauthorized (HTTP {status})")]
    Unauthorized { status: u16 },
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("stream interrupted: {0}")]
    Interrupted(String),
    #[error("stream ended before completion")]
    EndedEarly,
}

impl StreamError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, StreamError::Unauthorized { .. })
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Opens the underlying request for one attempt.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, StreamError>;
}

/// Session callbacks. Exactly one of `on_done` / `on_error` is called per session.
pub trait StreamObserver: Send + Sync {
    fn on_meta(&self, _meta: &StreamMeta) {}
    fn on_token(&self, _token: &str) {}
    fn on_title_generated(&self, _title: &str) {}
    fn on_done(&self, _full_text: &str) {}
    fn on_error(&self, _error: &StreamError) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Meta(StreamMeta),
    Token(String),
    TitleGenerated(String),
    Done(String),
    Error(StreamError),
}

impl StreamObserver for mpsc::UnboundedSender<StreamEvent> {
    fn on_meta(&self, meta: &StreamMeta) {
        let _ = self.send(StreamEvent::Meta(meta.clone()));
    }

    fn on_token(&self, token: &str) {
        let _ = self.send(StreamEvent::Token(token.to_owned()));
    }

    fn on_title_generated(&self, title: &str) {
        let _ = self.send(StreamEvent::TitleGenerated(title.to_owned()));
    }

    fn on_done(&self, full_text: &str) {
        let _ = self.send(StreamEvent::Done(full_text.to_owned()));
    }

    fn on_error(&self, error: &StreamError) {
        let _ = self.send(StreamEvent::Error(error.clone()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SalvageReason {
    Cancelled,
    Idle,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed(String),
    Salvaged { text: String, reason: SalvageReason },
    Failed(StreamError),
}

impl StreamOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            StreamOutcome::Completed(text) | StreamOutcome::Salvaged { text, .. } => Some(text),
            StreamOutcome::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamCanceller(Arc<watch::Sender<bool>>);

impl StreamCanceller {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Cancellation handle plus the awaitable result of a running session.
#[derive(Debug)]
pub struct StreamHandle {
    canceller: StreamCanceller,
    task: JoinHandle<StreamOutcome>,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> StreamCanceller {
        self.canceller.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn outcome(self) -> StreamOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => StreamOutcome::Failed(StreamError::Interrupted(err.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct StreamTransport {
    connector: Arc<dyn StreamConnector>,
    policy: RetryPolicy,
    idle_timeout: Duration,
}

impl StreamTransport {
    pub fn new(connector: Arc<dyn StreamConnector>) -> Self {
        Self {
            connector,
            policy: RetryPolicy::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn http() -> Self {
        Self::new(Arc::new(HttpStreamConnector::new()))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Starts a session on the current runtime. All outcomes, including failures, are
    /// reported through `observer`; this never fails synchronously.
    pub fn open(&self, request: StreamRequest, observer: Arc<dyn StreamObserver>) -> StreamHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let session = StreamSession::new(request, self.policy);
        let task = tokio::spawn(drive(
            session,
            self.connector.clone(),
            observer,
            self.idle_timeout,
            cancel_rx,
        ));
        StreamHandle {
            canceller: StreamCanceller(Arc::new(cancel_tx)),
            task,
        }
    }
}

enum AttemptEnd {
    Completed,
    Stopped(SalvageReason),
    Failed(StreamError),
}

async fn drive(
    mut session: StreamSession,
    connector: Arc<dyn StreamConnector>,
    observer: Arc<dyn StreamObserver>,
    idle_timeout: Duration,
    mut cancel: watch::Receiver<bool>,
) -> StreamOutcome {
    loop {
        session.begin_attempt();
        let failure = match run_attempt(
            &mut session,
            connector.as_ref(),
            observer.as_ref(),
            idle_timeout,
            &mut cancel,
        )
        .await
        {
            AttemptEnd::Completed => {
                let text = session.complete();
                observer.on_done(&text);
                return StreamOutcome::Completed(text);
            }
            AttemptEnd::Stopped(reason) => return salvage(&mut session, observer.as_ref(), reason),
            AttemptEnd::Failed(err) => err,
        };

        match session.recover(&failure) {
            Recovery::Retry(delay) => {
                warn!(
                    target: "clawchat::stream",
                    retry = session.retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "generation stream failed; retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => {
                        return salvage(&mut session, observer.as_ref(), SalvageReason::Cancelled);
                    }
                    _ = sleep(delay) => {}
                }
            }
            Recovery::Salvage => {
                return salvage(&mut session, observer.as_ref(), SalvageReason::Interrupted);
            }
            Recovery::Fail => {
                warn!(
                    target: "clawchat::stream",
                    retries = session.retries(),
                    error = %failure,
                    "generation stream failed"
                );
                session.fail();
                observer.on_error(&failure);
                return StreamOutcome::Failed(failure);
            }
        }
    }
}

async fn run_attempt(
    session: &mut StreamSession,
    connector: &dyn StreamConnector,
    observer: &dyn StreamObserver,
    idle_timeout: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> AttemptEnd {
    let mut deadline = Instant::now() + idle_timeout;
    let opened = tokio::select! {
        biased;
        _ = cancelled(cancel) => return AttemptEnd::Stopped(SalvageReason::Cancelled),
        _ = sleep_until(deadline) => return AttemptEnd::Stopped(SalvageReason::Idle),
        opened = connector.open(session.request()) => opened,
    };
    let mut body = match opened {
        Ok(body) => body,
        Err(err) => return AttemptEnd::Failed(err),
    };
    session.mark_streaming();

    let mut decoder = FrameDecoder::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(cancel) => return AttemptEnd::Stopped(SalvageReason::Cancelled),
            _ = sleep_until(deadline) => return AttemptEnd::Stopped(SalvageReason::Idle),
            next = body.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                deadline = Instant::now() + idle_timeout;
                for payload in decoder.push(&chunk) {
                    if deliver(session, observer, &payload) {
                        return AttemptEnd::Completed;
                    }
                }
            }
            Some(Err(err)) => return AttemptEnd::Failed(err),
            None => {
                // Bodies that arrive whole (no streaming) end here with frames still buffered.
                for payload in decoder.finish() {
                    if deliver(session, observer, &payload) {
                        return AttemptEnd::Completed;
                    }
                }
                return AttemptEnd::Failed(StreamError::EndedEarly);
            }
        }
    }
}

/// Returns true once the completion sentinel is seen.
fn deliver(session: &mut StreamSession, observer: &dyn StreamObserver, payload: &str) -> bool {
    match session.apply(payload) {
        FrameEffect::Done => return true,
        FrameEffect::Meta(meta) => observer.on_meta(&meta),
        FrameEffect::Token(token) => observer.on_token(&token),
        FrameEffect::Title(title) => observer.on_title_generated(&title),
        FrameEffect::Ignored => {}
    }
    false
}

fn salvage(
    session: &mut StreamSession,
    observer: &dyn StreamObserver,
    reason: SalvageReason,
) -> StreamOutcome {
    let text = session.complete();
    debug!(
        target: "clawchat::stream",
        ?reason,
        chars = text.len(),
        "resolving generation stream with partial text"
    );
    observer.on_done(&text);
    StreamOutcome::Salvaged { text, reason }
}

/// Resolves once cancellation is requested; pends forever if the handle is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    enum Script {
        Refuse(StreamError),
        Body(Vec<&'static str>, Tail),
    }

    enum Tail {
        End,
        Drop,
        Hang,
    }

    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Script>>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().clone()
        }
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn open(&self, _request: &StreamRequest) -> Result<ByteStream, StreamError> {
            self.attempts.lock().push(Instant::now());
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or(Script::Refuse(StreamError::Connect("no script".into())));
            match script {
                Script::Refuse(err) => Err(err),
                Script::Body(chunks, tail) => {
                    let head = stream::iter(
                        chunks
                            .into_iter()
                            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                            .collect::<Vec<_>>(),
                    );
                    Ok(match tail {
                        Tail::End => head.boxed(),
                        Tail::Drop => head
                            .chain(stream::iter(vec![Err(StreamError::Interrupted(
                                "connection reset".into(),
                            ))]))
                            .boxed(),
                        Tail::Hang => head.chain(stream::pending()).boxed(),
                    })
                }
            }
        }
    }

    fn open(connector: Arc<ScriptedConnector>) -> (StreamHandle, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = StreamTransport::new(connector);
        let handle = transport.open(StreamRequest::chat("http://srv", "c1", "hi", "tok"), Arc::new(tx));
        (handle, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn completes_with_tokens_in_order() {
        let connector = ScriptedConnector::new(vec![Script::Body(
            vec![
                "data: {\"token\":\"Hi\"}\n\n",
                "data: {\"token\":\" there\"}\n\ndata: [DONE]\n\n",
            ],
            Tail::Hang,
        )]);
        let (handle, mut rx) = open(connector);
        assert_eq!(handle.outcome().await, StreamOutcome::Completed("Hi there".into()));
        assert_eq!(
            drain(&mut rx),
            vec![
                StreamEvent::Token("Hi".into()),
                StreamEvent::Token(" there".into()),
                StreamEvent::Done("Hi there".into()),
            ]
        );
    }

    #[tokio::test]
    async fn meta_and_title_are_reported() {
        let connector = ScriptedConnector::new(vec![Script::Body(
            vec![
                "data: {\"conversation_id\":\"c1\",\"message_id\":\"m9\"}\n\ndata: {\"token\":\"ok\"}\n\n",
                "data: {\"title\":\"Plans\"}\n\ndata: [DONE]\n\n",
            ],
            Tail::End,
        )]);
        let (handle, mut rx) = open(connector);
        handle.outcome().await;
        assert_eq!(
            drain(&mut rx),
            vec![
                StreamEvent::Meta(StreamMeta {
                    conversation_id: "c1".into(),
                    message_id: "m9".into()
                }),
                StreamEvent::Token("ok".into()),
                StreamEvent::TitleGenerated("Plans".into()),
                StreamEvent::Done("ok".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_fails() {
        let refuse = || Script::Refuse(StreamError::Connect("refused".into()));
        let connector = ScriptedConnector::new(vec![refuse(), refuse(), refuse()]);
        let (handle, mut rx) = open(connector.clone());
        let outcome = handle.outcome().await;
        assert!(matches!(outcome, StreamOutcome::Failed(StreamError::Connect(_))));

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[1] - attempts[0], Duration::from_millis(1000));
        assert_eq!(attempts[2] - attempts[0], Duration::from_millis(3000));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_when_a_retry_succeeds() {
        let connector = ScriptedConnector::new(vec![
            Script::Refuse(StreamError::Status {
                status: 502,
                body: "bad gateway".into(),
            }),
            Script::Body(vec!["data: {\"token\":\"late\"}\n\ndata: [DONE]\n\n"], Tail::End),
        ]);
        let (handle, _rx) = open(connector.clone());
        assert_eq!(handle.outcome().await, StreamOutcome::Completed("late".into()));
        assert_eq!(connector.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn salvages_partial_text_without_retrying() {
        let connector = ScriptedConnector::new(vec![Script::Body(
            vec!["data: {\"token\":\"Hello\"}\n\n", "data: {\"token\":\" wor\"}\n\n"],
            Tail::Drop,
        )]);
        let (handle, mut rx) = open(connector.clone());
        assert_eq!(
            handle.outcome().await,
            StreamOutcome::Salvaged {
                text: "Hello wor".into(),
                reason: SalvageReason::Interrupted
            }
        );
        assert_eq!(connector.attempts().len(), 1);
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&StreamEvent::Done("Hello wor".into())));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_is_not_retried() {
        let connector = ScriptedConnector::new(vec![Script::Refuse(StreamError::Unauthorized {
            status: 401,
        })]);
        let (handle, mut rx) = open(connector.clone());
        assert_eq!(
            handle.outcome().await,
            StreamOutcome::Failed(StreamError::Unauthorized { status: 401 })
        );
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![StreamEvent::Error(StreamError::Unauthorized { status: 401 })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_watchdog_salvages_after_silence() {
        let connector = ScriptedConnector::new(vec![Script::Body(
            vec!["data: {\"token\":\"partial\"}\n\n"],
            Tail::Hang,
        )]);
        let started = Instant::now();
        let (handle, mut rx) = open(connector);
        assert_eq!(
            handle.outcome().await,
            StreamOutcome::Salvaged {
                text: "partial".into(),
                reason: SalvageReason::Idle
            }
        );
        assert!(Instant::now() - started >= DEFAULT_IDLE_TIMEOUT);
        assert_eq!(drain(&mut rx).last(), Some(&StreamEvent::Done("partial".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_resolves_via_done() {
        let connector = ScriptedConnector::new(vec![
            Script::Refuse(StreamError::Connect("refused".into())),
            Script::Refuse(StreamError::Connect("refused".into())),
        ]);
        let (handle, mut rx) = open(connector.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.cancel();
        assert_eq!(
            handle.outcome().await,
            StreamOutcome::Salvaged {
                text: String::new(),
                reason: SalvageReason::Cancelled
            }
        );
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(drain(&mut rx), vec![StreamEvent::Done(String::new())]);
    }

    #[tokio::test]
    async fn whole_body_without_sentinel_is_parsed_then_salvaged() {
        let connector = ScriptedConnector::new(vec![Script::Body(
            vec!["data: {\"token\":\"a\"}\n\ndata: {\"token\":\"b\"}"],
            Tail::End,
        )]);
        let (handle, _rx) = open(connector);
        assert_eq!(handle.outcome().await.text(), Some("ab"));
    }
}
