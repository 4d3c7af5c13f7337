use std::time::Duration;

use serde_json::{json, Value};

use super::frame::{parse_payload, Frame, StreamMeta};
use super::StreamError;

/// One generation request as sent to the stream endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub url: String,
    pub payload: Value,
    pub credential: String,
}

impl StreamRequest {
    pub fn new(url: impl Into<String>, payload: Value, credential: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            payload,
            credential: credential.into(),
        }
    }

    /// `POST <server>/api/chat/stream` with `{conversation_id, content}`.
    pub fn chat(
        server_url: &str,
        conversation_id: &str,
        content: &str,
        credential: impl Into<String>,
    ) -> Self {
        Self::new(
            format!("{}/api/chat/stream", server_url.trim_end_matches('/')),
            json!({ "conversation_id": conversation_id, "content": content }),
            credential,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based): base, 2×base, 4×base, …
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Connecting,
    Streaming,
    Retrying { retry: u32, delay: Duration },
    Done,
    Failed,
}

/// What a single payload did to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEffect {
    Meta(StreamMeta),
    Token(String),
    Title(String),
    Done,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Retry(Duration),
    Salvage,
    Fail,
}

/// Explicit state for one generation request: accumulated text, metadata flag, retry
/// counter and phase. The async driver only moves data in and out of it.
#[derive(Debug)]
pub struct StreamSession {
    request: StreamRequest,
    policy: RetryPolicy,
    accumulated: String,
    meta_received: bool,
    retries: u32,
    phase: StreamPhase,
}

impl StreamSession {
    pub fn new(request: StreamRequest, policy: RetryPolicy) -> Self {
        Self {
            request,
            policy,
            accumulated: String::new(),
            meta_received: false,
            retries: 0,
            phase: StreamPhase::Connecting,
        }
    }

    pub fn request(&self) -> &StreamRequest {
        &self.request
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn meta_received(&self) -> bool {
        self.meta_received
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn begin_attempt(&mut self) {
        self.phase = StreamPhase::Connecting;
    }

    pub fn mark_streaming(&mut self) {
        self.phase = StreamPhase::Streaming;
    }

    pub fn apply(&mut self, payload: &str) -> FrameEffect {
        let fields = match parse_payload(payload) {
            Some(Frame::Done) => return FrameEffect::Done,
            Some(Frame::Fields(fields)) => fields,
            None => return FrameEffect::Ignored,
        };
        if !self.meta_received {
            if let Some(meta) = fields.meta() {
                self.meta_received = true;
                return FrameEffect::Meta(meta);
            }
        }
        if let Some(token) = fields.token {
            self.accumulated.push_str(&token);
            return FrameEffect::Token(token);
        }
        if let Some(title) = fields.title {
            return FrameEffect::Title(title);
        }
        FrameEffect::Ignored
    }

    /// Decides how to continue after a failed attempt.
    pub fn recover(&mut self, error: &StreamError) -> Recovery {
        if !self.accumulated.is_empty() {
            return Recovery::Salvage;
        }
        if error.is_unauthorized() || self.meta_received {
            return Recovery::Fail;
        }
        if self.retries >= self.policy.max_retries {
            return Recovery::Fail;
        }
        let delay = self.policy.delay_for(self.retries);
        self.phase = StreamPhase::Retrying {
            retry: self.retries + 1,
            delay,
        };
        self.retries += 1;
        Recovery::Retry(delay)
    }

    /// Ends the session successfully, handing over the text.
    pub fn complete(&mut self) -> String {
        self.phase = StreamPhase::Done;
        std::mem::take(&mut self.accumulated)
    }

    pub fn fail(&mut self) {
        self.phase = StreamPhase::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> StreamSession {
        StreamSession::new(
            StreamRequest::chat("http://srv", "c1", "hi", "tok"),
            RetryPolicy::default(),
        )
    }

    #[test]
    fn chat_request_targets_stream_endpoint() {
        let req = StreamRequest::chat("http://srv/", "c1", "hello", "tok");
        assert_eq!(req.url, "http://srv/api/chat/stream");
        assert_eq!(req.payload["conversation_id"], "c1");
        assert_eq!(req.payload["content"], "hello");
    }

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
    }

    #[test]
    fn meta_fires_once_then_tokens_accumulate() {
        let mut s = session();
        let meta = "{\"conversation_id\":\"c1\",\"message_id\":\"m1\"}";
        assert!(matches!(s.apply(meta), FrameEffect::Meta(_)));
        assert_eq!(s.apply(meta), FrameEffect::Ignored);
        assert_eq!(
            s.apply("{\"token\":\"Hi\"}"),
            FrameEffect::Token("Hi".into())
        );
        assert_eq!(
            s.apply("{\"title\":\"Greeting\"}"),
            FrameEffect::Title("Greeting".into())
        );
        assert_eq!(s.apply("garbage"), FrameEffect::Ignored);
        assert_eq!(s.apply("[DONE]"), FrameEffect::Done);
        assert_eq!(s.accumulated(), "Hi");
        assert_eq!(s.complete(), "Hi");
        assert_eq!(s.phase(), StreamPhase::Done);
    }

    #[test]
    fn retries_only_before_any_progress() {
        let mut s = session();
        let err = StreamError::Connect("refused".into());
        assert_eq!(s.recover(&err), Recovery::Retry(Duration::from_secs(1)));
        assert_eq!(
            s.phase(),
            StreamPhase::Retrying {
                retry: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(s.recover(&err), Recovery::Retry(Duration::from_secs(2)));
        assert_eq!(s.recover(&err), Recovery::Fail);
        assert_eq!(s.retries(), 2);
    }

    #[test]
    fn partial_text_is_salvaged_instead_of_retried() {
        let mut s = session();
        s.apply("{\"token\":\"Hello wor\"}");
        assert_eq!(
            s.recover(&StreamError::Interrupted("reset".into())),
            Recovery::Salvage
        );
        assert_eq!(s.retries(), 0);
    }

    #[test]
    fn unauthorized_and_post_meta_failures_are_terminal() {
        let mut s = session();
        assert_eq!(
            s.recover(&StreamError::Unauthorized { status: 401 }),
            Recovery::Fail
        );

        let mut s = session();
        s.apply("{\"conversation_id\":\"c1\",\"message_id\":\"m1\"}");
        assert_eq!(s.recover(&StreamError::EndedEarly), Recovery::Fail);
    }
}
