use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;

use super::{ByteStream, StreamConnector, StreamError, StreamRequest};

/// Opens generation streams with reqwest and exposes the body as a chunk stream.
#[derive(Clone, Default)]
pub struct HttpStreamConnector {
    http: Client,
}

impl HttpStreamConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl StreamConnector for HttpStreamConnector {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, StreamError> {
        let mut builder = self
            .http
            .post(&request.url)
            .header(ACCEPT, "text/event-stream")
            .json(&request.payload);
        if !request.credential.is_empty() {
            builder = builder.bearer_auth(&request.credential);
        }

        let res = builder
            .send()
            .await
            .map_err(|err| StreamError::Connect(err.to_string()))?;
        let status = res.status().as_u16();
        if status == 401 || status == 403 {
            return Err(StreamError::Unauthorized { status });
        }
        if !res.status().is_success() {
            let body = res
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StreamError::Status { status, body });
        }

        Ok(res
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| StreamError::Interrupted(err.to_string())))
            .boxed())
    }
}
