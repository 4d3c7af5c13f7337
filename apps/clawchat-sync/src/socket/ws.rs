use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::trace;
use url::Url;

use super::{MessageStream, SocketConnector, SocketError};

/// tokio-tungstenite client. Yields inbound text frames; the stream ends on close.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<MessageStream, SocketError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SocketError::Connect(err.to_string()))?;
        // Outbound traffic is not part of the protocol; keep the sink alive so the
        // connection is not half-closed.
        let (ws_write, ws_read) = ws_stream.split();

        let messages = stream::unfold(
            (ws_read, ws_write),
            |(mut read, write)| async move {
                loop {
                    match read.next().await? {
                        Ok(Message::Text(text)) => {
                            trace!(target: "clawchat::socket", kind = "text", len = text.len(), "ws_in");
                            return Some((Ok(text), (read, write)));
                        }
                        Ok(Message::Binary(data)) => {
                            trace!(target: "clawchat::socket", kind = "binary", len = data.len(), "ws_in");
                            match String::from_utf8(data) {
                                Ok(text) => return Some((Ok(text), (read, write))),
                                Err(_) => continue,
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            trace!(target: "clawchat::socket", ?frame, "ws closed by server");
                            return None;
                        }
                        Ok(_) => continue,
                        Err(err) => {
                            return Some((Err(SocketError::Closed(err.to_string())), (read, write)))
                        }
                    }
                }
            },
        );
        Ok(messages.boxed())
    }
}
