use serde::{Deserialize, Serialize};

/// Payload that terminates a generation stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const FRAME_BOUNDARY: &[u8] = b"\n\n";

/// Identifiers announced by the first frame of a generation stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub conversation_id: String,
    pub message_id: String,
}

/// A decoded `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Done,
    Fields(FrameFields),
}

/// The fields of a JSON frame the transport cares about; everything else is ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FrameFields {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl FrameFields {
    pub fn meta(&self) -> Option<StreamMeta> {
        match (&self.conversation_id, &self.message_id) {
            (Some(conversation_id), Some(message_id))
                if !conversation_id.is_empty() && !message_id.is_empty() =>
            {
                Some(StreamMeta {
                    conversation_id: conversation_id.clone(),
                    message_id: message_id.clone(),
                })
            }
            _ => None,
        }
    }
}

/// Returns `None` for malformed payloads; callers drop them.
pub fn parse_payload(payload: &str) -> Option<Frame> {
    if payload == DONE_SENTINEL {
        return Some(Frame::Done);
    }
    match serde_json::from_str::<FrameFields>(payload) {
        Ok(fields) => Some(Frame::Fields(fields)),
        Err(err) => {
            tracing::debug!(target: "clawchat::stream", error = %err, "skipping malformed frame");
            None
        }
    }
}

/// Incremental splitter for a growing response body.
///
/// Only bytes up to the last frame boundary are decoded; the tail is kept for the next
/// chunk. Boundaries are ASCII so a split never lands inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no boundary.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        // A boundary may straddle the previous chunk's last byte.
        let start = self.scanned.saturating_sub(FRAME_BOUNDARY.len() - 1);
        let Some(found) = self.buffer[start..]
            .windows(FRAME_BOUNDARY.len())
            .rposition(|window| window == FRAME_BOUNDARY)
        else {
            self.scanned = self.buffer.len();
            return Vec::new();
        };
        let tail = self.buffer.split_off(start + found + FRAME_BOUNDARY.len());
        self.scanned = tail.len();
        let complete = std::mem::replace(&mut self.buffer, tail);
        extract_data(&String::from_utf8_lossy(&complete))
    }

    /// Decodes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if rest.is_empty() {
            return Vec::new();
        }
        extract_data(&String::from_utf8_lossy(&rest))
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Pulls the `data:` lines out of a block of complete frames.
pub fn extract_data(raw: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    for part in raw.split("\n\n") {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        for line in trimmed.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                payloads.push(rest.strip_prefix(' ').unwrap_or(rest).to_owned());
            }
        }
    }
    payloads
}
