use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEventKind {
    ModuleDataChanged,
    Reminder,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    StreamStart,
    StreamChunk,
    StreamEnd,
    ConversationUpdated,
}

impl SocketEventKind {
    pub const ALL: [SocketEventKind; 9] = [
        SocketEventKind::ModuleDataChanged,
        SocketEventKind::Reminder,
        SocketEventKind::TaskProgress,
        SocketEventKind::TaskCompleted,
        SocketEventKind::TaskFailed,
        SocketEventKind::StreamStart,
        SocketEventKind::StreamChunk,
        SocketEventKind::StreamEnd,
        SocketEventKind::ConversationUpdated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SocketEventKind::ModuleDataChanged => "module_data_changed",
            SocketEventKind::Reminder => "reminder",
            SocketEventKind::TaskProgress => "task_progress",
            SocketEventKind::TaskCompleted => "task_completed",
            SocketEventKind::TaskFailed => "task_failed",
            SocketEventKind::StreamStart => "stream_start",
            SocketEventKind::StreamChunk => "stream_chunk",
            SocketEventKind::StreamEnd => "stream_end",
            SocketEventKind::ConversationUpdated => "conversation_updated",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleDataChanged {
    #[serde(default)]
    pub module: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Reminder {
    pub fn text(&self) -> String {
        self.message.clone().unwrap_or_else(|| {
            format!(
                "Reminder: {}",
                self.title.as_deref().unwrap_or("Upcoming event")
            )
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleted {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFailed {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStart {
    pub message_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnd {
    pub message_id: String,
    pub full_content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationUpdated {
    pub conversation_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Server push events, one variant per known envelope `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SocketEvent {
    ModuleDataChanged(ModuleDataChanged),
    Reminder(Reminder),
    TaskProgress(TaskProgress),
    TaskCompleted(TaskCompleted),
    TaskFailed(TaskFailed),
    StreamStart(StreamStart),
    StreamChunk(StreamChunk),
    StreamEnd(StreamEnd),
    ConversationUpdated(ConversationUpdated),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Why an inbound message was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeSkip {
    Malformed(String),
    UnknownType(String),
}

impl SocketEvent {
    pub fn kind(&self) -> SocketEventKind {
        match self {
            SocketEvent::ModuleDataChanged(_) => SocketEventKind::ModuleDataChanged,
            SocketEvent::Reminder(_) => SocketEventKind::Reminder,
            SocketEvent::TaskProgress(_) => SocketEventKind::TaskProgress,
            SocketEvent::TaskCompleted(_) => SocketEventKind::TaskCompleted,
            SocketEvent::TaskFailed(_) => SocketEventKind::TaskFailed,
            SocketEvent::StreamStart(_) => SocketEventKind::StreamStart,
            SocketEvent::StreamChunk(_) => SocketEventKind::StreamChunk,
            SocketEvent::StreamEnd(_) => SocketEventKind::StreamEnd,
            SocketEvent::ConversationUpdated(_) => SocketEventKind::ConversationUpdated,
        }
    }

    /// Parses a `{type, data}` envelope.
    pub fn decode(text: &str) -> Result<Self, DecodeSkip> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|err| DecodeSkip::Malformed(err.to_string()))?;
        let kind = SocketEventKind::from_wire(&envelope.kind)
            .ok_or_else(|| DecodeSkip::UnknownType(envelope.kind.clone()))?;
        let data = match envelope.data {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let event = match kind {
            SocketEventKind::ModuleDataChanged => SocketEvent::ModuleDataChanged(payload(data)?),
            SocketEventKind::Reminder => SocketEvent::Reminder(payload(data)?),
            SocketEventKind::TaskProgress => SocketEvent::TaskProgress(payload(data)?),
            SocketEventKind::TaskCompleted => SocketEvent::TaskCompleted(payload(data)?),
            SocketEventKind::TaskFailed => SocketEvent::TaskFailed(payload(data)?),
            SocketEventKind::StreamStart => SocketEvent::StreamStart(payload(data)?),
            SocketEventKind::StreamChunk => SocketEvent::StreamChunk(payload(data)?),
            SocketEventKind::StreamEnd => SocketEvent::StreamEnd(payload(data)?),
            SocketEventKind::ConversationUpdated => {
                SocketEvent::ConversationUpdated(payload(data)?)
            }
        };
        Ok(event)
    }
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, DecodeSkip> {
    serde_json::from_value(data).map_err(|err| DecodeSkip::Malformed(err.to_string()))
}
