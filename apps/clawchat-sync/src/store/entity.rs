use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    Todos,
    Events,
    Memos,
}

impl Module {
    pub const ALL: [Module; 3] = [Module::Todos, Module::Events, Module::Memos];

    pub fn as_str(self) -> &'static str {
        match self {
            Module::Todos => "todos",
            Module::Events => "events",
            Module::Memos => "memos",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|module| module.as_str() == name)
    }

    pub fn collection_path(self) -> String {
        format!("/{}", self.as_str())
    }

    pub fn item_path(self, id: &str) -> String {
        format!("/{}/{}", self.as_str(), id)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoStatus {
    #[default]
    Pending,
    Completed,
}

impl TodoStatus {
    pub fn toggled(self) -> Self {
        match self {
            TodoStatus::Pending => TodoStatus::Completed,
            TodoStatus::Completed => TodoStatus::Pending,
        }
    }
}

/// Client-side board column. `InProgress` only exists locally; the server sees
/// such todos as pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KanbanColumn {
    Pending,
    InProgress,
    Completed,
}

impl KanbanColumn {
    pub fn server_status(self) -> TodoStatus {
        match self {
            KanbanColumn::Pending | KanbanColumn::InProgress => TodoStatus::Pending,
            KanbanColumn::Completed => TodoStatus::Completed,
        }
    }
}

impl From<TodoStatus> for KanbanColumn {
    fn from(status: TodoStatus) -> Self {
        match status {
            TodoStatus::Pending => KanbanColumn::Pending,
            TodoStatus::Completed => KanbanColumn::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: TodoStatus,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memo {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A server-backed record living in one module collection.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const MODULE: Module;

    fn id(&self) -> &str;
}

impl Entity for Todo {
    const MODULE: Module = Module::Todos;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for CalendarEvent {
    const MODULE: Module = Module::Events;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Memo {
    const MODULE: Module = Module::Memos;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Merges `fields` over the serialized entity. The id is never overwritten.
pub fn merge_fields<E: Entity>(entity: &E, fields: &Map<String, Value>) -> Result<E, serde_json::Error> {
    let mut value = serde_json::to_value(entity)?;
    if let Value::Object(object) = &mut value {
        for (key, field) in fields {
            if key != "id" {
                object.insert(key.clone(), field.clone());
            }
        }
    }
    serde_json::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_server_fields_survive_roundtrip() {
        let raw = json!({"id": "t1", "title": "Ship", "status": "pending", "priority": "high", "tags": ["dev"]});
        let todo: Todo = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(todo.extra["priority"], "high");
        assert_eq!(serde_json::to_value(&todo).unwrap(), raw);
    }

    #[test]
    fn merge_keeps_identity() {
        let memo = Memo {
            id: "m1".into(),
            content: "old".into(),
            extra: Map::new(),
        };
        let fields = json!({"id": "hijack", "content": "new", "pinned": true});
        let merged = merge_fields(&memo, fields.as_object().unwrap()).unwrap();
        assert_eq!(merged.id, "m1");
        assert_eq!(merged.content, "new");
        assert_eq!(merged.extra["pinned"], true);
    }

    #[test]
    fn in_progress_is_pending_on_the_server() {
        assert_eq!(KanbanColumn::InProgress.server_status(), TodoStatus::Pending);
        assert_eq!(KanbanColumn::from(TodoStatus::Completed), KanbanColumn::Completed);
        assert_eq!(Module::from_name("memos"), Some(Module::Memos));
        assert_eq!(Module::Events.item_path("e1"), "/events/e1");
    }
}
