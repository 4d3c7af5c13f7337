//! Client-side data stores. Local state changes first; the server is told afterwards.

mod chat;
mod entity;
mod module;
mod notice;
mod optimistic;

pub use chat::{
    Author, ChatError, ChatMessage, ChatStore, Conversation, EditedMessage, Regeneration,
    GENERATION_APOLOGY,
};
pub use entity::{merge_fields, CalendarEvent, Entity, KanbanColumn, Memo, Module, Todo, TodoStatus};
pub use module::{
    ModuleState, ModuleStore, PendingDelete, StoreError, StoredEntity, TaskState,
    DEFAULT_UNDO_WINDOW,
};
pub use notice::{Notice, NoticeLevel, NoticeLog, Notifier, TracingNotifier};
pub use optimistic::{MutationError, MutationHandle, MutationOutcome, OptimisticEdit, Remote};

use crate::socket::{HandlerId, SocketEventKind, SocketManager};

/// Socket handlers registered by a store.
#[derive(Debug, Default)]
#[must_use = "keep the attachment to detach the handlers later"]
pub struct SocketAttachment {
    handlers: Vec<(SocketEventKind, HandlerId)>,
}

impl SocketAttachment {
    fn push(&mut self, kind: SocketEventKind, id: HandlerId) {
        self.handlers.push((kind, id));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn detach(self, socket: &SocketManager) {
        for (kind, id) in self.handlers {
            socket.off(kind, id);
        }
    }
}
