use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::entity::{merge_fields, CalendarEvent, Entity, KanbanColumn, Memo, Module, Todo};
use super::notice::{Notice, NoticeLevel, Notifier};
use super::optimistic::{commit, MutationHandle, MutationOutcome, OptimisticEdit, Remote};
use super::SocketAttachment;
use crate::coordinator::DataRefresh;
use crate::executor::{ApiRequest, ExecutorError};
use crate::socket::{SocketEvent, SocketEventKind, SocketManager};

pub const DEFAULT_UNDO_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{module} item {id} not found")]
    NotFound { module: Module, id: String },
    #[error("invalid fields: {0}")]
    InvalidFields(#[from] serde_json::Error),
}

/// Last known state of a background task reported over the socket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskState {
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub status: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleState {
    pub todos: Vec<Todo>,
    pub events: Vec<CalendarEvent>,
    pub memos: Vec<Memo>,
    /// Board column overrides keyed by todo id.
    pub kanban: HashMap<String, KanbanColumn>,
    pub tasks: HashMap<String, TaskState>,
    pub last_fetched: Option<OffsetDateTime>,
}

impl ModuleState {
    /// The override if one is set, otherwise the column matching the todo's status.
    pub fn kanban_column(&self, id: &str) -> Option<KanbanColumn> {
        if let Some(column) = self.kanban.get(id) {
            return Some(*column);
        }
        self.todos
            .iter()
            .find(|todo| todo.id == id)
            .map(|todo| todo.status.into())
    }
}

/// Entities kept in a `ModuleState` collection.
pub trait StoredEntity: Entity {
    fn collection(state: &ModuleState) -> &Vec<Self>;
    fn collection_mut(state: &mut ModuleState) -> &mut Vec<Self>;
}

impl StoredEntity for Todo {
    fn collection(state: &ModuleState) -> &Vec<Self> {
        &state.todos
    }
    fn collection_mut(state: &mut ModuleState) -> &mut Vec<Self> {
        &mut state.todos
    }
}

impl StoredEntity for CalendarEvent {
    fn collection(state: &ModuleState) -> &Vec<Self> {
        &state.events
    }
    fn collection_mut(state: &mut ModuleState) -> &mut Vec<Self> {
        &mut state.events
    }
}

impl StoredEntity for Memo {
    fn collection(state: &ModuleState) -> &Vec<Self> {
        &state.memos
    }
    fn collection_mut(state: &mut ModuleState) -> &mut Vec<Self> {
        &mut state.memos
    }
}

fn restore_entity<E: StoredEntity>(state: &mut ModuleState, snapshot: E) {
    if let Some(slot) = E::collection_mut(state)
        .iter_mut()
        .find(|item| item.id() == snapshot.id())
    {
        *slot = snapshot;
    }
}

fn restore_column(state: &mut ModuleState, id: String, column: Option<KanbanColumn>) {
    match column {
        Some(column) => {
            state.kanban.insert(id, column);
        }
        None => {
            state.kanban.remove(&id);
        }
    }
}

struct Shared {
    state: Arc<Mutex<ModuleState>>,
    remote: Option<Remote>,
    notifier: Arc<dyn Notifier>,
}

/// Todos, events and memos with optimistic mutations.
#[derive(Clone)]
pub struct ModuleStore {
    shared: Arc<Shared>,
    undo_window: Duration,
}

impl ModuleStore {
    /// `remote` is `None` when no server is configured; mutations then stay local.
    pub fn new(remote: Option<Remote>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Arc::new(Mutex::new(ModuleState::default())),
                remote,
                notifier,
            }),
            undo_window: DEFAULT_UNDO_WINDOW,
        }
    }

    pub fn with_undo_window(mut self, undo_window: Duration) -> Self {
        self.undo_window = undo_window;
        self
    }

    pub fn snapshot(&self) -> ModuleState {
        self.shared.state.lock().clone()
    }

    pub fn todos(&self) -> Vec<Todo> {
        self.shared.state.lock().todos.clone()
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        self.shared.state.lock().events.clone()
    }

    pub fn memos(&self) -> Vec<Memo> {
        self.shared.state.lock().memos.clone()
    }

    pub fn get<E: StoredEntity>(&self, id: &str) -> Option<E> {
        let state = self.shared.state.lock();
        E::collection(&state).iter().find(|item| item.id() == id).cloned()
    }

    pub fn kanban_column(&self, id: &str) -> Option<KanbanColumn> {
        self.shared.state.lock().kanban_column(id)
    }

    pub fn replace<E: StoredEntity>(&self, items: Vec<E>) {
        *E::collection_mut(&mut self.shared.state.lock()) = items;
    }

    pub fn insert<E: StoredEntity>(&self, item: E) {
        E::collection_mut(&mut self.shared.state.lock()).push(item);
    }

    /// Flips a todo between pending and completed and drops its board override.
    pub fn toggle_complete(&self, id: &str) -> Result<MutationHandle, StoreError> {
        let (request, edit) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let todo = state
                .todos
                .iter_mut()
                .find(|todo| todo.id == id)
                .ok_or_else(|| not_found(Module::Todos, id))?;
            let previous = todo.status;
            let next = previous.toggled();
            todo.status = next;
            let previous_column = state.kanban.remove(id);

            let id = id.to_string();
            let request = ApiRequest::patch(Module::Todos.item_path(&id), json!({ "status": next }));
            let edit = OptimisticEdit::new(move |state: &mut ModuleState| {
                if let Some(todo) = state.todos.iter_mut().find(|todo| todo.id == id) {
                    todo.status = previous;
                }
                restore_column(state, id, previous_column);
            });
            (request, edit)
        };
        Ok(self.commit(request, edit, "Could not update the todo"))
    }

    /// Moves a todo to a board column. The server only hears about it when the
    /// column changes the todo's pending/completed status.
    pub fn move_to_column(&self, id: &str, column: KanbanColumn) -> Result<MutationHandle, StoreError> {
        let (request, edit) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let todo = state
                .todos
                .iter_mut()
                .find(|todo| todo.id == id)
                .ok_or_else(|| not_found(Module::Todos, id))?;
            let previous_status = todo.status;
            let server_status = column.server_status();
            let request = (previous_status != server_status).then(|| {
                todo.status = server_status;
                ApiRequest::patch(Module::Todos.item_path(id), json!({ "status": server_status }))
            });
            let previous_column = state.kanban.insert(id.to_string(), column);

            let id = id.to_string();
            let edit = OptimisticEdit::new(move |state: &mut ModuleState| {
                if let Some(todo) = state.todos.iter_mut().find(|todo| todo.id == id) {
                    todo.status = previous_status;
                }
                restore_column(state, id, previous_column);
            });
            (request, edit)
        };
        match request {
            Some(request) => Ok(self.commit(request, edit, "Could not move the todo")),
            None => Ok(MutationHandle::ready(MutationOutcome::LocalOnly)),
        }
    }

    /// Overwrites fields of one entity and sends them as a `PATCH`.
    pub fn update<E: StoredEntity>(
        &self,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<MutationHandle, StoreError> {
        let edit = {
            let mut state = self.shared.state.lock();
            let entity = E::collection_mut(&mut state)
                .iter_mut()
                .find(|item| item.id() == id)
                .ok_or_else(|| not_found(E::MODULE, id))?;
            let merged = merge_fields(entity, &fields)?;
            let snapshot = std::mem::replace(entity, merged);
            OptimisticEdit::new(move |state: &mut ModuleState| restore_entity(state, snapshot))
        };
        let request = ApiRequest::patch(E::MODULE.item_path(id), Value::Object(fields));
        Ok(self.commit(
            request,
            edit,
            &format!("Could not save changes to {}", E::MODULE),
        ))
    }

    /// Removes an entity now and sends the `DELETE` once the undo window passes.
    pub fn delete<E: StoredEntity>(&self, id: &str) -> Result<PendingDelete, StoreError> {
        let edit = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let collection = E::collection_mut(state);
            let index = collection
                .iter()
                .position(|item| item.id() == id)
                .ok_or_else(|| not_found(E::MODULE, id))?;
            let removed = collection.remove(index);
            let previous_column = match E::MODULE {
                Module::Todos => state.kanban.remove(id),
                _ => None,
            };
            let id = id.to_string();
            OptimisticEdit::new(move |state: &mut ModuleState| {
                let collection = E::collection_mut(state);
                if !collection.iter().any(|item| item.id() == id) {
                    let at = index.min(collection.len());
                    collection.insert(at, removed);
                }
                if E::MODULE == Module::Todos {
                    restore_column(state, id, previous_column);
                }
            })
        };

        let slot = Arc::new(Mutex::new(Some(edit)));
        let undo = Arc::new(Notify::new());
        let request = ApiRequest::delete(E::MODULE.item_path(id));
        let failure = format!("Could not delete from {}", E::MODULE);
        let task = {
            let slot = slot.clone();
            let undo = undo.clone();
            let state = self.shared.state.clone();
            let remote = self.shared.remote.clone();
            let notifier = self.shared.notifier.clone();
            let window = self.undo_window;
            tokio::spawn(async move {
                tokio::select! {
                    _ = undo.notified() => return MutationOutcome::Undone,
                    _ = sleep(window) => {}
                }
                let taken = slot.lock().take();
                let Some(edit) = taken else {
                    return MutationOutcome::Undone;
                };
                commit(state, remote.as_ref(), notifier, request, edit, failure)
                    .outcome()
                    .await
            })
        };

        Ok(PendingDelete {
            slot,
            undo,
            state: self.shared.state.clone(),
            task,
        })
    }

    /// Reloads one module from the server, keeping current data on failure.
    pub async fn refresh_module(&self, module: Module) -> Result<(), ExecutorError> {
        match module {
            Module::Todos => self.fetch::<Todo>().await,
            Module::Events => self.fetch::<CalendarEvent>().await,
            Module::Memos => self.fetch::<Memo>().await,
        }
    }

    pub async fn refresh_all(&self) {
        for module in Module::ALL {
            if let Err(err) = self.refresh_module(module).await {
                warn!(target: "clawchat::store", %module, error = %err, "refresh failed; keeping cached data");
            }
        }
    }

    async fn fetch<E: StoredEntity>(&self) -> Result<(), ExecutorError> {
        let Some(remote) = &self.shared.remote else {
            return Ok(());
        };
        let response = remote
            .executor
            .execute(ApiRequest::get(E::MODULE.collection_path()))
            .await?;
        let items = match response.get("items") {
            Some(items) => serde_json::from_value::<Vec<E>>(items.clone())
                .map_err(|err| ExecutorError::Decode(err.to_string()))?,
            None => Vec::new(),
        };
        debug!(target: "clawchat::store", module = %E::MODULE, count = items.len(), "refreshed");
        let mut state = self.shared.state.lock();
        *E::collection_mut(&mut state) = items;
        state.last_fetched = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    /// Refetches on invalidation and turns reminders and task updates into notices.
    pub fn attach(&self, socket: &SocketManager) -> SocketAttachment {
        let mut attachment = SocketAttachment::default();

        let store = self.clone();
        attachment.push(
            SocketEventKind::ModuleDataChanged,
            socket.on(SocketEventKind::ModuleDataChanged, move |event| {
                let SocketEvent::ModuleDataChanged(change) = event else {
                    return;
                };
                let modules = match change.module.as_deref().and_then(Module::from_name) {
                    Some(module) => vec![module],
                    None => Module::ALL.to_vec(),
                };
                let store = store.clone();
                tokio::spawn(async move {
                    for module in modules {
                        if let Err(err) = store.refresh_module(module).await {
                            warn!(target: "clawchat::store", %module, error = %err, "refresh failed");
                        }
                    }
                });
            }),
        );

        let notifier = self.shared.notifier.clone();
        attachment.push(
            SocketEventKind::Reminder,
            socket.on(SocketEventKind::Reminder, move |event| {
                if let SocketEvent::Reminder(reminder) = event {
                    notifier.notify(Notice::new(NoticeLevel::Warning, reminder.text()));
                }
            }),
        );

        for kind in [
            SocketEventKind::TaskProgress,
            SocketEventKind::TaskCompleted,
            SocketEventKind::TaskFailed,
        ] {
            let store = self.clone();
            attachment.push(kind, socket.on(kind, move |event| store.apply_task_event(event)));
        }
        attachment
    }

    pub fn task(&self, task_id: &str) -> Option<TaskState> {
        self.shared.state.lock().tasks.get(task_id).cloned()
    }

    fn apply_task_event(&self, event: &SocketEvent) {
        let notice = {
            let mut state = self.shared.state.lock();
            match event {
                SocketEvent::TaskProgress(progress) => {
                    let task = state
                        .tasks
                        .entry(progress.task_id.clone().unwrap_or_default())
                        .or_default();
                    task.progress = progress.progress.or(task.progress);
                    task.message = progress.message.clone().or(task.message.take());
                    task.status = progress.status.clone().or(task.status.take());
                    None
                }
                SocketEvent::TaskCompleted(done) => {
                    let task = state
                        .tasks
                        .entry(done.task_id.clone().unwrap_or_default())
                        .or_default();
                    task.status = Some("completed".into());
                    task.result = done.result.clone();
                    Some(Notice::new(NoticeLevel::Success, "Background task completed"))
                }
                SocketEvent::TaskFailed(failed) => {
                    let task = state
                        .tasks
                        .entry(failed.task_id.clone().unwrap_or_default())
                        .or_default();
                    task.status = Some("failed".into());
                    task.error = failed.error.clone();
                    Some(Notice::error(format!(
                        "Background task failed: {}",
                        failed.error.as_deref().unwrap_or("Unknown error")
                    )))
                }
                _ => None,
            }
        };
        if let Some(notice) = notice {
            self.shared.notifier.notify(notice);
        }
    }

    fn commit(
        &self,
        request: ApiRequest,
        edit: OptimisticEdit<ModuleState>,
        failure: &str,
    ) -> MutationHandle {
        commit(
            self.shared.state.clone(),
            self.shared.remote.as_ref(),
            self.shared.notifier.clone(),
            request,
            edit,
            failure.to_string(),
        )
    }
}

#[async_trait]
impl DataRefresh for ModuleStore {
    async fn refresh(&self) {
        self.refresh_all().await;
    }
}

fn not_found(module: Module, id: &str) -> StoreError {
    StoreError::NotFound {
        module,
        id: id.to_string(),
    }
}

/// A deletion waiting out its undo window.
pub struct PendingDelete {
    slot: Arc<Mutex<Option<OptimisticEdit<ModuleState>>>>,
    undo: Arc<Notify>,
    state: Arc<Mutex<ModuleState>>,
    task: JoinHandle<MutationOutcome>,
}

impl PendingDelete {
    /// Puts the entity back. Returns false once the window has passed.
    pub fn undo(&self) -> bool {
        let taken = self.slot.lock().take();
        let Some(edit) = taken else {
            return false;
        };
        edit.restore(&mut self.state.lock());
        self.undo.notify_one();
        true
    }

    pub async fn outcome(self) -> MutationOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(_) => MutationOutcome::Undone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::HttpMethod;
    use crate::queue::MutationQueue;
    use crate::socket::ReconnectPolicy;
    use crate::status::{ConnectionStatus, LinkStatus};
    use crate::storage::MemoryStore;
    use crate::store::entity::TodoStatus;
    use crate::store::notice::NoticeLog;
    use crate::store::optimistic::MutationError;
    use crate::testing::{wait_until, ChannelConnector, ScriptedExecutor};

    struct Fixture {
        store: ModuleStore,
        exec: Arc<ScriptedExecutor>,
        queue: Arc<MutationQueue>,
        link: LinkStatus,
        notices: Arc<NoticeLog>,
    }

    fn fixture(exec: ScriptedExecutor) -> Fixture {
        let exec = Arc::new(exec);
        let queue = Arc::new(MutationQueue::new(Arc::new(MemoryStore::new())));
        let link = LinkStatus::new(ConnectionStatus::Connected);
        let notices = Arc::new(NoticeLog::new());
        let store = ModuleStore::new(
            Some(Remote {
                executor: exec.clone(),
                queue: queue.clone(),
                link: link.clone(),
            }),
            notices.clone(),
        );
        store.replace(vec![todo("t1", TodoStatus::Pending), todo("t2", TodoStatus::Pending)]);
        Fixture {
            store,
            exec,
            queue,
            link,
            notices,
        }
    }

    fn todo(id: &str, status: TodoStatus) -> Todo {
        serde_json::from_value(json!({"id": id, "title": format!("todo {id}"), "status": status, "priority": "high"}))
            .unwrap()
    }

    fn server_error() -> ExecutorError {
        ExecutorError::Status {
            status: 500,
            body: "boom".into(),
        }
    }

    #[tokio::test]
    async fn failed_toggle_restores_status_and_notifies() {
        let f = fixture(ScriptedExecutor::new().script(Err(server_error())));
        let handle = f.store.toggle_complete("t1").unwrap();
        assert_eq!(f.store.get::<Todo>("t1").unwrap().status, TodoStatus::Completed);

        assert_eq!(
            handle.outcome().await,
            MutationOutcome::RolledBack(MutationError::Remote(server_error()))
        );
        assert_eq!(f.store.get::<Todo>("t1").unwrap().status, TodoStatus::Pending);
        let notices = f.notices.entries();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn confirmed_toggle_keeps_value() {
        let f = fixture(ScriptedExecutor::new());
        f.store.move_to_column("t1", KanbanColumn::InProgress).unwrap();
        let handle = f.store.toggle_complete("t1").unwrap();
        assert_eq!(handle.outcome().await, MutationOutcome::Confirmed);

        let todo = f.store.get::<Todo>("t1").unwrap();
        assert_eq!(todo.status, TodoStatus::Completed);
        assert_eq!(todo.extra["priority"], "high");
        assert_eq!(f.store.kanban_column("t1"), Some(KanbanColumn::Completed));
        let calls = f.exec.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path, "/todos/t1");
        assert_eq!(calls[0].body, Some(json!({"status": "completed"})));
        assert!(f.notices.entries().is_empty());
    }

    #[tokio::test]
    async fn offline_mutations_are_queued() {
        let f = fixture(ScriptedExecutor::new());
        f.link.set(ConnectionStatus::Disconnected);
        let handle = f.store.toggle_complete("t2").unwrap();
        assert_eq!(handle.outcome().await, MutationOutcome::Queued);
        assert!(f.exec.calls().is_empty());
        assert_eq!(f.store.get::<Todo>("t2").unwrap().status, TodoStatus::Completed);

        let queued = f.queue.items().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].method, HttpMethod::Patch);
        assert_eq!(queued[0].path, "/todos/t2");
    }

    #[tokio::test]
    async fn failed_move_restores_column_and_status() {
        let f = fixture(ScriptedExecutor::new().script(Err(server_error())));
        let handle = f.store.move_to_column("t1", KanbanColumn::Completed).unwrap();
        assert_eq!(f.store.kanban_column("t1"), Some(KanbanColumn::Completed));
        assert!(matches!(handle.outcome().await, MutationOutcome::RolledBack(_)));

        let state = f.store.snapshot();
        assert!(!state.kanban.contains_key("t1"));
        assert_eq!(state.kanban_column("t1"), Some(KanbanColumn::Pending));
        assert_eq!(f.notices.entries().len(), 1);
    }

    #[tokio::test]
    async fn in_progress_column_stays_local() {
        let f = fixture(ScriptedExecutor::new());
        let handle = f.store.move_to_column("t1", KanbanColumn::InProgress).unwrap();
        assert_eq!(handle.outcome().await, MutationOutcome::LocalOnly);
        assert!(f.exec.calls().is_empty());
        assert_eq!(f.store.kanban_column("t1"), Some(KanbanColumn::InProgress));
    }

    #[tokio::test]
    async fn failed_update_restores_snapshot() {
        let f = fixture(ScriptedExecutor::new().script(Err(server_error())));
        let before = f.store.get::<Todo>("t1").unwrap();
        let fields = json!({"title": "renamed", "priority": "low"});
        let handle = f
            .store
            .update::<Todo>("t1", fields.as_object().unwrap().clone())
            .unwrap();
        assert_eq!(f.store.get::<Todo>("t1").unwrap().title, "renamed");
        handle.outcome().await;
        assert_eq!(f.store.get::<Todo>("t1").unwrap(), before);
        assert_eq!(f.exec.calls()[0].body, Some(fields));
    }

    #[tokio::test]
    async fn local_only_store_never_calls_out() {
        let store = ModuleStore::new(None, Arc::new(NoticeLog::new()));
        store.insert(todo("t9", TodoStatus::Completed));
        let handle = store.toggle_complete("t9").unwrap();
        assert_eq!(handle.outcome().await, MutationOutcome::LocalOnly);
        assert_eq!(store.get::<Todo>("t9").unwrap().status, TodoStatus::Pending);
        assert!(matches!(
            store.toggle_complete("missing"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn undo_within_window_restores_without_network() {
        let f = fixture(ScriptedExecutor::new());
        f.store.move_to_column("t1", KanbanColumn::InProgress).unwrap();
        let pending = f.store.delete::<Todo>("t1").unwrap();
        assert!(f.store.get::<Todo>("t1").is_none());
        assert!(!f.store.snapshot().kanban.contains_key("t1"));

        sleep(Duration::from_secs(2)).await;
        assert!(pending.undo());
        assert!(!pending.undo());
        let state = f.store.snapshot();
        assert_eq!(state.todos[0].id, "t1");
        assert_eq!(state.kanban.get("t1"), Some(&KanbanColumn::InProgress));

        assert_eq!(pending.outcome().await, MutationOutcome::Undone);
        sleep(Duration::from_secs(10)).await;
        assert!(f.exec.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_runs_after_window() {
        let f = fixture(ScriptedExecutor::new());
        let started = tokio::time::Instant::now();
        let pending = f.store.delete::<Todo>("t2").unwrap();
        sleep(Duration::from_millis(4900)).await;
        assert!(f.exec.calls().is_empty());

        let outcome = pending.outcome().await;
        assert_eq!(outcome, MutationOutcome::Confirmed);
        assert!(tokio::time::Instant::now() - started >= DEFAULT_UNDO_WINDOW);
        assert_eq!(f.exec.paths(), vec!["DELETE /todos/t2"]);
        assert!(f.store.get::<Todo>("t2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_delete_puts_entity_back() {
        let f = fixture(ScriptedExecutor::new().script(Err(server_error())));
        let pending = f.store.delete::<Todo>("t1").unwrap();
        assert!(matches!(pending.outcome().await, MutationOutcome::RolledBack(_)));
        assert_eq!(f.store.todos()[0].id, "t1");
        assert_eq!(f.notices.entries().len(), 1);
    }

    #[tokio::test]
    async fn refresh_replaces_and_keeps_on_failure() {
        let f = fixture(
            ScriptedExecutor::new()
                .route(
                    HttpMethod::Get,
                    "/memos",
                    Ok(json!({"items": [{"id": "m1", "content": "hello"}]})),
                )
                .route(HttpMethod::Get, "/todos", Err(server_error()))
                .route(HttpMethod::Get, "/events", Ok(json!({"items": []}))),
        );
        f.store.refresh_all().await;
        let state = f.store.snapshot();
        assert_eq!(state.memos.len(), 1);
        assert_eq!(state.memos[0].content, "hello");
        assert_eq!(state.todos.len(), 2);
        assert!(state.last_fetched.is_some());
    }

    #[tokio::test]
    async fn socket_events_refresh_and_notify() {
        let f = fixture(ScriptedExecutor::new().route(
            HttpMethod::Get,
            "/memos",
            Ok(json!({"items": [{"id": "m7", "content": "pushed"}]})),
        ));
        let (connector, feed) = ChannelConnector::new();
        let socket = SocketManager::new(connector, ReconnectPolicy::default());
        let attachment = f.store.attach(&socket);
        assert_eq!(attachment.len(), 5);
        socket.connect("http://srv", "tok").unwrap();

        feed.send(r#"{"type":"module_data_changed","data":{"module":"memos"}}"#.into())
            .unwrap();
        feed.send(r#"{"type":"reminder","data":{"title":"Dentist"}}"#.into())
            .unwrap();
        feed.send(r#"{"type":"task_failed","data":{"task_id":"k1"}}"#.into())
            .unwrap();

        let store = f.store.clone();
        wait_until(move || store.memos().len() == 1).await;
        let notices = f.notices.clone();
        wait_until(move || notices.entries().len() == 2).await;

        let notices = f.notices.entries();
        assert_eq!(notices[0], Notice::new(NoticeLevel::Warning, "Reminder: Dentist"));
        assert_eq!(notices[1].message, "Background task failed: Unknown error");
        assert_eq!(f.store.task("k1").unwrap().status.as_deref(), Some("failed"));
        assert_eq!(f.exec.paths(), vec!["GET /memos"]);

        attachment.detach(&socket);
    }
}
