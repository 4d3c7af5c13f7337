use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::notice::{Notice, Notifier};
use super::optimistic::{commit, MutationHandle, OptimisticEdit, Remote};
use super::SocketAttachment;
use crate::coordinator::DataRefresh;
use crate::executor::{ApiRequest, ExecutorError, HttpMethod};
use crate::socket::{SocketEvent, SocketEventKind, SocketManager};
use crate::stream::{
    StreamCanceller, StreamError, StreamHandle, StreamMeta, StreamObserver, StreamRequest,
    StreamTransport,
};

pub const GENERATION_APOLOGY: &str = "Sorry, an error occurred while generating a response.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub author: Author,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Still receiving tokens.
    pub streaming: bool,
    pub metadata: Option<Value>,
}

impl ChatMessage {
    fn new(id: String, conversation_id: &str, text: &str, author: Author, streaming: bool) -> Self {
        Self {
            id,
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            author,
            created_at: OffsetDateTime::now_utc(),
            streaming,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

fn message_path(conversation_id: &str, message_id: &str) -> String {
    format!("/chat/conversations/{conversation_id}/messages/{message_id}")
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("a reply is already streaming in conversation {conversation_id}")]
    StreamInFlight { conversation_id: String },
    #[error("no server configured")]
    NoServer,
    #[error("message {message_id} not found in conversation {conversation_id}")]
    MessageNotFound {
        conversation_id: String,
        message_id: String,
    },
    #[error("no user message precedes reply {message_id}")]
    NoPrompt { message_id: String },
}

fn message_not_found(conversation_id: &str, message_id: &str) -> ChatError {
    ChatError::MessageNotFound {
        conversation_id: conversation_id.to_string(),
        message_id: message_id.to_string(),
    }
}

/// Server calls started by `ChatStore::edit_message`.
pub struct EditedMessage {
    /// The `PUT` carrying the new text.
    pub edit: MutationHandle,
    /// One `DELETE` per assistant reply that followed the edited message.
    pub removed_replies: Vec<MutationHandle>,
}

/// A reply removed and requested again from the same prompt.
pub struct Regeneration {
    pub removal: MutationHandle,
    pub reply: StreamHandle,
}

struct ActiveStream {
    id: u64,
    /// Id of the assistant message this stream writes into.
    message_id: String,
    canceller: Option<StreamCanceller>,
}

#[derive(Default)]
struct ChatState {
    conversations: Vec<Conversation>,
    messages: HashMap<String, Vec<ChatMessage>>,
    active: HashMap<String, ActiveStream>,
}

impl ChatState {
    fn ensure_conversation(&mut self, conversation_id: &str) {
        if !self.conversations.iter().any(|c| c.id == conversation_id) {
            self.conversations.push(Conversation {
                id: conversation_id.to_string(),
                title: None,
            });
        }
    }

    fn message_mut(&mut self, conversation_id: &str, message_id: &str) -> Option<&mut ChatMessage> {
        self.messages
            .get_mut(conversation_id)?
            .iter_mut()
            .find(|message| message.id == message_id)
    }

    fn find_message_mut(&mut self, message_id: &str) -> Option<&mut ChatMessage> {
        self.messages
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|message| message.id == message_id)
    }

    /// True when a local stream is writing into `message_id`.
    fn locally_streamed(&self, message_id: &str) -> bool {
        self.active.values().any(|active| active.message_id == message_id)
    }

    fn set_title(&mut self, conversation_id: &str, title: &str) {
        self.ensure_conversation(conversation_id);
        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == conversation_id) {
            conversation.title = Some(title.to_string());
        }
    }

    /// Removes a message and returns the edit that puts it back in place.
    fn remove_message(
        &mut self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<OptimisticEdit<ChatState>, ChatError> {
        let (list, index) = self
            .messages
            .get_mut(conversation_id)
            .and_then(|list| {
                let index = list.iter().position(|message| message.id == message_id)?;
                Some((list, index))
            })
            .ok_or_else(|| message_not_found(conversation_id, message_id))?;
        let removed = list.remove(index);
        let conversation_id = conversation_id.to_string();
        Ok(OptimisticEdit::new(move |state: &mut ChatState| {
            let list = state.messages.entry(conversation_id).or_default();
            let at = index.min(list.len());
            list.insert(at, removed);
        }))
    }

    fn finish_stream(&mut self, conversation_id: &str, stream_id: u64) {
        if self
            .active
            .get(conversation_id)
            .is_some_and(|active| active.id == stream_id)
        {
            self.active.remove(conversation_id);
        }
    }
}

struct Shared {
    state: Arc<Mutex<ChatState>>,
    transport: StreamTransport,
    server_url: Option<String>,
    credential: String,
    notifier: Arc<dyn Notifier>,
    next_stream: AtomicU64,
}

/// Conversations and their messages, fed by generation streams and the push socket.
#[derive(Clone)]
pub struct ChatStore {
    shared: Arc<Shared>,
    remote: Option<Remote>,
}

impl ChatStore {
    pub fn new(
        transport: StreamTransport,
        server_url: Option<String>,
        credential: impl Into<String>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Arc::new(Mutex::new(ChatState::default())),
                transport,
                server_url,
                credential: credential.into(),
                notifier,
                next_stream: AtomicU64::new(1),
            }),
            remote: None,
        }
    }

    /// Routes message edits and deletions through `remote`; without it they stay local.
    pub fn with_remote(mut self, remote: Remote) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.shared.state.lock().conversations.clone()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.shared
            .state
            .lock()
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.shared
            .state
            .lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.shared.state.lock().active.contains_key(conversation_id)
    }

    /// Appends the user's message and an empty assistant reply, then streams the
    /// reply into it.
    pub fn send_streaming(&self, conversation_id: &str, text: &str) -> Result<StreamHandle, ChatError> {
        self.send_streaming_observed(conversation_id, text, None)
    }

    /// Like `send_streaming`; `tap` sees every callback after the store has applied it.
    pub fn send_streaming_observed(
        &self,
        conversation_id: &str,
        text: &str,
        tap: Option<Arc<dyn StreamObserver>>,
    ) -> Result<StreamHandle, ChatError> {
        self.start_reply(conversation_id, text, true, tap)
    }

    fn start_reply(
        &self,
        conversation_id: &str,
        text: &str,
        with_user_message: bool,
        tap: Option<Arc<dyn StreamObserver>>,
    ) -> Result<StreamHandle, ChatError> {
        let server_url = self.shared.server_url.as_deref().ok_or(ChatError::NoServer)?;
        let stream_id = self.shared.next_stream.fetch_add(1, Ordering::Relaxed);
        let placeholder = format!("streaming-{stream_id}");
        {
            let mut state = self.shared.state.lock();
            if state.active.contains_key(conversation_id) {
                return Err(ChatError::StreamInFlight {
                    conversation_id: conversation_id.to_string(),
                });
            }
            state.active.insert(
                conversation_id.to_string(),
                ActiveStream {
                    id: stream_id,
                    message_id: placeholder.clone(),
                    canceller: None,
                },
            );
            state.ensure_conversation(conversation_id);
            let list = state.messages.entry(conversation_id.to_string()).or_default();
            if with_user_message {
                list.push(ChatMessage::new(
                    format!("local-{}", Uuid::new_v4()),
                    conversation_id,
                    text,
                    Author::User,
                    false,
                ));
            }
            list.push(ChatMessage::new(
                placeholder.clone(),
                conversation_id,
                "",
                Author::Assistant,
                true,
            ));
        }

        let observer = Arc::new(ReplyObserver {
            shared: self.shared.clone(),
            conversation_id: conversation_id.to_string(),
            stream_id,
            message_id: Mutex::new(placeholder),
            tap,
        });
        let request = StreamRequest::chat(
            server_url,
            conversation_id,
            text,
            self.shared.credential.clone(),
        );
        let handle = self.shared.transport.open(request, observer);

        if let Some(active) = self.shared.state.lock().active.get_mut(conversation_id) {
            if active.id == stream_id {
                active.canceller = Some(handle.canceller());
            }
        }
        debug!(target: "clawchat::store", conversation = conversation_id, stream_id, "reply streaming");
        Ok(handle)
    }

    /// Cancels the conversation's active stream. The partial reply is kept.
    pub fn stop_generation(&self, conversation_id: &str) -> bool {
        let state = self.shared.state.lock();
        match state
            .active
            .get(conversation_id)
            .and_then(|active| active.canceller.as_ref())
        {
            Some(canceller) => {
                canceller.cancel();
                true
            }
            None => false,
        }
    }

    pub fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<MutationHandle, ChatError> {
        let edit = {
            let mut state = self.shared.state.lock();
            if state.locally_streamed(message_id) {
                return Err(ChatError::StreamInFlight {
                    conversation_id: conversation_id.to_string(),
                });
            }
            state.remove_message(conversation_id, message_id)?
        };
        Ok(self.commit(
            ApiRequest::delete(message_path(conversation_id, message_id)),
            edit,
            "Could not delete the message",
        ))
    }

    /// Replaces a message's text and drops the assistant replies that answered it.
    pub fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<EditedMessage, ChatError> {
        let (edit, removed) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.active.contains_key(conversation_id) {
                return Err(ChatError::StreamInFlight {
                    conversation_id: conversation_id.to_string(),
                });
            }
            let list = state
                .messages
                .get_mut(conversation_id)
                .ok_or_else(|| message_not_found(conversation_id, message_id))?;
            let index = list
                .iter()
                .position(|message| message.id == message_id)
                .ok_or_else(|| message_not_found(conversation_id, message_id))?;
            let previous = std::mem::replace(&mut list[index].text, text.to_string());
            let replies: Vec<String> = list[index + 1..]
                .iter()
                .take_while(|message| message.author == Author::Assistant)
                .map(|message| message.id.clone())
                .collect();

            let conversation = conversation_id.to_string();
            let id = message_id.to_string();
            let edit = OptimisticEdit::new(move |state: &mut ChatState| {
                if let Some(message) = state.message_mut(&conversation, &id) {
                    message.text = previous;
                }
            });
            // Last first, so each restore lands on its original index.
            let mut removed = Vec::with_capacity(replies.len());
            for reply in replies.into_iter().rev() {
                let restore = state.remove_message(conversation_id, &reply)?;
                removed.push((reply, restore));
            }
            (edit, removed)
        };

        let request = ApiRequest::new(HttpMethod::Put, message_path(conversation_id, message_id))
            .with_body(json!({ "content": text }));
        let edit = self.commit(request, edit, "Could not edit the message");
        let removed_replies = removed
            .into_iter()
            .map(|(reply, restore)| {
                self.commit(
                    ApiRequest::delete(message_path(conversation_id, &reply)),
                    restore,
                    "Could not remove the previous reply",
                )
            })
            .collect();
        Ok(EditedMessage {
            edit,
            removed_replies,
        })
    }

    /// Drops an assistant reply and streams a new one for the user message before it.
    pub fn regenerate(
        &self,
        conversation_id: &str,
        reply_id: &str,
    ) -> Result<Regeneration, ChatError> {
        if self.shared.server_url.is_none() {
            return Err(ChatError::NoServer);
        }
        let (prompt, edit) = {
            let mut state = self.shared.state.lock();
            if state.active.contains_key(conversation_id) {
                return Err(ChatError::StreamInFlight {
                    conversation_id: conversation_id.to_string(),
                });
            }
            let list = state
                .messages
                .get(conversation_id)
                .ok_or_else(|| message_not_found(conversation_id, reply_id))?;
            let index = list
                .iter()
                .position(|message| message.id == reply_id && message.author == Author::Assistant)
                .ok_or_else(|| message_not_found(conversation_id, reply_id))?;
            let prompt = list[..index]
                .iter()
                .rev()
                .find(|message| message.author == Author::User)
                .map(|message| message.text.clone())
                .ok_or_else(|| ChatError::NoPrompt {
                    message_id: reply_id.to_string(),
                })?;
            (prompt, state.remove_message(conversation_id, reply_id)?)
        };
        let removal = self.commit(
            ApiRequest::delete(message_path(conversation_id, reply_id)),
            edit,
            "Could not remove the previous reply",
        );
        let reply = self.start_reply(conversation_id, &prompt, false, None)?;
        Ok(Regeneration { removal, reply })
    }

    /// Replaces the conversation list with the server's. Conversations with a
    /// reply in flight are kept.
    pub async fn refresh_conversations(&self) -> Result<(), ExecutorError> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        let response = remote
            .executor
            .execute(ApiRequest::get("/chat/conversations"))
            .await?;
        let items = response.get("items").cloned().unwrap_or(response);
        let conversations: Vec<Conversation> = if items.is_null() {
            Vec::new()
        } else {
            serde_json::from_value(items).map_err(|err| ExecutorError::Decode(err.to_string()))?
        };
        debug!(target: "clawchat::store", count = conversations.len(), "conversations refreshed");

        let mut state = self.shared.state.lock();
        state.conversations = conversations;
        let streaming: Vec<String> = state.active.keys().cloned().collect();
        for conversation_id in streaming {
            state.ensure_conversation(&conversation_id);
        }
        Ok(())
    }

    fn commit(&self, request: ApiRequest, edit: OptimisticEdit<ChatState>, failure: &str) -> MutationHandle {
        commit(
            self.shared.state.clone(),
            self.remote.as_ref(),
            self.shared.notifier.clone(),
            request,
            edit,
            failure.to_string(),
        )
    }

    /// Mirrors replies produced elsewhere (another client, a background agent) and
    /// conversation renames.
    pub fn attach(&self, socket: &SocketManager) -> SocketAttachment {
        let mut attachment = SocketAttachment::default();
        for kind in [
            SocketEventKind::StreamStart,
            SocketEventKind::StreamChunk,
            SocketEventKind::StreamEnd,
            SocketEventKind::ConversationUpdated,
        ] {
            let store = self.clone();
            attachment.push(kind, socket.on(kind, move |event| store.apply_socket_event(event)));
        }
        attachment
    }

    fn apply_socket_event(&self, event: &SocketEvent) {
        let mut state = self.shared.state.lock();
        match event {
            SocketEvent::StreamStart(start) => {
                if state.locally_streamed(&start.message_id)
                    || state.find_message_mut(&start.message_id).is_some()
                {
                    return;
                }
                state.ensure_conversation(&start.conversation_id);
                state
                    .messages
                    .entry(start.conversation_id.clone())
                    .or_default()
                    .push(ChatMessage::new(
                        start.message_id.clone(),
                        &start.conversation_id,
                        "",
                        Author::Assistant,
                        true,
                    ));
            }
            SocketEvent::StreamChunk(chunk) => {
                if state.locally_streamed(&chunk.message_id) {
                    return;
                }
                match state.find_message_mut(&chunk.message_id) {
                    Some(message) => message.text.push_str(&chunk.content),
                    None => trace!(target: "clawchat::store", message_id = %chunk.message_id, "chunk for unknown message"),
                }
            }
            SocketEvent::StreamEnd(end) => {
                if let Some(message) = state.find_message_mut(&end.message_id) {
                    message.text = end.full_content.clone();
                    message.metadata = end.metadata.clone();
                    message.streaming = false;
                }
            }
            SocketEvent::ConversationUpdated(update) => {
                if let Some(title) = update.title.as_deref().filter(|title| !title.is_empty()) {
                    state.set_title(&update.conversation_id, title);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl DataRefresh for ChatStore {
    async fn refresh(&self) {
        if let Err(err) = self.refresh_conversations().await {
            warn!(target: "clawchat::store", error = %err, "conversation refresh failed; keeping cached list");
        }
    }
}

struct ReplyObserver {
    shared: Arc<Shared>,
    conversation_id: String,
    stream_id: u64,
    /// The placeholder id until the server announces the real one.
    message_id: Mutex<String>,
    tap: Option<Arc<dyn StreamObserver>>,
}

impl ReplyObserver {
    fn with_reply(&self, state: &mut ChatState, apply: impl FnOnce(&mut ChatMessage)) {
        let id = self.message_id.lock().clone();
        if let Some(message) = state.message_mut(&self.conversation_id, &id) {
            apply(message);
        }
    }
}

impl StreamObserver for ReplyObserver {
    fn on_meta(&self, meta: &StreamMeta) {
        let mut state = self.shared.state.lock();
        let mut current = self.message_id.lock();
        if let Some(message) = state.message_mut(&self.conversation_id, &current) {
            message.id = meta.message_id.clone();
        }
        if let Some(active) = state.active.get_mut(&self.conversation_id) {
            if active.id == self.stream_id {
                active.message_id = meta.message_id.clone();
            }
        }
        *current = meta.message_id.clone();
        drop(current);
        drop(state);
        if let Some(tap) = &self.tap {
            tap.on_meta(meta);
        }
    }

    fn on_token(&self, token: &str) {
        {
            let mut state = self.shared.state.lock();
            self.with_reply(&mut state, |message| message.text.push_str(token));
        }
        if let Some(tap) = &self.tap {
            tap.on_token(token);
        }
    }

    fn on_title_generated(&self, title: &str) {
        self.shared.state.lock().set_title(&self.conversation_id, title);
        if let Some(tap) = &self.tap {
            tap.on_title_generated(title);
        }
    }

    fn on_done(&self, full_text: &str) {
        {
            let mut state = self.shared.state.lock();
            self.with_reply(&mut state, |message| {
                message.text = full_text.to_string();
                message.streaming = false;
            });
            state.finish_stream(&self.conversation_id, self.stream_id);
        }
        if let Some(tap) = &self.tap {
            tap.on_done(full_text);
        }
    }

    fn on_error(&self, error: &StreamError) {
        {
            let mut state = self.shared.state.lock();
            self.with_reply(&mut state, |message| {
                if message.text.is_empty() {
                    message.text = GENERATION_APOLOGY.to_string();
                }
                message.streaming = false;
            });
            state.finish_stream(&self.conversation_id, self.stream_id);
        }
        let message = if error.is_unauthorized() {
            "Session expired. Sign in again to keep chatting.".to_string()
        } else {
            format!("Could not get a reply: {error}")
        };
        self.shared.notifier.notify(Notice::error(message));
        if let Some(tap) = &self.tap {
            tap.on_error(error);
        }
    }
}
