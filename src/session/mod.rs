mod relay_client;

pub use relay_client::WsRelayClient;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use log::{ debug, info, warn };
use thiserror::Error;
use tokio::sync::mpsc::{ self, UnboundedReceiver, UnboundedSender };
use tokio::time::timeout;

use crate::history::{ HistoryStore, StoreError };
use crate::models::chat::{ derive_title, new_id, Conversation, Message, Role };
use crate::models::settings::Settings;
use crate::relay::ChatRelay;

const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

/// State transitions announced to whatever renders the session.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    MessageAdded(Message),
    MessageUpdated(Message),
    MessageRemoved { id: String },
    StreamStarted { id: String },
    Chunk { id: String, content: String },
    StreamFinished { id: String },
    /// The placeholder `id` was dropped; `error` is shown in place of the reply.
    StreamFailed { id: String, error: String },
    Notice(String),
    Saved { id: String, title: String },
    Loaded { id: String, message_count: usize },
    Reset { id: String },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message '{0}' not found")]
    MessageNotFound(String),
    #[error("only an assistant reply that directly follows a user message can be regenerated")]
    InvalidRegenerateTarget,
    #[error("message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Relay(String),
    #[error("no reply received within {0:?}")]
    Timeout(Duration),
}

/// One open conversation on the client side.
///
/// Holds the message list and conversation id for a single session, so several
/// controllers can share a store and relay without interfering. Saving is
/// last-write-wins against the store.
pub struct SessionController {
    store: Arc<dyn HistoryStore>,
    relay: Arc<dyn ChatRelay>,
    settings: Option<Settings>,
    conversation_id: String,
    title: Option<String>,
    messages: Vec<Message>,
    chunk_timeout: Duration,
    events: UnboundedSender<SessionEvent>,
}

impl SessionController {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        relay: Arc<dyn ChatRelay>
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let controller = Self {
            store,
            relay,
            settings: None,
            conversation_id: new_id(),
            title: None,
            messages: Vec::new(),
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            events,
        };
        (controller, rx)
    }

    /// Settings sent with each request. Without them the relay uses its stored settings.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_chunk_timeout(mut self, chunk_timeout: Duration) -> Self {
        self.chunk_timeout = chunk_timeout;
        self
    }

    pub fn set_settings(&mut self, settings: Option<Settings>) {
        self.settings = settings;
    }

    pub fn settings(&self) -> Option<&Settings> {
        self.settings.as_ref()
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event dropped, no listener");
        }
    }

    fn position(&self, id: &str) -> Result<usize, SessionError> {
        self.messages
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| SessionError::MessageNotFound(id.to_string()))
    }

    pub fn add_message(&mut self, role: Role, content: impl Into<String>) -> Message {
        self.push_message(Message::new(role, content))
    }

    pub fn push_message(&mut self, mut message: Message) -> Message {
        if message.id.is_empty() {
            message.id = new_id();
        }
        self.messages.push(message.clone());
        self.emit(SessionEvent::MessageAdded(message.clone()));
        message
    }

    pub async fn edit_message(&mut self, id: &str, content: impl Into<String>) -> Result<(), SessionError> {
        let index = self.position(id)?;
        self.messages[index].content = content.into();
        self.emit(SessionEvent::MessageUpdated(self.messages[index].clone()));
        self.save().await
    }

    pub async fn delete_message(&mut self, id: &str) -> Result<(), SessionError> {
        let index = self.position(id)?;
        let removed = self.messages.remove(index);
        self.emit(SessionEvent::MessageRemoved { id: removed.id });
        self.save().await
    }

    /// Appends a user message and streams the reply. Returns the finished assistant message.
    pub async fn send(&mut self, text: &str) -> Result<Message, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        self.add_message(Role::User, text);
        self.stream_reply().await
    }

    /// Drops `assistant_id` and everything after it, keeping the user message before it,
    /// then streams a new reply.
    pub async fn regenerate(&mut self, assistant_id: &str) -> Result<Message, SessionError> {
        let target = self.messages.iter().position(|m| m.id == assistant_id);
        let index = match target {
            Some(i) if
                i > 0 &&
                self.messages[i].role == Role::Assistant &&
                self.messages[i - 1].role == Role::User
            => i,
            _ => {
                warn!("Ignoring regenerate for message '{}'", assistant_id);
                self.emit(
                    SessionEvent::Notice(SessionError::InvalidRegenerateTarget.to_string())
                );
                return Err(SessionError::InvalidRegenerateTarget);
            }
        };

        for removed in self.messages.split_off(index) {
            self.emit(SessionEvent::MessageRemoved { id: removed.id });
        }
        self.stream_reply().await
    }

    async fn stream_reply(&mut self) -> Result<Message, SessionError> {
        let history = self.messages.clone();
        let placeholder = Message::assistant("");
        let id = placeholder.id.clone();
        self.messages.push(placeholder);
        self.emit(SessionEvent::StreamStarted { id: id.clone() });

        match self.collect_reply(&history, &id).await {
            Ok(()) => {
                self.emit(SessionEvent::StreamFinished { id: id.clone() });
                self.save().await?;
                let index = self.position(&id)?;
                Ok(self.messages[index].clone())
            }
            Err(e) => {
                warn!("Reply for conversation {} failed: {}", self.conversation_id, e);
                self.messages.retain(|m| m.id != id);
                self.emit(SessionEvent::StreamFailed { id, error: e.to_string() });
                Err(e)
            }
        }
    }

    async fn collect_reply(&mut self, history: &[Message], id: &str) -> Result<(), SessionError> {
        let mut stream = self.relay
            .stream(history, self.settings.as_ref()).await
            .map_err(|e| SessionError::Relay(e.to_string()))?;
        let index = self.position(id)?;

        loop {
            let next = timeout(self.chunk_timeout, stream.next()).await.map_err(|_|
                SessionError::Timeout(self.chunk_timeout)
            )?;
            match next {
                Some(Ok(chunk)) => {
                    self.messages[index].content.push_str(&chunk);
                    self.emit(SessionEvent::Chunk { id: id.to_string(), content: chunk });
                }
                Some(Err(e)) => {
                    return Err(SessionError::Relay(e.to_string()));
                }
                None => {
                    return Ok(());
                }
            }
        }
    }

    pub fn new_conversation(&mut self) -> &str {
        self.conversation_id = new_id();
        self.title = None;
        self.messages.clear();
        self.emit(SessionEvent::Reset { id: self.conversation_id.clone() });
        &self.conversation_id
    }

    pub async fn load_conversation(&mut self, id: &str) -> Result<(), SessionError> {
        let conversation = self.store.get(id).await?;
        info!("Loaded conversation {} ({} messages)", conversation.id, conversation.messages.len());
        self.conversation_id = conversation.id;
        self.title = Some(conversation.title);
        self.messages = conversation.messages;
        self.emit(SessionEvent::Loaded {
            id: self.conversation_id.clone(),
            message_count: self.messages.len(),
        });
        Ok(())
    }

    /// Persists the whole message list under the current conversation id.
    pub async fn save(&mut self) -> Result<(), SessionError> {
        let title = self.title.clone().unwrap_or_else(|| derive_title(&self.messages));
        let conversation = Conversation {
            id: self.conversation_id.clone(),
            title: title.clone(),
            messages: self.messages.clone(),
            timestamp: Utc::now(),
        };
        self.store.save(&conversation).await?;
        self.emit(SessionEvent::Saved { id: conversation.id, title });
        Ok(())
    }
}
