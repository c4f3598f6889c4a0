use async_trait::async_trait;
use log::{ debug, info };
use std::sync::Arc;
use thiserror::Error;

use crate::config::settings::SettingsStore;
use crate::history::StoreError;
use crate::llm::chat::{ new_client, BoxError, TokenStream };
use crate::llm::{ BackendOptions, LlmConfig };
use crate::models::chat::{ Message, Role };
use crate::models::settings::{ SamplingOverrides, Settings, SettingsError };
use crate::models::websocket::StreamRequest;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("conversation is empty")]
    EmptyHistory,
    #[error("conversation has no user message")]
    NoUserMessage,
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("backend error: {0}")]
    Backend(BoxError),
}

impl RelayError {
    /// True for problems with the request itself rather than the backend.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RelayError::EmptyHistory | RelayError::NoUserMessage | RelayError::Settings(_)
        )
    }
}

/// Source of streamed replies used by the session controller.
#[async_trait]
pub trait ChatRelay: Send + Sync {
    async fn stream(
        &self,
        messages: &[Message],
        settings: Option<&Settings>
    ) -> Result<TokenStream, BoxError>;
}

/// Forwards a conversation to the configured backend and hands back its token stream.
///
/// The relay itself is stateless between requests: settings are either sent with the
/// request or read from the settings store each time, so concurrent connections never
/// share per-session state.
pub struct Relay {
    settings: Arc<SettingsStore>,
    options: BackendOptions,
    system_prompt: Option<String>,
}

impl Relay {
    pub fn new(
        settings: Arc<SettingsStore>,
        options: BackendOptions,
        system_prompt: Option<String>
    ) -> Self {
        Self { settings, options, system_prompt }
    }

    async fn resolve_settings(
        &self,
        settings: Option<Settings>,
        overrides: &SamplingOverrides
    ) -> Result<Settings, RelayError> {
        let mut resolved = match settings {
            Some(s) => s,
            None => self.settings.get().await?,
        };
        if !overrides.is_empty() {
            resolved.apply(overrides);
        }
        resolved.validate()?;
        Ok(resolved)
    }

    fn prepare_history(&self, mut messages: Vec<Message>) -> Result<Vec<Message>, RelayError> {
        if messages.is_empty() {
            return Err(RelayError::EmptyHistory);
        }
        if !messages.iter().any(|m| m.role == Role::User) {
            return Err(RelayError::NoUserMessage);
        }
        if let Some(prompt) = &self.system_prompt {
            if !messages.iter().any(|m| m.role == Role::System) {
                messages.insert(0, Message::system(prompt.clone()));
            }
        }
        Ok(messages)
    }

    /// Validates the request and opens the backend stream.
    pub async fn open_stream(&self, request: StreamRequest) -> Result<TokenStream, RelayError> {
        let settings = self.resolve_settings(request.settings, &request.overrides).await?;
        let history = self.prepare_history(request.messages)?;

        info!(
            "Relaying {} messages to {} backend at {} (model {})",
            history.len(),
            settings.backend,
            settings.api_endpoint,
            settings.model
        );
        debug!(
            "Sampling: temperature={}, max_tokens={}, top_p={}",
            settings.temperature,
            settings.max_tokens,
            settings.top_p
        );

        let config = LlmConfig::from_settings(&settings, &self.options);
        let client = new_client(&config).map_err(RelayError::Backend)?;
        debug!(
            "Backend client ready: model {} at {}",
            client.get_model(),
            client.get_base_url().unwrap_or_default()
        );
        client.stream_chat(&history).await.map_err(RelayError::Backend)
    }

    pub async fn list_models(&self) -> Result<Vec<String>, RelayError> {
        let settings = self.settings.get().await?;
        let config = LlmConfig::from_settings(&settings, &self.options);
        let client = new_client(&config).map_err(RelayError::Backend)?;
        client.list_models().await.map_err(RelayError::Backend)
    }
}

#[async_trait]
impl ChatRelay for Relay {
    async fn stream(
        &self,
        messages: &[Message],
        settings: Option<&Settings>
    ) -> Result<TokenStream, BoxError> {
        let request = StreamRequest {
            messages: messages.to_vec(),
            settings: settings.cloned(),
            overrides: SamplingOverrides::default(),
        };
        Ok(self.open_stream(request).await?)
    }
}
