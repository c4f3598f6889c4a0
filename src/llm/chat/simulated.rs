use async_trait::async_trait;
use std::time::Duration;

use super::{ create_streaming_response, BoxError, ChatClient, TokenStream };
use crate::llm::LlmConfig;
use crate::models::chat::{ Message, Role };

/// Offline backend: fabricates a reply and emits it one character at a time.
#[derive(Debug, Clone)]
pub struct SimulatedClient {
    model: String,
    reply: Option<String>,
    delay: Duration,
}

impl SimulatedClient {
    pub fn new(reply: Option<String>, delay: Duration) -> Self {
        Self {
            model: "simulated".to_string(),
            reply,
            delay,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        let mut client = Self::new(config.simulated.reply.clone(), config.simulated.delay);
        if !config.completion_model.trim().is_empty() {
            client.model = config.completion_model.clone();
        }
        client
    }

    fn compose(&self, messages: &[Message]) -> String {
        if let Some(reply) = &self.reply {
            return reply.clone();
        }
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.trim())
            .unwrap_or("");
        format!("This is a simulated reply to: \"{}\"", prompt)
    }
}

#[async_trait]
impl ChatClient for SimulatedClient {
    async fn stream_chat(&self, messages: &[Message]) -> Result<TokenStream, BoxError> {
        let text = self.compose(messages);
        let delay = self.delay;

        Ok(
            create_streaming_response(move |tx| async move {
                for ch in text.chars() {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tx.closed() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    if tx.send(Ok(ch.to_string())).await.is_err() {
                        return;
                    }
                }
            })
        )
    }

    async fn list_models(&self) -> Result<Vec<String>, BoxError> {
        Ok(vec!["simulated".to_string()])
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        None
    }
}
