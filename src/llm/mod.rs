pub mod chat;

use serde::{ Deserialize, Serialize };
use std::str::FromStr;
use std::fmt;
use std::time::Duration;

use crate::models::settings::Settings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmType {
    /// Any server speaking the OpenAI chat-completions protocol (LocalAI, llama.cpp, vLLM...).
    #[default]
    OpenAI,
    Ollama,
    Simulated,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLlmTypeError {
    message: String,
}

impl fmt::Display for ParseLlmTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseLlmTypeError {}

impl FromStr for LlmType {
    type Err = ParseLlmTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" | "localai" => Ok(LlmType::OpenAI),
            "ollama" => Ok(LlmType::Ollama),
            "simulated" => Ok(LlmType::Simulated),
            _ =>
                Err(ParseLlmTypeError {
                    message: format!("Invalid LLM type: '{}'", s),
                }),
        }
    }
}

impl fmt::Display for LlmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LlmType::OpenAI => "openai",
            LlmType::Ollama => "ollama",
            LlmType::Simulated => "simulated",
        };
        f.write_str(name)
    }
}

/// Reconnect policy for connection-level backend failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_retries: 0, initial_backoff: Duration::ZERO }
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, initial_backoff: Duration::from_millis(250) }
    }
}

/// Behaviour of the fabricated backend.
#[derive(Debug, Clone, Default)]
pub struct SimulatedOptions {
    pub reply: Option<String>,
    pub delay: Duration,
}

/// Server-side backend options that are not part of the user-editable settings.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub api_key: Option<String>,
    pub retry: RetryPolicy,
    pub simulated: SimulatedOptions,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub llm_type: LlmType,
    pub api_key: Option<String>,
    pub completion_model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub retry: RetryPolicy,
    pub simulated: SimulatedOptions,
}

impl LlmConfig {
    pub fn from_settings(settings: &Settings, options: &BackendOptions) -> Self {
        Self {
            llm_type: settings.backend,
            api_key: options.api_key.clone().filter(|k| !k.is_empty()),
            completion_model: settings.model.clone(),
            base_url: settings.api_endpoint.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            top_p: settings.top_p,
            retry: options.retry,
            simulated: options.simulated.clone(),
        }
    }
}
