use serde::{ Deserialize, Serialize };
use thiserror::Error;
use url::Url;

use crate::llm::LlmType;

/// Connection parameters sent with every relay request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub backend: LlmType,
    pub api_endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("invalid api endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("model must not be empty")]
    EmptyModel,
    #[error("temperature {0} is outside [0, 2]")]
    Temperature(f32),
    #[error("top_p {0} is outside [0, 1]")]
    TopP(f32),
    #[error("max_tokens must be positive")]
    MaxTokens,
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        match Url::parse(&self.api_endpoint) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            _ => {
                return Err(SettingsError::InvalidEndpoint(self.api_endpoint.clone()));
            }
        }
        if self.model.trim().is_empty() {
            return Err(SettingsError::EmptyModel);
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(SettingsError::Temperature(self.temperature));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(SettingsError::TopP(self.top_p));
        }
        if self.max_tokens == 0 {
            return Err(SettingsError::MaxTokens);
        }
        Ok(())
    }

    pub fn apply(&mut self, overrides: &SamplingOverrides) {
        if let Some(t) = overrides.temperature {
            self.temperature = t;
        }
        if let Some(m) = overrides.max_tokens {
            self.max_tokens = m;
        }
        if let Some(p) = overrides.top_p {
            self.top_p = p;
        }
    }
}

/// Loose sampling fields some clients send next to the history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, alias = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, alias = "topP", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl SamplingOverrides {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.max_tokens.is_none() && self.top_p.is_none()
    }
}
