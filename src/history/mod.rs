mod file;
pub mod migrate;
mod remote;

pub use file::FileHistoryStore;
pub use remote::RemoteHistoryStore;

use async_trait::async_trait;
use thiserror::Error;
use crate::models::chat::{ Conversation, ConversationSummary };
use crate::models::settings::SettingsError;

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation '{0}' not found")]
    NotFound(String),
    #[error("invalid conversation id '{0}'")]
    InvalidId(String),
    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] SettingsError),
    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u64),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("remote store error: {0}")]
    Remote(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Remote(err.to_string())
    }
}

/// Conversation persistence. No locking: concurrent saves to one id are last-write-wins.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Summaries, newest first.
    async fn list(&self) -> Result<Vec<ConversationSummary>, StoreError>;

    async fn get(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Full overwrite of the stored copy.
    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError>;

    /// Succeeds when the conversation does not exist.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn rename(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let mut conversation = self.get(id).await?;
        conversation.title = title.to_string();
        self.save(&conversation).await
    }
}

pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid =
        !id.is_empty() &&
        id.len() <= MAX_ID_LEN &&
        id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid { Ok(()) } else { Err(StoreError::InvalidId(id.to_string())) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_restricted_to_safe_characters() {
        assert!(validate_id("3f2b-11_ab").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../settings").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id(&"x".repeat(MAX_ID_LEN + 1)).is_err());
    }
}
