use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use log::{ debug, info, warn };
use std::path::{ Path, PathBuf };
use tokio::fs;

use super::migrate::{ self, Fallback, StoredConversation };
use super::{ validate_id, HistoryStore, StoreError };
use crate::models::chat::{ Conversation, ConversationSummary };

/// One JSON document per conversation, named `<id>.json`.
pub struct FileHistoryStore {
    dir: PathBuf,
}

impl FileHistoryStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        info!("Chat history will be stored in: {}", dir.display());
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn read_file(path: &Path, id: &str) -> Result<Conversation, StoreError> {
        let bytes = fs::read(path).await?;
        let raw: serde_json::Value = serde_json::from_slice(&bytes)?;
        let modified = fs::metadata(path).await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        migrate::decode(raw, &Fallback { id, timestamp: modified })
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn list(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut summaries = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
                continue;
            };
            match Self::read_file(&path, &id).await {
                Ok(conversation) => summaries.push(conversation.summary()),
                Err(e) => {
                    warn!("Skipping unreadable conversation file {}: {}", path.display(), e);
                }
            }
        }

        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(summaries)
    }

    async fn get(&self, id: &str) -> Result<Conversation, StoreError> {
        let path = self.path_for(id)?;
        match Self::read_file(&path, id).await {
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.to_string()))
            }
            other => other,
        }
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let path = self.path_for(&conversation.id)?;
        let body = serde_json::to_vec_pretty(&StoredConversation::new(conversation))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        debug!(
            "Saved conversation {} ({} messages)",
            conversation.id,
            conversation.messages.len()
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted conversation {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
