use async_trait::async_trait;
use reqwest::{ Client as HttpClient, Response, StatusCode };
use serde::Deserialize;

use super::{ validate_id, HistoryStore, StoreError };
use crate::models::chat::{ Conversation, ConversationSummary };

/// `HistoryStore` backed by the server's `/api/chats` endpoints.
pub struct RemoteHistoryStore {
    http: HttpClient,
    base_url: String,
}

#[derive(Deserialize)]
struct Ack {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

impl RemoteHistoryStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn chat_url(&self, id: &str) -> Result<String, StoreError> {
        validate_id(id)?;
        Ok(format!("{}/api/chats/{}", self.base_url, id))
    }

    async fn expect_ack(resp: Response, id: &str) -> Result<(), StoreError> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let ack = resp
            .json::<Ack>().await
            .map_err(|e| StoreError::Remote(format!("unexpected response ({}): {}", status, e)))?;
        if status.is_success() && ack.success {
            Ok(())
        } else {
            Err(StoreError::Remote(ack.error.unwrap_or_else(|| format!("server returned {}", status))))
        }
    }
}

#[async_trait]
impl HistoryStore for RemoteHistoryStore {
    async fn list(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let url = format!("{}/api/chats", self.base_url);
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn get(&self, id: &str) -> Result<Conversation, StoreError> {
        let resp = self.http.get(self.chat_url(id)?).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(resp.error_for_status()?.json().await?)
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        validate_id(&conversation.id)?;
        let url = format!("{}/api/chats", self.base_url);
        let resp = self.http.post(&url).json(conversation).send().await?;
        Self::expect_ack(resp, &conversation.id).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let resp = self.http.delete(self.chat_url(id)?).send().await?;
        Self::expect_ack(resp, id).await
    }

    async fn rename(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let resp = self.http
            .patch(self.chat_url(id)?)
            .json(&serde_json::json!({ "title": title }))
            .send().await?;
        Self::expect_ack(resp, id).await
    }
}
