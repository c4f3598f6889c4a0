use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use async_trait::async_trait;
use log::info;
use super::{ http_stream_generate, send_with_retry, BoxError, ChatClient, ParsedLine, TokenStream };
use crate::llm::{ LlmConfig, LlmType, RetryPolicy };
use crate::models::chat::{ Message, Role };

#[derive(Debug)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    completion_model: String,
    options: GenerateOptions,
    retry: RetryPolicy,
}

#[derive(Serialize, Debug, Clone)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
    top_p: f32,
}

#[derive(Serialize)]
struct ChatTurn<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn<'a>>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

/// Accepts `http://host:11434`, `.../api` or `.../api/chat` as the endpoint.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/api/chat").unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    trimmed.to_string()
}

pub(crate) fn parse_stream_line(line: &str) -> Result<ParsedLine, serde_json::Error> {
    let resp = serde_json::from_str::<StreamResponse>(line)?;
    if let Some(err) = resp.error {
        return Ok(ParsedLine::Error(err));
    }
    let content = resp.message.map(|m| m.content).unwrap_or_default();
    if !content.is_empty() {
        return Ok(ParsedLine::Token(content));
    }
    if resp.done { Ok(ParsedLine::Done) } else { Ok(ParsedLine::Ignore) }
}

impl OllamaClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, BoxError> {
        if config.llm_type != LlmType::Ollama {
            return Err("Invalid config type for OllamaClient".into());
        }

        Ok(Self {
            http: HttpClient::new(),
            base_url: normalize_base_url(&config.base_url),
            completion_model: config.completion_model.clone(),
            options: GenerateOptions {
                temperature: config.temperature,
                num_predict: config.max_tokens,
                top_p: config.top_p,
            },
            retry: config.retry,
        })
    }
}

#[async_trait]
impl ChatClient for OllamaClient {
    async fn stream_chat(&self, messages: &[Message]) -> Result<TokenStream, BoxError> {
        let url = format!("{}/api/chat", self.base_url);
        let req = ChatRequest {
            model: &self.completion_model,
            messages: messages
                .iter()
                .map(|m| ChatTurn { role: m.role, content: &m.content })
                .collect(),
            stream: true,
            options: self.options.clone(),
        };
        info!("Streaming {} messages to Ollama at {} (model {})", messages.len(), url, self.completion_model);

        let request = self.http.post(&url).json(&req);
        Ok(http_stream_generate(request, self.retry, parse_stream_line))
    }

    async fn list_models(&self) -> Result<Vec<String>, BoxError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = send_with_retry(self.http.get(&url), self.retry).await?.error_for_status()?;
        let tags = resp.json::<TagsResponse>().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn get_model(&self) -> String {
        self.completion_model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}
