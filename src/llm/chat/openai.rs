use async_trait::async_trait;
use log::{ debug, info };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };

use super::{ http_stream_generate, send_with_retry, BoxError, ChatClient, ParsedLine, TokenStream };
use crate::llm::{ LlmConfig, LlmType, RetryPolicy };
use crate::models::chat::{ Message, Role };

/// Client for servers exposing the OpenAI chat-completions API (LocalAI, llama.cpp server, vLLM...).
pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct OpenAIMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    error: Option<OpenAIError>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: Option<OpenAIDelta>,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIError {
    message: String,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// The endpoint may be given as the API root or as the full completions URL.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    trimmed.strip_suffix("/chat/completions").unwrap_or(trimmed).to_string()
}

pub(crate) fn parse_sse_line(line: &str) -> Result<ParsedLine, serde_json::Error> {
    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim_start(),
        None => {
            // SSE comments, `event:` and `id:` fields carry no text
            return Ok(ParsedLine::Ignore);
        }
    };
    if data == "[DONE]" {
        return Ok(ParsedLine::Done);
    }

    let resp = serde_json::from_str::<OpenAIStreamResponse>(data)?;
    if let Some(err) = resp.error {
        return Ok(ParsedLine::Error(err.message));
    }
    let content: String = resp.choices
        .into_iter()
        .filter_map(|c| c.delta.and_then(|d| d.content))
        .collect();
    if content.is_empty() { Ok(ParsedLine::Ignore) } else { Ok(ParsedLine::Token(content)) }
}

impl OpenAIChatClient {
    pub fn new(
        api_key: Option<String>,
        model: String,
        base_url: &str,
        temperature: f32,
        max_tokens: u32,
        top_p: f32,
        retry: RetryPolicy
    ) -> Result<Self, BoxError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|e|
                    format!("Invalid API key format: {}", e)
                )?
            );
        }

        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Box::new(e) as BoxError)?;

        Ok(Self {
            http,
            model,
            base_url: normalize_base_url(base_url),
            temperature,
            max_tokens,
            top_p,
            retry,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, BoxError> {
        if config.llm_type != LlmType::OpenAI {
            return Err("Invalid config type for OpenAIChatClient".into());
        }
        Self::new(
            config.api_key.clone(),
            config.completion_model.clone(),
            &config.base_url,
            config.temperature,
            config.max_tokens,
            config.top_p,
            config.retry
        )
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn stream_chat(&self, messages: &[Message]) -> Result<TokenStream, BoxError> {
        let url = format!("{}/chat/completions", self.base_url);
        let req = OpenAIChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| OpenAIMessage { role: m.role, content: &m.content })
                .collect(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            stream: true,
        };
        info!("Streaming {} messages to {} (model {})", messages.len(), url, self.model);
        debug!(
            "Sampling: temperature={}, max_tokens={}, top_p={}",
            self.temperature,
            self.max_tokens,
            self.top_p
        );

        let request = self.http.post(&url).json(&req);
        Ok(http_stream_generate(request, self.retry, parse_sse_line))
    }

    async fn list_models(&self) -> Result<Vec<String>, BoxError> {
        let url = format!("{}/models", self.base_url);
        let resp = send_with_retry(self.http.get(&url), self.retry).await?.error_for_status()?;
        let list = resp.json::<ModelList>().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}
