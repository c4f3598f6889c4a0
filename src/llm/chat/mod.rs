pub mod ollama;
pub mod openai;
pub mod simulated;

use async_trait::async_trait;
use futures::{ Stream, StreamExt, Future };
use log::{ debug, info, warn };
use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use super::{ LlmConfig, LlmType, RetryPolicy };
use self::ollama::OllamaClient;
use self::openai::OpenAIChatClient;
use self::simulated::SimulatedClient;
use crate::models::chat::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type BoxError = Box<dyn StdError + Send + Sync>;
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, BoxError>> + Send>>;

/// Outcome of parsing one line of a backend's streaming body.
#[derive(Debug, PartialEq)]
pub enum ParsedLine {
    Token(String),
    Ignore,
    Done,
    Error(String),
}

pub type LineParser = fn(&str) -> Result<ParsedLine, serde_json::Error>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Streams the reply to `messages`, in backend order, ending at the backend's sentinel.
    async fn stream_chat(&self, messages: &[Message]) -> Result<TokenStream, BoxError>;

    async fn list_models(&self) -> Result<Vec<String>, BoxError>;

    fn get_model(&self) -> String;
    fn get_base_url(&self) -> Option<String>;
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, BoxError> {
    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::Ollama => {
            let specific_client = OllamaClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::OpenAI => {
            let specific_client = OpenAIChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::Simulated => {
            let specific_client = SimulatedClient::from_config(config);
            Arc::new(specific_client)
        }
    };
    Ok(client)
}

/// Runs `response_fn` on its own task, exposing what it sends as a stream.
/// The task sees `Sender::closed()` resolve once the stream is dropped.
pub fn create_streaming_response<F, Fut>(response_fn: F) -> TokenStream
where
    F: FnOnce(mpsc::Sender<Result<String, BoxError>>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Reassembles newline-delimited frames that may be split across network reads.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).to_string())
    }
}

pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    retry: RetryPolicy
) -> Result<reqwest::Response, BoxError> {
    let mut attempt = 0;
    loop {
        let req = request.try_clone().ok_or("backend request cannot be retried")?;
        match req.send().await {
            Ok(resp) => {
                return Ok(resp);
            }
            Err(e) if (e.is_connect() || e.is_timeout()) && attempt < retry.max_retries => {
                let wait = retry.backoff_for(attempt);
                attempt += 1;
                warn!(
                    "Backend connection failed ({}), retry {}/{} in {:?}",
                    e,
                    attempt,
                    retry.max_retries,
                    wait
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                return Err(Box::new(e));
            }
        }
    }
}

/// Returns false once the stream should stop.
async fn forward_line(
    tx: &mpsc::Sender<Result<String, BoxError>>,
    line: &str,
    line_parser: LineParser
) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    match line_parser(line) {
        Ok(ParsedLine::Token(tok)) => tok.is_empty() || tx.send(Ok(tok)).await.is_ok(),
        Ok(ParsedLine::Ignore) => true,
        Ok(ParsedLine::Done) => {
            debug!("Backend sent end-of-stream sentinel");
            false
        }
        Ok(ParsedLine::Error(message)) => {
            let _ = tx.send(Err(format!("backend error: {}", message).into())).await;
            false
        }
        Err(e) => {
            warn!("Skipping malformed backend chunk '{}': {}", line, e);
            true
        }
    }
}

/// Sends `request` and turns its line-delimited body into a token stream.
pub fn http_stream_generate(
    request: reqwest::RequestBuilder,
    retry: RetryPolicy,
    line_parser: LineParser
) -> TokenStream {
    create_streaming_response(move |tx| async move {
        let sent =
            tokio::select! {
            _ = tx.closed() => {
                debug!("Stream consumer dropped before the backend answered");
                return;
            }
            sent = send_with_retry(request, retry) => sent,
        };

        let resp = match sent {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let msg = format!("backend returned {}: {}", status, body.trim());
            let _ = tx.send(Err(msg.into())).await;
            return;
        }

        let mut bytes = resp.bytes_stream();
        let mut lines = LineBuffer::default();
        loop {
            let next =
                tokio::select! {
                _ = tx.closed() => {
                    info!("Client went away, aborting backend request");
                    return;
                }
                next = bytes.next() => next,
            };

            match next {
                Some(Ok(buf)) => {
                    for line in lines.push(&buf) {
                        if !forward_line(&tx, &line, line_parser).await {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(Box::new(e) as BoxError)).await;
                    return;
                }
                None => {
                    break;
                }
            }
        }

        if let Some(rest) = lines.finish() {
            forward_line(&tx, &rest, line_parser).await;
        }
    })
}
