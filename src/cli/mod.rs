use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::llm::{ BackendOptions, LlmType, RetryPolicy, SimulatedOptions };
use crate::models::settings::Settings;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Listener Args ---
    /// Host address and port for the HTTP API (chats, settings, NDJSON streaming).
    #[arg(long, env = "HTTP_ADDR", default_value = "127.0.0.1:8282")]
    pub http_addr: String,

    /// Host address and port for the WebSocket relay.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:8283")]
    pub server_addr: String,

    /// Optional API Key required for clients to connect to the WebSocket server.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Maximum accepted WebSocket connections per second across all peers.
    #[arg(long, env = "MAX_CONNECTIONS_PER_SEC", default_value = "10")]
    pub max_connections_per_sec: u32,

    // --- Storage Args ---
    /// Directory holding `settings.json` and the `chats/` folder.
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    // --- Default Settings Args ---
    /// Backend protocol used until the user saves settings (openai, ollama, simulated).
    #[arg(long, env = "DEFAULT_BACKEND", default_value = "openai")]
    pub default_backend: LlmType,

    /// Backend endpoint used until the user saves settings.
    #[arg(long, env = "DEFAULT_ENDPOINT", default_value = "http://localhost:11434/v1")]
    pub default_endpoint: String,

    /// Model name used until the user saves settings.
    #[arg(long, env = "DEFAULT_MODEL", default_value = "local")]
    pub default_model: String,

    #[arg(long, env = "DEFAULT_TEMPERATURE", default_value = "0.7")]
    pub default_temperature: f32,

    #[arg(long, env = "DEFAULT_MAX_TOKENS", default_value = "500")]
    pub default_max_tokens: u32,

    #[arg(long, env = "DEFAULT_TOP_P", default_value = "1.0")]
    pub default_top_p: f32,

    // --- Backend Args ---
    /// Bearer token sent to OpenAI-compatible backends.
    #[arg(long, env = "BACKEND_API_KEY")]
    pub backend_api_key: Option<String>,

    /// System prompt prepended when the history has none. Empty disables it.
    #[arg(long, env = "SYSTEM_PROMPT", default_value = "You are a helpful AI assistant.")]
    pub system_prompt: String,

    /// Retries for backend connection failures.
    #[arg(long, env = "BACKEND_RETRIES", default_value = "2")]
    pub backend_retries: u32,

    /// Initial retry backoff in milliseconds, doubled per attempt.
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value = "250")]
    pub retry_backoff_ms: u64,

    /// Fixed reply for the simulated backend. Defaults to echoing the last user message.
    #[arg(long, env = "SIMULATED_REPLY")]
    pub simulated_reply: Option<String>,

    /// Delay between characters emitted by the simulated backend.
    #[arg(long, env = "SIMULATED_DELAY_MS", default_value = "20")]
    pub simulated_delay_ms: u64,

    // --- TLS Args ---
    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    pub fn default_settings(&self) -> Settings {
        Settings {
            backend: self.default_backend,
            api_endpoint: self.default_endpoint.clone(),
            model: self.default_model.clone(),
            temperature: self.default_temperature,
            max_tokens: self.default_max_tokens,
            top_p: self.default_top_p,
        }
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            api_key: self.backend_api_key.clone(),
            retry: RetryPolicy {
                max_retries: self.backend_retries,
                initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            },
            simulated: SimulatedOptions {
                reply: self.simulated_reply.clone(),
                delay: Duration::from_millis(self.simulated_delay_ms),
            },
        }
    }

    pub fn system_prompt(&self) -> Option<String> {
        Some(self.system_prompt.trim().to_string()).filter(|p| !p.is_empty())
    }

    pub fn chats_dir(&self) -> PathBuf {
        self.data_dir.join("chats")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }
}
