pub mod cli;
pub mod config;
pub mod history;
pub mod llm;
pub mod models;
pub mod relay;
pub mod server;
pub mod session;

use cli::Args;
use config::settings::SettingsStore;
use history::{ FileHistoryStore, HistoryStore };
use llm::chat::BoxError;
use log::info;
use relay::Relay;
use server::api::AppState;
use server::Server;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), BoxError> {
    let default_settings = args.default_settings();

    info!("--- Core Configuration ---");
    info!("HTTP Address: {}", args.http_addr);
    info!("WebSocket Address: {}", args.server_addr);
    info!("Data Directory: {}", args.data_dir.display());
    info!("Default Backend: {}", default_settings.backend);
    info!("Default Endpoint: {}", default_settings.api_endpoint);
    info!("Default Model: {}", default_settings.model);
    info!("System Prompt: {}", args.system_prompt().as_deref().unwrap_or("(none)"));
    info!("Backend Retries: {} (initial backoff {}ms)", args.backend_retries, args.retry_backoff_ms);
    info!("Max Connections/sec: {}", args.max_connections_per_sec);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    default_settings.validate()?;

    let history: Arc<dyn HistoryStore> = Arc::new(FileHistoryStore::new(args.chats_dir()).await?);
    let settings = Arc::new(SettingsStore::new(args.settings_path(), default_settings));
    let relay = Arc::new(
        Relay::new(Arc::clone(&settings), args.backend_options(), args.system_prompt())
    );

    let state = AppState { history, settings, relay };
    let server = Server::new(args, state);
    server.run().await?;

    Ok(())
}
