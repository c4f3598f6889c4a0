pub mod api;
pub mod tls;
pub mod websocket;

use crate::cli::Args;
use crate::llm::chat::BoxError;
use api::AppState;

pub struct Server {
    args: Args,
    state: AppState,
}

impl Server {
    pub fn new(args: Args, state: AppState) -> Self {
        Self { args, state }
    }

    /// Starts the HTTP API in the background, then runs the WebSocket relay until it fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.start_http_server().await?;
        self.start_ws_server().await?;

        Ok(())
    }

    async fn start_http_server(&self) -> Result<(), BoxError> {
        api::start_http_server(&self.args.http_addr, self.state.clone(), &self.args).await
    }

    async fn start_ws_server(&self) -> Result<(), BoxError> {
        websocket::start_ws_server(
            &self.args.server_addr,
            self.state.relay.clone(),
            &self.args,
        ).await
    }
}
