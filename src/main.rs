use clap::Parser;
use dotenv::dotenv;
use local_chat_relay::cli::Args;
use local_chat_relay::llm::chat::BoxError;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    local_chat_relay::run(args).await
}
