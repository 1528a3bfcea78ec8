use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snipe_bot::config::{Config, Transport};
use snipe_bot::{socket, webhook, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;
    info!(
        channel = %config.target_channel_id,
        transport = ?config.slack_transport,
        mode = ?config.scoring_mode,
        data_dir = %config.data_dir.display(),
        "Bot is starting"
    );

    let transport = config.slack_transport;
    let state = Arc::new(AppState::new(config)?);

    match transport {
        Transport::Socket => socket::run(state).await,
        Transport::Http => webhook::serve(state).await,
    }
}
