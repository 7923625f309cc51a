use std::sync::Arc;
use tracing::{error, info};

use chat_relay::{api, telemetry, Config, Relay};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    telemetry::init_tracing(&config.logging)?;

    let server = config.server.clone();
    let relay = Arc::new(Relay::from_config(config)?);

    info!("Starting chat relay");
    tokio::select! {
        result = api::serve(relay.clone(), &server) => {
            if let Err(e) = result {
                error!("Observability server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    relay.shutdown().await;
    Ok(())
}
