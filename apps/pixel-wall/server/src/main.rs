use anyhow::{Context, Result};
use clap::Parser;
use pixel_wall_server::{
    config::{Cli, ServerConfig},
    telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = match dotenvy::dotenv() {
        Ok(path) => Some(path),
        Err(err) if err.not_found() => None,
        Err(err) => return Err(err).context("failed to load .env file"),
    };
    let config = ServerConfig::try_from(Cli::parse())?;
    let telemetry = telemetry::install(config.otel_stdout)?;
    if let Some(path) = dotenv {
        info!(path = %path.display(), "loaded environment file");
    }

    info!(
        listen_addr = %config.listen_addr,
        slot_count = config.slot_count,
        token_ttl_secs = config.token_ttl.as_secs(),
        token_retention_secs = config.token_retention.as_secs(),
        reject_invalid_otp = config.reject_invalid_otp,
        otel_stdout = config.otel_stdout,
        "starting pixel-wall server"
    );

    pixel_wall_server::run(config, Some(telemetry.metrics_handle())).await
}
