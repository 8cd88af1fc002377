use std::{net::SocketAddr, time::Duration};

use anyhow::{ensure, Context};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "pixel-wall-server",
    author,
    version,
    about = "Shared pixel grid over WebSockets"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "PIXEL_WALL_LISTEN_ADDR", default_value = "0.0.0.0:9000")]
    pub listen_addr: String,

    /// Number of slots in the shared grid.
    #[arg(long, env = "PIXEL_WALL_SLOT_COUNT", default_value_t = 25)]
    pub slot_count: usize,

    /// Lifetime of an issued channel token.
    #[arg(long, env = "PIXEL_WALL_TOKEN_TTL_SECS", default_value_t = 60)]
    pub token_ttl_secs: u64,

    /// Age after which unconsumed tokens are swept from the store.
    #[arg(long, env = "PIXEL_WALL_TOKEN_RETENTION_SECS", default_value_t = 60)]
    pub token_retention_secs: u64,

    /// How often the token sweeper runs.
    #[arg(long, env = "PIXEL_WALL_RETENTION_INTERVAL_MS", default_value_t = 5000)]
    pub retention_interval_ms: u64,

    /// How often every connection is probed with a ping.
    #[arg(long, env = "PIXEL_WALL_LIVENESS_INTERVAL_SECS", default_value_t = 30)]
    pub liveness_interval_secs: u64,

    /// Drop clients silent for longer than this (0 disables).
    #[arg(long, env = "PIXEL_WALL_IDLE_TIMEOUT_SECS", default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// Upper bound on a single outbound frame write.
    #[arg(long, env = "PIXEL_WALL_WRITE_TIMEOUT_SECS", default_value_t = 15)]
    pub write_timeout_secs: u64,

    /// Refuse upgrades whose token is unknown or expired instead of
    /// admitting them anonymously.
    #[arg(long, env = "PIXEL_WALL_REJECT_INVALID_OTP", default_value_t = false)]
    pub reject_invalid_otp: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PIXEL_WALL_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Export tracing spans to stdout through OpenTelemetry. The env value
    /// is false for `0`, `false`, `no`, `off` or empty, true otherwise.
    #[arg(
        long,
        env = "PIXEL_WALL_OTEL_STDOUT",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub otel_stdout: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub slot_count: usize,
    pub token_ttl: Duration,
    pub token_retention: Duration,
    pub retention_interval: Duration,
    pub liveness_interval: Duration,
    pub idle_timeout: Option<Duration>,
    pub write_timeout: Duration,
    pub reject_invalid_otp: bool,
    pub shutdown_grace: Duration,
    pub otel_stdout: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            slot_count: 25,
            token_ttl: Duration::from_secs(60),
            token_retention: Duration::from_secs(60),
            retention_interval: Duration::from_millis(5000),
            liveness_interval: Duration::from_secs(30),
            idle_timeout: None,
            write_timeout: Duration::from_secs(15),
            reject_invalid_otp: false,
            shutdown_grace: Duration::from_secs(2),
            otel_stdout: false,
        }
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.slot_count > 0, "slot count must be greater than zero");
        ensure!(
            cli.retention_interval_ms > 0,
            "retention interval must be greater than zero"
        );
        ensure!(
            cli.liveness_interval_secs > 0,
            "liveness interval must be greater than zero"
        );
        ensure!(
            cli.write_timeout_secs > 0,
            "write timeout must be greater than zero"
        );

        Ok(ServerConfig {
            listen_addr,
            slot_count: cli.slot_count,
            token_ttl: Duration::from_secs(cli.token_ttl_secs),
            token_retention: Duration::from_secs(cli.token_retention_secs),
            retention_interval: Duration::from_millis(cli.retention_interval_ms),
            liveness_interval: Duration::from_secs(cli.liveness_interval_secs),
            idle_timeout: (cli.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(cli.idle_timeout_secs)),
            write_timeout: Duration::from_secs(cli.write_timeout_secs),
            reject_invalid_otp: cli.reject_invalid_otp,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            otel_stdout: cli.otel_stdout,
        })
    }
}
