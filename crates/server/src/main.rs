mod bootstrap;
mod error;
mod health;
mod ratelimit;
mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kagent_agent::llm::NoopPlanner;
use kagent_core::config::{AppConfig, ConfigOverrides, LoadOptions};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "kagent-server", version, about = "Tool-brokering agent backend")]
struct Cli {
    /// Path to a TOML config file; required to exist when given.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    #[arg(long)]
    bind_address: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load_options(self) -> LoadOptions {
        LoadOptions {
            require_file: self.config.is_some(),
            config_path: self.config,
            overrides: ConfigOverrides {
                bind_address: self.bind_address,
                port: self.port,
                log_level: self.log_level,
                ..ConfigOverrides::default()
            },
        }
    }
}

fn init_logging(config: &AppConfig) {
    use kagent_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run(Cli::parse()).await
}

async fn run(cli: Cli) -> Result<()> {
    // Logging comes up before anything else can emit events.
    let config = AppConfig::load(cli.load_options())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config, Arc::new(NoopPlanner)).await;
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("could not bind {address}"))?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        tools = app.state.runtime.registry().len(),
        "kagent-server listening"
    );

    let stop = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(stop.clone()));

    let service = app.router().into_make_service_with_connect_info::<SocketAddr>();
    let server = axum::serve(listener, service).with_graceful_shutdown(stop.clone().cancelled_owned());
    let server = std::future::IntoFuture::into_future(server);
    tokio::pin!(server);

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    tokio::select! {
        served = &mut server => served?,
        _ = async {
            stop.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(
                event_name = "system.server.drain_timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "in-flight requests outlived the grace period; cancelling them"
            );
            app.shutdown();
            server.await?;
        }
    }

    app.shutdown();
    tracing::info!(event_name = "system.server.stopped", correlation_id = "shutdown", "kagent-server stopped");
    Ok(())
}

async fn wait_for_shutdown(stop: CancellationToken) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "could not listen for ctrl-c; shutting down"
        );
    }
    tracing::info!(event_name = "system.server.stopping", correlation_id = "shutdown", "shutdown requested");
    stop.cancel();
}
