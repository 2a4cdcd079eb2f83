use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use otad_agent::config::{self, load_config};
use otad_agent::server::{create_app, Agent};
use otad_common::manager::LinuxPartitionManager;
use otad_common::partitions::Partitions;

#[derive(Debug, Clone, Parser)]
#[clap(author, about)]
pub struct Args {
    /// The address to bind to [default: 0.0.0.0:8088].
    #[clap(long)]
    pub address: Option<String>,
    /// Path to the agent configuration file.
    #[clap(long)]
    pub config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let args = Args::parse();
    let address = args.address.as_deref().unwrap_or("0.0.0.0:8088");
    let config_path = args
        .config
        .as_deref()
        .unwrap_or(Path::new(config::CONFIG_PATH));
    let config = load_config(config_path).context("loading configuration")?;

    let partitions = Partitions::from_config(&config.partitions, &config.mount_root)
        .context("loading partitions")?;
    let manager = Arc::new(LinuxPartitionManager::new(partitions, config.boot_env.clone()));
    let agent = Arc::new(Agent::new(config, manager));
    let app = create_app(agent.clone());

    tracing::info!("listening on {address}");
    axum::Server::bind(&address.parse().context("invalid bind address")?)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Tear down any in-flight session before exiting.
    agent.registry().shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}

fn init_logging() {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .event_format(format)
        .init();
}
