//! Network monitoring probe engine
//!
//! The probe executes a population of parameterized tests on periodic
//! schedules. Each test is built on a query (HTTP, raw TCP/SSL,
//! subprocess, SNMP) whose result is threaded through a filter pipeline
//! into a Nagios-style status. Identical queries are deduplicated so one
//! request serves every dependent test, group scheduling staggers load
//! across each period, and a read-only XML endpoint exposes scheduler
//! statistics.

// Use jemalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{error, info};

// The engine is organized into several modules, each with a distinct
// responsibility.
mod config;
mod filters;
mod monitor_api;
mod nagios_objects;
mod queries;
mod query_http;
mod query_raw;
mod query_snmp;
mod query_subprocess;
mod runnable;
mod scheduler;

use config::ConfigManager;
use queries::QueryRegistry;
use scheduler::Scheduler;
use test::build_test;

/// Command-line arguments for the probe
#[derive(Parser, Debug)]
#[command(name = "probe")]
#[command(about = "Network monitoring probe engine that schedules tests and publishes status", long_about = None)]
struct CliArgs {
    /// Path to the configuration directory containing probe.toml and tests.toml
    #[arg(value_name = "CONFIG_DIR")]
    config_dir: PathBuf,

    /// Override the monitoring endpoint port from the config file
    #[arg(long = "monitor-port", value_name = "PORT")]
    monitor_port: Option<u16>,

    /// Override this node's peer id from the config file
    #[arg(long = "peer-id", value_name = "ID")]
    peer_id: Option<u32>,

    /// Override the cluster size from the config file
    #[arg(long = "num-peers", value_name = "N")]
    num_peers: Option<u32>,
}

/// The assembled engine: configuration, scheduler and the monitoring
/// endpoint task.
pub struct Probe {
    pub config_manager: ConfigManager,
    scheduler: Scheduler,
    monitor: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Probe {
    /// Loads configuration, builds the test population through the query
    /// registry, prepares the scheduler and spawns the monitoring
    /// endpoint.
    pub async fn new(config_dir: PathBuf, args: &CliArgs) -> Result<Self> {
        info!("Starting network monitoring probe engine");

        let mut config_manager = ConfigManager::new(config_dir)?;
        config_manager.load_config().await?;

        let mut engine_config = config_manager
            .engine_config
            .clone()
            .context("Engine configuration not loaded")?;
        let tests_config = config_manager
            .tests_config
            .clone()
            .context("Tests configuration not loaded")?;

        // Command-line overrides win over the configuration file.
        if let Some(port) = args.monitor_port {
            engine_config.monitor_port = Some(port);
        }
        if let Some(peer_id) = args.peer_id {
            engine_config.peer_id = Some(peer_id);
        }
        if let Some(num_peers) = args.num_peers {
            engine_config.num_peers = Some(num_peers);
        }
        engine_config
            .validate()
            .context("Engine configuration invalid after command-line overrides")?;

        let mut scheduler = Scheduler::new(&engine_config);
        let peers = scheduler.peers();
        let mut registry = QueryRegistry::new()?;

        for (position, test_conf) in tests_config.tests.iter().enumerate() {
            let runnable = build_test(test_conf, position as u32, &mut registry, &peers)
                .with_context(|| format!("Failed to build test '{}'", test_conf.name))?;
            scheduler.register(runnable)?;
        }

        scheduler.prepare()?;

        info!(
            tests = tests_config.tests.len(),
            queries = registry.len(),
            groups = scheduler.group_count(),
            peer_id = ?engine_config.peer_id,
            num_peers = ?engine_config.num_peers,
            "Probe engine initialized"
        );

        let monitor = engine_config.monitor_port.map(|port| {
            let stats = scheduler.stats_handle();
            tokio::spawn(async move {
                if let Err(err) = monitor_api::serve(port, stats).await {
                    error!("Monitoring endpoint terminated: {err}");
                }
            })
        });

        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            config_manager,
            scheduler,
            monitor,
            shutdown_tx,
        })
    }

    /// Runs the scheduler loop until interrupted, then shuts down
    /// gracefully.
    pub async fn run(&mut self) -> Result<()> {
        if let Some(checksum) = &self.config_manager.current_checksum {
            info!("Active configuration checksum {checksum}");
        }

        self.scheduler.start()?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            result = self.scheduler.run(&mut shutdown_rx) => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt signal");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Graceful shutdown: stop the scheduler (waiting for in-flight
    /// group runs) and tear down the monitoring endpoint.
    pub async fn shutdown(&mut self) {
        info!("Shutting down probe engine");

        let _ = self.shutdown_tx.send(());

        if let Err(err) = self.scheduler.stop().await {
            error!("Error stopping scheduler: {err}");
        }

        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }

        info!("Probe engine shutdown complete");
    }
}

// The `#[tokio::main]` attribute transforms the `async fn main` into a
// synchronous `fn main` that initializes a tokio runtime and runs the
// async code.
#[tokio::main]
async fn main() -> Result<()> {
    // Configure logging with proper RUST_LOG environment variable handling
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default directives are only used if RUST_LOG is not set
        tracing_subscriber::EnvFilter::new("probe=info,shared=info")
    });

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli_args = CliArgs::parse();

    info!("Network monitoring probe engine starting up");
    info!("Configuration directory: {}", cli_args.config_dir.display());

    let mut probe = match Probe::new(cli_args.config_dir.clone(), &cli_args).await {
        Ok(probe) => probe,
        Err(err) => {
            error!("Failed to initialize probe engine: {err:#}");
            return Err(err);
        }
    };

    probe.run().await
}

#[cfg(test)]
mod tests;
