use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use perfmon::config::SamplerConfig;
use perfmon::cycle::HostCycle;
use perfmon::events::EventHub;
use perfmon::report;
use perfmon::transport::{Connector, OpenSshConnector};

/// perfmon: agentless metrics sampler for SSH-reachable hosts.
#[derive(Parser, Debug)]
#[command(name = "perfmon", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/perfmon/config.toml")]
    config: PathBuf,

    /// Print snapshots and failures as JSON lines on stdout.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perfmon=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting perfmon");

    let cfg = SamplerConfig::from_file(&cli.config)?;
    info!(
        hosts = cfg.hosts.len(),
        interval = cfg.interval_secs,
        disk_mount = %cfg.disk_mount,
        "Configuration loaded"
    );

    let events = EventHub::new();
    let printer = tokio::spawn(report::print_events(events.subscribe(), cli.json));

    let connector: Arc<dyn Connector> = Arc::new(OpenSshConnector::new(
        cfg.connect_timeout(),
        cfg.command_timeout(),
    ));
    let settings = cfg.cycle_settings();
    let shutdown = CancellationToken::new();

    let mut cycles = JoinSet::new();
    for target in cfg.hosts {
        let cycle = HostCycle::new(
            target,
            Arc::clone(&connector),
            settings.clone(),
            Arc::clone(&events),
        );
        cycles.spawn(cycle.run(shutdown.child_token()));
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("Shutdown requested");
        }
        _ = async {
            while let Some(joined) = cycles.join_next().await {
                if let Err(e) = joined {
                    error!("Host cycle task failed: {e}");
                }
            }
        } => {
            warn!("Every host cycle has terminated");
        }
    }

    shutdown.cancel();
    while let Some(joined) = cycles.join_next().await {
        if let Err(e) = joined {
            error!("Host cycle task failed: {e}");
        }
    }

    // Cycles are gone; the printer stops once the last publisher is dropped.
    drop(events);
    if let Err(e) = printer.await {
        error!("Event printer failed: {e}");
    }

    info!("perfmon stopped");
    Ok(())
}
