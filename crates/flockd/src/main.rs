//! Flock node daemon (flockd).
//!
//! One daemon runs per cluster node. It watches the shared control
//! volume for configuration changes and converges the local node's
//! assignments toward their targets: allocating and removing backing
//! storage, generating resource configuration, and driving the external
//! block-device configuration tool.
//!
//! The daemon itself is deliberately quiet: it initiates a cycle on a
//! timer tick, on a line from the event feed, or on SIGHUP (forced),
//! and everything else follows from the state on the control volume.

mod backing;
mod confgen;
mod ctrlvol;
mod engine;
mod events;
mod executor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use flock_model::consts::DEFAULT_PEER_COUNT;

use crate::backing::LvmBacking;
use crate::ctrlvol::FileCtrlVol;
use crate::engine::{Engine, EngineConfig};
use crate::executor::ToolExecutor;

/// Flock node daemon
#[derive(Parser, Debug)]
#[command(name = "flockd", version, about = "Flock replicated block-device node daemon")]
struct Args {
    /// Name of this node in the cluster
    #[arg(short = 'n', long)]
    node_name: String,

    /// Path of the control-volume device
    #[arg(short = 'c', long, default_value = "/dev/flock/ctrlvol")]
    ctrlvol: PathBuf,

    /// Backing device of the local control-volume replica
    #[arg(long, default_value = "/dev/flockpool/ctrl_00")]
    ctrl_disk: String,

    /// Directory for generated resource configuration files
    #[arg(short = 'd', long, default_value = "/var/lib/flock/res.d")]
    conf_dir: PathBuf,

    /// LVM volume group providing backing storage
    #[arg(short = 'g', long, default_value = "flockpool")]
    vg: String,

    /// External block-device configuration tool
    #[arg(short = 't', long, default_value = "drbdadm")]
    tool: PathBuf,

    /// Peer count used for replication metadata sizing
    #[arg(long, default_value_t = DEFAULT_PEER_COUNT)]
    peers: u8,

    /// Seconds between periodic reconciliation cycles
    #[arg(short = 'i', long, default_value_t = 60)]
    interval: u64,

    /// Named pipe carrying change events from the replication tool
    #[arg(short = 'e', long)]
    events: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("flockd v{} starting on node {}", env!("CARGO_PKG_VERSION"), args.node_name);

    if let Err(e) = tokio::fs::create_dir_all(&args.conf_dir).await {
        error!(
            "failed to create configuration directory {}: {}",
            args.conf_dir.display(),
            e
        );
        std::process::exit(1);
    }

    let mut engine = Engine::new(
        EngineConfig {
            node_name: args.node_name.clone(),
            conf_dir: args.conf_dir.clone(),
            peers: args.peers,
            ctrl_disk: args.ctrl_disk.clone(),
        },
        Arc::new(FileCtrlVol::new(args.ctrlvol.clone())),
        Arc::new(ToolExecutor::new(args.tool.clone())),
        Arc::new(LvmBacking::new(args.vg.clone())),
    );

    let mut events = args.events.clone().map(events::spawn_event_reader);
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            error!("failed to install SIGHUP handler: {}", e);
            std::process::exit(1);
        }
    };

    loop {
        let force = tokio::select! {
            _ = ticker.tick() => false,
            _ = sighup.recv() => {
                info!("SIGHUP received, forcing a cycle");
                true
            }
            line = recv_event(&mut events) => {
                info!("change event: {}", line);
                true
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        };

        if let Err(e) = engine.run(force, false).await {
            // The next cycle starts from scratch off the control volume
            warn!("reconciliation cycle failed: {}", e);
        }
    }
}

/// Receive the next event line; pends forever when no feed is
/// configured or the feed task has ended, so the select! above simply
/// never takes this branch.
async fn recv_event(events: &mut Option<tokio::sync::mpsc::Receiver<String>>) -> String {
    match events.as_mut() {
        Some(rx) => match rx.recv().await {
            Some(line) => line,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}
