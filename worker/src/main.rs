use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::control::{Handshake, PROTOCOL_VERSION};

use crate::arena::{Arena, DEFAULT_ARENA_BYTES};
use crate::cli::Config;
use crate::executor::ExecutorRegistry;
use crate::transport::HostLink;
use crate::worker::Worker;

pub mod arena;
pub mod cli;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod ops;
pub mod sandbox;
pub mod shutdown;
pub mod transport;
pub mod worker;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    tracing_subscriber::fmt()
        .with_ansi(true)
        .with_level(true)
        .with_target(true)
        .with_max_level(if config.debug { LevelFilter::DEBUG } else { LevelFilter::INFO })
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Error: {err}. Aborting worker.");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), anyhow::Error> {
    info!(slot = config.slot_index, arena = %config.arena_name, "lattice worker starting");

    // Must precede any externally supplied operation code.
    sandbox::enable();

    let mut registry = ExecutorRegistry::new();
    ops::register_builtin(&mut registry);

    let arena = Arena::open_or_create(&config.arena_name, DEFAULT_ARENA_BYTES)?;
    arena.register(config.slot_index)?;

    let link = connect_host(&config, &registry).await;
    let shutdown = shutdown::shutdown_token();

    let mut worker = Worker::new(
        config.slot_index,
        config.poll_interval,
        arena,
        registry,
        link,
        shutdown,
    );
    worker.run().await?;

    info!("worker shutdown complete");
    Ok(())
}

/// Connect and handshake with the host. An absent or unresponsive host is
/// not fatal; the worker falls back to standalone heartbeat-only mode.
async fn connect_host(config: &Config, registry: &ExecutorRegistry) -> Option<HostLink> {
    let mut link = match HostLink::connect(&config.socket_path).await {
        Ok(link) => link,
        Err(err) => {
            warn!(
                path = %config.socket_path.display(),
                %err,
                "host socket unavailable, running standalone"
            );
            return None;
        }
    };

    let hello = Handshake {
        worker_id: Uuid::new_v4(),
        protocol_version: PROTOCOL_VERSION,
        capabilities: registry.operation_names(),
    };
    match link.handshake(hello, HANDSHAKE_TIMEOUT).await {
        Ok(ack) => {
            // Slot assignment is external; a mismatched ack is logged, not obeyed.
            if ack.slot_index as usize != config.slot_index {
                warn!(
                    acked = ack.slot_index,
                    local = config.slot_index,
                    "host acked a different slot, keeping local assignment"
                );
            }
            info!(arena = %ack.arena_name, "handshake complete");
            Some(link)
        }
        Err(err) => {
            warn!(%err, "handshake failed, running standalone");
            None
        }
    }
}
