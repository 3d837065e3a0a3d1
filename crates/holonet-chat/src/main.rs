//! Holonet chat server: one chat node in a cluster of game server processes.
//!
//! Loads configuration, installs logging, boots the node, and runs the tick
//! loop on a single-threaded runtime until the operator asks it to stop.

mod cli;
mod logging;
mod modules;

use crate::cli::Cli;
use clap::Parser;
use holonet_kernel::config::load_config;
use holonet_kernel::{KernelResult, Node, Supervisor};
use holonet_types::config::NodeConfig;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

async fn serve(config: NodeConfig) -> KernelResult<()> {
    let supervisor = Arc::new(Supervisor::new());
    let _signals = supervisor.spawn_signal_listener();
    if let Err(e) = supervisor.spawn_keystroke_listener() {
        warn!(error = %e, "Operator input unavailable; use Ctrl-C to stop");
    }

    let registrations = modules::registrations(&config.node_name)?;
    let node = Node::boot(config, registrations, supervisor).await?;
    info!("Type q and press Enter to shut down");
    node.run().await
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chatserver: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init_tracing(&config.log) {
        eprintln!("chatserver: {e}");
        return ExitCode::FAILURE;
    }
    info!(config = %cli.config.display(), node = %config.node_name, "Starting chat server");

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => {
            info!("Chat server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Chat server failed");
            ExitCode::FAILURE
        }
    }
}
