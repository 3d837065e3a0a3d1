//! Clap CLI definitions for the chat server.

use clap::Parser;
use holonet_kernel::config::DEFAULT_CONFIG_FILE;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
While running, type q and press Enter (or press Ctrl-C) to drain and exit.

Exit codes:
  0  clean shutdown
  1  startup failed (configuration, log file, registry, or upstream)";

/// Holonet chat node.
#[derive(Parser, Debug)]
#[command(name = "chatserver", version, about = "Holonet chat node", after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
}
