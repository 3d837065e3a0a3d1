//! Configuration loading from a TOML file.
//!
//! Unlike most settings in the node, a missing or broken config file is
//! fatal: the node must not touch the registry with guessed values.

use holonet_types::config::NodeConfig;
use holonet_types::error::HolonetError;
use std::path::Path;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "chatserver.toml";

/// Load and validate node configuration from `path`.
pub fn load_config(path: &Path) -> Result<NodeConfig, HolonetError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        HolonetError::Configuration(format!(
            "unable to read configuration file {}: {e}",
            path.display()
        ))
    })?;
    parse_config(&contents).map_err(|e| match e {
        HolonetError::Configuration(msg) => {
            HolonetError::Configuration(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

/// Parse and validate configuration text.
pub fn parse_config(contents: &str) -> Result<NodeConfig, HolonetError> {
    let config: NodeConfig =
        toml::from_str(contents).map_err(|e| HolonetError::Configuration(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
