//! Config file loading for the relay binary.

use std::path::{Path, PathBuf};
use tracing::{info, warn};
use winerp_server::ServerConfig;

/// `~/.winerp/server.toml`, or `./server.toml` without a home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".winerp"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("server.toml")
}

/// Load the server config from `path` (or the default location). A missing
/// or unreadable file falls back to defaults.
pub fn load_config(path: Option<&Path>) -> ServerConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return ServerConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ServerConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    path = %config_path.display(),
                    error = %e,
                    "Failed to parse config, using defaults"
                );
                ServerConfig::default()
            }
        },
        Err(e) => {
            warn!(
                path = %config_path.display(),
                error = %e,
                "Failed to read config file, using defaults"
            );
            ServerConfig::default()
        }
    }
}

/// Apply command-line overrides on top of a loaded config.
pub fn apply_overrides(mut config: ServerConfig, host: Option<String>, port: Option<u16>) -> ServerConfig {
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    config
}
