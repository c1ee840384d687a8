//! Clap CLI definitions for the winerp relay.

use clap::Parser;
use std::path::PathBuf;

/// winerp relay — routes calls between named clients over WebSockets.
#[derive(Debug, Parser)]
#[command(name = "winerp", version, about)]
pub struct Cli {
    /// Path to a server config file (default: ~/.winerp/server.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to bind, overriding the config file.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind, overriding the config file.
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Log filter, e.g. `debug` or `winerp_server=trace`. Falls back to
    /// `RUST_LOG`, then `info`.
    #[arg(long)]
    pub log_level: Option<String>,
}
