use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "cacheproxy", about = "Forward caching HTTP proxy")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./cacheproxy.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen on; overrides the configured `listen`.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Log output format; overrides the configured `log`.
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
