use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "cacheproxy", about = "Caching reverse proxy for a single upstream")]
pub struct Cli {
    /// Path to a configuration file (defaults to ./cacheproxy.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Base URL of the upstream server, e.g. https://api.example.com
    #[arg(long)]
    pub upstream: Option<String>,

    /// Directory holding cached responses.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Address to accept client connections on.
    #[arg(long)]
    pub listen: Option<String>,

    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}
