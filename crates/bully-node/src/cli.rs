use crate::error::{NodeError, Result};
use bully_cluster::ElectionConfig;
use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bully-node",
    about = "Leader election node using the Bully algorithm",
    version = env!("CARGO_PKG_VERSION"),
    author = "Bully Project Team"
)]
pub struct Cli {
    /// Port to listen on for peer connections
    #[arg(long, default_value_t = 8117)]
    pub port: u16,

    /// Comma separated list of peer addresses (host:port)
    #[arg(long, value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Address the HTTP leader endpoint binds to
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub http: SocketAddr,

    /// Include the leader's port in /leader responses
    #[arg(long)]
    pub showport: bool,

    /// Render timestamps as unix seconds
    #[arg(long, alias = "unixTime", default_value_t = true, action = ArgAction::Set)]
    pub unix_time: bool,

    /// Webhook posted to when this node is elected ("none" disables it)
    #[arg(long, default_value = "none")]
    pub url: String,

    /// Election configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Address of the peer listener
    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Initial candidates with blanks removed
    pub fn candidates(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|node| node.trim())
            .filter(|node| !node.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn webhook_url(&self) -> Option<&str> {
        match self.url.trim() {
            "" | "none" => None,
            url => Some(url),
        }
    }

    pub fn election_config(&self) -> Result<ElectionConfig> {
        match &self.config {
            Some(path) => ElectionConfig::from_file(path).map_err(NodeError::from),
            None => Ok(ElectionConfig::default()),
        }
    }
}
