//! CLI argument parsing with clap.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ghostwarden")]
#[command(author, version, about = "Ban-decision reconciler for Proxmox and nftables firewalls")]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "/etc/ghostwarden/config.yaml")]
    pub config: PathBuf,

    /// Log level override (debug, info, warn, error)
    #[arg(short = 'L', long)]
    pub log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    pub print_config: bool,
}
