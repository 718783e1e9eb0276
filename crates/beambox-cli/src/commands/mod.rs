//! CLI command definitions and handlers.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Load configuration with graceful fallback to defaults.
///
/// This function should be used by all commands to load the user's configuration.
/// If the config file doesn't exist or can't be parsed, it falls back to defaults.
pub fn load_config() -> beambox_core::config::Config {
    match beambox_core::config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Using default configuration: {}", e);
            beambox_core::config::Config::default()
        }
    }
}

pub mod config;
pub mod scan;
pub mod send;
pub mod serve;

/// Beambox - serverless local network file exchange
#[derive(Parser)]
#[command(name = "beambox")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Announce this device and wait for a peer
    Serve(ServeArgs),

    /// List devices announcing on the network
    Scan(ScanArgs),

    /// Send files to a serving device
    Send(SendArgs),

    /// Inspect configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Parser)]
pub struct ServeArgs {
    /// Directory the peer may browse and download from
    #[arg(short, long, default_value = ".")]
    pub root: PathBuf,

    /// Directory for files the peer sends
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Custom device name for this session
    #[arg(long)]
    pub name: Option<String>,

    /// Local address to bind (defaults to the LAN address)
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Address announcements are sent to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::BROADCAST))]
    pub broadcast: IpAddr,

    /// Do not print the QR code
    #[arg(long)]
    pub no_qr: bool,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the scan command
#[derive(Parser)]
pub struct ScanArgs {
    /// Duration to scan (e.g., 5s, 10s)
    #[arg(short, long, default_value = "5s")]
    pub duration: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Address of the serving device, or its scanned QR payload
    pub target: String,

    /// Files to send
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Request the transfer over the QR rendezvous port
    #[arg(long)]
    pub qr: bool,

    /// Custom device name for this session
    #[arg(long)]
    pub name: Option<String>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Show the configuration file path
    Path,
}
