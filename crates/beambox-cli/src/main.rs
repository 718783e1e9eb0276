//! Beambox CLI - serverless local network file exchange
//!
//! Two devices on the same network find each other over UDP broadcast or a
//! QR code, open a FileExplore session and stream files over parallel TCP
//! connections.
//!
//! ## Quick Start
//!
//! ```bash
//! # Wait for a peer and serve the current directory
//! beambox serve
//!
//! # See who is announcing (on another device)
//! beambox scan
//!
//! # Send files to a serving device
//! beambox send 192.168.1.20 ./document.pdf
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => commands::serve::run(args).await,
        Command::Scan(args) => commands::scan::run(args).await,
        Command::Send(args) => commands::send::run(args).await,
        Command::Config(args) => commands::config::run(&args),
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,beambox=info,beambox_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
