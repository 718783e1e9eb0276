//! Send command implementation.
//!
//! Asks a serving device for a transfer, opens a FileExplore session to it
//! and pushes files over the transfer engine.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use beambox_core::config::Config;
use beambox_core::discovery::{BroadcastReceiver, DiscoveryOptions, QrCodeScanClient};
use beambox_core::explore::{ExploreHandlers, ExploreOptions, FileExplore};
use beambox_core::file::format_size;
use beambox_core::protocol::messages::{
    DownloadFilesReq, DownloadFilesResp, QRCodeShare, ScanDirReq, ScanDirResp, SendFilesReq,
    SendFilesResp,
};
use beambox_core::protocol::MAX_BODY_SIZE;
use beambox_core::transfer::{
    FileSender, FileTransferState, SenderFile, SpeedCalculator, TransferOptions,
};

use super::SendArgs;
use crate::ui::{describe_outcome, TransferDisplay};

/// How long to keep dialing while the peer opens its FileExplore port.
const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_BACKOFF: Duration = Duration::from_millis(250);

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(name) = &args.name {
        config.general.device_name.clone_from(name);
    }

    let files = collect_files(&args)?;
    let total_size: u64 = files.iter().map(|f| f.explore_file.size).sum();
    let (peer_ip, use_qr) = parse_target(&args.target, args.qr)?;

    if !args.quiet {
        println!();
        println!("Beambox v{}", beambox_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!(
            "  Sending {} file(s) ({}) to {}",
            files.len(),
            format_size(total_size),
            peer_ip
        );
        for file in &files {
            println!("    {}", file.explore_file.name);
        }
        println!();
    }

    let peer_name = request_transfer(&config, peer_ip, use_qr).await?;
    if !args.quiet {
        println!("  {} accepted the request", peer_name);
    }

    let explore = FileExplore::new(declining_handlers(), ExploreOptions::from(&config));
    connect(&explore, peer_ip).await?;
    explore
        .request_handshake()
        .await
        .context("FileExplore handshake failed")?;

    let explore_files = files.iter().map(|f| f.explore_file.clone()).collect();
    let max_connection = config.transfer.max_connection;
    let offer = explore
        .request_send_files(explore_files, u32::try_from(max_connection).unwrap_or(u32::MAX))
        .await
        .context("Peer did not accept the files")?;

    let options = TransferOptions {
        buffer_size: (offer.buffer_size as usize).clamp(1, MAX_BODY_SIZE),
        ..TransferOptions::from(&config)
    };
    let file_count = files.len();
    let sender = FileSender::new(files, &options);

    let display = TransferDisplay::new(total_size, args.quiet);
    let speed = SpeedCalculator::new();
    speed.add_observer(display.clone());
    sender.add_observer(display);
    sender.add_observer(speed.clone());
    speed.start();

    let outcome = match sender.start().await {
        Ok(()) => {
            tokio::select! {
                state = sender.wait_terminal() => state,
                _ = tokio::signal::ctrl_c() => {
                    sender.cancel();
                    sender.wait_terminal().await
                }
            }
        }
        Err(e) => {
            tracing::debug!("Sender failed to start: {}", e);
            sender.state()
        }
    };
    speed.stop();
    explore.close_connection_if_active();

    println!("  {}", describe_outcome(&outcome, file_count, total_size));
    if outcome == FileTransferState::Finished {
        Ok(())
    } else {
        bail!("transfer ended in state {}", outcome)
    }
}

fn collect_files(args: &SendArgs) -> Result<Vec<SenderFile>> {
    args.paths
        .iter()
        .map(|path| {
            let file = SenderFile::from_path(path)
                .with_context(|| format!("Cannot send {}", path.display()))?;
            if file.explore_file.size == 0 {
                bail!("Cannot send {}: file is empty", path.display());
            }
            Ok(file)
        })
        .collect()
}

/// Accept either a plain address or a scanned QR payload.
fn parse_target(target: &str, qr: bool) -> Result<(IpAddr, bool)> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok((ip, qr));
    }
    let share = QRCodeShare::parse(target)
        .with_context(|| format!("'{}' is neither an address nor a QR payload", target))?;
    share.ensure_compatible()?;
    Ok((share.ip_address()?, true))
}

/// Run the discovery handshake and return the peer's name.
async fn request_transfer(config: &Config, peer_ip: IpAddr, use_qr: bool) -> Result<String> {
    let options = DiscoveryOptions::from(config);
    if use_qr {
        let client = QrCodeScanClient::new(options);
        client
            .start(peer_ip)
            .await
            .context("Failed to open QR rendezvous socket")?;
        let result = client.request_file_transfer(&config.general.device_name).await;
        client.close_connection_if_active();
        result.context("Peer did not answer the transfer request")?;
        Ok(peer_ip.to_string())
    } else {
        let receiver = BroadcastReceiver::new(options);
        receiver
            .start()
            .await
            .context("Failed to open broadcast socket")?;
        let result = receiver.request_file_transfer(peer_ip).await;
        receiver.close_connection_if_active();
        let reply = result.context("Peer did not answer the transfer request")?;
        Ok(reply.device_name)
    }
}

async fn connect(explore: &FileExplore, peer_ip: IpAddr) -> Result<()> {
    let mut attempt = 0;
    loop {
        match explore.connect(peer_ip).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_recoverable() && attempt + 1 < CONNECT_ATTEMPTS => {
                tracing::debug!("FileExplore connect attempt {} failed: {}", attempt + 1, e);
                attempt += 1;
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to connect to {}", peer_ip));
            }
        }
    }
}

/// The sending side serves nothing back.
fn declining_handlers() -> ExploreHandlers {
    ExploreHandlers {
        scan_dir: Arc::new(|_is_new: bool, request: ScanDirReq| {
            Some(ScanDirResp {
                path: request.request_path,
                ..ScanDirResp::default()
            })
        }),
        send_files: Arc::new(|_is_new: bool, _request: SendFilesReq| -> Option<SendFilesResp> {
            None
        }),
        download_files: Arc::new(
            |_is_new: bool, _request: DownloadFilesReq| -> Option<DownloadFilesResp> { None },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_target() {
        let (ip, qr) = parse_target("192.168.1.9", false).unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)));
        assert!(!qr);

        let payload = QRCodeShare::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), "Desk")
            .to_payload()
            .unwrap();
        let (ip, qr) = parse_target(&payload, false).unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)));
        assert!(qr);

        assert!(parse_target("not a target", false).is_err());
    }
}
