//! Serve command implementation.
//!
//! Announces this device, waits for a peer to request a transfer over
//! broadcast or the QR code, then hosts a FileExplore session that lets the
//! peer browse `--root`, download from it and send files into `--output`.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use beambox_core::config::Config;
use beambox_core::discovery::{
    local_ipv4, BroadcastSender, BroadcastSenderObserver, DiscoveryOptions, QrCodeScanServer,
    QrCodeScanServerObserver, RemoteDevice,
};
use beambox_core::explore::{
    ExploreHandlers, ExploreOptions, FileExplore, FileExploreObserver, FileExploreState,
};
use beambox_core::file::{format_size, resolve_in_root, scan_dir};
use beambox_core::protocol::messages::{
    DownloadFilesReq, DownloadFilesResp, ScanDirReq, SendFilesReq, SendFilesResp, SendMsgReq,
};
use beambox_core::transfer::{
    FileDownloader, FileSender, FileTransferObserver, FileTransferState, SenderFile,
    SpeedCalculator, TransferOptions,
};

use super::ServeArgs;
use crate::ui::{describe_outcome, render_qr, TransferDisplay};

/// Forwards the first transfer request from either discovery path.
struct RequestForwarder {
    tx: mpsc::UnboundedSender<RemoteDevice>,
}

impl BroadcastSenderObserver for RequestForwarder {
    fn on_request_transfer_file(&self, remote_device: &RemoteDevice) {
        let _ = self.tx.send(remote_device.clone());
    }
}

impl QrCodeScanServerObserver for RequestForwarder {
    fn on_request_transfer_file(&self, remote_device: &RemoteDevice) {
        let _ = self.tx.send(remote_device.clone());
    }
}

struct SessionPrinter {
    peer_name: String,
}

impl FileExploreObserver for SessionPrinter {
    fn on_new_state(&self, state: &FileExploreState) {
        match state {
            FileExploreState::Active(_) => println!("  Session with {} is active", self.peer_name),
            FileExploreState::NoConnection => println!("  Session closed"),
            FileExploreState::Requesting | FileExploreState::Connected => {}
        }
    }

    fn on_new_msg(&self, msg: &SendMsgReq) {
        let time = chrono::DateTime::from_timestamp_millis(msg.send_time)
            .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
            .unwrap_or_default();
        println!("  [{}] {}: {}", time, self.peer_name, msg.msg);
    }
}

/// Everything the FileExplore handlers need while the session runs.
struct ServeContext {
    root: PathBuf,
    config: Config,
    peer_ip: IpAddr,
    quiet: bool,
    runtime: Handle,
    shutdown: CancellationToken,
    transfers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServeContext {
    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = self.runtime.spawn(task);
        self.transfers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }

    fn take_transfers(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(
            &mut *self
                .transfers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

/// Run the serve command.
pub async fn run(args: ServeArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(name) = &args.name {
        config.general.device_name.clone_from(name);
    }
    if let Some(output) = &args.output {
        config.general.download_dir.clone_from(output);
    }
    config.validate().context("Invalid configuration")?;

    let root = args
        .root
        .canonicalize()
        .with_context(|| format!("Cannot serve {}", args.root.display()))?;
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }

    let local_ip = match args.bind {
        Some(ip) => ip,
        None => local_ipv4()
            .map(IpAddr::V4)
            .context("Could not determine the LAN address, pass --bind")?,
    };

    if !args.quiet {
        println!();
        println!("Beambox v{}", beambox_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!("  Device:    {}", config.general.device_name);
        println!("  Address:   {}", local_ip);
        println!("  Serving:   {}", root.display());
        println!("  Saving to: {}", config.general.download_dir.display());
        println!();
    }

    let Some(peer) = wait_for_peer(&config, local_ip, &args).await? else {
        println!("  Stopped.");
        return Ok(());
    };
    println!("  {} wants to connect", peer);

    let context = Arc::new(ServeContext {
        root,
        peer_ip: peer.remote_address.ip(),
        quiet: args.quiet,
        runtime: Handle::current(),
        shutdown: CancellationToken::new(),
        transfers: Mutex::new(Vec::new()),
        config,
    });

    let explore = FileExplore::new(
        session_handlers(&context),
        ExploreOptions::from(&context.config),
    );
    explore.add_observer(Arc::new(SessionPrinter {
        peer_name: peer.device_name.clone(),
    }));

    tokio::select! {
        result = explore.bind(local_ip) => {
            result.context("FileExplore session failed to open")?;
        }
        _ = tokio::signal::ctrl_c() => {
            explore.close_connection_if_active();
            println!("  Stopped.");
            return Ok(());
        }
    }

    tokio::select! {
        () = explore.wait_close() => {}
        _ = tokio::signal::ctrl_c() => {
            println!();
            explore.close_connection_if_active();
            context.shutdown.cancel();
        }
    }

    for transfer in context.take_transfers() {
        if let Err(e) = transfer.await {
            tracing::warn!("Transfer task failed: {}", e);
        }
    }
    Ok(())
}

/// Announce over broadcast and the QR port until a peer asks for a
/// transfer. Returns `None` when interrupted.
async fn wait_for_peer(
    config: &Config,
    local_ip: IpAddr,
    args: &ServeArgs,
) -> Result<Option<RemoteDevice>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let forwarder = Arc::new(RequestForwarder { tx });
    let options = DiscoveryOptions::from(config);

    let broadcast = BroadcastSender::new(options.clone());
    broadcast.add_observer(forwarder.clone());
    let broadcasting = match broadcast.start(local_ip, args.broadcast).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Broadcast announcements unavailable: {}", e);
            false
        }
    };

    let qr_server = QrCodeScanServer::new(options);
    qr_server.add_observer(forwarder);
    let scannable = match qr_server.start(local_ip).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("QR rendezvous unavailable: {}", e);
            false
        }
    };

    if !broadcasting && !scannable {
        bail!("Neither broadcast nor QR discovery could start on {}", local_ip);
    }

    if scannable && !args.no_qr && !args.quiet {
        let payload = QrCodeScanServer::share_payload(local_ip, &config.general.device_name)?;
        println!("{}", render_qr(&payload)?);
        println!("  Scan the code, or run: beambox send '{}' <files>", payload);
        println!();
    }
    println!("  Waiting for a peer... (Ctrl+C to stop)");

    let peer = tokio::select! {
        peer = rx.recv() => peer,
        _ = tokio::signal::ctrl_c() => None,
    };

    broadcast.close_connection_if_active();
    qr_server.close_connection_if_active();
    Ok(peer)
}

/// Map a path the peer sent back to a local path under `root`.
///
/// Absolute paths are accepted when they resolve inside `root`, which is
/// how paths from our own listings come back. Anything else is taken as
/// relative to `root`.
fn served_path(root: &Path, requested: &str) -> Option<PathBuf> {
    let candidate = Path::new(requested);
    if candidate.is_absolute() {
        if let Ok(canonical) = candidate.canonicalize() {
            if canonical.starts_with(root) {
                return Some(canonical);
            }
        }
    }
    let resolved = resolve_in_root(root, requested)?;
    let canonical = resolved.canonicalize().ok()?;
    canonical.starts_with(root).then_some(canonical)
}

fn session_handlers(context: &Arc<ServeContext>) -> ExploreHandlers {
    let scan_context = Arc::clone(context);
    let send_context = Arc::clone(context);
    let download_context = Arc::clone(context);

    ExploreHandlers {
        scan_dir: Arc::new(move |_is_new: bool, request: ScanDirReq| {
            let Some(path) = served_path(&scan_context.root, &request.request_path) else {
                tracing::warn!("Refusing to list {}", request.request_path);
                return None;
            };
            Some(scan_dir(&path))
        }),
        send_files: Arc::new(move |is_new: bool, request: SendFilesReq| {
            let buffer_size = u32::try_from(send_context.config.transfer.buffer_size).ok()?;
            if is_new {
                start_download(&send_context, request);
            }
            Some(SendFilesResp { buffer_size })
        }),
        download_files: Arc::new(move |is_new: bool, request: DownloadFilesReq| {
            let max_connection =
                u32::try_from(download_context.config.transfer.max_connection).ok()?;
            if is_new {
                let files = resolve_requested_files(&download_context.root, &request)?;
                start_upload(&download_context, files, request.buffer_size as usize);
            }
            Some(DownloadFilesResp { max_connection })
        }),
    }
}

fn resolve_requested_files(root: &Path, request: &DownloadFilesReq) -> Option<Vec<SenderFile>> {
    request
        .download_files
        .iter()
        .map(|file| {
            let Some(path) = served_path(root, &file.path) else {
                tracing::warn!("Refusing to serve {}", file.path);
                return None;
            };
            match SenderFile::from_path(path) {
                Ok(sender_file) => Some(sender_file),
                Err(e) => {
                    tracing::warn!("Cannot serve {}: {}", file.path, e);
                    None
                }
            }
        })
        .collect()
}

fn start_download(context: &Arc<ServeContext>, request: SendFilesReq) {
    let mut options = TransferOptions::from(&context.config);
    options.max_connection = options
        .max_connection
        .min(request.max_connection as usize)
        .max(1);
    let remote = SocketAddr::new(context.peer_ip, options.port);
    let total_size = request.send_files.iter().map(|f| f.size).sum();
    let file_count = request.send_files.len();

    if !context.quiet {
        println!(
            "  Receiving {} file(s) ({})",
            file_count,
            format_size(total_size)
        );
    }

    let downloader = Arc::new(FileDownloader::new(request.send_files, remote, options));
    let task_context = Arc::clone(context);
    context.spawn(async move {
        let outcome = drive_transfer(
            &task_context,
            total_size,
            |observer| downloader.add_observer(observer),
            downloader.start(),
            async {
                tokio::select! {
                    state = downloader.wait_terminal() => state,
                    () = task_context.shutdown.cancelled() => {
                        downloader.cancel();
                        downloader.wait_terminal().await
                    }
                }
            },
        )
        .await;
        println!("  {}", describe_outcome(&outcome, file_count, total_size));
        for path in downloader.downloaded_files() {
            println!("    {}", path.display());
        }
    });
}

fn start_upload(context: &Arc<ServeContext>, files: Vec<SenderFile>, buffer_size: usize) {
    let mut options = TransferOptions::from(&context.config);
    options.buffer_size = buffer_size.clamp(1, beambox_core::protocol::MAX_BODY_SIZE);
    let total_size = files.iter().map(|f| f.explore_file.size).sum();
    let file_count = files.len();

    if !context.quiet {
        println!(
            "  Sending {} file(s) ({})",
            file_count,
            format_size(total_size)
        );
    }

    let sender = Arc::new(FileSender::new(files, &options));
    let task_context = Arc::clone(context);
    context.spawn(async move {
        let outcome = drive_transfer(
            &task_context,
            total_size,
            |observer| sender.add_observer(observer),
            sender.start(),
            async {
                tokio::select! {
                    state = sender.wait_terminal() => state,
                    () = task_context.shutdown.cancelled() => {
                        sender.cancel();
                        sender.wait_terminal().await
                    }
                }
            },
        )
        .await;
        println!("  {}", describe_outcome(&outcome, file_count, total_size));
    });
}

/// Attach progress output, start the transfer and wait for it to settle.
async fn drive_transfer(
    context: &ServeContext,
    total_size: u64,
    add_observer: impl Fn(Arc<dyn FileTransferObserver>),
    start: impl std::future::Future<Output = beambox_core::Result<()>>,
    finished: impl std::future::Future<Output = FileTransferState>,
) -> FileTransferState {
    let display = TransferDisplay::new(total_size, context.quiet);
    let speed = SpeedCalculator::new();
    speed.add_observer(display.clone());
    add_observer(display);
    add_observer(speed.clone());
    speed.start();

    let outcome = match start.await {
        Ok(()) => finished.await,
        Err(e) => FileTransferState::Error(e.to_string()),
    };
    speed.stop();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn test_served_path_stays_in_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir(root.join("docs")).unwrap();
        fs::write(root.join("docs/a.txt"), b"a").unwrap();

        assert_eq!(served_path(&root, "/"), Some(root.clone()));
        assert_eq!(served_path(&root, "docs"), Some(root.join("docs")));

        let absolute = root.join("docs/a.txt").display().to_string();
        assert_eq!(served_path(&root, &absolute), Some(root.join("docs/a.txt")));

        assert_eq!(served_path(&root, "../"), None);
        assert_eq!(served_path(&root, "missing"), None);
    }

    #[test]
    fn test_resolve_requested_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::write(root.join("a.bin"), vec![1u8; 32]).unwrap();

        let listing = scan_dir(&root);
        let request = DownloadFilesReq {
            download_files: listing.children_files.clone(),
            buffer_size: 1024,
        };
        let files = resolve_requested_files(&root, &request).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].explore_file, listing.children_files[0]);

        let mut outside = listing.children_files[0].clone();
        outside.path = "../../etc/passwd".to_string();
        let request = DownloadFilesReq {
            download_files: vec![outside],
            buffer_size: 1024,
        };
        assert!(resolve_requested_files(&root, &request).is_none());
    }
}
