//! Serving side of a transfer: owns the local files.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    configure_tcp_keepalive, peer_label, send_error, FileTransferObserver, FileTransferState,
    SenderFile, TransferCore, TransferOptions, CANCELED_MESSAGE, PEER_ERROR_GRACE,
};
use crate::error::{Error, Result};
use crate::observer::lock;
use crate::protocol::messages::{DownloadReq, ErrorReq, TransferMessage};
use crate::protocol::{decode_body, read_frame, write_frame, Frame};

struct SendShared {
    core: Arc<TransferCore>,
    files: Vec<SenderFile>,
    buffer_size: usize,
    finished_files: Mutex<HashSet<String>>,
    active_connections: AtomicUsize,
}

impl SendShared {
    fn all_files_sent(&self) -> bool {
        lock(&self.finished_files).len() == self.files.len()
    }

    fn mark_sent(&self, sender_file: &SenderFile) {
        let all_sent = {
            let mut finished = lock(&self.finished_files);
            finished.insert(sender_file.explore_file.path.clone());
            finished.len() == self.files.len()
        };
        if all_sent {
            self.core.transition(FileTransferState::Finished);
        }
    }
}

/// Serves local files to a [`super::FileDownloader`].
pub struct FileSender {
    core: Arc<TransferCore>,
    files: Vec<SenderFile>,
    bind_addr: SocketAddr,
    buffer_size: usize,
    max_connection: usize,
    accept_timeout: Duration,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl FileSender {
    /// Prepare to serve `files` on `options.port` (all interfaces).
    ///
    /// `options.buffer_size` and `options.max_connection` should hold the
    /// values negotiated over FileExplore.
    #[must_use]
    pub fn new(files: Vec<SenderFile>, options: &TransferOptions) -> Self {
        Self::with_bind_addr(
            files,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), options.port),
            options,
        )
    }

    /// Prepare to serve `files` on an explicit address.
    #[must_use]
    pub fn with_bind_addr(
        files: Vec<SenderFile>,
        bind_addr: SocketAddr,
        options: &TransferOptions,
    ) -> Self {
        Self {
            core: TransferCore::new("Sender"),
            files,
            bind_addr,
            buffer_size: options.buffer_size.max(1),
            max_connection: options.max_connection.max(1),
            accept_timeout: options.accept_timeout,
            local_addr: Mutex::new(None),
        }
    }

    /// Validate the files, bind the data port and start serving.
    ///
    /// # Errors
    ///
    /// Fails, leaving the transfer in `Error`, if a file is missing, empty,
    /// or changed size, or if the port cannot be bound.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.validate() {
            self.core.fail(&e);
            return Err(e);
        }

        let listener = match TcpListener::bind(self.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let e = Error::Transport(format!("bind {} failed: {e}", self.bind_addr));
                self.core.fail(&e);
                return Err(e);
            }
        };
        *lock(&self.local_addr) = listener.local_addr().ok();

        if !self.core.transition(FileTransferState::Started) {
            return Err(Error::State(format!(
                "sender cannot start from {}",
                self.core.state()
            )));
        }
        tracing::info!(
            "Serving {} file(s) on {:?}",
            self.files.len(),
            self.local_addr()
        );

        let shared = Arc::new(SendShared {
            core: Arc::clone(&self.core),
            files: self.files.clone(),
            buffer_size: self.buffer_size,
            finished_files: Mutex::new(HashSet::new()),
            active_connections: AtomicUsize::new(0),
        });
        tokio::spawn(accept_loop(
            shared,
            listener,
            self.max_connection,
            self.accept_timeout,
        ));
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.files.is_empty() {
            return Err(Error::InvalidFile("no files to send".to_string()));
        }
        for file in &self.files {
            let metadata = std::fs::metadata(&file.real_file)
                .map_err(|_| Error::FileNotFound(file.real_file.display().to_string()))?;
            if !metadata.is_file() || metadata.len() == 0 {
                return Err(Error::InvalidFile(format!(
                    "{} is empty or not a regular file",
                    file.real_file.display()
                )));
            }
            if metadata.len() != file.explore_file.size {
                return Err(Error::InvalidFile(format!(
                    "{} changed size: expected {}, found {}",
                    file.real_file.display(),
                    file.explore_file.size,
                    metadata.len()
                )));
            }
        }
        Ok(())
    }

    /// Address the data port is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Current state.
    pub fn state(&self) -> FileTransferState {
        self.core.state()
    }

    /// Cancel a running transfer. Connected downloaders receive
    /// `ErrorReq("Canceled")`.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// Register an observer. It immediately receives the current state.
    pub fn add_observer(&self, observer: Arc<dyn FileTransferObserver>) {
        self.core.add_observer(observer);
    }

    /// Unregister an observer.
    pub fn remove_observer(&self, observer: &Arc<dyn FileTransferObserver>) {
        self.core.remove_observer(observer);
    }

    /// Resolve once the transfer reaches a terminal state.
    pub async fn wait_terminal(&self) -> FileTransferState {
        self.core.wait_terminal().await
    }
}

async fn accept_with_timeout(
    listener: &TcpListener,
    wait: Option<Duration>,
) -> Result<(TcpStream, SocketAddr)> {
    match wait {
        Some(limit) => tokio::time::timeout(limit, listener.accept())
            .await
            .map_err(|_| {
                Error::Transport(format!("no downloader connected within {limit:?}"))
            })?
            .map_err(Error::from),
        None => listener.accept().await.map_err(Error::from),
    }
}

async fn accept_loop(
    shared: Arc<SendShared>,
    listener: TcpListener,
    max_connection: usize,
    accept_timeout: Duration,
) {
    let halt = shared.core.halt_token().clone();
    let mut accepted_any = false;
    loop {
        let wait = if accepted_any { None } else { Some(accept_timeout) };
        let accepted = tokio::select! {
            () = halt.cancelled() => break,
            accepted = accept_with_timeout(&listener, wait) => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if shared.active_connections.load(Ordering::SeqCst) >= max_connection {
                    tracing::debug!("Rejecting extra data connection from {}", peer);
                    continue;
                }
                accepted_any = true;
                shared.active_connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(Arc::clone(&shared), stream, peer));
            }
            Err(e) => {
                shared.core.fail(&e);
                break;
            }
        }
    }
}

/// Forward frames from the downloader until EOF, a read error or `stop`.
async fn read_frames(
    mut reader: OwnedReadHalf,
    frames: mpsc::Sender<Result<Frame>>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = stop.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        let failed = frame.is_err();
        if frames.send(frame).await.is_err() || failed {
            break;
        }
    }
}

async fn serve_connection(shared: Arc<SendShared>, stream: TcpStream, peer: SocketAddr) {
    configure_tcp_keepalive(&stream);
    let (reader, mut writer) = stream.into_split();
    let core = &shared.core;
    let halt = core.halt_token().clone();
    let mut next_id = 0i64;

    let reader_stop = CancellationToken::new();
    let _stop_reader = reader_stop.clone().drop_guard();
    let (frames_tx, mut frames) = mpsc::channel(8);
    tokio::spawn(read_frames(reader, frames_tx, reader_stop));

    tracing::debug!("Downloader connected from {}", peer);
    let outcome: Result<()> = loop {
        let frame = tokio::select! {
            () = halt.cancelled() => break Ok(()),
            frame = frames.recv() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::debug!("Data connection from {} ended: {}", peer, e);
                break Ok(());
            }
            None => {
                tracing::debug!("Data connection from {} closed", peer);
                break Ok(());
            }
        };

        match TransferMessage::from_code(frame.message_type) {
            Some(TransferMessage::DownloadReq) => {
                let request: DownloadReq = match decode_body(&frame.body) {
                    Ok(request) => request,
                    Err(e) => break Err(e),
                };
                let Some(sender_file) = shared
                    .files
                    .iter()
                    .find(|f| f.explore_file.path == request.file.path)
                else {
                    break Err(Error::FileNotFound(request.file.path));
                };
                let streamed = send_file(
                    &shared,
                    &mut writer,
                    &mut frames,
                    sender_file,
                    &request,
                    &mut next_id,
                )
                .await;
                match streamed {
                    Ok(true) => shared.mark_sent(sender_file),
                    Ok(false) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            Some(TransferMessage::FinishedReq) => {
                tracing::debug!("Downloader {} finished", peer);
                break Ok(());
            }
            Some(TransferMessage::ErrorReq) => {
                let msg = decode_body::<ErrorReq>(&frame.body)
                    .map_or_else(|e| e.to_string(), |r| r.error_msg);
                break Err(Error::RemoteApplication(msg));
            }
            _ => {
                tracing::debug!(
                    "Ignoring message type {} from {}",
                    frame.message_type,
                    peer
                );
            }
        }
    };

    match outcome {
        Ok(()) => {
            if core.state() == FileTransferState::Canceled {
                send_error(&mut writer, next_id, CANCELED_MESSAGE).await;
            }
        }
        Err(e) => {
            if core.state() == FileTransferState::Canceled {
                send_error(&mut writer, next_id, CANCELED_MESSAGE).await;
            } else if !matches!(e, Error::RemoteApplication(_)) {
                send_error(&mut writer, next_id, &e.to_string()).await;
            }
            core.fail(&e);
        }
    }

    let remaining = shared.active_connections.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 && core.is_started() && !shared.all_files_sent() {
        core.fail(&Error::Transport(format!(
            "all downloader connections closed, last was {}",
            peer_label(Some(peer))
        )));
    }
}

/// Stream one byte range. Returns `false` if the transfer halted midway.
///
/// The downloader only speaks during a range to report an error, so any
/// other frame is dropped.
async fn send_file(
    shared: &SendShared,
    writer: &mut OwnedWriteHalf,
    frames: &mut mpsc::Receiver<Result<Frame>>,
    sender_file: &SenderFile,
    request: &DownloadReq,
    next_id: &mut i64,
) -> Result<bool> {
    let core = &shared.core;
    let halt = core.halt_token();
    let explore_file = &sender_file.explore_file;
    let end = request.end.min(explore_file.size);
    if request.start >= end {
        return Err(Error::InvalidFile(format!(
            "invalid range {}..{} for {}",
            request.start, request.end, explore_file.name
        )));
    }

    let mut file = tokio::fs::File::open(&sender_file.real_file).await?;
    file.seek(SeekFrom::Start(request.start)).await?;

    core.start_file(explore_file);
    let mut position = request.start;
    let mut buf = vec![0u8; shared.buffer_size];
    while position < end {
        if halt.is_cancelled() {
            return Ok(false);
        }
        let want = usize::try_from(end - position)
            .map_or(shared.buffer_size, |left| left.min(shared.buffer_size));
        file.read_exact(&mut buf[..want]).await?;

        let frame = Frame::new(TransferMessage::SendData.code(), *next_id, buf[..want].to_vec());
        *next_id += 1;
        let write = write_frame(writer, &frame);
        tokio::pin!(write);
        loop {
            tokio::select! {
                written = &mut write => {
                    if let Err(e) = written {
                        return Err(peer_error_or(frames, e).await);
                    }
                    break;
                }
                incoming = frames.recv() => interrupt(incoming)?,
            }
        }

        position += want as u64;
        core.progress(explore_file, position);
    }
    core.end_file(explore_file);
    Ok(true)
}

/// A write failed, usually because the downloader reported an error and
/// closed. Prefer its `ErrorReq`, if one arrives within the grace period,
/// over the local I/O error.
async fn peer_error_or(frames: &mut mpsc::Receiver<Result<Frame>>, local: Error) -> Error {
    let deadline = tokio::time::Instant::now() + PEER_ERROR_GRACE;
    loop {
        match tokio::time::timeout_at(deadline, frames.recv()).await {
            Ok(incoming @ Some(Ok(_))) => {
                if let Err(remote @ Error::RemoteApplication(_)) = interrupt(incoming) {
                    return remote;
                }
            }
            _ => return local,
        }
    }
}

/// Turn a frame received mid-range into the error that ends the range.
fn interrupt(incoming: Option<Result<Frame>>) -> Result<()> {
    match incoming {
        Some(Ok(frame)) if frame.message_type == TransferMessage::ErrorReq.code() => {
            let msg = decode_body::<ErrorReq>(&frame.body)
                .map_or_else(|e| e.to_string(), |r| r.error_msg);
            Err(Error::RemoteApplication(msg))
        }
        Some(Ok(frame)) => {
            tracing::debug!(
                "Ignoring message type {} during a range",
                frame.message_type
            );
            Ok(())
        }
        Some(Err(e)) => Err(e),
        None => Err(Error::Transport("downloader disconnected".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_frame(msg: &str) -> Frame {
        Frame::json(
            TransferMessage::ErrorReq.code(),
            4,
            &ErrorReq {
                error_msg: msg.to_string(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_failed_write_prefers_queued_peer_error() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Ok(Frame::new(TransferMessage::FinishedReq.code(), 3, Vec::new())))
            .await
            .unwrap();
        tx.send(Ok(error_frame("Canceled"))).await.unwrap();

        let local = Error::Io("Broken pipe".to_string());
        let e = peer_error_or(&mut rx, local).await;
        assert!(matches!(e, Error::RemoteApplication(msg) if msg == "Canceled"));
    }

    #[tokio::test]
    async fn test_failed_write_waits_for_late_peer_error() {
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(Ok(error_frame("disk full"))).await;
        });

        let e = peer_error_or(&mut rx, Error::Io("Broken pipe".to_string())).await;
        assert!(matches!(e, Error::RemoteApplication(msg) if msg == "disk full"));
    }

    #[tokio::test]
    async fn test_failed_write_without_peer_error_keeps_local_error() {
        let (tx, mut rx) = mpsc::channel::<Result<Frame>>(4);
        drop(tx);
        let e = peer_error_or(&mut rx, Error::Io("Broken pipe".to_string())).await;
        assert!(matches!(e, Error::Io(_)));
    }

    #[test]
    fn test_interrupt_ignores_other_frames() {
        let finished = Frame::new(TransferMessage::FinishedReq.code(), 1, Vec::new());
        assert!(interrupt(Some(Ok(finished))).is_ok());
        assert!(matches!(interrupt(None), Err(Error::Transport(_))));
    }
}
