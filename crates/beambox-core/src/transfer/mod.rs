//! File transfer engine for Beambox.
//!
//! A transfer runs on its own data connections, independent of the
//! FileExplore session that negotiated it:
//!
//! - [`FileSender`] owns the local files. It listens on the transfer port
//!   and serves up to `max_connection` downloader connections.
//! - [`FileDownloader`] dials `max_connection` connections and pulls files
//!   from a shared largest-first queue, one file per connection at a time.
//! - [`SpeedCalculator`] turns progress callbacks into a smoothed rate.
//!
//! ## Data Connection Protocol
//!
//! ```text
//! Downloader                         Sender
//!     │── DownloadReq{file,start,end} ──>│
//!     │<──────── SendData (chunk) ───────│  repeated until end
//!     │── DownloadReq ... ──────────────>│  next file
//!     │── FinishedReq ──────────────────>│  queue empty
//! ```
//!
//! Either side may send `ErrorReq{errorMsg}` at any point; the peer then
//! ends in `RemoteError`.

mod downloader;
mod sender;
mod speed;

pub use downloader::FileDownloader;
pub use sender::FileSender;
pub use speed::{format_speed, SpeedCalculator, SpeedObserver, SPEED_SAMPLE_INTERVAL, SPEED_WINDOW};

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::observer::Observers;
use crate::protocol::messages::{ErrorReq, FileExploreFile, TransferMessage};
use crate::protocol::{write_frame, Frame};

/// Error message sent to the peer on local cancellation.
pub const CANCELED_MESSAGE: &str = "Canceled";

/// How long a side that reported an error keeps its socket readable, and
/// how long the other side waits for that report after a failed write.
const PEER_ERROR_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of one transfer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTransferState {
    /// Not started
    NotExecute,
    /// Running
    Started,
    /// Cancelled locally
    Canceled,
    /// Every file arrived at full size
    Finished,
    /// Local failure
    Error(String),
    /// The peer reported a failure
    RemoteError(String),
}

impl FileTransferState {
    /// Whether the run is over.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Finished | Self::Error(_) | Self::RemoteError(_)
        )
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::NotExecute, Self::Started | Self::Error(_)) => true,
            (Self::Started, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for FileTransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotExecute => write!(f, "NotExecute"),
            Self::Started => write!(f, "Started"),
            Self::Canceled => write!(f, "Canceled"),
            Self::Finished => write!(f, "Finished"),
            Self::Error(msg) => write!(f, "Error({msg})"),
            Self::RemoteError(msg) => write!(f, "RemoteError({msg})"),
        }
    }
}

/// Receives transfer events. Per-file events are only delivered while the
/// transfer is `Started`.
pub trait FileTransferObserver: Send + Sync {
    /// Called on every state transition, and once with the current state
    /// when the observer is added.
    fn on_new_state(&self, _state: &FileTransferState) {}

    /// A file started transferring.
    fn on_start_file(&self, _file: &FileExploreFile) {}

    /// Bytes of `file` transferred so far.
    fn on_progress_update(&self, _file: &FileExploreFile, _progress: u64) {}

    /// A file reached its full size.
    fn on_end_file(&self, _file: &FileExploreFile) {}
}

/// A local file bound to the descriptor the peer sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderFile {
    /// Path on this device
    pub real_file: PathBuf,
    /// Descriptor announced to the peer
    pub explore_file: FileExploreFile,
}

impl SenderFile {
    /// Describe a local file.
    ///
    /// # Errors
    ///
    /// See [`crate::file::explore_file`].
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let real_file = path.into();
        let explore_file = crate::file::explore_file(&real_file)?;
        Ok(Self {
            real_file,
            explore_file,
        })
    }
}

/// Transfer settings shared by sender and downloader.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Data port the sender listens on
    pub port: u16,
    /// Parallel data connections
    pub max_connection: usize,
    /// Chunk size in bytes
    pub buffer_size: usize,
    /// Where the downloader writes files
    pub download_dir: PathBuf,
    /// How long the sender waits for the first connection, and how long
    /// the downloader keeps retrying to connect
    pub accept_timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for TransferOptions {
    fn from(config: &Config) -> Self {
        Self {
            port: config.network.file_transfer_port,
            max_connection: config.transfer.max_connection,
            buffer_size: config.transfer.buffer_size,
            download_dir: config.general.download_dir.clone(),
            accept_timeout: config.transfer.accept_timeout,
        }
    }
}

/// State, observers and halt signal shared by all connections of one run.
pub(crate) struct TransferCore {
    label: &'static str,
    state: watch::Sender<FileTransferState>,
    observers: Observers<dyn FileTransferObserver>,
    halt: CancellationToken,
}

impl TransferCore {
    pub(crate) fn new(label: &'static str) -> Arc<Self> {
        let (state, _) = watch::channel(FileTransferState::NotExecute);
        Arc::new(Self {
            label,
            state,
            observers: Observers::new(),
            halt: CancellationToken::new(),
        })
    }

    pub(crate) fn state(&self) -> FileTransferState {
        self.state.borrow().clone()
    }

    pub(crate) fn is_started(&self) -> bool {
        *self.state.borrow() == FileTransferState::Started
    }

    pub(crate) fn halt_token(&self) -> &CancellationToken {
        &self.halt
    }

    pub(crate) fn transition(&self, next: FileTransferState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                *current = next.clone();
                true
            } else {
                false
            }
        });
        if changed {
            if matches!(
                next,
                FileTransferState::Error(_) | FileTransferState::RemoteError(_)
            ) {
                tracing::warn!("{} transfer failed: {}", self.label, next);
            } else {
                tracing::info!("{} transfer state: {}", self.label, next);
            }
            for observer in self.observers.snapshot() {
                observer.on_new_state(&next);
            }
            if next.is_terminal() {
                self.halt.cancel();
            }
        }
        changed
    }

    pub(crate) fn fail(&self, error: &Error) {
        let next = match error {
            Error::RemoteApplication(msg) => FileTransferState::RemoteError(msg.clone()),
            other => FileTransferState::Error(other.to_string()),
        };
        self.transition(next);
    }

    pub(crate) fn cancel(&self) -> bool {
        self.transition(FileTransferState::Canceled)
    }

    pub(crate) fn add_observer(&self, observer: Arc<dyn FileTransferObserver>) {
        self.observers.add(Arc::clone(&observer));
        observer.on_new_state(&self.state());
    }

    pub(crate) fn remove_observer(&self, observer: &Arc<dyn FileTransferObserver>) {
        self.observers.remove(observer);
    }

    pub(crate) async fn wait_terminal(&self) -> FileTransferState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(FileTransferState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        settled
    }

    pub(crate) fn start_file(&self, file: &FileExploreFile) {
        if self.is_started() {
            for observer in self.observers.snapshot() {
                observer.on_start_file(file);
            }
        }
    }

    pub(crate) fn progress(&self, file: &FileExploreFile, progress: u64) {
        if self.is_started() {
            for observer in self.observers.snapshot() {
                observer.on_progress_update(file, progress);
            }
        }
    }

    pub(crate) fn end_file(&self, file: &FileExploreFile) {
        if self.is_started() {
            for observer in self.observers.snapshot() {
                observer.on_end_file(file);
            }
        }
    }
}

/// Enable TCP keep-alive on a data connection.
///
/// - Start probing after 10 seconds of idle time
/// - Send probes every 5 seconds
fn configure_tcp_keepalive(stream: &TcpStream) {
    let socket_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    if let Err(e) = socket_ref.set_tcp_keepalive(&keepalive) {
        tracing::debug!("Failed to enable TCP keep-alive: {}", e);
    }
    let _ = stream.set_nodelay(true);
}

/// Best-effort `ErrorReq` to the peer.
async fn send_error<W>(writer: &mut W, message_id: i64, msg: &str)
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    let frame = Frame::json(
        TransferMessage::ErrorReq.code(),
        message_id,
        &ErrorReq {
            error_msg: msg.to_string(),
        },
    );
    match frame {
        Ok(frame) => {
            if let Err(e) = write_frame(writer, &frame).await {
                tracing::debug!("Failed to send ErrorReq: {}", e);
            }
        }
        Err(e) => tracing::debug!("Failed to encode ErrorReq: {}", e),
    }
}

/// Close the write half after an `ErrorReq` and keep reading until the
/// peer hangs up, so unread data does not turn the close into a reset
/// that discards the report.
async fn linger_after_error<R, W>(reader: &mut R, writer: &mut W)
where
    R: tokio::io::AsyncReadExt + Unpin,
    W: tokio::io::AsyncWriteExt + Unpin,
{
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Failed to shut down data connection: {}", e);
        return;
    }
    let mut sink = vec![0u8; 16 * 1024];
    let drain = async {
        while let Ok(n) = reader.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(PEER_ERROR_GRACE, drain).await;
}

/// Remote address string for logs.
fn peer_label(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "unknown peer".to_string(), |a| a.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<FileTransferState>>,
        progress: Mutex<Vec<u64>>,
    }

    impl FileTransferObserver for Recorder {
        fn on_new_state(&self, state: &FileTransferState) {
            self.states.lock().unwrap().push(state.clone());
        }

        fn on_progress_update(&self, _file: &FileExploreFile, progress: u64) {
            self.progress.lock().unwrap().push(progress);
        }
    }

    fn file() -> FileExploreFile {
        FileExploreFile {
            name: "a".to_string(),
            path: "/a".to_string(),
            size: 3,
            last_modify: 0,
        }
    }

    #[test]
    fn test_terminal_states_are_exclusive() {
        let core = TransferCore::new("test");
        let recorder = Arc::new(Recorder::default());
        core.add_observer(recorder.clone());

        assert!(!core.cancel(), "cancel needs Started");
        assert!(core.transition(FileTransferState::Started));
        assert!(core.cancel());
        assert!(!core.transition(FileTransferState::Finished));
        assert!(!core.cancel());
        assert!(core.halt_token().is_cancelled());

        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![
                FileTransferState::NotExecute,
                FileTransferState::Started,
                FileTransferState::Canceled
            ]
        );
    }

    #[test]
    fn test_progress_requires_started() {
        let core = TransferCore::new("test");
        let recorder = Arc::new(Recorder::default());
        core.add_observer(recorder.clone());

        core.progress(&file(), 1);
        core.transition(FileTransferState::Started);
        core.progress(&file(), 2);
        core.transition(FileTransferState::Finished);
        core.progress(&file(), 3);

        assert_eq!(*recorder.progress.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_remote_error_mapping() {
        let core = TransferCore::new("test");
        core.transition(FileTransferState::Started);
        core.fail(&Error::RemoteApplication("disk full".to_string()));
        assert_eq!(
            core.state(),
            FileTransferState::RemoteError("disk full".to_string())
        );
    }

    #[test]
    fn test_validation_error_from_not_execute() {
        let core = TransferCore::new("test");
        core.fail(&Error::InvalidFile("empty".to_string()));
        assert!(matches!(core.state(), FileTransferState::Error(_)));
    }
}
