//! FileExplore control session.
//!
//! One TCP connection per pair of devices, carrying small JSON requests in
//! both directions once the handshake is done:
//!
//! ```text
//! Client                                Server
//!   │── connect ─────────────────────────>│  Requesting → Connected
//!   │── HandshakeReq{version, sep} ──────>│  Connected → Active
//!   │<─────────────── HandshakeResp{sep} ─│
//!   │   Connected → Active                │
//!   │── HeartbeatReq (every interval) ───>│
//!   │<──── ScanDir / SendFiles / ... ────>│  either direction
//! ```
//!
//! The server accepts exactly one peer; later connections are closed on
//! arrival. Either side tears the session down when the peer stays silent
//! for `heartbeat_interval × idle_multiplier`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::MAIN_SEPARATOR_STR;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::{ConnectionObserver, ConnectionState, ConnectionTask};
use crate::error::{Error, Result};
use crate::observer::{lock, Observers};
use crate::protocol::messages::{
    DownloadFilesReq, DownloadFilesResp, ExploreMessage, FileExploreFile, HandshakeReq,
    HandshakeResp, ScanDirReq, ScanDirResp, SendFilesReq, SendFilesResp, SendMsgReq,
};
use crate::rpc::{typed_handler, RequestContext, RpcConnection};
use crate::PROTOCOL_VERSION;

/// What the client learned from the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Path separator used in the peer's file paths
    pub remote_file_separator: String,
}

/// Lifecycle of a FileExplore session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileExploreState {
    /// No session
    NoConnection,
    /// Binding or connecting
    Requesting,
    /// TCP connected, handshake pending
    Connected,
    /// Handshake done
    Active(Handshake),
}

impl fmt::Display for FileExploreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConnection => write!(f, "NoConnection"),
            Self::Requesting => write!(f, "Requesting"),
            Self::Connected => write!(f, "Connected"),
            Self::Active(handshake) => {
                write!(f, "Active(separator {:?})", handshake.remote_file_separator)
            }
        }
    }
}

/// Receives session events.
pub trait FileExploreObserver: Send + Sync {
    /// Called on every state change, and once with the current state when
    /// the observer is added.
    fn on_new_state(&self, _state: &FileExploreState) {}

    /// The peer sent a chat message. Retransmissions are not repeated.
    fn on_new_msg(&self, _msg: &SendMsgReq) {}
}

/// Answers one kind of peer request. Returning `None` declines; the peer
/// then times out.
///
/// Closures `Fn(bool, Req) -> Option<Resp>` implement this trait, where the
/// flag is `false` for a retransmission of a request already seen.
pub trait FileExploreRequestHandler<Req, Resp>: Send + Sync {
    /// Handle a request.
    fn on_request(&self, is_new: bool, request: Req) -> Option<Resp>;
}

impl<Req, Resp, F> FileExploreRequestHandler<Req, Resp> for F
where
    F: Fn(bool, Req) -> Option<Resp> + Send + Sync,
{
    fn on_request(&self, is_new: bool, request: Req) -> Option<Resp> {
        self(is_new, request)
    }
}

/// The application side of a session.
#[derive(Clone)]
pub struct ExploreHandlers {
    /// Lists a local directory for the peer
    pub scan_dir: Arc<dyn FileExploreRequestHandler<ScanDirReq, ScanDirResp>>,
    /// The peer wants to send us files; answer with our chunk size
    pub send_files: Arc<dyn FileExploreRequestHandler<SendFilesReq, SendFilesResp>>,
    /// The peer wants our files; answer with our connection count
    pub download_files: Arc<dyn FileExploreRequestHandler<DownloadFilesReq, DownloadFilesResp>>,
}

impl fmt::Debug for ExploreHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExploreHandlers").finish_non_exhaustive()
    }
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct ExploreOptions {
    /// TCP port the server binds and the client dials
    pub port: u16,
    /// Client heartbeat period
    pub heartbeat_interval: Duration,
    /// Silence limit in heartbeat periods
    pub idle_multiplier: u32,
    /// Wait before the single retransmission of a request
    pub retry_timeout: Duration,
    /// Protocol version sent in and required from handshakes
    pub version: i32,
}

impl ExploreOptions {
    /// How long a silent peer is tolerated.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval * self.idle_multiplier
    }
}

impl Default for ExploreOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ExploreOptions {
    fn from(config: &Config) -> Self {
        Self {
            port: config.network.file_explore_port,
            heartbeat_interval: config.session.heartbeat_interval,
            idle_multiplier: config.session.idle_multiplier,
            retry_timeout: config.session.retry_timeout,
            version: PROTOCOL_VERSION,
        }
    }
}

struct ExploreInner {
    options: ExploreOptions,
    handlers: ExploreHandlers,
    state: watch::Sender<FileExploreState>,
    observers: Observers<dyn FileExploreObserver>,
    explore_task: Mutex<Option<RpcConnection>>,
    server_task: Mutex<Option<ConnectionTask>>,
    heartbeat: Mutex<Option<CancellationToken>>,
}

impl ExploreInner {
    fn state(&self) -> FileExploreState {
        self.state.borrow().clone()
    }

    fn is_active(&self) -> bool {
        matches!(*self.state.borrow(), FileExploreState::Active(_))
    }

    fn notify_state(&self, state: &FileExploreState) {
        tracing::debug!("FileExplore state: {}", state);
        for observer in self.observers.snapshot() {
            observer.on_new_state(state);
        }
    }

    /// Move `from` → `to` atomically; `false` if the state was elsewhere.
    fn advance(&self, from: &FileExploreState, to: FileExploreState) -> bool {
        let moved = self.state.send_if_modified(|current| {
            if current == from {
                *current = to.clone();
                true
            } else {
                false
            }
        });
        if moved {
            self.notify_state(&to);
        }
        moved
    }

    fn begin(&self) -> Result<()> {
        if self.advance(&FileExploreState::NoConnection, FileExploreState::Requesting) {
            Ok(())
        } else {
            Err(Error::State(format!(
                "FileExplore cannot open a session in state {}",
                self.state()
            )))
        }
    }

    fn stop_tasks(&self) {
        if let Some(token) = lock(&self.heartbeat).take() {
            token.cancel();
        }
        let explore = lock(&self.explore_task).take();
        if let Some(explore) = explore {
            explore.stop();
        }
        let server = lock(&self.server_task).take();
        if let Some(server) = server {
            server.stop();
        }
    }

    /// Abort an open attempt. Observers stay registered.
    fn abort_open(&self) {
        self.stop_tasks();
        let changed = self.state.send_if_modified(|current| {
            if *current == FileExploreState::NoConnection {
                false
            } else {
                *current = FileExploreState::NoConnection;
                true
            }
        });
        if changed {
            self.notify_state(&FileExploreState::NoConnection);
        }
    }

    fn close(&self) {
        self.abort_open();
        self.observers.clear();
    }

    /// The session connection, if the state allows a request.
    fn connection_for(&self, allow_connected: bool) -> Result<RpcConnection> {
        let state = self.state();
        let allowed = match state {
            FileExploreState::Active(_) => true,
            FileExploreState::Connected => allow_connected,
            _ => false,
        };
        if !allowed {
            return Err(Error::State(format!(
                "FileExplore request not allowed in state {state}"
            )));
        }
        lock(&self.explore_task)
            .clone()
            .ok_or_else(|| Error::State("FileExplore has no connection".to_string()))
    }
}

/// Closes the session when any of its tasks closes or fails.
struct CloseOnTeardown {
    inner: Weak<ExploreInner>,
}

impl ConnectionObserver for CloseOnTeardown {
    fn on_new_state(&self, state: &ConnectionState, task: &ConnectionTask) {
        if !state.is_terminal() {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            tracing::info!(
                "FileExplore connection {} ended ({}), closing session",
                task.id(),
                state
            );
            inner.close();
        }
    }
}

/// Accepts the first peer on the listener and rejects the rest.
struct FirstChildAcceptor {
    inner: Weak<ExploreInner>,
    accepted: AtomicBool,
}

impl ConnectionObserver for FirstChildAcceptor {
    fn on_new_child(&self, child: &ConnectionTask, _server: &ConnectionTask) {
        let Some(inner) = self.inner.upgrade() else {
            child.stop();
            return;
        };
        if self.accepted.swap(true, Ordering::SeqCst) {
            tracing::info!("Rejecting extra FileExplore connection {}", child.id());
            child.stop();
            return;
        }

        let connection = RpcConnection::new(child.clone());
        register_server_handlers(&inner, &connection);
        let previous = lock(&inner.explore_task).replace(connection.clone());
        if let Some(previous) = previous {
            previous.stop();
        }
        connection.add_observer(Arc::new(CloseOnTeardown {
            inner: Arc::downgrade(&inner),
        }));
        if !inner.advance(&FileExploreState::Requesting, FileExploreState::Connected) {
            child.stop();
        }
    }
}

fn register_common_handlers(inner: &Arc<ExploreInner>, connection: &RpcConnection) {
    let weak = Arc::downgrade(inner);
    connection.register_handler(typed_handler(
        ExploreMessage::ScanDirReq.code(),
        ExploreMessage::ScanDirResp.code(),
        move |ctx: &RequestContext, request: ScanDirReq| {
            let inner = weak.upgrade().filter(|i| i.is_active())?;
            inner.handlers.scan_dir.on_request(ctx.is_new, request)
        },
    ));

    let weak = Arc::downgrade(inner);
    connection.register_handler(typed_handler(
        ExploreMessage::SendFilesReq.code(),
        ExploreMessage::SendFilesResp.code(),
        move |ctx: &RequestContext, request: SendFilesReq| {
            let inner = weak.upgrade().filter(|i| i.is_active())?;
            inner.handlers.send_files.on_request(ctx.is_new, request)
        },
    ));

    let weak = Arc::downgrade(inner);
    connection.register_handler(typed_handler(
        ExploreMessage::DownloadFilesReq.code(),
        ExploreMessage::DownloadFilesResp.code(),
        move |ctx: &RequestContext, request: DownloadFilesReq| {
            let inner = weak.upgrade().filter(|i| i.is_active())?;
            inner.handlers.download_files.on_request(ctx.is_new, request)
        },
    ));

    let weak = Arc::downgrade(inner);
    connection.register_handler(typed_handler(
        ExploreMessage::SendMsgReq.code(),
        ExploreMessage::SendMsgResp.code(),
        move |ctx: &RequestContext, request: SendMsgReq| {
            let inner = weak.upgrade().filter(|i| i.is_active())?;
            if ctx.is_new {
                for observer in inner.observers.snapshot() {
                    observer.on_new_msg(&request);
                }
            }
            Some(())
        },
    ));
}

fn register_server_handlers(inner: &Arc<ExploreInner>, connection: &RpcConnection) {
    let weak = Arc::downgrade(inner);
    connection.register_handler(typed_handler(
        ExploreMessage::HandshakeReq.code(),
        ExploreMessage::HandshakeResp.code(),
        move |ctx: &RequestContext, request: HandshakeReq| {
            let inner = weak.upgrade()?;
            if request.version != inner.options.version {
                tracing::warn!(
                    "Handshake from {:?} with version {} (ours {}), ignoring",
                    ctx.remote_addr,
                    request.version,
                    inner.options.version
                );
                return None;
            }
            if ctx.is_new {
                inner.advance(
                    &FileExploreState::Connected,
                    FileExploreState::Active(Handshake {
                        remote_file_separator: request.file_separator,
                    }),
                );
            }
            Some(HandshakeResp {
                file_separator: MAIN_SEPARATOR_STR.to_string(),
            })
        },
    ));

    let weak = Arc::downgrade(inner);
    connection.register_handler(typed_handler(
        ExploreMessage::HeartbeatReq.code(),
        ExploreMessage::HeartbeatResp.code(),
        move |ctx: &RequestContext, (): ()| {
            let inner = weak.upgrade()?;
            match inner.state() {
                FileExploreState::Connected | FileExploreState::Active(_) => {
                    tracing::trace!("Heartbeat from {:?}", ctx.remote_addr);
                    Some(())
                }
                _ => None,
            }
        },
    ));

    register_common_handlers(inner, connection);
}

async fn run_heartbeat(
    inner: Weak<ExploreInner>,
    token: CancellationToken,
    connection: RpcConnection,
) {
    let Some(period) = inner.upgrade().map(|i| i.options.heartbeat_interval) else {
        return;
    };
    let connection_closed = connection.task().cancel_token().clone();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = connection_closed.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let connection = match inner.connection_for(true) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::debug!("Heartbeat stopped: {}", e);
                break;
            }
        };
        let retry = inner.options.retry_timeout;
        drop(inner);
        match connection
            .request::<_, ()>(
                ExploreMessage::HeartbeatReq.code(),
                ExploreMessage::HeartbeatResp.code(),
                &(),
                None,
                retry,
            )
            .await
        {
            Ok(()) => tracing::trace!("Heartbeat acknowledged"),
            Err(e) => tracing::warn!("Heartbeat failed: {}", e),
        }
    }
}

/// A FileExplore session, in either the server or the client role.
///
/// ```rust,ignore
/// let explore = FileExplore::new(handlers, ExploreOptions::default());
/// explore.connect(peer_ip).await?;
/// explore.request_handshake().await?;
/// let listing = explore.request_scan_dir("/").await?;
/// ```
pub struct FileExplore {
    inner: Arc<ExploreInner>,
}

impl FileExplore {
    /// Create a closed session.
    #[must_use]
    pub fn new(handlers: ExploreHandlers, options: ExploreOptions) -> Self {
        let (state, _) = watch::channel(FileExploreState::NoConnection);
        Self {
            inner: Arc::new(ExploreInner {
                options,
                handlers,
                state,
                observers: Observers::new(),
                explore_task: Mutex::new(None),
                server_task: Mutex::new(None),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> FileExploreState {
        self.inner.state()
    }

    /// Session options.
    pub fn options(&self) -> &ExploreOptions {
        &self.inner.options
    }

    /// Address of the connected peer.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.explore_task)
            .as_ref()
            .and_then(|c| c.task().remote_addr())
    }

    /// Local address of the session connection, or of the listener while
    /// waiting for a peer.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let explore = lock(&self.inner.explore_task)
            .as_ref()
            .and_then(|c| c.task().local_addr());
        explore.or_else(|| {
            lock(&self.inner.server_task)
                .as_ref()
                .and_then(ConnectionTask::local_addr)
        })
    }

    /// Server role: listen on `address` and resolve once the first peer
    /// connects (state `Connected`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] unless `NoConnection`, or
    /// [`Error::Transport`] if the port cannot be bound or the session
    /// closes before a peer arrives.
    pub async fn bind(&self, address: IpAddr) -> Result<()> {
        let inner = &self.inner;
        inner.begin()?;

        let bind = SocketAddr::new(address, inner.options.port);
        let server = ConnectionTask::tcp_server(bind, Some(inner.options.idle_timeout()));
        server.add_observer(Arc::new(FirstChildAcceptor {
            inner: Arc::downgrade(inner),
            accepted: AtomicBool::new(false),
        }));
        let previous = lock(&inner.server_task).replace(server.clone());
        if let Some(previous) = previous {
            previous.stop();
        }

        if let Err(e) = server.start().await {
            tracing::warn!("FileExplore failed to bind {}: {}", bind, e);
            inner.abort_open();
            return Err(e);
        }
        server.add_observer(Arc::new(CloseOnTeardown {
            inner: Arc::downgrade(inner),
        }));
        tracing::info!("FileExplore waiting for a peer on {:?}", server.local_addr());

        let mut rx = inner.state.subscribe();
        let settled = rx
            .wait_for(|s| *s != FileExploreState::Requesting)
            .await
            .map(|s| s.clone())
            .map_err(|_| Error::Transport("FileExplore dropped".to_string()))?;
        match settled {
            FileExploreState::Connected | FileExploreState::Active(_) => Ok(()),
            other => Err(Error::Transport(format!(
                "FileExplore closed before a peer connected ({other})"
            ))),
        }
    }

    /// Client role: connect to the server at `address` (state `Connected`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] unless `NoConnection`, or
    /// [`Error::Transport`] if the connection fails.
    pub async fn connect(&self, address: IpAddr) -> Result<()> {
        let inner = &self.inner;
        inner.begin()?;

        let remote = SocketAddr::new(address, inner.options.port);
        let connection = RpcConnection::new(ConnectionTask::tcp_client(
            remote,
            Some(inner.options.idle_timeout()),
        ));
        register_common_handlers(inner, &connection);
        let previous = lock(&inner.explore_task).replace(connection.clone());
        if let Some(previous) = previous {
            previous.stop();
        }

        if let Err(e) = connection.start().await {
            tracing::warn!("FileExplore failed to connect to {}: {}", remote, e);
            inner.abort_open();
            return Err(e);
        }
        if !inner.advance(&FileExploreState::Requesting, FileExploreState::Connected) {
            let state = inner.state();
            inner.abort_open();
            return Err(Error::State(format!(
                "FileExplore connected in unexpected state {state}"
            )));
        }
        connection.add_observer(Arc::new(CloseOnTeardown {
            inner: Arc::downgrade(inner),
        }));
        tracing::info!("FileExplore connected to {}", remote);
        Ok(())
    }

    /// Client role: exchange protocol version and path separator. On
    /// success the session is `Active` and the heartbeat starts.
    ///
    /// A server speaking another protocol version never answers, so this
    /// fails with [`Error::Timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] unless `Connected` or `Active`, or the
    /// request failure.
    pub async fn request_handshake(&self) -> Result<Handshake> {
        let inner = &self.inner;
        let connection = inner.connection_for(true)?;
        let request = HandshakeReq {
            version: inner.options.version,
            file_separator: MAIN_SEPARATOR_STR.to_string(),
        };
        let response: HandshakeResp = connection
            .request(
                ExploreMessage::HandshakeReq.code(),
                ExploreMessage::HandshakeResp.code(),
                &request,
                None,
                inner.options.retry_timeout,
            )
            .await?;

        let handshake = Handshake {
            remote_file_separator: response.file_separator,
        };
        if !inner.advance(
            &FileExploreState::Connected,
            FileExploreState::Active(handshake.clone()),
        ) {
            return Err(Error::State(format!(
                "handshake answered in state {}",
                inner.state()
            )));
        }

        let token = CancellationToken::new();
        let previous = lock(&inner.heartbeat).replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        tokio::spawn(run_heartbeat(Arc::downgrade(inner), token, connection));
        Ok(handshake)
    }

    /// List `path` on the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] unless `Active`, or the request failure.
    pub async fn request_scan_dir(&self, path: &str) -> Result<ScanDirResp> {
        let request = ScanDirReq {
            request_path: path.to_string(),
        };
        self.request(ExploreMessage::ScanDirReq, ExploreMessage::ScanDirResp, &request)
            .await
    }

    /// Offer `files` to the peer. The reply carries the chunk size the
    /// peer's downloader will accept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] unless `Active`, or the request failure.
    pub async fn request_send_files(
        &self,
        files: Vec<FileExploreFile>,
        max_connection: u32,
    ) -> Result<SendFilesResp> {
        let request = SendFilesReq {
            send_files: files,
            max_connection,
        };
        self.request(ExploreMessage::SendFilesReq, ExploreMessage::SendFilesResp, &request)
            .await
    }

    /// Ask the peer to serve `files`. The reply carries the number of
    /// connections the peer's sender will accept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] unless `Active`, or the request failure.
    pub async fn request_download_files(
        &self,
        files: Vec<FileExploreFile>,
        buffer_size: u32,
    ) -> Result<DownloadFilesResp> {
        let request = DownloadFilesReq {
            download_files: files,
            buffer_size,
        };
        self.request(
            ExploreMessage::DownloadFilesReq,
            ExploreMessage::DownloadFilesResp,
            &request,
        )
        .await
    }

    /// Send a chat message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] unless `Active`, or the request failure.
    pub async fn send_msg(&self, msg: &str) -> Result<()> {
        let request = SendMsgReq {
            send_time: chrono::Utc::now().timestamp_millis(),
            msg: msg.to_string(),
        };
        self.request(ExploreMessage::SendMsgReq, ExploreMessage::SendMsgResp, &request)
            .await
    }

    async fn request<Req, Resp>(
        &self,
        request_type: ExploreMessage,
        response_type: ExploreMessage,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let connection = self.inner.connection_for(false)?;
        connection
            .request(
                request_type.code(),
                response_type.code(),
                request,
                None,
                self.inner.options.retry_timeout,
            )
            .await
    }

    /// Tear the session down: stop the connection, the listener and the
    /// heartbeat, go to `NoConnection` and drop every observer.
    pub fn close_connection_if_active(&self) {
        self.inner.close();
    }

    /// Register an observer. It immediately receives the current state.
    pub fn add_observer(&self, observer: Arc<dyn FileExploreObserver>) {
        self.inner.observers.add(Arc::clone(&observer));
        observer.on_new_state(&self.inner.state());
    }

    /// Unregister an observer.
    pub fn remove_observer(&self, observer: &Arc<dyn FileExploreObserver>) {
        self.inner.observers.remove(observer);
    }

    /// Resolve once the session is back to `NoConnection`.
    pub async fn wait_close(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx
            .wait_for(|s| *s == FileExploreState::NoConnection)
            .await;
    }

    /// Resolve once the session is `Active`, or fail if it closes first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the session closes before the
    /// handshake completes.
    pub async fn wait_active(&self) -> Result<Handshake> {
        let mut rx = self.inner.state.subscribe();
        let settled = rx
            .wait_for(|s| matches!(s, FileExploreState::Active(_) | FileExploreState::NoConnection))
            .await
            .map(|s| s.clone())
            .map_err(|_| Error::Transport("FileExplore dropped".to_string()))?;
        match settled {
            FileExploreState::Active(handshake) => Ok(handshake),
            other => Err(Error::Transport(format!(
                "FileExplore closed before the handshake ({other})"
            ))),
        }
    }
}

impl Drop for FileExplore {
    fn drop(&mut self) {
        self.inner.stop_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    fn handlers() -> ExploreHandlers {
        ExploreHandlers {
            scan_dir: Arc::new(|_is_new: bool, request: ScanDirReq| {
                Some(ScanDirResp {
                    path: request.request_path,
                    ..ScanDirResp::default()
                })
            }),
            send_files: Arc::new(|_is_new: bool, _request: SendFilesReq| {
                Some(SendFilesResp { buffer_size: 1024 })
            }),
            download_files: Arc::new(|_is_new: bool, _request: DownloadFilesReq| {
                Some(DownloadFilesResp { max_connection: 2 })
            }),
        }
    }

    #[test]
    fn test_closure_handler() {
        let handler: Arc<dyn FileExploreRequestHandler<ScanDirReq, ScanDirResp>> =
            handlers().scan_dir;
        let resp = handler
            .on_request(
                true,
                ScanDirReq {
                    request_path: "/tmp".to_string(),
                },
            )
            .unwrap();
        assert_eq!(resp.path, "/tmp");
    }

    #[test]
    fn test_idle_timeout() {
        let options = ExploreOptions {
            heartbeat_interval: Duration::from_millis(200),
            idle_multiplier: 3,
            ..ExploreOptions::default()
        };
        assert_eq!(options.idle_timeout(), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_requests_need_a_session() {
        let explore = FileExplore::new(handlers(), ExploreOptions::default());
        assert!(matches!(
            explore.request_scan_dir("/").await,
            Err(Error::State(_))
        ));
        assert!(matches!(
            explore.request_handshake().await,
            Err(Error::State(_))
        ));
        assert!(matches!(explore.send_msg("hi").await, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn test_connect_refused_returns_to_no_connection() {
        let options = ExploreOptions {
            port: 1,
            ..ExploreOptions::default()
        };
        let explore = FileExplore::new(handlers(), options);
        assert!(explore.connect(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.is_err());
        assert_eq!(explore.state(), FileExploreState::NoConnection);
        explore.wait_close().await;
    }

    #[tokio::test]
    async fn test_close_drops_observers() {
        #[derive(Default)]
        struct Count(Mutex<usize>);
        impl FileExploreObserver for Count {
            fn on_new_state(&self, _state: &FileExploreState) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let explore = FileExplore::new(handlers(), ExploreOptions::default());
        let count = Arc::new(Count::default());
        explore.add_observer(count.clone());
        explore.close_connection_if_active();
        explore.close_connection_if_active();
        assert_eq!(*count.0.lock().unwrap(), 1);
    }
}
