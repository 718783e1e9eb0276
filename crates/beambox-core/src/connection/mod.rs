//! Connection tasks: one socket, one event loop, many observers.
//!
//! A [`ConnectionTask`] owns exactly one TCP or UDP socket. Its event loop
//! runs on a dedicated tokio task, decodes frames with the codec in
//! [`crate::protocol`] and fans out state changes and frames to every
//! registered [`ConnectionObserver`].
//!
//! Four shapes are supported:
//!
//! - TCP server: binds, accepts children, and hands every child (a TCP
//!   connection task of its own) to observers before starting it
//! - TCP client: dials a remote address
//! - UDP bound socket: optionally broadcast-enabled
//! - UDP connected socket: talks to one peer
//!
//! State is monotonic: `Idle -> Starting -> Active -> Closed | Error`.

mod tcp;
mod udp;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::observer::{lock, Observers};
use crate::protocol::Frame;

/// Lifecycle of a connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not started
    Idle,
    /// Socket is being opened
    Starting,
    /// Socket is open and the event loop is running
    Active,
    /// Closed locally, by the peer, or by the idle timeout
    Closed,
    /// Failed with the given cause
    Error(String),
}

impl ConnectionState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error(_))
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Starting => 1,
            Self::Active => 2,
            Self::Closed | Self::Error(_) => 3,
        }
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Starting => write!(f, "Starting"),
            Self::Active => write!(f, "Active"),
            Self::Closed => write!(f, "Closed"),
            Self::Error(cause) => write!(f, "Error({cause})"),
        }
    }
}

/// A decoded frame together with the addresses it travelled between.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    /// The decoded frame
    pub frame: Frame,
    /// Local socket address
    pub local_addr: Option<SocketAddr>,
    /// Sender address
    pub remote_addr: Option<SocketAddr>,
}

/// Receives events from a [`ConnectionTask`].
///
/// Callbacks run on the task's event loop and must return quickly.
pub trait ConnectionObserver: Send + Sync {
    /// Called on every state transition, and once with the current state
    /// when the observer is added.
    fn on_new_state(&self, _state: &ConnectionState, _task: &ConnectionTask) {}

    /// Called for every decoded frame while the task is active.
    fn on_new_frame(&self, _frame: &ReceivedFrame, _task: &ConnectionTask) {}

    /// TCP servers only: a child connection was accepted.
    ///
    /// The child has not been started yet; observers attached here see
    /// every frame it will deliver. Stopping the child rejects it.
    fn on_new_child(&self, _child: &ConnectionTask, _server: &ConnectionTask) {}
}

struct Outbound {
    frame: Frame,
    dest: Option<SocketAddr>,
}

enum TaskKind {
    TcpServer {
        bind: SocketAddr,
        child_idle: Option<Duration>,
    },
    TcpClient {
        remote: SocketAddr,
        idle: Option<Duration>,
    },
    TcpAccepted {
        stream: Mutex<Option<TcpStream>>,
        idle: Option<Duration>,
    },
    UdpBind {
        bind: SocketAddr,
        broadcast: bool,
    },
    UdpConnect {
        remote: SocketAddr,
    },
}

impl TaskKind {
    const fn label(&self) -> &'static str {
        match self {
            Self::TcpServer { .. } => "tcp-server",
            Self::TcpClient { .. } => "tcp-client",
            Self::TcpAccepted { .. } => "tcp-child",
            Self::UdpBind { .. } => "udp-bind",
            Self::UdpConnect { .. } => "udp-connect",
        }
    }
}

struct TaskInner {
    id: u64,
    kind: TaskKind,
    state: watch::Sender<ConnectionState>,
    observers: Observers<dyn ConnectionObserver>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    cancel: CancellationToken,
    addrs: Mutex<(Option<SocketAddr>, Option<SocketAddr>)>,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a connection task. Clones share the same socket and loop.
#[derive(Clone)]
pub struct ConnectionTask {
    inner: Arc<TaskInner>,
}

impl fmt::Debug for ConnectionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTask")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind.label())
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl ConnectionTask {
    fn with_kind(kind: TaskKind) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                state,
                observers: Observers::new(),
                outbound: Mutex::new(None),
                cancel: CancellationToken::new(),
                addrs: Mutex::new((None, None)),
            }),
        }
    }

    /// TCP listener. Accepted children close after `child_idle` without
    /// receiving data.
    #[must_use]
    pub fn tcp_server(bind: SocketAddr, child_idle: Option<Duration>) -> Self {
        Self::with_kind(TaskKind::TcpServer { bind, child_idle })
    }

    /// TCP client dialing `remote`. Closes after `idle` without receiving
    /// data.
    #[must_use]
    pub fn tcp_client(remote: SocketAddr, idle: Option<Duration>) -> Self {
        Self::with_kind(TaskKind::TcpClient { remote, idle })
    }

    /// UDP socket bound to `bind`, able to send to any destination.
    #[must_use]
    pub fn udp_bind(bind: SocketAddr, broadcast: bool) -> Self {
        Self::with_kind(TaskKind::UdpBind { bind, broadcast })
    }

    /// UDP socket connected to `remote`.
    #[must_use]
    pub fn udp_connect(remote: SocketAddr) -> Self {
        Self::with_kind(TaskKind::UdpConnect { remote })
    }

    fn accepted(stream: TcpStream, idle: Option<Duration>) -> Self {
        Self::with_kind(TaskKind::TcpAccepted {
            stream: Mutex::new(Some(stream)),
            idle,
        })
    }

    /// Process-unique id, used in logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Local socket address, once active.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.addrs).0
    }

    /// Peer address for connected sockets, once active.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.addrs).1
    }

    /// Open the socket and run the event loop.
    ///
    /// Resolves once the task is `Active`, or with the failure that
    /// prevented it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] if the task was already started, and
    /// [`Error::Transport`] if the socket could not be opened.
    pub async fn start(&self) -> Result<()> {
        let mut state_rx = self.launch()?;
        let settled = state_rx
            .wait_for(|s| !matches!(s, ConnectionState::Starting))
            .await
            .map(|s| s.clone())
            .map_err(|_| Error::Transport("connection task dropped".to_string()))?;

        match settled {
            ConnectionState::Active => Ok(()),
            ConnectionState::Error(cause) => Err(Error::Transport(cause)),
            other => Err(Error::Transport(format!(
                "connection task ended during start: {other}"
            ))),
        }
    }

    /// Move to `Starting` and spawn the event loop without waiting for it.
    ///
    /// The returned receiver was subscribed before the spawn, so it sees
    /// every later transition.
    fn launch(&self) -> Result<watch::Receiver<ConnectionState>> {
        if !self.transition(ConnectionState::Starting) {
            return Err(Error::State(format!(
                "connection task {} cannot start from {}",
                self.inner.id,
                self.state()
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.outbound) = Some(tx);

        let state_rx = self.inner.state.subscribe();
        let task = self.clone();
        tokio::spawn(async move {
            let outcome = task.run(rx).await;
            lock(&task.inner.outbound).take();
            match outcome {
                Ok(()) => {
                    task.transition(ConnectionState::Closed);
                }
                Err(e) => {
                    tracing::warn!(
                        task = task.inner.id,
                        kind = task.inner.kind.label(),
                        "Connection task failed: {}",
                        e
                    );
                    task.transition(ConnectionState::Error(e.to_string()));
                }
            }
        });
        Ok(state_rx)
    }

    /// Spawn an accepted child's event loop. The accept loop never waits
    /// on a child.
    fn launch_child(&self) {
        if let Err(e) = self.launch() {
            tracing::debug!(task = self.inner.id, "Child connection not started: {}", e);
        }
    }

    async fn run(&self, rx: mpsc::UnboundedReceiver<Outbound>) -> Result<()> {
        match &self.inner.kind {
            TaskKind::TcpServer { bind, child_idle } => {
                tcp::run_server(self, *bind, *child_idle).await
            }
            TaskKind::TcpClient { remote, idle } => {
                let stream = tcp::connect(*remote).await?;
                tcp::run_stream(self, stream, *idle, rx).await
            }
            TaskKind::TcpAccepted { stream, idle } => {
                let stream = lock(stream)
                    .take()
                    .ok_or_else(|| Error::State("accepted stream already used".to_string()))?;
                tcp::run_stream(self, stream, *idle, rx).await
            }
            TaskKind::UdpBind { bind, broadcast } => {
                let socket = udp::bind_socket(*bind, *broadcast)?;
                udp::run_socket(self, socket, None, rx).await
            }
            TaskKind::UdpConnect { remote } => {
                let socket = udp::connect_socket(*remote).await?;
                udp::run_socket(self, socket, Some(*remote), rx).await
            }
        }
    }

    /// Stop the task. Idempotent and safe from any state; after it returns
    /// the loop delivers no further frames.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        lock(&self.inner.outbound).take();
        self.transition(ConnectionState::Closed);
    }

    /// Queue a frame for sending. UDP bound sockets need `dest`; connected
    /// sockets ignore it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] unless the task is active.
    pub fn send(&self, frame: Frame, dest: Option<SocketAddr>) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Active {
            return Err(Error::State(format!(
                "cannot send on connection task {} in state {state}",
                self.inner.id
            )));
        }
        match lock(&self.inner.outbound).as_ref() {
            Some(tx) => tx
                .send(Outbound { frame, dest })
                .map_err(|_| Error::Transport("connection closed".to_string())),
            None => Err(Error::Transport("connection closed".to_string())),
        }
    }

    /// Register an observer. It immediately receives the current state.
    ///
    /// Observers are released once the task reaches a terminal state; an
    /// observer added after that only receives the replay.
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        let state = self.state();
        if !state.is_terminal() {
            self.inner.observers.add(Arc::clone(&observer));
        }
        observer.on_new_state(&state, self);
    }

    /// Unregister an observer.
    pub fn remove_observer(&self, observer: &Arc<dyn ConnectionObserver>) {
        self.inner.observers.remove(observer);
    }

    /// Resolve once the task reaches `Closed` or `Error`.
    pub async fn wait_close(&self) -> ConnectionState {
        let mut rx = self.inner.state.subscribe();
        let settled = match rx.wait_for(ConnectionState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        settled
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    fn set_addrs(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>) {
        *lock(&self.inner.addrs) = (local, remote);
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let changed = self.inner.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                *current = next.clone();
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(
                task = self.inner.id,
                kind = self.inner.kind.label(),
                "Connection state: {}",
                next
            );
            for observer in self.inner.observers.snapshot() {
                observer.on_new_state(&next, self);
            }
            if next.is_terminal() {
                self.inner.observers.clear();
            }
        }
        changed
    }

    fn deliver(
        &self,
        frame: Frame,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) {
        if self.inner.cancel.is_cancelled() || self.state() != ConnectionState::Active {
            return;
        }
        let received = ReceivedFrame {
            frame,
            local_addr,
            remote_addr,
        };
        for observer in self.inner.observers.snapshot() {
            observer.on_new_frame(&received, self);
        }
    }

    fn notify_new_child(&self, child: &Self) {
        for observer in self.inner.observers.snapshot() {
            observer.on_new_child(child, self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Mutex as StdMutex;

    use tokio::sync::mpsc::UnboundedSender;

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[derive(Default)]
    struct Recorder {
        states: StdMutex<Vec<ConnectionState>>,
    }

    impl ConnectionObserver for Recorder {
        fn on_new_state(&self, state: &ConnectionState, _task: &ConnectionTask) {
            self.states.lock().unwrap().push(state.clone());
        }
    }

    struct Forward(UnboundedSender<ReceivedFrame>);

    impl ConnectionObserver for Forward {
        fn on_new_frame(&self, frame: &ReceivedFrame, _task: &ConnectionTask) {
            let _ = self.0.send(frame.clone());
        }
    }

    /// Echoes every frame back with `message_type + 1`.
    struct Echo;

    impl ConnectionObserver for Echo {
        fn on_new_frame(&self, received: &ReceivedFrame, task: &ConnectionTask) {
            let reply = Frame::new(
                received.frame.message_type + 1,
                received.frame.message_id,
                received.frame.body.clone(),
            );
            let _ = task.send(reply, received.remote_addr);
        }
    }

    struct EchoChildren;

    impl ConnectionObserver for EchoChildren {
        fn on_new_child(&self, child: &ConnectionTask, _server: &ConnectionTask) {
            child.add_observer(Arc::new(Echo));
        }
    }

    #[test]
    fn test_state_monotonic() {
        assert!(ConnectionState::Idle.can_transition_to(&ConnectionState::Starting));
        assert!(ConnectionState::Starting.can_transition_to(&ConnectionState::Closed));
        assert!(!ConnectionState::Active.can_transition_to(&ConnectionState::Starting));
        assert!(!ConnectionState::Closed.can_transition_to(&ConnectionState::Error("x".into())));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let task = ConnectionTask::udp_bind(localhost(0), false);
        let recorder = Arc::new(Recorder::default());
        task.add_observer(recorder.clone());

        task.stop();
        task.stop();
        assert_eq!(task.state(), ConnectionState::Closed);
        assert!(task.start().await.is_err());
        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![ConnectionState::Idle, ConnectionState::Closed]
        );
    }

    #[tokio::test]
    async fn test_send_requires_active() {
        let task = ConnectionTask::udp_bind(localhost(0), false);
        let result = task.send(Frame::new(0, 0, Vec::new()), Some(localhost(9)));
        assert!(matches!(result, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn test_udp_echo() {
        let server = ConnectionTask::udp_bind(localhost(0), false);
        server.add_observer(Arc::new(Echo));
        server.start().await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = ConnectionTask::udp_connect(server_addr);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.add_observer(Arc::new(Forward(tx)));
        client.start().await.unwrap();

        client
            .send(Frame::new(4, 77, b"ping".to_vec()), None)
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.frame, Frame::new(5, 77, b"ping".to_vec()));
        assert_eq!(received.remote_addr, Some(server_addr));

        client.stop();
        server.stop();
        assert_eq!(server.wait_close().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_tcp_echo_through_child() {
        let server = ConnectionTask::tcp_server(localhost(0), None);
        server.add_observer(Arc::new(EchoChildren));
        server.start().await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = ConnectionTask::tcp_client(server_addr, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.add_observer(Arc::new(Forward(tx)));
        client.start().await.unwrap();

        client
            .send(Frame::new(2, 1, vec![7; 100_000]), None)
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.frame.message_type, 3);
        assert_eq!(received.frame.body.len(), 100_000);

        client.stop();
        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tcp_server_runs_children_concurrently() {
        fn assert_send<T: Send>(_: &T) {}

        let server = ConnectionTask::tcp_server(localhost(0), None);
        server.add_observer(Arc::new(EchoChildren));
        let starting = server.start();
        assert_send(&starting);
        starting.await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut clients = Vec::new();
        for id in 0..2 {
            let client = ConnectionTask::tcp_client(server_addr, None);
            client.add_observer(Arc::new(Forward(tx.clone())));
            client.start().await.unwrap();
            client.send(Frame::new(6, id, b"hi".to_vec()), None).unwrap();
            clients.push(client);
        }

        let mut ids = Vec::new();
        for _ in 0..2 {
            let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received.frame.message_type, 7);
            ids.push(received.frame.message_id);
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);

        for client in &clients {
            client.stop();
        }
        server.stop();
    }

    #[tokio::test]
    async fn test_tcp_connect_refused_is_error() {
        let listener = std::net::TcpListener::bind(localhost(0)).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ConnectionTask::tcp_client(addr, None);
        let result = client.start().await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(matches!(client.state(), ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_child() {
        struct KeepChild(UnboundedSender<ConnectionTask>);

        impl ConnectionObserver for KeepChild {
            fn on_new_child(&self, child: &ConnectionTask, _server: &ConnectionTask) {
                let _ = self.0.send(child.clone());
            }
        }

        let server = ConnectionTask::tcp_server(localhost(0), Some(Duration::from_millis(200)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.add_observer(Arc::new(KeepChild(tx)));
        server.start().await.unwrap();

        let client = ConnectionTask::tcp_client(server.local_addr().unwrap(), None);
        client.start().await.unwrap();

        let child = rx.recv().await.unwrap();
        let state = tokio::time::timeout(Duration::from_secs(5), child.wait_close())
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Closed);

        let state = tokio::time::timeout(Duration::from_secs(5), client.wait_close())
            .await
            .unwrap();
        assert!(state.is_terminal());
        server.stop();
    }
}
