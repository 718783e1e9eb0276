//! Network discovery for Beambox.
//!
//! Two ways for a peer to find the device it wants to exchange files with:
//! - UDP broadcast: a [`BroadcastSender`] announces itself every interval,
//!   a [`BroadcastReceiver`] collects announcements and asks one announcer
//!   for a transfer
//! - QR code: a [`QrCodeScanServer`] shows its address in a QR image, a
//!   [`QrCodeScanClient`] scans it and asks for a transfer over UDP
//!
//! Both end with the asking side holding a [`RemoteDevice`] and the asked
//! side notified through its observers. Accepting the request (opening a
//! FileExplore session) is up to the host application.
//!
//! ## Protocol
//!
//! - Broadcast receiver port: 1999 (UDP)
//! - Broadcast sender port: 2000 (UDP), also receives transfer requests
//! - QR rendezvous port: 1998 (UDP)
//! - Announcement interval: every second while active
//!
//! A request whose protocol version differs from ours gets no response; the
//! asking side sees a timeout.

mod broadcast;
mod qrcode;

pub use broadcast::{
    BroadcastReceiver, BroadcastReceiverObserver, BroadcastSender, BroadcastSenderObserver,
};
pub use qrcode::{
    QrCodeScanClient, QrCodeScanClientObserver, QrCodeScanServer, QrCodeScanServerObserver,
    QR_REQUEST_RETRY_TIMEOUT,
};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;

use crate::config::Config;
use crate::connection::{ConnectionObserver, ConnectionState, ConnectionTask};
use crate::error::{Error, Result};
use crate::observer::{lock, Observers};
use crate::rpc::RpcConnection;
use crate::PROTOCOL_VERSION;

/// A peer that announced itself or asked us for a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteDevice {
    /// Address the peer sent from
    pub remote_address: SocketAddr,
    /// Name the peer declared
    pub device_name: String,
}

impl fmt::Display for RemoteDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.device_name, self.remote_address.ip())
    }
}

/// Lifecycle of a broadcast receiver or QR scan endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Not running
    NoConnection,
    /// Socket is being bound
    Requesting,
    /// Socket is bound and serving
    Active,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConnection => write!(f, "NoConnection"),
            Self::Requesting => write!(f, "Requesting"),
            Self::Active => write!(f, "Active"),
        }
    }
}

/// Lifecycle of a broadcast sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastSenderState {
    /// Not running
    NoConnection,
    /// Socket is being bound
    Requesting,
    /// Announcing to this broadcast address
    Active {
        /// Destination of the announcements
        broadcast_address: IpAddr,
    },
}

impl fmt::Display for BroadcastSenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConnection => write!(f, "NoConnection"),
            Self::Requesting => write!(f, "Requesting"),
            Self::Active { broadcast_address } => write!(f, "Active({broadcast_address})"),
        }
    }
}

/// Settings shared by every discovery endpoint.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Name announced to peers
    pub device_name: String,
    /// Protocol version announced and required from peers
    pub version: i32,
    /// Port broadcast receivers listen on
    pub broadcast_receiver_port: u16,
    /// Port broadcast senders bind and answer transfer requests on
    pub broadcast_transfer_port: u16,
    /// Port of the QR rendezvous server
    pub qr_code_port: u16,
    /// Announcement interval; receivers evict after three missed intervals
    pub broadcast_interval: Duration,
    /// Retry timeout for transfer requests over broadcast
    pub retry_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for DiscoveryOptions {
    fn from(config: &Config) -> Self {
        Self {
            device_name: config.general.device_name.clone(),
            version: PROTOCOL_VERSION,
            broadcast_receiver_port: config.network.broadcast_receiver_port,
            broadcast_transfer_port: config.network.broadcast_transfer_port,
            qr_code_port: config.network.qr_code_port,
            broadcast_interval: config.session.broadcast_interval,
            retry_timeout: config.session.retry_timeout,
        }
    }
}

/// Best guess at this device's LAN address.
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick the
/// outgoing interface.
#[must_use]
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Replace the state if it differs. Returns whether it changed.
pub(crate) fn replace_state<S: PartialEq>(state: &watch::Sender<S>, next: S) -> bool {
    state.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    })
}

/// State, observers and socket of one discovery endpoint.
///
/// The state lives in a watch channel so every transition goes through one
/// place; `notify` forwards a state to the endpoint's observer trait.
pub(crate) struct Endpoint<S, O: ?Sized> {
    label: &'static str,
    idle: S,
    state: watch::Sender<S>,
    observers: Observers<O>,
    connection: Mutex<Option<RpcConnection>>,
    notify: fn(&Arc<O>, &S),
}

impl<S, O> Endpoint<S, O>
where
    S: Clone + PartialEq + fmt::Display,
    O: ?Sized,
{
    pub(crate) fn new(label: &'static str, idle: S, notify: fn(&Arc<O>, &S)) -> Self {
        let (state, _) = watch::channel(idle.clone());
        Self {
            label,
            idle,
            state,
            observers: Observers::new(),
            connection: Mutex::new(None),
            notify,
        }
    }

    pub(crate) fn state(&self) -> S {
        self.state.borrow().clone()
    }

    pub(crate) fn observers(&self) -> Vec<Arc<O>> {
        self.observers.snapshot()
    }

    pub(crate) fn set_state(&self, next: S) -> bool {
        let changed = replace_state(&self.state, next.clone());
        if changed {
            tracing::debug!("{} state: {}", self.label, next);
            for observer in self.observers.snapshot() {
                (self.notify)(&observer, &next);
            }
        }
        changed
    }

    /// Move from idle to `requesting`, refusing if already running.
    pub(crate) fn begin(&self, requesting: S) -> Result<()> {
        let idle = &self.idle;
        let claimed = self.state.send_if_modified(|current| {
            if current == idle {
                *current = requesting.clone();
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(Error::State(format!(
                "{} cannot start in state {}",
                self.label,
                self.state()
            )));
        }
        for observer in self.observers.snapshot() {
            (self.notify)(&observer, &requesting);
        }
        Ok(())
    }

    /// Move from `from` to `to`; fails if something else changed the state
    /// in between.
    pub(crate) fn advance(&self, from: &S, to: S) -> Result<()> {
        let moved = self.state.send_if_modified(|current| {
            if current == from {
                *current = to.clone();
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(Error::State(format!(
                "{} expected {} but is {}",
                self.label,
                from,
                self.state()
            )));
        }
        tracing::debug!("{} state: {}", self.label, to);
        for observer in self.observers.snapshot() {
            (self.notify)(&observer, &to);
        }
        Ok(())
    }

    pub(crate) fn attach(&self, connection: RpcConnection) {
        let previous = lock(&self.connection).replace(connection);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    pub(crate) fn connection(&self) -> Option<RpcConnection> {
        lock(&self.connection).clone()
    }

    /// Go back to idle, stop the socket and drop every observer.
    pub(crate) fn close(&self) {
        self.set_state(self.idle.clone());
        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            connection.stop();
        }
        self.observers.clear();
    }

    pub(crate) fn add_observer(&self, observer: Arc<O>) {
        self.observers.add(Arc::clone(&observer));
        (self.notify)(&observer, &self.state());
    }

    pub(crate) fn remove_observer(&self, observer: &Arc<O>) {
        self.observers.remove(observer);
    }

    pub(crate) async fn wait_close(&self) {
        let mut rx = self.state.subscribe();
        let idle = &self.idle;
        let _ = rx.wait_for(|s| s == idle).await;
    }
}

/// Closes the owning endpoint when its socket closes or fails.
pub(crate) struct TeardownWatch<T> {
    target: Weak<T>,
    close: fn(&T),
}

impl<T> TeardownWatch<T> {
    pub(crate) fn new(target: Weak<T>, close: fn(&T)) -> Arc<Self> {
        Arc::new(Self { target, close })
    }
}

impl<T: Send + Sync> ConnectionObserver for TeardownWatch<T> {
    fn on_new_state(&self, state: &ConnectionState, task: &ConnectionTask) {
        if state.is_terminal() {
            if let Some(target) = self.target.upgrade() {
                tracing::debug!("Discovery socket {} ended: {}", task.id(), state);
                (self.close)(&target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_state() {
        let (tx, _) = watch::channel(DiscoveryState::NoConnection);
        assert!(replace_state(&tx, DiscoveryState::Requesting));
        assert!(!replace_state(&tx, DiscoveryState::Requesting));
        assert_eq!(*tx.borrow(), DiscoveryState::Requesting);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.general.device_name = "Desk".to_string();
        config.network.qr_code_port = 4000;

        let options = DiscoveryOptions::from(&config);
        assert_eq!(options.device_name, "Desk");
        assert_eq!(options.qr_code_port, 4000);
        assert_eq!(options.version, PROTOCOL_VERSION);
    }

    trait Seen: Send + Sync {
        fn seen(&self, state: &DiscoveryState);
    }

    #[derive(Default)]
    struct Log(std::sync::Mutex<Vec<DiscoveryState>>);

    impl Seen for Log {
        fn seen(&self, state: &DiscoveryState) {
            self.0.lock().unwrap().push(state.clone());
        }
    }

    #[test]
    fn test_endpoint_lifecycle() {
        let endpoint: Endpoint<DiscoveryState, dyn Seen> = Endpoint::new(
            "test",
            DiscoveryState::NoConnection,
            |o: &Arc<dyn Seen>, s: &DiscoveryState| o.seen(s),
        );
        let log = Arc::new(Log::default());
        endpoint.add_observer(log.clone());

        endpoint.begin(DiscoveryState::Requesting).unwrap();
        assert!(endpoint.begin(DiscoveryState::Requesting).is_err());
        endpoint
            .advance(&DiscoveryState::Requesting, DiscoveryState::Active)
            .unwrap();
        endpoint.close();
        endpoint.set_state(DiscoveryState::Active);

        assert_eq!(
            *log.0.lock().unwrap(),
            vec![
                DiscoveryState::NoConnection,
                DiscoveryState::Requesting,
                DiscoveryState::Active,
                DiscoveryState::NoConnection,
            ]
        );
    }

    #[test]
    fn test_display() {
        let device = RemoteDevice {
            remote_address: "192.168.1.20:2000".parse().unwrap(),
            device_name: "Phone".to_string(),
        };
        assert_eq!(device.to_string(), "Phone (192.168.1.20)");
        assert_eq!(
            BroadcastSenderState::Active {
                broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST)
            }
            .to_string(),
            "Active(255.255.255.255)"
        );
    }
}
