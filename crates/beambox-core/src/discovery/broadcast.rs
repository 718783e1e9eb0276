//! UDP broadcast discovery.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use super::{
    BroadcastSenderState, DiscoveryOptions, DiscoveryState, Endpoint, RemoteDevice,
    TeardownWatch,
};
use crate::connection::{ConnectionObserver, ConnectionTask, ReceivedFrame};
use crate::error::{Error, Result};
use crate::observer::lock;
use crate::protocol::messages::{
    BroadcastMessage, BroadcastMsg, BroadcastTransferFileReq, BroadcastTransferFileResp,
};
use crate::protocol::{decode_body, Frame};
use crate::rpc::{typed_handler, RequestContext, RequestHandler, RpcConnection};

/// Announcements a device may miss before the receiver forgets it.
const EVICT_AFTER_MISSED: u32 = 3;

/// Receives broadcast sender events.
pub trait BroadcastSenderObserver: Send + Sync {
    /// Called on every state change, and once with the current state when
    /// the observer is added.
    fn on_new_state(&self, _state: &BroadcastSenderState) {}

    /// A receiver asked to start a transfer with us.
    fn on_request_transfer_file(&self, _remote_device: &RemoteDevice) {}
}

type SenderEndpoint = Endpoint<BroadcastSenderState, dyn BroadcastSenderObserver>;

/// Announces this device and answers transfer requests.
///
/// ```rust,ignore
/// let sender = BroadcastSender::new(DiscoveryOptions::default());
/// sender.add_observer(observer);
/// sender.start(local_ip, Ipv4Addr::BROADCAST.into()).await?;
/// ```
pub struct BroadcastSender {
    options: Arc<DiscoveryOptions>,
    endpoint: Arc<SenderEndpoint>,
}

impl BroadcastSender {
    /// Create a stopped sender.
    #[must_use]
    pub fn new(options: DiscoveryOptions) -> Self {
        Self {
            options: Arc::new(options),
            endpoint: Arc::new(Endpoint::new(
                "BroadcastSender",
                BroadcastSenderState::NoConnection,
                |o: &Arc<dyn BroadcastSenderObserver>, s: &BroadcastSenderState| {
                    o.on_new_state(s);
                },
            )),
        }
    }

    /// Current state.
    pub fn state(&self) -> BroadcastSenderState {
        self.endpoint.state()
    }

    /// Address the sender socket is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint
            .connection()
            .and_then(|c| c.task().local_addr())
    }

    /// Bind the sender port on `local_address` and start announcing to
    /// `broadcast_address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] if already running, or the bind failure.
    pub async fn start(&self, local_address: IpAddr, broadcast_address: IpAddr) -> Result<()> {
        self.endpoint.begin(BroadcastSenderState::Requesting)?;

        let bind = SocketAddr::new(local_address, self.options.broadcast_transfer_port);
        let connection = RpcConnection::new(ConnectionTask::udp_bind(bind, true));
        connection.register_handler(transfer_request_handler(
            Arc::clone(&self.options),
            Arc::downgrade(&self.endpoint),
        ));
        connection.add_observer(TeardownWatch::new(
            Arc::downgrade(&self.endpoint),
            SenderEndpoint::close,
        ));
        self.endpoint.attach(connection.clone());

        if let Err(e) = connection.start().await {
            tracing::warn!("Broadcast sender failed to bind {}: {}", bind, e);
            self.endpoint.close();
            return Err(e);
        }
        if let Err(e) = self.endpoint.advance(
            &BroadcastSenderState::Requesting,
            BroadcastSenderState::Active { broadcast_address },
        ) {
            self.endpoint.close();
            return Err(e);
        }

        let dest = SocketAddr::new(broadcast_address, self.options.broadcast_receiver_port);
        tracing::info!("Announcing '{}' to {}", self.options.device_name, dest);
        tokio::spawn(announce(
            connection,
            dest,
            BroadcastMsg {
                version: self.options.version,
                device_name: self.options.device_name.clone(),
            },
            self.options.broadcast_interval,
        ));
        Ok(())
    }

    /// Stop announcing, return to `NoConnection` and drop all observers.
    pub fn close_connection_if_active(&self) {
        self.endpoint.close();
    }

    /// Register an observer. It immediately receives the current state.
    pub fn add_observer(&self, observer: Arc<dyn BroadcastSenderObserver>) {
        self.endpoint.add_observer(observer);
    }

    /// Unregister an observer.
    pub fn remove_observer(&self, observer: &Arc<dyn BroadcastSenderObserver>) {
        self.endpoint.remove_observer(observer);
    }

    /// Resolve once the sender is back to `NoConnection`.
    pub async fn wait_close(&self) {
        self.endpoint.wait_close().await;
    }
}

async fn announce(
    connection: RpcConnection,
    dest: SocketAddr,
    body: BroadcastMsg,
    interval: Duration,
) {
    let cancel = connection.task().cancel_token().clone();
    let mut ticker = tokio::time::interval(interval);
    let mut message_id = 0i64;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let frame = match Frame::json(BroadcastMessage::BroadcastMsg.code(), message_id, &body) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode broadcast: {}", e);
                break;
            }
        };
        message_id += 1;
        if let Err(e) = connection.task().send(frame, Some(dest)) {
            tracing::debug!("Broadcast loop ending: {}", e);
            break;
        }
    }
}

fn transfer_request_handler(
    options: Arc<DiscoveryOptions>,
    endpoint: Weak<SenderEndpoint>,
) -> Arc<dyn RequestHandler> {
    typed_handler(
        BroadcastMessage::TransferFileReq.code(),
        BroadcastMessage::TransferFileResp.code(),
        move |ctx: &RequestContext, request: BroadcastTransferFileReq| {
            let endpoint = endpoint.upgrade()?;
            if request.version != options.version {
                tracing::warn!(
                    "Ignoring transfer request from {:?}: version {} (ours {})",
                    ctx.remote_addr,
                    request.version,
                    options.version
                );
                return None;
            }
            if !matches!(endpoint.state(), BroadcastSenderState::Active { .. }) {
                return None;
            }
            let remote_address = ctx.remote_addr?;
            if ctx.is_new {
                let device = RemoteDevice {
                    remote_address,
                    device_name: request.device_name,
                };
                tracing::info!("Transfer requested by {}", device);
                for observer in endpoint.observers() {
                    observer.on_request_transfer_file(&device);
                }
            }
            Some(BroadcastTransferFileResp {
                device_name: options.device_name.clone(),
            })
        },
    )
}

/// Receives broadcast receiver events.
pub trait BroadcastReceiverObserver: Send + Sync {
    /// Called on every state change, and once with the current state when
    /// the observer is added.
    fn on_new_state(&self, _state: &DiscoveryState) {}

    /// Called for every valid announcement.
    fn on_new_broadcast(&self, _remote_device: &RemoteDevice) {}

    /// The set of recently seen devices changed.
    fn on_active_remote_devices_update(&self, _remote_devices: &[RemoteDevice]) {}
}

type ReceiverEndpoint = Endpoint<DiscoveryState, dyn BroadcastReceiverObserver>;

struct ReceiverShared {
    options: Arc<DiscoveryOptions>,
    endpoint: ReceiverEndpoint,
    devices: Mutex<HashMap<SocketAddr, (RemoteDevice, Instant)>>,
}

impl ReceiverShared {
    fn active_devices(&self) -> Vec<RemoteDevice> {
        let mut devices: Vec<_> = lock(&self.devices)
            .values()
            .map(|(device, _)| device.clone())
            .collect();
        devices.sort_by(|a, b| {
            a.device_name
                .cmp(&b.device_name)
                .then(a.remote_address.cmp(&b.remote_address))
        });
        devices
    }

    fn publish_devices(&self) {
        let devices = self.active_devices();
        for observer in self.endpoint.observers() {
            observer.on_active_remote_devices_update(&devices);
        }
    }

    /// Record an announcement. Returns whether the active set changed.
    fn record(&self, device: RemoteDevice, now: Instant) -> bool {
        let mut devices = lock(&self.devices);
        let previous = devices.insert(device.remote_address, (device.clone(), now));
        previous.map_or(true, |(old, _)| old != device)
    }

    /// Drop devices not seen within `ttl`. Returns whether any were dropped.
    fn evict_older_than(&self, ttl: Duration, now: Instant) -> bool {
        let mut devices = lock(&self.devices);
        let before = devices.len();
        devices.retain(|_, (device, last_seen)| {
            let keep = now.saturating_duration_since(*last_seen) <= ttl;
            if !keep {
                tracing::debug!("Device {} went quiet", device);
            }
            keep
        });
        devices.len() != before
    }

    fn on_broadcast(&self, received: &ReceivedFrame) {
        let Some(remote_address) = received.remote_addr else {
            return;
        };
        let announcement: BroadcastMsg = match decode_body(&received.frame.body) {
            Ok(announcement) => announcement,
            Err(e) => {
                tracing::debug!("Bad broadcast from {}: {}", remote_address, e);
                return;
            }
        };
        if announcement.version != self.options.version {
            tracing::debug!(
                "Ignoring broadcast from {} with version {}",
                remote_address,
                announcement.version
            );
            return;
        }
        if self.endpoint.state() != DiscoveryState::Active {
            return;
        }

        let device = RemoteDevice {
            remote_address,
            device_name: announcement.device_name,
        };
        let changed = self.record(device.clone(), Instant::now());
        for observer in self.endpoint.observers() {
            observer.on_new_broadcast(&device);
        }
        if changed {
            tracing::info!("Found {}", device);
            self.publish_devices();
        }
    }

    fn close(&self) {
        self.endpoint.close();
        lock(&self.devices).clear();
    }
}

struct BroadcastListener {
    shared: Weak<ReceiverShared>,
}

impl ConnectionObserver for BroadcastListener {
    fn on_new_frame(&self, received: &ReceivedFrame, _task: &ConnectionTask) {
        if received.frame.message_type != BroadcastMessage::BroadcastMsg.code() {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.on_broadcast(received);
        }
    }
}

/// Listens for announcements and asks announcers for a transfer.
pub struct BroadcastReceiver {
    shared: Arc<ReceiverShared>,
}

impl BroadcastReceiver {
    /// Create a stopped receiver.
    #[must_use]
    pub fn new(options: DiscoveryOptions) -> Self {
        Self {
            shared: Arc::new(ReceiverShared {
                options: Arc::new(options),
                endpoint: Endpoint::new(
                    "BroadcastReceiver",
                    DiscoveryState::NoConnection,
                    |o: &Arc<dyn BroadcastReceiverObserver>, s: &DiscoveryState| {
                        o.on_new_state(s);
                    },
                ),
                devices: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> DiscoveryState {
        self.shared.endpoint.state()
    }

    /// Devices heard from within the eviction window.
    pub fn active_devices(&self) -> Vec<RemoteDevice> {
        self.shared.active_devices()
    }

    /// Bind the receiver port on all interfaces and start listening.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] if already running, or the bind failure.
    pub async fn start(&self) -> Result<()> {
        self.start_on(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).await
    }

    /// Bind the receiver port on a specific address and start listening.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] if already running, or the bind failure.
    pub async fn start_on(&self, bind_address: IpAddr) -> Result<()> {
        let shared = &self.shared;
        shared.endpoint.begin(DiscoveryState::Requesting)?;

        let bind = SocketAddr::new(bind_address, shared.options.broadcast_receiver_port);
        let connection = RpcConnection::new(ConnectionTask::udp_bind(bind, true));
        connection.add_observer(Arc::new(BroadcastListener {
            shared: Arc::downgrade(shared),
        }));
        connection.add_observer(TeardownWatch::new(
            Arc::downgrade(shared),
            ReceiverShared::close,
        ));
        shared.endpoint.attach(connection.clone());

        if let Err(e) = connection.start().await {
            tracing::warn!("Broadcast receiver failed to bind {}: {}", bind, e);
            shared.close();
            return Err(e);
        }
        if let Err(e) = shared
            .endpoint
            .advance(&DiscoveryState::Requesting, DiscoveryState::Active)
        {
            shared.close();
            return Err(e);
        }

        tracing::info!("Listening for broadcasts on {}", bind);
        tokio::spawn(evict_stale(
            Arc::downgrade(shared),
            connection,
            shared.options.broadcast_interval,
        ));
        Ok(())
    }

    /// Ask the sender at `target` for a transfer. Resolves with the
    /// sender's reply, or times out if it declines.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] unless active, [`Error::Timeout`] if the
    /// sender never answers, or [`Error::Transport`] if the socket closes.
    pub async fn request_file_transfer(&self, target: IpAddr) -> Result<BroadcastTransferFileResp> {
        let shared = &self.shared;
        let connection = match (shared.endpoint.state(), shared.endpoint.connection()) {
            (DiscoveryState::Active, Some(connection)) => connection,
            (state, _) => {
                return Err(Error::State(format!(
                    "broadcast receiver is {state}, cannot request a transfer"
                )))
            }
        };
        let dest = SocketAddr::new(target, shared.options.broadcast_transfer_port);
        let request = BroadcastTransferFileReq {
            version: shared.options.version,
            device_name: shared.options.device_name.clone(),
        };
        tracing::info!("Requesting transfer from {}", dest);
        connection
            .request(
                BroadcastMessage::TransferFileReq.code(),
                BroadcastMessage::TransferFileResp.code(),
                &request,
                Some(dest),
                shared.options.retry_timeout,
            )
            .await
    }

    /// Stop listening, return to `NoConnection` and drop all observers.
    pub fn close_connection_if_active(&self) {
        self.shared.close();
    }

    /// Register an observer. It immediately receives the current state.
    pub fn add_observer(&self, observer: Arc<dyn BroadcastReceiverObserver>) {
        self.shared.endpoint.add_observer(observer);
    }

    /// Unregister an observer.
    pub fn remove_observer(&self, observer: &Arc<dyn BroadcastReceiverObserver>) {
        self.shared.endpoint.remove_observer(observer);
    }

    /// Resolve once the receiver is back to `NoConnection`.
    pub async fn wait_close(&self) {
        self.shared.endpoint.wait_close().await;
    }
}

async fn evict_stale(shared: Weak<ReceiverShared>, connection: RpcConnection, interval: Duration) {
    let cancel = connection.task().cancel_token().clone();
    drop(connection);
    let ttl = interval * EVICT_AFTER_MISSED;
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.evict_older_than(ttl, Instant::now()) {
            shared.publish_devices();
        }
    }
}
