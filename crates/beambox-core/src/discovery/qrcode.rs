//! QR-code rendezvous over UDP.
//!
//! The server's address travels out of band as a [`QRCodeShare`] JSON
//! payload rendered into a QR image. The scanning client decodes it and
//! sends a `TransferFileReq` straight to that address.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{DiscoveryOptions, DiscoveryState, Endpoint, RemoteDevice, TeardownWatch};
use crate::connection::ConnectionTask;
use crate::error::{Error, Result};
use crate::protocol::messages::{QRCodeShare, QRCodeTransferFileReq, QrCodeMessage};
use crate::rpc::{typed_handler, RequestContext, RequestHandler, RpcConnection};
use crate::PROTOCOL_VERSION;

/// Retry timeout of the scanner's transfer request.
pub const QR_REQUEST_RETRY_TIMEOUT: Duration = Duration::from_millis(2000);

impl QRCodeShare {
    /// Payload for this device.
    #[must_use]
    pub fn new(address: IpAddr, device_name: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            device_name: device_name.to_string(),
            address: address.to_string(),
        }
    }

    /// Decode a scanned payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the text is not a share payload.
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload.trim()).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Encode as the text put into the QR image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Fail early when the share was produced by another protocol version;
    /// its owner would ignore our requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VersionMismatch`].
    pub fn ensure_compatible(&self) -> Result<()> {
        if self.version == PROTOCOL_VERSION {
            Ok(())
        } else {
            Err(Error::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: self.version,
            })
        }
    }

    /// The advertised address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the address does not parse.
    pub fn ip_address(&self) -> Result<IpAddr> {
        self.address
            .parse()
            .map_err(|_| Error::Serialization(format!("invalid address '{}'", self.address)))
    }
}

/// Receives QR scan server events.
pub trait QrCodeScanServerObserver: Send + Sync {
    /// Called on every state change, and once with the current state when
    /// the observer is added.
    fn on_new_state(&self, _state: &DiscoveryState) {}

    /// A scanner asked to start a transfer with us.
    fn on_request_transfer_file(&self, _remote_device: &RemoteDevice) {}
}

type ServerEndpoint = Endpoint<DiscoveryState, dyn QrCodeScanServerObserver>;

/// Waits for scanners of this device's QR code.
pub struct QrCodeScanServer {
    options: Arc<DiscoveryOptions>,
    endpoint: Arc<ServerEndpoint>,
}

impl QrCodeScanServer {
    /// Create a stopped server.
    #[must_use]
    pub fn new(options: DiscoveryOptions) -> Self {
        Self {
            options: Arc::new(options),
            endpoint: Arc::new(Endpoint::new(
                "QrCodeScanServer",
                DiscoveryState::NoConnection,
                |o: &Arc<dyn QrCodeScanServerObserver>, s: &DiscoveryState| {
                    o.on_new_state(s);
                },
            )),
        }
    }

    /// The text to render into the QR image for a server reachable at
    /// `local_address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn share_payload(local_address: IpAddr, device_name: &str) -> Result<String> {
        QRCodeShare::new(local_address, device_name).to_payload()
    }

    /// Current state.
    pub fn state(&self) -> DiscoveryState {
        self.endpoint.state()
    }

    /// Address the server socket is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint
            .connection()
            .and_then(|c| c.task().local_addr())
    }

    /// Bind the QR port on `local_address` and wait for scanners.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] if already running, or the bind failure.
    pub async fn start(&self, local_address: IpAddr) -> Result<()> {
        self.endpoint.begin(DiscoveryState::Requesting)?;

        let bind = SocketAddr::new(local_address, self.options.qr_code_port);
        let connection = RpcConnection::new(ConnectionTask::udp_bind(bind, false));
        connection.register_handler(transfer_request_handler(
            Arc::clone(&self.options),
            Arc::downgrade(&self.endpoint),
        ));
        connection.add_observer(TeardownWatch::new(
            Arc::downgrade(&self.endpoint),
            ServerEndpoint::close,
        ));
        self.endpoint.attach(connection.clone());

        if let Err(e) = connection.start().await {
            tracing::warn!("QR scan server failed to bind {}: {}", bind, e);
            self.endpoint.close();
            return Err(e);
        }
        if let Err(e) = self
            .endpoint
            .advance(&DiscoveryState::Requesting, DiscoveryState::Active)
        {
            self.endpoint.close();
            return Err(e);
        }
        tracing::info!("Waiting for QR scanners on {}", bind);
        Ok(())
    }

    /// Stop waiting, return to `NoConnection` and drop all observers.
    pub fn close_connection_if_active(&self) {
        self.endpoint.close();
    }

    /// Register an observer. It immediately receives the current state.
    pub fn add_observer(&self, observer: Arc<dyn QrCodeScanServerObserver>) {
        self.endpoint.add_observer(observer);
    }

    /// Unregister an observer.
    pub fn remove_observer(&self, observer: &Arc<dyn QrCodeScanServerObserver>) {
        self.endpoint.remove_observer(observer);
    }

    /// Resolve once the server is back to `NoConnection`.
    pub async fn wait_close(&self) {
        self.endpoint.wait_close().await;
    }
}

fn transfer_request_handler(
    options: Arc<DiscoveryOptions>,
    endpoint: Weak<ServerEndpoint>,
) -> Arc<dyn RequestHandler> {
    typed_handler(
        QrCodeMessage::TransferFileReq.code(),
        QrCodeMessage::TransferFileResp.code(),
        move |ctx: &RequestContext, request: QRCodeTransferFileReq| {
            let endpoint = endpoint.upgrade()?;
            let state = endpoint.state();
            if state != DiscoveryState::Active || request.version != options.version {
                tracing::warn!(
                    "Ignoring QR transfer request from {:?}: version {}, state {}",
                    ctx.remote_addr,
                    request.version,
                    state
                );
                return None;
            }
            let remote_address = ctx.remote_addr?;
            if ctx.is_new {
                let device = RemoteDevice {
                    remote_address,
                    device_name: request.device_name,
                };
                tracing::info!("QR transfer requested by {}", device);
                for observer in endpoint.observers() {
                    observer.on_request_transfer_file(&device);
                }
            }
            Some(())
        },
    )
}

/// Receives QR scan client state changes.
pub trait QrCodeScanClientObserver: Send + Sync {
    /// Called on every state change, and once with the current state when
    /// the observer is added.
    fn on_new_state(&self, _state: &DiscoveryState) {}
}

type ClientEndpoint = Endpoint<DiscoveryState, dyn QrCodeScanClientObserver>;

/// Asks the owner of a scanned QR code for a transfer.
pub struct QrCodeScanClient {
    options: Arc<DiscoveryOptions>,
    endpoint: Arc<ClientEndpoint>,
}

impl QrCodeScanClient {
    /// Create a stopped client.
    #[must_use]
    pub fn new(options: DiscoveryOptions) -> Self {
        Self {
            options: Arc::new(options),
            endpoint: Arc::new(Endpoint::new(
                "QrCodeScanClient",
                DiscoveryState::NoConnection,
                |o: &Arc<dyn QrCodeScanClientObserver>, s: &DiscoveryState| {
                    o.on_new_state(s);
                },
            )),
        }
    }

    /// Current state.
    pub fn state(&self) -> DiscoveryState {
        self.endpoint.state()
    }

    /// Open a UDP socket connected to the server's QR port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] if already running, or the socket failure.
    pub async fn start(&self, server_address: IpAddr) -> Result<()> {
        self.endpoint.begin(DiscoveryState::Requesting)?;

        let remote = SocketAddr::new(server_address, self.options.qr_code_port);
        let connection = RpcConnection::new(ConnectionTask::udp_connect(remote));
        connection.add_observer(TeardownWatch::new(
            Arc::downgrade(&self.endpoint),
            ClientEndpoint::close,
        ));
        self.endpoint.attach(connection.clone());

        if let Err(e) = connection.start().await {
            tracing::warn!("QR scan client failed to reach {}: {}", remote, e);
            self.endpoint.close();
            return Err(e);
        }
        if let Err(e) = self
            .endpoint
            .advance(&DiscoveryState::Requesting, DiscoveryState::Active)
        {
            self.endpoint.close();
            return Err(e);
        }
        Ok(())
    }

    /// Ask the server for a transfer, announcing `device_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] unless active, [`Error::Timeout`] if the
    /// server never answers (for example on a version mismatch), or
    /// [`Error::Transport`] if the socket closes.
    pub async fn request_file_transfer(&self, device_name: &str) -> Result<()> {
        let connection = match (self.endpoint.state(), self.endpoint.connection()) {
            (DiscoveryState::Active, Some(connection)) => connection,
            (state, _) => {
                return Err(Error::State(format!(
                    "QR scan client is {state}, cannot request a transfer"
                )))
            }
        };
        let request = QRCodeTransferFileReq {
            version: self.options.version,
            device_name: device_name.to_string(),
        };
        connection
            .request::<_, ()>(
                QrCodeMessage::TransferFileReq.code(),
                QrCodeMessage::TransferFileResp.code(),
                &request,
                None,
                QR_REQUEST_RETRY_TIMEOUT,
            )
            .await
    }

    /// Close the socket, return to `NoConnection` and drop all observers.
    pub fn close_connection_if_active(&self) {
        self.endpoint.close();
    }

    /// Register an observer. It immediately receives the current state.
    pub fn add_observer(&self, observer: Arc<dyn QrCodeScanClientObserver>) {
        self.endpoint.add_observer(observer);
    }

    /// Unregister an observer.
    pub fn remove_observer(&self, observer: &Arc<dyn QrCodeScanClientObserver>) {
        self.endpoint.remove_observer(observer);
    }

    /// Resolve once the client is back to `NoConnection`.
    pub async fn wait_close(&self) {
        self.endpoint.wait_close().await;
    }
}
