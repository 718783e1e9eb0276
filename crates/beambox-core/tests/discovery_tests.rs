//! Broadcast and QR-code discovery on loopback.

mod common;

use std::sync::Arc;
use std::time::Duration;

use beambox_core::discovery::{
    BroadcastReceiver, BroadcastReceiverObserver, BroadcastSender, BroadcastSenderObserver,
    BroadcastSenderState, DiscoveryOptions, DiscoveryState, QrCodeScanClient, QrCodeScanServer,
    QrCodeScanServerObserver, RemoteDevice,
};
use beambox_core::protocol::messages::QRCodeShare;
use beambox_core::Error;
use tokio::sync::mpsc;

use common::{get_test_ports, next_port, within, LOCALHOST};

fn options(name: &str, receiver_port: u16, transfer_port: u16) -> DiscoveryOptions {
    DiscoveryOptions {
        device_name: name.to_string(),
        broadcast_receiver_port: receiver_port,
        broadcast_transfer_port: transfer_port,
        broadcast_interval: Duration::from_millis(100),
        retry_timeout: Duration::from_millis(300),
        ..DiscoveryOptions::default()
    }
}

struct DeviceForwarder(mpsc::UnboundedSender<Vec<RemoteDevice>>);

impl BroadcastReceiverObserver for DeviceForwarder {
    fn on_active_remote_devices_update(&self, remote_devices: &[RemoteDevice]) {
        let _ = self.0.send(remote_devices.to_vec());
    }
}

struct RequestForwarder(mpsc::UnboundedSender<RemoteDevice>);

impl BroadcastSenderObserver for RequestForwarder {
    fn on_request_transfer_file(&self, remote_device: &RemoteDevice) {
        let _ = self.0.send(remote_device.clone());
    }
}

impl QrCodeScanServerObserver for RequestForwarder {
    fn on_request_transfer_file(&self, remote_device: &RemoteDevice) {
        let _ = self.0.send(remote_device.clone());
    }
}

#[tokio::test]
async fn test_broadcast_discovery_and_transfer_request() {
    let (receiver_port, transfer_port) = get_test_ports();

    let receiver = BroadcastReceiver::new(options("Phone", receiver_port, transfer_port));
    let (devices_tx, mut devices_rx) = mpsc::unbounded_channel();
    receiver.add_observer(Arc::new(DeviceForwarder(devices_tx)));
    receiver.start_on(LOCALHOST).await.unwrap();
    assert_eq!(receiver.state(), DiscoveryState::Active);

    let sender = BroadcastSender::new(options("Laptop", receiver_port, transfer_port));
    let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
    sender.add_observer(Arc::new(RequestForwarder(requests_tx)));
    sender.start(LOCALHOST, LOCALHOST).await.unwrap();
    assert_eq!(
        sender.state(),
        BroadcastSenderState::Active {
            broadcast_address: LOCALHOST
        }
    );

    let devices = within(devices_rx.recv()).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_name, "Laptop");
    assert_eq!(devices[0].remote_address.ip(), LOCALHOST);

    let reply = within(receiver.request_file_transfer(LOCALHOST))
        .await
        .unwrap();
    assert_eq!(reply.device_name, "Laptop");
    let requester = within(requests_rx.recv()).await.unwrap();
    assert_eq!(requester.device_name, "Phone");

    // Without announcements the device is evicted after three intervals.
    sender.close_connection_if_active();
    within(sender.wait_close()).await;
    let devices = within(devices_rx.recv()).await.unwrap();
    assert!(devices.is_empty());
    assert!(receiver.active_devices().is_empty());

    receiver.close_connection_if_active();
    assert_eq!(receiver.state(), DiscoveryState::NoConnection);
}

#[tokio::test]
async fn test_broadcast_other_version_is_ignored() {
    let (receiver_port, transfer_port) = get_test_ports();

    let receiver = BroadcastReceiver::new(options("Phone", receiver_port, transfer_port));
    receiver.start_on(LOCALHOST).await.unwrap();

    let sender = BroadcastSender::new(DiscoveryOptions {
        version: 42,
        ..options("Old", receiver_port, transfer_port)
    });
    sender.start(LOCALHOST, LOCALHOST).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(receiver.active_devices().is_empty());
    match within(receiver.request_file_transfer(LOCALHOST)).await {
        Err(Error::Timeout { .. }) => {}
        other => panic!("expected timeout, got {other:?}"),
    }

    sender.close_connection_if_active();
    receiver.close_connection_if_active();
}

#[tokio::test]
async fn test_qr_code_rendezvous() {
    let port = next_port();
    let qr_options = DiscoveryOptions {
        qr_code_port: port,
        ..DiscoveryOptions::default()
    };

    let server = QrCodeScanServer::new(qr_options.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.add_observer(Arc::new(RequestForwarder(tx)));
    server.start(LOCALHOST).await.unwrap();
    assert_eq!(server.state(), DiscoveryState::Active);

    let payload = QrCodeScanServer::share_payload(LOCALHOST, "Desktop").unwrap();
    let share = QRCodeShare::parse(&payload).unwrap();
    share.ensure_compatible().unwrap();
    assert_eq!(share.device_name, "Desktop");

    let client = QrCodeScanClient::new(qr_options);
    client.start(share.ip_address().unwrap()).await.unwrap();
    within(client.request_file_transfer("Tablet")).await.unwrap();

    let requester = within(rx.recv()).await.unwrap();
    assert_eq!(requester.device_name, "Tablet");
    assert!(rx.try_recv().is_err());

    client.close_connection_if_active();
    server.close_connection_if_active();
    within(server.wait_close()).await;
    assert_eq!(client.state(), DiscoveryState::NoConnection);
}

#[tokio::test]
async fn test_qr_other_version_times_out() {
    let port = next_port();
    let qr_options = DiscoveryOptions {
        qr_code_port: port,
        ..DiscoveryOptions::default()
    };
    let server = QrCodeScanServer::new(qr_options.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.add_observer(Arc::new(RequestForwarder(tx)));
    server.start(LOCALHOST).await.unwrap();

    let client = QrCodeScanClient::new(DiscoveryOptions {
        version: 7,
        ..qr_options
    });
    client.start(LOCALHOST).await.unwrap();
    match within(client.request_file_transfer("Tablet")).await {
        Err(Error::Timeout { .. }) => {}
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(rx.try_recv().is_err());

    client.close_connection_if_active();
    server.close_connection_if_active();
}
