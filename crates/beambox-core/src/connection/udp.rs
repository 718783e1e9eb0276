//! UDP event loop.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::{ConnectionState, ConnectionTask, Outbound};
use crate::error::{Error, Result};
use crate::protocol::{Frame, MAX_DATAGRAM_SIZE};

pub(super) fn bind_socket(bind: SocketAddr, broadcast: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;

    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.set_reuse_address(true)?;

    #[cfg(target_os = "macos")]
    socket.set_reuse_port(true)?;

    socket
        .bind(&bind.into())
        .map_err(|e| Error::Transport(format!("bind {bind} failed: {e}")))?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

pub(super) async fn connect_socket(remote: SocketAddr) -> Result<UdpSocket> {
    let unspecified = match remote.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
    socket
        .connect(remote)
        .await
        .map_err(|e| Error::Transport(format!("connect to {remote} failed: {e}")))?;
    Ok(socket)
}

pub(super) async fn run_socket(
    task: &ConnectionTask,
    socket: UdpSocket,
    connected: Option<SocketAddr>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> Result<()> {
    let local = socket.local_addr().ok();
    task.set_addrs(local, connected);
    task.transition(ConnectionState::Active);
    tracing::debug!(task = task.id(), "UDP socket ready on {:?}", local);

    let cancel = task.cancel_token().clone();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            outbound = rx.recv() => {
                let Some(outbound) = outbound else {
                    return Ok(());
                };
                let data = outbound.frame.encode_datagram()?;
                let sent = match (outbound.dest, connected) {
                    (Some(dest), None) => socket.send_to(&data, dest).await,
                    (_, Some(_)) => socket.send(&data).await,
                    (None, None) => {
                        tracing::warn!(task = task.id(), "Dropping datagram without destination");
                        continue;
                    }
                };
                if let Err(e) = sent {
                    tracing::warn!(
                        task = task.id(),
                        "Failed to send datagram type {}: {}",
                        outbound.frame.message_type,
                        e
                    );
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        // Connected sockets surface ICMP unreachable here.
                        tracing::debug!(task = task.id(), "UDP receive failed: {}", e);
                        continue;
                    }
                };
                match Frame::decode_datagram(&buf[..n]) {
                    Ok(frame) => task.deliver(frame, local, Some(from)),
                    Err(e) => {
                        tracing::warn!(task = task.id(), "Dropping datagram from {}: {}", from, e);
                    }
                }
            }
        }
    }
}
