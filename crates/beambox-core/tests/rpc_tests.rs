//! Request deduplication seen from a raw peer.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use beambox_core::connection::ConnectionTask;
use beambox_core::protocol::{decode_body, Frame, MAX_DATAGRAM_SIZE};
use beambox_core::rpc::{typed_handler, RequestContext, RpcConnection};
use tokio::net::UdpSocket;

use common::{within, LOCALHOST};

async fn recv_frame(socket: &UdpSocket) -> Frame {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (len, _) = within(socket.recv_from(&mut buf)).await.unwrap();
    Frame::decode_datagram(&buf[..len]).unwrap()
}

#[tokio::test]
async fn test_retransmitted_request_is_answered_from_cache() {
    let server = RpcConnection::new(ConnectionTask::udp_bind(
        SocketAddr::new(LOCALHOST, 0),
        false,
    ));
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    server.register_handler(typed_handler(
        4,
        5,
        move |ctx: &RequestContext, word: String| {
            assert!(ctx.is_new);
            seen.fetch_add(1, Ordering::SeqCst);
            Some(word.len() as u32)
        },
    ));
    server.start().await.unwrap();
    let server_addr = server.task().local_addr().unwrap();

    let peer = UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
    let request = Frame::json(4, 77, &"beam").unwrap();
    let datagram = request.encode_datagram().unwrap();

    peer.send_to(&datagram, server_addr).await.unwrap();
    let first = recv_frame(&peer).await;
    peer.send_to(&datagram, server_addr).await.unwrap();
    let second = recv_frame(&peer).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.message_type, 5);
    assert_eq!(first.message_id, 77);
    assert_eq!(first, second);
    assert_eq!(decode_body::<u32>(&first.body).unwrap(), 4);

    server.stop();
}

#[tokio::test]
async fn test_same_id_from_two_peers_is_two_requests() {
    let server = RpcConnection::new(ConnectionTask::udp_bind(
        SocketAddr::new(LOCALHOST, 0),
        false,
    ));
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    server.register_handler(typed_handler(0, 1, move |_ctx: &RequestContext, (): ()| {
        seen.fetch_add(1, Ordering::SeqCst);
        Some(())
    }));
    server.start().await.unwrap();
    let server_addr = server.task().local_addr().unwrap();

    let datagram = Frame::json(0, 1, &()).unwrap().encode_datagram().unwrap();
    for _ in 0..2 {
        let peer = UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
        peer.send_to(&datagram, server_addr).await.unwrap();
        let reply = recv_frame(&peer).await;
        assert_eq!(reply.message_type, 1);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    server.stop();
}
