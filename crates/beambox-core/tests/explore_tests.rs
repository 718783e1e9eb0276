//! FileExplore sessions between two peers on loopback.

mod common;

use std::path::{Path, PathBuf, MAIN_SEPARATOR_STR};
use std::sync::Arc;
use std::time::Duration;

use beambox_core::explore::{
    ExploreHandlers, ExploreOptions, FileExplore, FileExploreObserver, FileExploreState,
};
use beambox_core::file::{explore_file, resolve_in_root, scan_dir};
use beambox_core::protocol::messages::{
    DownloadFilesReq, DownloadFilesResp, ScanDirReq, ScanDirResp, SendFilesReq, SendFilesResp,
    SendMsgReq,
};
use beambox_core::{Error, PROTOCOL_VERSION};
use tokio::sync::mpsc;

use common::{create_temp_dir, create_test_file, next_port, within, LOCALHOST};

fn options(port: u16) -> ExploreOptions {
    ExploreOptions {
        port,
        heartbeat_interval: Duration::from_millis(200),
        idle_multiplier: 3,
        retry_timeout: Duration::from_millis(300),
        ..ExploreOptions::default()
    }
}

fn handlers(root: PathBuf) -> ExploreHandlers {
    ExploreHandlers {
        scan_dir: Arc::new(move |_is_new: bool, request: ScanDirReq| {
            let path = resolve_in_root(&root, &request.request_path)?;
            Some(scan_dir(&path))
        }),
        send_files: Arc::new(|_is_new: bool, _request: SendFilesReq| {
            Some(SendFilesResp { buffer_size: 4096 })
        }),
        download_files: Arc::new(|_is_new: bool, request: DownloadFilesReq| {
            Some(DownloadFilesResp {
                max_connection: request.download_files.len() as u32,
            })
        }),
    }
}

/// Bind a server and connect a client to it. Returns `(server, client)`.
async fn connected_pair(
    root: &Path,
    client_options: ExploreOptions,
) -> (Arc<FileExplore>, FileExplore) {
    let server_options = ExploreOptions {
        version: PROTOCOL_VERSION,
        ..client_options.clone()
    };
    let server = Arc::new(FileExplore::new(handlers(root.to_path_buf()), server_options));
    let binding = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.bind(LOCALHOST).await })
    };

    let client = FileExplore::new(handlers(root.to_path_buf()), client_options);
    let mut attempts = 0;
    while let Err(e) = client.connect(LOCALHOST).await {
        attempts += 1;
        assert!(attempts < 50, "client never connected: {e}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    within(binding).await.unwrap().unwrap();
    (server, client)
}

struct MsgForwarder(mpsc::UnboundedSender<SendMsgReq>);

impl FileExploreObserver for MsgForwarder {
    fn on_new_msg(&self, msg: &SendMsgReq) {
        let _ = self.0.send(msg.clone());
    }
}

#[tokio::test]
async fn test_handshake_activates_both_sides() {
    let dir = create_temp_dir();
    let (server, client) = connected_pair(dir.path(), options(next_port())).await;
    assert_eq!(client.state(), FileExploreState::Connected);

    let handshake = within(client.request_handshake()).await.unwrap();
    assert_eq!(handshake.remote_file_separator, MAIN_SEPARATOR_STR);
    assert!(matches!(client.state(), FileExploreState::Active(_)));

    let server_side = within(server.wait_active()).await.unwrap();
    assert_eq!(server_side.remote_file_separator, MAIN_SEPARATOR_STR);

    client.close_connection_if_active();
    within(server.wait_close()).await;
    assert_eq!(server.state(), FileExploreState::NoConnection);
}

#[tokio::test]
async fn test_scan_dir_and_messages() {
    let dir = create_temp_dir();
    create_test_file(dir.path(), "notes.txt", b"hello");
    std::fs::create_dir_all(dir.path().join("empty")).unwrap();

    let (server, client) = connected_pair(dir.path(), options(next_port())).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.add_observer(Arc::new(MsgForwarder(tx)));
    within(client.request_handshake()).await.unwrap();

    let root = within(client.request_scan_dir("/")).await.unwrap();
    assert_eq!(root.children_files.len(), 1);
    assert_eq!(root.children_files[0].name, "notes.txt");
    assert_eq!(root.children_dirs.len(), 1);

    let empty: ScanDirResp = within(client.request_scan_dir("/empty")).await.unwrap();
    assert!(empty.children_dirs.is_empty());
    assert!(empty.children_files.is_empty());

    client.send_msg("hi there").await.unwrap();
    let msg = within(rx.recv()).await.unwrap();
    assert_eq!(msg.msg, "hi there");
    assert!(msg.send_time > 0);

    let file = explore_file(&dir.path().join("notes.txt")).unwrap();
    let offer = within(client.request_send_files(vec![file.clone()], 2))
        .await
        .unwrap();
    assert_eq!(offer.buffer_size, 4096);
    let pull = within(client.request_download_files(vec![file], 1024))
        .await
        .unwrap();
    assert_eq!(pull.max_connection, 1);

    client.close_connection_if_active();
    server.close_connection_if_active();
}

#[tokio::test]
async fn test_server_can_request_the_client() {
    let dir = create_temp_dir();
    create_test_file(dir.path(), "a.bin", b"abc");
    let (server, client) = connected_pair(dir.path(), options(next_port())).await;
    within(client.request_handshake()).await.unwrap();
    within(server.wait_active()).await.unwrap();

    let listing = within(server.request_scan_dir("/")).await.unwrap();
    assert_eq!(listing.children_files.len(), 1);

    client.close_connection_if_active();
    server.close_connection_if_active();
}

#[tokio::test]
async fn test_requests_before_handshake_are_rejected() {
    let dir = create_temp_dir();
    let (server, client) = connected_pair(dir.path(), options(next_port())).await;

    assert!(matches!(
        client.request_scan_dir("/").await,
        Err(Error::State(_))
    ));

    client.close_connection_if_active();
    server.close_connection_if_active();
}

#[tokio::test]
async fn test_version_mismatch_times_out() {
    let dir = create_temp_dir();
    // Idle limit well above the two request attempts.
    let client_options = ExploreOptions {
        version: 99,
        heartbeat_interval: Duration::from_secs(1),
        ..options(next_port())
    };
    let (server, client) = connected_pair(dir.path(), client_options).await;

    match within(client.request_handshake()).await {
        Err(Error::Timeout { .. }) => {}
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(client.state(), FileExploreState::Connected);
    assert_eq!(server.state(), FileExploreState::Connected);

    client.close_connection_if_active();
    server.close_connection_if_active();
}

#[tokio::test]
async fn test_silent_peer_is_dropped() {
    let dir = create_temp_dir();
    let (server, client) = connected_pair(dir.path(), options(next_port())).await;

    // No handshake, so no heartbeat: both sides hit the idle limit.
    within(server.wait_close()).await;
    within(client.wait_close()).await;
    assert_eq!(server.state(), FileExploreState::NoConnection);
    assert_eq!(client.state(), FileExploreState::NoConnection);
}

#[tokio::test]
async fn test_heartbeat_keeps_session_alive() {
    let dir = create_temp_dir();
    let (server, client) = connected_pair(dir.path(), options(next_port())).await;
    within(client.request_handshake()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(matches!(client.state(), FileExploreState::Active(_)));
    assert!(matches!(server.state(), FileExploreState::Active(_)));

    client.close_connection_if_active();
    server.close_connection_if_active();
}

#[tokio::test]
async fn test_bind_twice_is_state_error() {
    let dir = create_temp_dir();
    let (server, client) = connected_pair(dir.path(), options(next_port())).await;

    assert!(matches!(server.bind(LOCALHOST).await, Err(Error::State(_))));
    assert!(matches!(client.connect(LOCALHOST).await, Err(Error::State(_))));

    client.close_connection_if_active();
    server.close_connection_if_active();
}
