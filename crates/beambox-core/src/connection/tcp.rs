//! TCP event loops.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::{ConnectionState, ConnectionTask, Outbound};
use crate::error::{Error, Result};
use crate::protocol::{write_frame, FrameBuffer};

/// Connect timeout for outgoing TCP connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read buffer size per connection.
const READ_BUFFER_SIZE: usize = 64 * 1024;

pub(super) async fn connect(remote: SocketAddr) -> Result<TcpStream> {
    tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(remote))
        .await
        .map_err(|_| Error::Transport(format!("connect to {remote} timed out")))?
        .map_err(|e| Error::Transport(format!("connect to {remote} failed: {e}")))
}

pub(super) async fn run_server(
    task: &ConnectionTask,
    bind: SocketAddr,
    child_idle: Option<Duration>,
) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| Error::Transport(format!("bind {bind} failed: {e}")))?;
    task.set_addrs(listener.local_addr().ok(), None);
    task.transition(ConnectionState::Active);
    tracing::debug!(task = task.id(), "TCP server listening on {:?}", task.local_addr());

    let cancel = task.cancel_token().clone();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(task = task.id(), "Accepted connection from {}", peer);
                let child = ConnectionTask::accepted(stream, child_idle);
                task.notify_new_child(&child);
                child.launch_child();
            }
        }
    }
}

pub(super) async fn run_stream(
    task: &ConnectionTask,
    stream: TcpStream,
    idle: Option<Duration>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let local = stream.local_addr().ok();
    let remote = stream.peer_addr().ok();
    task.set_addrs(local, remote);

    let (mut reader, mut writer) = stream.into_split();
    task.transition(ConnectionState::Active);

    let cancel = task.cancel_token().clone();
    tokio::select! {
        () = cancel.cancelled() => Ok(()),
        result = read_loop(task, &mut reader, idle, local, remote) => result,
        result = write_loop(&mut writer, &mut rx) => result,
    }
}

async fn read_loop(
    task: &ConnectionTask,
    reader: &mut OwnedReadHalf,
    idle: Option<Duration>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
) -> Result<()> {
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match idle {
            Some(limit) => {
                if let Ok(read) = tokio::time::timeout(limit, reader.read(&mut buf)).await {
                    read?
                } else {
                    tracing::info!(
                        task = task.id(),
                        "No data from {:?} for {:?}, closing",
                        remote,
                        limit
                    );
                    return Ok(());
                }
            }
            None => reader.read(&mut buf).await?,
        };
        if n == 0 {
            tracing::debug!(task = task.id(), "Peer {:?} closed the connection", remote);
            return Ok(());
        }
        frames.extend(&buf[..n]);
        while let Some(frame) = frames.decode_next()? {
            task.deliver(frame, local, remote);
        }
    }
}

async fn write_loop(
    writer: &mut OwnedWriteHalf,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Result<()> {
    while let Some(outbound) = rx.recv().await {
        write_frame(writer, &outbound.frame).await?;
    }
    Ok(())
}
