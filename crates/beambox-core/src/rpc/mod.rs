//! Request/response layer on top of a [`ConnectionTask`].
//!
//! - [`RequestClient`] correlates responses to outgoing requests by
//!   message id and retries exactly once before timing out.
//! - [`DispatchTable`] routes incoming requests to handlers by message type
//!   and answers retransmissions from a reply cache.
//! - [`RpcConnection`] bundles a task with both, so one socket can act as
//!   client and server at the same time.

mod client;
mod server;

pub use client::RequestClient;
pub use server::{typed_handler, DispatchTable, RequestContext, RequestHandler, TypedHandler};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::{ConnectionObserver, ConnectionState, ConnectionTask};
use crate::error::Result;

/// A connection task acting as both request client and request server.
#[derive(Clone)]
pub struct RpcConnection {
    task: ConnectionTask,
    client: Arc<RequestClient>,
    server: Arc<DispatchTable>,
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("task", &self.task)
            .field("pending", &self.client.pending_count())
            .finish_non_exhaustive()
    }
}

impl RpcConnection {
    /// Wrap a connection task. The task may already be running.
    pub fn new(task: ConnectionTask) -> Self {
        let client = Arc::new(RequestClient::new(task.clone()));
        let server = Arc::new(DispatchTable::new());
        task.add_observer(Arc::clone(&client) as Arc<dyn ConnectionObserver>);
        task.add_observer(Arc::clone(&server) as Arc<dyn ConnectionObserver>);
        Self {
            task,
            client,
            server,
        }
    }

    /// The underlying connection task.
    pub fn task(&self) -> &ConnectionTask {
        &self.task
    }

    /// Start the underlying connection task.
    ///
    /// # Errors
    ///
    /// See [`ConnectionTask::start`].
    pub async fn start(&self) -> Result<()> {
        self.task.start().await
    }

    /// Stop the underlying connection task.
    pub fn stop(&self) {
        self.task.stop();
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.task.state()
    }

    /// Resolve once the connection is closed or failed.
    pub async fn wait_close(&self) -> ConnectionState {
        self.task.wait_close().await
    }

    /// Add an observer to the underlying task.
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.task.add_observer(observer);
    }

    /// Remove an observer from the underlying task.
    pub fn remove_observer(&self, observer: &Arc<dyn ConnectionObserver>) {
        self.task.remove_observer(observer);
    }

    /// Serve `handler.request_type()` on this connection.
    pub fn register_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.server.register(handler);
    }

    /// Send a typed request; see [`RequestClient::request`].
    ///
    /// # Errors
    ///
    /// See [`RequestClient::request`].
    pub async fn request<Req, Resp>(
        &self,
        request_type: i32,
        response_type: i32,
        request: &Req,
        dest: Option<SocketAddr>,
        retry_timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.client
            .request(request_type, response_type, request, dest, retry_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::Error;
    use crate::protocol::Frame;

    fn localhost() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    async fn udp_pair() -> (RpcConnection, RpcConnection, SocketAddr) {
        let server = RpcConnection::new(ConnectionTask::udp_bind(localhost(), false));
        server.start().await.unwrap();
        let server_addr = server.task().local_addr().unwrap();
        let client = RpcConnection::new(ConnectionTask::udp_connect(server_addr));
        client.start().await.unwrap();
        (server, client, server_addr)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (server, client, _) = udp_pair().await;
        server.register_handler(typed_handler(2, 3, |_ctx: &RequestContext, n: u32| {
            Some(n * 2)
        }));

        let doubled: u32 = client
            .request(2, 3, &21u32, None, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(doubled, 42);

        client.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_concurrent_requests() {
        let (server, client, _) = udp_pair().await;
        server.register_handler(typed_handler(0, 1, |_ctx: &RequestContext, s: String| {
            Some(s.to_uppercase())
        }));

        let (a, b) = tokio::join!(
            client.request::<_, String>(0, 1, "a", None, Duration::from_millis(500)),
            client.request::<_, String>(0, 1, "b", None, Duration::from_millis(500)),
        );
        assert_eq!(a.unwrap(), "A");
        assert_eq!(b.unwrap(), "B");

        client.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_declined_request_times_out_after_one_retry() {
        let (server, client, _) = udp_pair().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        server.register_handler(typed_handler(
            0,
            1,
            move |ctx: &RequestContext, _req: ()| -> Option<()> {
                seen.fetch_add(1, Ordering::SeqCst);
                assert_eq!(ctx.is_new, seen.load(Ordering::SeqCst) == 1);
                None
            },
        ));

        let result = client
            .request::<_, ()>(0, 1, &(), None, Duration::from_millis(200))
            .await;
        match result {
            Err(Error::Timeout {
                message_type,
                waited_ms,
            }) => {
                assert_eq!(message_type, 0);
                assert_eq!(waited_ms, 400);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        client.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (server, client, _) = udp_pair().await;

        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request::<_, ()>(0, 1, &(), None, Duration::from_secs(10))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.stop();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Transport(_))));
        server.stop();
    }

    #[tokio::test]
    async fn test_abandoned_request_leaves_no_pending_entry() {
        let (server, client, _) = udp_pair().await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            client.request::<_, ()>(0, 1, &(), None, Duration::from_secs(5)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(client.client.pending_count(), 0);

        client.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_request_on_stopped_connection_is_state_error() {
        let (server, client, _) = udp_pair().await;
        client.stop();
        let result = client
            .request::<_, ()>(0, 1, &(), None, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(Error::State(_))));
        server.stop();
    }

    #[tokio::test]
    async fn test_response_with_wrong_type_is_ignored() {
        let (server, client, _) = udp_pair().await;

        struct WrongType;

        impl ConnectionObserver for WrongType {
            fn on_new_frame(
                &self,
                received: &crate::connection::ReceivedFrame,
                task: &ConnectionTask,
            ) {
                let reply = Frame::new(99, received.frame.message_id, b"null".to_vec());
                let _ = task.send(reply, received.remote_addr);
            }
        }
        server.add_observer(Arc::new(WrongType));

        let result = client
            .request::<_, ()>(0, 1, &(), None, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));

        client.stop();
        server.stop();
    }
}
