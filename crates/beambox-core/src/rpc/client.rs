//! Client side of the request/response multiplexer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::connection::{ConnectionObserver, ConnectionState, ConnectionTask, ReceivedFrame};
use crate::error::{Error, Result};
use crate::observer::lock;
use crate::protocol::{decode_body, encode_body, Frame};

struct PendingRequest {
    response_type: i32,
    reply: oneshot::Sender<Result<ReceivedFrame>>,
}

/// Removes a request's pending entry however its call ends, including when
/// the caller drops the future mid-wait.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<i64, PendingRequest>>,
    message_id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.message_id);
    }
}

/// Correlates outgoing requests with their responses by message id.
///
/// Register it as an observer of the connection task it sends on.
pub struct RequestClient {
    task: ConnectionTask,
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingRequest>>,
}

impl RequestClient {
    pub(crate) fn new(task: ConnectionTask) -> Self {
        Self {
            task,
            next_id: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send a typed request and wait for its typed response.
    ///
    /// If nothing arrives within `retry_timeout` the same frame (same
    /// message id) is sent once more; a second silence fails with
    /// [`Error::Timeout`]. Connection loss fails the call with
    /// [`Error::Transport`].
    ///
    /// # Errors
    ///
    /// See above, plus serialization failures on either body.
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
        let body = encode_body(request)?;
        let response = self
            .request_raw(request_type, response_type, body, dest, retry_timeout)
            .await?;
        decode_body(&response.frame.body)
    }

    /// Send a request frame and wait for the matching response frame.
    ///
    /// # Errors
    ///
    /// Same as [`RequestClient::request`].
    pub async fn request_raw(
        &self,
        request_type: i32,
        response_type: i32,
        body: Vec<u8>,
        dest: Option<SocketAddr>,
        retry_timeout: Duration,
    ) -> Result<ReceivedFrame> {
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(request_type, message_id, body);
        let (reply, mut rx) = oneshot::channel();
        lock(&self.pending).insert(
            message_id,
            PendingRequest {
                response_type,
                reply,
            },
        );

        let _pending = PendingGuard {
            pending: &self.pending,
            message_id,
        };
        self.exchange(&frame, dest, retry_timeout, &mut rx).await
    }

    async fn exchange(
        &self,
        frame: &Frame,
        dest: Option<SocketAddr>,
        retry_timeout: Duration,
        rx: &mut oneshot::Receiver<Result<ReceivedFrame>>,
    ) -> Result<ReceivedFrame> {
        for attempt in 0..2 {
            if attempt > 0 {
                tracing::warn!(
                    message_type = frame.message_type,
                    message_id = frame.message_id,
                    "No response after {:?}, retrying once",
                    retry_timeout
                );
            }
            self.task.send(frame.clone(), dest)?;
            match tokio::time::timeout(retry_timeout, &mut *rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => {
                    return Err(Error::Transport("request dropped".to_string()));
                }
                Err(_) => {}
            }
        }

        let waited_ms =
            u64::try_from(retry_timeout.as_millis().saturating_mul(2)).unwrap_or(u64::MAX);
        tracing::warn!(
            message_type = frame.message_type,
            message_id = frame.message_id,
            "Request timed out after {} ms",
            waited_ms
        );
        Err(Error::Timeout {
            message_type: frame.message_type,
            waited_ms,
        })
    }

    fn fail_all(&self, error: &Error) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (message_id, pending) in drained {
            tracing::debug!(message_id, "Failing pending request: {}", error);
            let _ = pending.reply.send(Err(error.clone()));
        }
    }
}

impl ConnectionObserver for RequestClient {
    fn on_new_state(&self, state: &ConnectionState, _task: &ConnectionTask) {
        match state {
            ConnectionState::Closed => {
                self.fail_all(&Error::Transport("connection closed".to_string()));
            }
            ConnectionState::Error(cause) => self.fail_all(&Error::Transport(cause.clone())),
            _ => {}
        }
    }

    fn on_new_frame(&self, received: &ReceivedFrame, _task: &ConnectionTask) {
        let mut pending = lock(&self.pending);
        let matches = pending
            .get(&received.frame.message_id)
            .is_some_and(|p| p.response_type == received.frame.message_type);
        if matches {
            if let Some(request) = pending.remove(&received.frame.message_id) {
                drop(pending);
                let _ = request.reply.send(Ok(received.clone()));
            }
        }
    }
}
