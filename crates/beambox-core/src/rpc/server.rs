//! Server side of the request/response multiplexer.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::{ConnectionObserver, ConnectionTask, ReceivedFrame};
use crate::observer::lock;
use crate::protocol::{decode_body, encode_body, Frame};

/// Number of served requests remembered for duplicate detection.
const REPLY_CACHE_SIZE: usize = 128;

/// Where a request came from and whether it is a first delivery.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    /// Local socket address
    pub local_addr: Option<SocketAddr>,
    /// Requester address
    pub remote_addr: Option<SocketAddr>,
    /// `false` when this message id was already seen from this peer
    pub is_new: bool,
}

/// Handles one request type.
///
/// Returning `None` declines: no response is sent and the requester
/// eventually times out.
pub trait RequestHandler: Send + Sync {
    /// Request message type served by this handler
    fn request_type(&self) -> i32;

    /// Message type of the response frame
    fn response_type(&self) -> i32;

    /// Handle a raw request body.
    fn handle(&self, ctx: &RequestContext, body: &[u8]) -> Option<Vec<u8>>;
}

/// Adapter turning a typed closure into a [`RequestHandler`].
pub struct TypedHandler<Req, Resp, F> {
    request_type: i32,
    response_type: i32,
    handler: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> RequestHandler for TypedHandler<Req, Resp, F>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(&RequestContext, Req) -> Option<Resp> + Send + Sync,
{
    fn request_type(&self) -> i32 {
        self.request_type
    }

    fn response_type(&self) -> i32 {
        self.response_type
    }

    fn handle(&self, ctx: &RequestContext, body: &[u8]) -> Option<Vec<u8>> {
        let request: Req = match decode_body(body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(
                    request_type = self.request_type,
                    "Dropping undecodable request from {:?}: {}",
                    ctx.remote_addr,
                    e
                );
                return None;
            }
        };
        let response = (self.handler)(ctx, request)?;
        match encode_body(&response) {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::error!(
                    request_type = self.request_type,
                    "Failed to encode response: {}",
                    e
                );
                None
            }
        }
    }
}

/// Build a handler from a typed closure.
pub fn typed_handler<Req, Resp, F>(
    request_type: i32,
    response_type: i32,
    handler: F,
) -> Arc<dyn RequestHandler>
where
    Req: DeserializeOwned + 'static,
    Resp: Serialize + 'static,
    F: Fn(&RequestContext, Req) -> Option<Resp> + Send + Sync + 'static,
{
    Arc::new(TypedHandler {
        request_type,
        response_type,
        handler,
        _marker: PhantomData,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReplyKey {
    remote: Option<SocketAddr>,
    request_type: i32,
    message_id: i64,
}

#[derive(Debug, Clone)]
enum CachedReply {
    InFlight,
    Replied(Vec<u8>),
    Declined,
}

#[derive(Default)]
struct ReplyCache {
    order: VecDeque<ReplyKey>,
    entries: HashMap<ReplyKey, CachedReply>,
}

impl ReplyCache {
    fn get(&self, key: &ReplyKey) -> Option<&CachedReply> {
        self.entries.get(key)
    }

    fn put(&mut self, key: ReplyKey, reply: CachedReply) {
        if self.entries.insert(key.clone(), reply).is_none() {
            self.order.push_back(key);
            while self.order.len() > REPLY_CACHE_SIZE {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }
}

enum Dispatch {
    Invoke { is_new: bool },
    Resend(Vec<u8>),
    Ignore,
}

/// Maps request types to handlers and replays cached responses for
/// retransmitted requests.
///
/// Handlers run on the blocking pool, off the connection's event loop.
#[derive(Default)]
pub struct DispatchTable {
    handlers: Mutex<HashMap<i32, Arc<dyn RequestHandler>>>,
    cache: Arc<Mutex<ReplyCache>>,
}

impl DispatchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any handler for the same request type.
    pub fn register(&self, handler: Arc<dyn RequestHandler>) {
        lock(&self.handlers).insert(handler.request_type(), handler);
    }

    /// Remove the handler for `request_type`.
    pub fn unregister(&self, request_type: i32) {
        lock(&self.handlers).remove(&request_type);
    }

    /// Remove every handler.
    pub fn clear(&self) {
        lock(&self.handlers).clear();
    }

    fn plan(&self, key: &ReplyKey) -> Dispatch {
        let mut cache = lock(&self.cache);
        match cache.get(key) {
            None => {
                cache.put(key.clone(), CachedReply::InFlight);
                Dispatch::Invoke { is_new: true }
            }
            Some(CachedReply::InFlight) => Dispatch::Ignore,
            Some(CachedReply::Replied(body)) => Dispatch::Resend(body.clone()),
            Some(CachedReply::Declined) => {
                cache.put(key.clone(), CachedReply::InFlight);
                Dispatch::Invoke { is_new: false }
            }
        }
    }
}

impl ConnectionObserver for DispatchTable {
    fn on_new_frame(&self, received: &ReceivedFrame, task: &ConnectionTask) {
        let Some(handler) = lock(&self.handlers)
            .get(&received.frame.message_type)
            .cloned()
        else {
            return;
        };

        let key = ReplyKey {
            remote: received.remote_addr,
            request_type: received.frame.message_type,
            message_id: received.frame.message_id,
        };
        let message_id = received.frame.message_id;
        let remote = received.remote_addr;

        match self.plan(&key) {
            Dispatch::Ignore => {
                tracing::debug!(
                    request_type = key.request_type,
                    message_id,
                    "Duplicate of in-flight request from {:?} ignored",
                    remote
                );
            }
            Dispatch::Resend(body) => {
                tracing::debug!(
                    request_type = key.request_type,
                    message_id,
                    "Replaying cached response to {:?}",
                    remote
                );
                let frame = Frame::new(handler.response_type(), message_id, body);
                if let Err(e) = task.send(frame, remote) {
                    tracing::debug!("Failed to replay response: {}", e);
                }
            }
            Dispatch::Invoke { is_new } => {
                let ctx = RequestContext {
                    local_addr: received.local_addr,
                    remote_addr: remote,
                    is_new,
                };
                let body = received.frame.body.clone();
                let cache = Arc::clone(&self.cache);
                let task = task.clone();
                tokio::task::spawn_blocking(move || {
                    let reply = handler.handle(&ctx, &body);
                    let cached = reply
                        .clone()
                        .map_or(CachedReply::Declined, CachedReply::Replied);
                    lock(&cache).put(key, cached);

                    match reply {
                        Some(body) => {
                            let frame = Frame::new(handler.response_type(), message_id, body);
                            if let Err(e) = task.send(frame, remote) {
                                tracing::debug!("Failed to send response: {}", e);
                            }
                        }
                        None => {
                            tracing::debug!(
                                request_type = handler.request_type(),
                                message_id,
                                "Handler declined request from {:?}",
                                remote
                            );
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64) -> ReplyKey {
        ReplyKey {
            remote: None,
            request_type: 0,
            message_id: id,
        }
    }

    #[test]
    fn test_plan_sequence() {
        let table = DispatchTable::new();
        assert!(matches!(table.plan(&key(1)), Dispatch::Invoke { is_new: true }));
        assert!(matches!(table.plan(&key(1)), Dispatch::Ignore));

        lock(&table.cache).put(key(1), CachedReply::Replied(b"x".to_vec()));
        match table.plan(&key(1)) {
            Dispatch::Resend(body) => assert_eq!(body, b"x"),
            _ => panic!("expected cached response"),
        }

        lock(&table.cache).put(key(2), CachedReply::Declined);
        assert!(matches!(table.plan(&key(2)), Dispatch::Invoke { is_new: false }));
    }

    #[test]
    fn test_cache_is_bounded() {
        let mut cache = ReplyCache::default();
        for id in 0..(REPLY_CACHE_SIZE as i64 + 10) {
            cache.put(key(id), CachedReply::Declined);
        }
        assert_eq!(cache.entries.len(), REPLY_CACHE_SIZE);
        assert!(cache.get(&key(0)).is_none());
        assert!(cache.get(&key(REPLY_CACHE_SIZE as i64 + 9)).is_some());
    }

    #[test]
    fn test_typed_handler_decline_on_bad_body() {
        let handler = typed_handler(3, 4, |_ctx: &RequestContext, n: u32| Some(n + 1));
        let ctx = RequestContext {
            local_addr: None,
            remote_addr: None,
            is_new: true,
        };
        assert_eq!(handler.handle(&ctx, b"41"), Some(b"42".to_vec()));
        assert_eq!(handler.handle(&ctx, b"not json"), None);
    }
}
