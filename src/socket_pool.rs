//! REQ socket pool with "lazy pirate" retry (spec §3).
//!
//! A fixed number of REQ connections to a single endpoint, shared by many
//! concurrent async callers. A [`tokio::sync::Semaphore`] caps in-flight
//! calls at the pool size; within that budget, each caller claims whichever
//! slot's `tokio::sync::Mutex` it can `try_lock`, which doubles as the
//! in-use flag -- holding the guard across a call is all "this slot is
//! busy" means. Blocking ZeroMQ I/O runs on `spawn_blocking`, mirroring the
//! original client's dedicated thread-pool executor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use encoding::{DecoderTrap, Encoding};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::config::CurveKeys;
use crate::error::{BridgeError, BridgeResult};
use qbridge_wire::{RpcReply, RpcRequest};

const MAX_RETRIES: u32 = 3;

#[derive(Debug, Default)]
pub struct PoolStats {
    pub calls: u64,
    pub socket_errors: u64,
    pub rpc_errors: u64,
}

struct Slot {
    socket: Option<zmq::Socket>,
}

pub struct SocketPool {
    endpoint: String,
    timeout: Duration,
    ctx: zmq::Context,
    curve: Option<CurveKeys>,
    slots: Vec<Mutex<Slot>>,
    permits: Semaphore,
    calls: AtomicU64,
    socket_errors: AtomicU64,
    rpc_errors: AtomicU64,
}

impl SocketPool {
    pub fn new(endpoint: impl Into<String>, n_sockets: usize, timeout: Duration) -> Self {
        Self::with_curve(endpoint, n_sockets, timeout, None)
    }

    pub fn with_curve(
        endpoint: impl Into<String>,
        n_sockets: usize,
        timeout: Duration,
        curve: Option<CurveKeys>,
    ) -> Self {
        let n_sockets = n_sockets.max(1);
        let mut slots = Vec::with_capacity(n_sockets);
        for _ in 0..n_sockets {
            slots.push(Mutex::new(Slot { socket: None }));
        }
        SocketPool {
            endpoint: endpoint.into(),
            timeout,
            ctx: zmq::Context::new(),
            curve,
            slots,
            permits: Semaphore::new(n_sockets),
            calls: AtomicU64::new(0),
            socket_errors: AtomicU64::new(0),
            rpc_errors: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            calls: self.calls.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
        }
    }

    pub fn stats_reset(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.socket_errors.store(0, Ordering::Relaxed);
        self.rpc_errors.store(0, Ordering::Relaxed);
    }

    fn new_socket(&self) -> BridgeResult<zmq::Socket> {
        let socket = self.ctx.socket(zmq::REQ)?;
        socket.set_linger(0)?;
        if let Some(curve) = &self.curve {
            socket.set_curve_serverkey(&curve.server_public_key)?;
            socket.set_curve_publickey(&curve.client_public_key)?;
            socket.set_curve_secretkey(&curve.client_secret_key)?;
        }
        socket.connect(&self.endpoint)?;
        Ok(socket)
    }

    /// Acquire whichever slot is currently free. `permits` already bounds
    /// concurrent holders to `slots.len()`, so one is always `try_lock`-able.
    async fn acquire_slot(&self) -> tokio::sync::MutexGuard<'_, Slot> {
        loop {
            for slot in &self.slots {
                if let Ok(guard) = slot.try_lock() {
                    return guard;
                }
            }
            tokio::task::yield_now().await;
        }
    }

    /// Call `method` with `args`, retrying on transport failure up to
    /// [`MAX_RETRIES`] times before surfacing [`BridgeError::Connectivity`].
    /// A structured server-side rejection (`error`, or `result.is_error`) is
    /// returned immediately without retry.
    pub async fn call(&self, method: &str, args: Option<Value>) -> BridgeResult<Value> {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("semaphore is never closed");
        let mut guard = self.acquire_slot().await;
        self.calls.fetch_add(1, Ordering::Relaxed);

        let request = RpcRequest::new(method, args);
        let request_bytes = serde_json::to_vec(&request)?;
        let timeout_ms = i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX);

        let mut retries_left = MAX_RETRIES;
        loop {
            let socket = match guard.socket.take() {
                Some(s) => s,
                None => self.new_socket()?,
            };
            let req_bytes = request_bytes.clone();
            let (socket, outcome) = tokio::task::spawn_blocking(move || {
                let result = send_receive(&socket, &req_bytes, timeout_ms);
                (socket, result)
            })
            .await
            .expect("blocking RPC task panicked");

            match outcome {
                Ok(Some(reply_bytes)) => {
                    guard.socket = Some(socket);
                    return self.parse_reply(&reply_bytes);
                }
                Ok(None) => {
                    // Poll timed out: the REQ socket is now poisoned (it is
                    // owed a reply it will never get), discard it.
                    drop(socket);
                    self.socket_errors.fetch_add(1, Ordering::Relaxed);
                    if retries_left == 0 {
                        guard.socket = None;
                        return Err(BridgeError::Connectivity(format!(
                            "{method}: server did not reply after {MAX_RETRIES} retries"
                        )));
                    }
                    retries_left -= 1;
                    warn!(method, retries_left, "RPC call timed out, retrying");
                    guard.socket = Some(self.new_socket()?);
                }
                Err(e) => {
                    self.socket_errors.fetch_add(1, Ordering::Relaxed);
                    if retries_left == 0 {
                        guard.socket = None;
                        return Err(BridgeError::Connectivity(format!(
                            "{method}: transport error after {MAX_RETRIES} retries: {e}"
                        )));
                    }
                    retries_left -= 1;
                    warn!(method, retries_left, error = %e, "RPC transport error, retrying");
                    guard.socket = Some(self.new_socket()?);
                }
            }
        }
    }

    fn parse_reply(&self, bytes: &[u8]) -> BridgeResult<Value> {
        let text = decode_with_fallback(bytes);
        let reply: RpcReply = serde_json::from_str(&text)?;
        if reply.is_success() {
            Ok(reply.result.expect("checked by is_success"))
        } else {
            self.rpc_errors.fetch_add(1, Ordering::Relaxed);
            let detail = reply
                .error
                .or(reply.result)
                .unwrap_or(Value::Null);
            Err(BridgeError::Generic(detail.to_string()))
        }
    }
}

/// Send `request` and wait up to `timeout_ms` for a reply.
///
/// `Ok(None)` means the poll deadline passed with nothing to read; the
/// caller must treat the socket as poisoned. Runs on a blocking thread --
/// `zmq::Socket` has no async-aware poll.
fn send_receive(
    socket: &zmq::Socket,
    request: &[u8],
    timeout_ms: i64,
) -> Result<Option<Vec<u8>>, zmq::Error> {
    socket.send(request, 0)?;
    let ready = socket.poll(zmq::POLLIN, timeout_ms)?;
    if ready == 0 {
        return Ok(None);
    }
    let bytes = socket.recv_bytes(0)?;
    Ok(Some(bytes))
}

/// Decode a reply as UTF-8, falling back to Windows-1252 -- the terminal's
/// host locale occasionally leaks non-UTF-8 bytes into string fields.
fn decode_with_fallback(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => {
            debug!("reply was not valid UTF-8, retrying as windows-1252");
            encoding::all::WINDOWS_1252
                .decode(bytes, DecoderTrap::Replace)
                .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbridge_testkit::{MockReply, MockRpcServer};

    #[tokio::test]
    async fn successful_call_returns_result() {
        let server = MockRpcServer::start();
        server.script(
            "getClassesList",
            vec![MockReply::Result(serde_json::json!({"classes_list": "SPBFUT"}))],
        );
        let pool = SocketPool::new(server.endpoint(), 2, Duration::from_millis(200));
        let result = pool.call("getClassesList", None).await.unwrap();
        assert_eq!(result["classes_list"], "SPBFUT");
        assert_eq!(pool.stats().calls, 1);
    }

    #[tokio::test]
    async fn structured_error_is_not_retried() {
        let server = MockRpcServer::start();
        server.script(
            "badMethod",
            vec![MockReply::Error(serde_json::json!({"message": "unknown method"}))],
        );
        let pool = SocketPool::new(server.endpoint(), 1, Duration::from_millis(200));
        let err = pool.call("badMethod", None).await.unwrap_err();
        assert!(matches!(err, BridgeError::Generic(_)));
        assert_eq!(pool.stats().rpc_errors, 1);
    }

    #[tokio::test]
    async fn silent_server_exhausts_retries_as_connectivity_error() {
        let server = MockRpcServer::start();
        server.script("getClassesList", vec![MockReply::Silent]);
        let pool = SocketPool::new(server.endpoint(), 1, Duration::from_millis(20));
        let err = pool.call("getClassesList", None).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connectivity(_)));
        assert!(pool.stats().socket_errors >= 1);
    }

    #[test]
    fn decode_with_fallback_handles_utf8() {
        assert_eq!(decode_with_fallback(b"hello"), "hello");
    }
}
