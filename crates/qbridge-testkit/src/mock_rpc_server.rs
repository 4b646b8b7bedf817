// A mock REP-socket RPC server for exercising the bridge's socket pool
// without a real trading terminal on the other end.
//
// Each connection round is: recv one JSON request, look up a canned or
// programmable response for its `method`, send it back. Handlers run on a
// background OS thread since `zmq::Socket` is a blocking, non-Send API.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// What the mock server does when it sees a given RPC method.
#[derive(Clone)]
pub enum MockReply {
    /// Respond with this JSON value as `result`.
    Result(serde_json::Value),
    /// Respond with an error envelope (`result.is_error = true`).
    Error(serde_json::Value),
    /// Don't reply at all -- used to exercise client-side receive timeouts.
    Silent,
    /// Close the connection without replying, simulating a dead peer.
    Drop,
}

/// A mock RPC server bound to a random local port.
pub struct MockRpcServer {
    endpoint: String,
    scripted: Arc<Mutex<HashMap<String, Vec<MockReply>>>>,
    default_reply: Arc<Mutex<MockReply>>,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl MockRpcServer {
    /// Start the mock server on an OS-assigned port.
    pub fn start() -> Self {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::REP).expect("create REP socket");
        socket
            .bind("tcp://127.0.0.1:*")
            .expect("bind mock RPC server");
        let endpoint = socket
            .get_last_endpoint()
            .expect("last endpoint")
            .expect("endpoint is utf-8");

        let scripted: Arc<Mutex<HashMap<String, Vec<MockReply>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let default_reply = Arc::new(Mutex::new(MockReply::Result(serde_json::json!({}))));
        let (stop_tx, stop_rx) = mpsc::channel();

        let scripted_bg = scripted.clone();
        let default_bg = default_reply.clone();
        let handle = std::thread::spawn(move || {
            Self::serve(socket, scripted_bg, default_bg, stop_rx);
        });

        MockRpcServer {
            endpoint,
            scripted,
            default_reply,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Queue a sequence of replies for `method`; each call consumes the
    /// next one, the last entry repeats once exhausted.
    pub fn script(&self, method: &str, replies: Vec<MockReply>) {
        self.scripted
            .lock()
            .expect("scripted lock")
            .insert(method.to_owned(), replies);
    }

    pub fn set_default_reply(&self, reply: MockReply) {
        *self.default_reply.lock().expect("default lock") = reply;
    }

    fn serve(
        socket: zmq::Socket,
        scripted: Arc<Mutex<HashMap<String, Vec<MockReply>>>>,
        default_reply: Arc<Mutex<MockReply>>,
        stop_rx: mpsc::Receiver<()>,
    ) {
        loop {
            if stop_rx.try_recv().is_ok() {
                return;
            }
            match socket.poll(zmq::POLLIN, 100) {
                Ok(n) if n > 0 => {}
                Ok(_) => continue,
                Err(_) => return,
            }
            let msg = match socket.recv_bytes(0) {
                Ok(m) => m,
                Err(_) => return,
            };
            let request: serde_json::Value = match serde_json::from_slice(&msg) {
                Ok(v) => v,
                Err(_) => {
                    let _ = socket.send(r#"{"error":{"message":"bad json"}}"#, 0);
                    continue;
                }
            };
            let method = request
                .get("method")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_owned();

            let reply = {
                let mut guard = scripted.lock().expect("scripted lock");
                match guard.get_mut(&method) {
                    Some(queue) if !queue.is_empty() => {
                        if queue.len() == 1 {
                            queue[0].clone()
                        } else {
                            queue.remove(0)
                        }
                    }
                    _ => default_reply.lock().expect("default lock").clone(),
                }
            };

            match reply {
                MockReply::Result(v) => {
                    let body = serde_json::json!({ "result": v });
                    let _ = socket.send(body.to_string().as_bytes(), 0);
                }
                MockReply::Error(v) => {
                    let body = serde_json::json!({ "error": v });
                    let _ = socket.send(body.to_string().as_bytes(), 0);
                }
                MockReply::Silent => {
                    // Deliberately don't reply promptly -- by the time this
                    // fires the client will already have timed out and
                    // reconnected on a fresh socket. A REP socket demands a
                    // send before its next recv though, so send a reply
                    // nobody is listening for anymore rather than wedging
                    // this socket's state machine and killing the server.
                    std::thread::sleep(std::time::Duration::from_secs(2));
                    let _ = socket.send(r#"{"result":{}}"#, 0);
                }
                MockReply::Drop => {
                    return;
                }
            }
        }
    }
}

impl Drop for MockRpcServer {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_binds_to_a_real_port() {
        let server = MockRpcServer::start();
        assert!(server.endpoint().starts_with("tcp://127.0.0.1:"));
        assert!(!server.endpoint().ends_with(":0"));
    }

    #[test]
    fn server_replies_with_scripted_result() {
        let server = MockRpcServer::start();
        server.script(
            "getClassesList",
            vec![MockReply::Result(serde_json::json!({"classes_list": "SPBFUT"}))],
        );

        let ctx = zmq::Context::new();
        let client = ctx.socket(zmq::REQ).unwrap();
        client.connect(server.endpoint()).unwrap();
        client
            .send(r#"{"method":"getClassesList"}"#, 0)
            .unwrap();
        let reply = client.recv_bytes(0).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(parsed["result"]["classes_list"], "SPBFUT");
    }
}
