// A mock PUB-socket event source for exercising the event watcher/dispatcher
// without a real trading terminal pushing events.

/// A mock event publisher bound to a random local port.
pub struct MockEventPublisher {
    endpoint: String,
    socket: zmq::Socket,
}

impl MockEventPublisher {
    pub fn start() -> Self {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::PUB).expect("create PUB socket");
        socket
            .bind("tcp://127.0.0.1:*")
            .expect("bind mock event publisher");
        let endpoint = socket
            .get_last_endpoint()
            .expect("last endpoint")
            .expect("endpoint is utf-8");
        MockEventPublisher { endpoint, socket }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Publish one event as a two-frame message: header then JSON payload.
    ///
    /// ZeroMQ's "slow joiner" behavior means a message published before a
    /// subscriber's connect/subscribe handshake lands is silently dropped --
    /// callers should give a freshly spawned subscriber a brief moment
    /// before calling this.
    pub fn publish(&self, header: &str, payload: &serde_json::Value) {
        self.socket
            .send(header, zmq::SNDMORE)
            .expect("send header frame");
        self.socket
            .send(payload.to_string().as_bytes(), 0)
            .expect("send payload frame");
    }

    /// Publish one of the transport-teardown sentinel headers with an empty payload.
    pub fn publish_teardown(&self, header: &str) {
        self.publish(header, &serde_json::json!({}));
    }
}
