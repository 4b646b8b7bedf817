//! SUB-socket event reader (spec §4.5).
//!
//! Runs on a dedicated OS thread -- `zmq::Socket` has no async-aware poll --
//! and feeds decoded events into a bounded channel the dispatcher drains.
//! A teardown sentinel header ([`qbridge_wire::is_teardown_header`])
//! reconnects the subscriber rather than propagating as an application
//! event, mirroring the original `_events_watch_task`'s handling of
//! `OnDisconnected` / `OnStop` / `OnClose`.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

use crate::config::EventFilter;
use qbridge_wire::is_teardown_header;

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub header: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Handle to the background subscriber thread; dropping it stops the thread.
pub struct EventWatcher {
    stop_tx: Option<std_mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl EventWatcher {
    pub fn spawn(endpoint: String, filter: EventFilter, tx: Sender<EventRecord>) -> Self {
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let handle = std::thread::spawn(move || serve(endpoint, filter, tx, stop_rx));
        EventWatcher {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }
}

impl Drop for EventWatcher {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn connect(ctx: &zmq::Context, endpoint: &str) -> zmq::Socket {
    loop {
        if let Ok(socket) = ctx.socket(zmq::SUB) {
            if socket.set_subscribe(b"").is_ok() && socket.connect(endpoint).is_ok() {
                return socket;
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(500));
    }
}

fn serve(
    endpoint: String,
    filter: EventFilter,
    tx: Sender<EventRecord>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let ctx = zmq::Context::new();
    let mut socket = connect(&ctx, &endpoint);

    loop {
        if stop_rx.try_recv().is_ok() {
            return;
        }
        match socket.poll(zmq::POLLIN, 100) {
            Ok(n) if n > 0 => {}
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "event subscriber poll failed, reconnecting");
                socket = connect(&ctx, &endpoint);
                continue;
            }
        }

        let header = match socket.recv_string(0) {
            Ok(Ok(h)) => h,
            Ok(Err(_)) | Err(_) => {
                warn!("event subscriber received a non-utf8 header, reconnecting");
                socket = connect(&ctx, &endpoint);
                continue;
            }
        };

        let payload_bytes = if socket.get_rcvmore().unwrap_or(false) {
            socket.recv_bytes(0).unwrap_or_default()
        } else {
            Vec::new()
        };

        if is_teardown_header(&header) {
            debug!(header, "terminal tore down the event stream, reconnecting");
            drop(socket);
            std::thread::sleep(std::time::Duration::from_secs(1));
            socket = connect(&ctx, &endpoint);
            continue;
        }

        if !filter.allows(&header) {
            continue;
        }

        let payload = serde_json::from_slice(&payload_bytes).unwrap_or(serde_json::Value::Null);
        let record = EventRecord {
            header,
            payload,
            received_at: Utc::now(),
        };
        if tx.blocking_send(record).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbridge_testkit::MockEventPublisher;

    #[tokio::test]
    async fn watcher_forwards_published_events() {
        let publisher = MockEventPublisher::start();
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let _watcher =
            EventWatcher::spawn(publisher.endpoint().to_owned(), EventFilter::default(), tx);
        // Let the subscriber finish its connect/subscribe handshake before
        // publishing -- ZeroMQ's "slow joiner" behavior drops messages sent
        // before a SUB socket has caught up.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        publisher.publish("OnTrade", &serde_json::json!({"price": 100.5}));

        let record = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("did not receive event in time")
            .expect("channel closed");
        assert_eq!(record.header, "OnTrade");
        assert_eq!(record.payload["price"], 100.5);
    }

    #[tokio::test]
    async fn watcher_drops_teardown_headers() {
        let publisher = MockEventPublisher::start();
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let _watcher =
            EventWatcher::spawn(publisher.endpoint().to_owned(), EventFilter::default(), tx);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        publisher.publish_teardown("OnStop");
        publisher.publish("OnTrade", &serde_json::json!({"price": 1.0}));

        let record = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("did not receive event in time")
            .expect("channel closed");
        assert_eq!(record.header, "OnTrade");
    }

    #[tokio::test]
    async fn watcher_applies_event_filter() {
        let publisher = MockEventPublisher::start();
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let filter = EventFilter {
            event_list: vec!["OnTrade".into()],
        };
        let _watcher = EventWatcher::spawn(publisher.endpoint().to_owned(), filter, tx);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        publisher.publish("OnOrder", &serde_json::json!({}));
        publisher.publish("OnTrade", &serde_json::json!({"price": 2.0}));

        let record = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("did not receive event in time")
            .expect("channel closed");
        assert_eq!(record.header, "OnTrade");
    }
}
