//! Event dispatch loop (spec §4.6, §4.7).
//!
//! Drains the channel the [`super::watcher::EventWatcher`] feeds and hands
//! each record to the user's callback, one at a time, so handler ordering
//! matches publish ordering. A handler error is logged and swallowed --
//! one bad event must not kill the stream -- mirroring the original
//! `_events_dispatcher_task`'s broad `except Exception` around
//! `on_new_event`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc::Receiver, watch, RwLock};
use tracing::warn;

use crate::error::BridgeResult;
use super::watcher::EventRecord;

pub type EventCallback =
    Arc<dyn Fn(EventRecord) -> Pin<Box<dyn Future<Output = BridgeResult<()>> + Send>> + Send + Sync>;

/// Alternate dispatch path for callers that would rather implement a trait
/// than hand over a closure -- the subclass-override equivalent of the
/// original's `on_new_event`.
pub trait EventHandler: Send + Sync {
    fn handle_event<'a>(
        &'a self,
        record: EventRecord,
    ) -> Pin<Box<dyn Future<Output = BridgeResult<()>> + Send + 'a>>;
}

/// Wraps a trait object as an [`EventCallback`] so it can be handed to
/// [`crate::BridgeClient::initialize`] the same way a closure would be.
pub fn callback_from_handler(handler: Arc<dyn EventHandler>) -> EventCallback {
    Arc::new(move |record| {
        let handler = handler.clone();
        Box::pin(async move { handler.handle_event(record).await })
    })
}

/// Fixed back-pressure warning threshold for the event dispatch loop --
/// unrelated to `Config::params_delay_timeout`, which budgets the parameter
/// poll loop instead.
const STALENESS_WARNING: Duration = Duration::from_secs(30);

pub struct EventDispatcher {
    last_processed_utc: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl EventDispatcher {
    /// `last_processed_utc` is shared with the owning client so its
    /// `last_event_processed_utc()` accessor reads the same cell directly.
    pub fn new(last_processed_utc: Arc<RwLock<Option<DateTime<Utc>>>>) -> Self {
        EventDispatcher { last_processed_utc }
    }

    /// Runs until the channel closes or `shutdown` flips to `true`.
    pub async fn run(
        &self,
        mut rx: Receiver<EventRecord>,
        callback: EventCallback,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                received = rx.recv() => {
                    let Some(record) = received else { return };
                    self.dispatch_one(record, &callback).await;
                }
            }
        }
    }

    async fn dispatch_one(&self, record: EventRecord, callback: &EventCallback) {
        let age = Utc::now().signed_duration_since(record.received_at);
        if age > chrono::Duration::from_std(STALENESS_WARNING).unwrap_or(chrono::Duration::MAX) {
            warn!(
                header = %record.header,
                age_ms = age.num_milliseconds(),
                "event handler is falling behind the publisher"
            );
        }

        let header = record.header.clone();
        if let Err(e) = callback(record).await {
            warn!(header = %header, error = %e, "event handler returned an error, continuing");
        }
        *self.last_processed_utc.write().await = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn dispatches_events_in_order() {
        let last_processed = Arc::new(RwLock::new(None));
        let dispatcher = EventDispatcher::new(last_processed);
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback: EventCallback = Arc::new(move |record| {
            let seen = seen_cb.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(record.header);
                Ok(())
            })
        });

        let run_handle = tokio::spawn(async move {
            dispatcher.run(rx, callback, shutdown_rx).await;
        });

        tx.send(EventRecord {
            header: "OnTrade".into(),
            payload: serde_json::Value::Null,
            received_at: Utc::now(),
        })
        .await
        .unwrap();
        tx.send(EventRecord {
            header: "OnOrder".into(),
            payload: serde_json::Value::Null,
            received_at: Utc::now(),
        })
        .await
        .unwrap();

        drop(tx);
        shutdown_tx.send(true).unwrap();
        run_handle.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["OnTrade", "OnOrder"]);
    }

    #[tokio::test]
    async fn handler_error_does_not_stop_the_loop() {
        let last_processed = Arc::new(RwLock::new(None));
        let dispatcher = EventDispatcher::new(last_processed);
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        let callback: EventCallback = Arc::new(move |_record| {
            let count = count_cb.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::BridgeError::Generic("boom".into()))
            })
        });

        let run_handle = tokio::spawn(async move {
            dispatcher.run(rx, callback, shutdown_rx).await;
        });

        for _ in 0..3 {
            tx.send(EventRecord {
                header: "OnTrade".into(),
                payload: serde_json::Value::Null,
                received_at: Utc::now(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        shutdown_tx.send(true).unwrap();
        run_handle.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
