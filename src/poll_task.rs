//! Background parameter poll loop (spec §4.3).
//!
//! Wakes on a fixed cadence, asks the watcher which subscriptions are due,
//! fetches each with `getParamEx2`, and feeds the result into that
//! instrument's [`ParamCache`]. A connectivity error backs the whole loop
//! off for ten seconds before resuming; any other error is logged and the
//! loop continues immediately. Grounded on the original `_params_watch_task`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::warn;

use crate::error::BridgeError;
use crate::params::{ParamCache, ParamWatcher};
use crate::socket_pool::SocketPool;
use qbridge_wire::ParamExResponse;

const CONNECTIVITY_BACKOFF: Duration = Duration::from_secs(10);

pub type ParamCacheMap = Mutex<HashMap<(String, String), Arc<ParamCache>>>;

pub struct PollTask {
    pool: Arc<SocketPool>,
    watcher: Arc<ParamWatcher>,
    caches: Arc<ParamCacheMap>,
    poll_interval: Duration,
    last_quote_processed_utc: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl PollTask {
    pub fn new(
        pool: Arc<SocketPool>,
        watcher: Arc<ParamWatcher>,
        caches: Arc<ParamCacheMap>,
        poll_interval: Duration,
        last_quote_processed_utc: Arc<RwLock<Option<DateTime<Utc>>>>,
    ) -> Self {
        PollTask {
            pool,
            watcher,
            caches,
            poll_interval,
            last_quote_processed_utc,
        }
    }

    /// Runs until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            let now = Utc::now();

            let due = {
                let mut guard = self.watcher.lock().await;
                let due = guard.due_candidates(now);
                guard.mark_polled(&due, now);
                due
            };

            for (class_code, sec_code, param) in due {
                if *shutdown.borrow() {
                    return;
                }
                if let Some(backoff) = self.poll_one(&class_code, &sec_code, &param, now).await {
                    tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    /// Returns `Some(backoff)` when the caller should pause before
    /// continuing (a connectivity error), `None` otherwise.
    async fn poll_one(
        &self,
        class_code: &str,
        sec_code: &str,
        param: &str,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let cache = {
            let caches = self.caches.lock().await;
            caches.get(&(class_code.to_owned(), sec_code.to_owned())).cloned()
        };
        let Some(cache) = cache else { return None };

        let args = json!({
            "class_code": class_code,
            "sec_code": sec_code,
            "param_name": param,
        });

        let response = match self.pool.call("getParamEx2", Some(args)).await {
            Ok(v) => v,
            Err(BridgeError::Connectivity(msg)) => {
                warn!(class_code, sec_code, param, error = %msg, "poll loop hit a connectivity error, backing off");
                return Some(CONNECTIVITY_BACKOFF);
            }
            Err(e) => {
                warn!(class_code, sec_code, param, error = %e, "poll of parameter failed, continuing");
                return None;
            }
        };

        let parsed: ParamExResponse = match serde_json::from_value(response) {
            Ok(p) => p,
            Err(e) => {
                warn!(class_code, sec_code, param, error = %e, "malformed getParamEx2 response, continuing");
                return None;
            }
        };

        match cache.process(param, &parsed.param_ex, now).await {
            Ok(()) => {
                if let Some((_, last_change_utc)) = cache.get(param).await {
                    self.advance_last_quote_processed(last_change_utc).await;
                }
                None
            }
            Err(BridgeError::Connectivity(msg)) => {
                warn!(class_code, sec_code, param, error = %msg, "parameter cache hit a connectivity error, backing off");
                Some(CONNECTIVITY_BACKOFF)
            }
            Err(e) => {
                warn!(class_code, sec_code, param, error = %e, "parameter decode failed, continuing");
                None
            }
        }
    }

    /// Advances the shared poll-loop timestamp to the max of itself and
    /// `candidate` -- never backward, matching the original's per-parameter
    /// `last_quote_processed_utc` update inside `_params_watch_task`.
    async fn advance_last_quote_processed(&self, candidate: DateTime<Utc>) {
        let mut guard = self.last_quote_processed_utc.write().await;
        *guard = Some(match *guard {
            Some(current) if current >= candidate => current,
            _ => candidate,
        });
    }
}
