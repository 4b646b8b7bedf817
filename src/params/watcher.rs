//! Poll-schedule bookkeeping for subscribed parameters (spec §4.1, §4.3).
//!
//! Tracks, per `(class_code, sec_code, lowercased param name)`, when it was
//! last polled and at what cadence, so the background poll task can compute
//! which subscriptions are due without re-deriving state from the caches
//! themselves. Exposed only through [`ParamWatcher::lock`] so callers (the
//! subscribe/unsubscribe RPCs and the poll task) can hold the guard across a
//! multi-step batch exactly like the original client's `asyncio.Lock`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

/// Identifies one subscribed parameter.
pub type WatchKey = (String, String, String);

struct Row {
    interval: Duration,
    last_polled: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct ParamWatcher {
    inner: Mutex<HashMap<WatchKey, Row>>,
}

impl ParamWatcher {
    pub fn new() -> Self {
        ParamWatcher::default()
    }

    pub async fn lock(&self) -> ParamWatcherGuard<'_> {
        ParamWatcherGuard(self.inner.lock().await)
    }
}

pub struct ParamWatcherGuard<'a>(MutexGuard<'a, HashMap<WatchKey, Row>>);

fn normalize(class_code: &str, sec_code: &str, param: &str) -> WatchKey {
    (
        class_code.to_owned(),
        sec_code.to_owned(),
        param.to_ascii_lowercase(),
    )
}

impl ParamWatcherGuard<'_> {
    /// Register (or re-register) a subscription. Re-subscribing overwrites
    /// the cadence and resets the last-polled timestamp, so it is
    /// immediately due regardless of its prior state.
    pub fn subscribe(&mut self, class_code: &str, sec_code: &str, param: &str, interval: Duration) {
        let key = normalize(class_code, sec_code, param);
        self.0.insert(
            key,
            Row {
                interval,
                last_polled: None,
            },
        );
    }

    pub fn unsubscribe(&mut self, class_code: &str, sec_code: &str, param: &str) {
        self.0.remove(&normalize(class_code, sec_code, param));
    }

    pub fn is_subscribed(&self, class_code: &str, sec_code: &str, param: &str) -> bool {
        self.0.contains_key(&normalize(class_code, sec_code, param))
    }

    /// Every currently subscribed parameter name for one instrument.
    pub fn params_for(&self, class_code: &str, sec_code: &str) -> Vec<String> {
        self.0
            .keys()
            .filter(|(c, s, _)| c == class_code && s == sec_code)
            .map(|(_, _, p)| p.clone())
            .collect()
    }

    /// Subscriptions whose cadence has elapsed as of `now`.
    pub fn due_candidates(&self, now: DateTime<Utc>) -> Vec<WatchKey> {
        self.0
            .iter()
            .filter(|(_, row)| match row.last_polled {
                None => true,
                Some(last) => {
                    now.signed_duration_since(last)
                        >= chrono::Duration::from_std(row.interval).unwrap_or_default()
                }
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn mark_polled(&mut self, keys: &[WatchKey], now: DateTime<Utc>) {
        for key in keys {
            if let Some(row) = self.0.get_mut(key) {
                row.last_polled = Some(now);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_subscription_is_immediately_due() {
        let watcher = ParamWatcher::new();
        let mut guard = watcher.lock().await;
        guard.subscribe("SPBFUT", "SiZ5", "LAST", Duration::from_millis(100));
        assert_eq!(guard.due_candidates(Utc::now()).len(), 1);
    }

    #[tokio::test]
    async fn marking_polled_removes_it_from_due_until_interval_elapses() {
        let watcher = ParamWatcher::new();
        let mut guard = watcher.lock().await;
        guard.subscribe("SPBFUT", "SiZ5", "LAST", Duration::from_secs(60));
        let now = Utc::now();
        let due = guard.due_candidates(now);
        guard.mark_polled(&due, now);
        assert!(guard.due_candidates(now).is_empty());
    }

    #[tokio::test]
    async fn param_lookup_is_case_insensitive() {
        let watcher = ParamWatcher::new();
        let mut guard = watcher.lock().await;
        guard.subscribe("SPBFUT", "SiZ5", "LAST", Duration::from_millis(100));
        assert!(guard.is_subscribed("SPBFUT", "SiZ5", "last"));
    }

    #[tokio::test]
    async fn resubscribing_resets_the_last_polled_timestamp() {
        let watcher = ParamWatcher::new();
        let mut guard = watcher.lock().await;
        guard.subscribe("SPBFUT", "SiZ5", "LAST", Duration::from_secs(60));
        let now = Utc::now();
        let due = guard.due_candidates(now);
        guard.mark_polled(&due, now);
        assert!(guard.due_candidates(now).is_empty());

        guard.subscribe("SPBFUT", "SiZ5", "LAST", Duration::from_secs(60));
        assert_eq!(guard.due_candidates(now).len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_row() {
        let watcher = ParamWatcher::new();
        let mut guard = watcher.lock().await;
        guard.subscribe("SPBFUT", "SiZ5", "LAST", Duration::from_millis(100));
        guard.unsubscribe("SPBFUT", "SiZ5", "last");
        assert_eq!(guard.count(), 0);
    }

    #[tokio::test]
    async fn params_for_lists_only_that_instrument() {
        let watcher = ParamWatcher::new();
        let mut guard = watcher.lock().await;
        guard.subscribe("SPBFUT", "SiZ5", "LAST", Duration::from_millis(100));
        guard.subscribe("SPBFUT", "SiZ5", "BID", Duration::from_millis(100));
        guard.subscribe("SPBFUT", "RIZ5", "LAST", Duration::from_millis(100));
        let mut params = guard.params_for("SPBFUT", "SiZ5");
        params.sort();
        assert_eq!(params, vec!["bid".to_owned(), "last".to_owned()]);
    }
}
