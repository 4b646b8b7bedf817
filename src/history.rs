//! Historical candle cache (spec §4.4).
//!
//! One [`HistoryCache`] per `(class_code, sec_code, interval)`. A refresh
//! walks a freshly created upstream datasource from its newest bar backward,
//! stopping as soon as it reaches a bar already known, then merges the new
//! bars into the cached series (new data wins on a timestamp collision).
//! Grounded on the original client's `HistoryCache.process_history` /
//! `can_update` and the backfill-wait loop in `get_price_history`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::{Mutex, MutexGuard};

use qbridge_wire::Interval;

/// Default `date_from` for [`crate::BridgeClient::get_price_history`] when
/// the caller has no earlier bound in mind -- matches the original client's
/// sentinel of 1900-01-01.
pub fn default_date_from() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .expect("1900-01-01 is a valid date")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Candle {
    pub ts: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct HistoryKey {
    pub class_code: String,
    pub sec_code: String,
    pub interval: Interval,
}

impl HistoryKey {
    pub fn new(class_code: impl Into<String>, sec_code: impl Into<String>, interval: Interval) -> Self {
        HistoryKey {
            class_code: class_code.into(),
            sec_code: sec_code.into(),
            interval,
        }
    }
}

pub struct HistoryState {
    candles: BTreeMap<NaiveDateTime, Candle>,
    datasource_uuid: Option<String>,
    last_refresh: Option<Instant>,
}

impl HistoryState {
    /// Merge freshly fetched bars in; on a timestamp collision the new
    /// batch's values replace the cached ones.
    pub fn merge(&mut self, fresh: impl IntoIterator<Item = Candle>) {
        for candle in fresh {
            self.candles.insert(candle.ts, candle);
        }
        self.last_refresh = Some(Instant::now());
    }

    pub fn last_bar_ts(&self) -> Option<NaiveDateTime> {
        self.candles.keys().next_back().copied()
    }

    /// Ascending by timestamp, the last `n` bars (or fewer if the cache has
    /// fewer than `n`).
    pub fn tail(&self, n: usize) -> Vec<Candle> {
        let len = self.candles.len();
        self.candles
            .values()
            .skip(len.saturating_sub(n))
            .copied()
            .collect()
    }

    /// The whole cached series, ascending by timestamp.
    pub fn all(&self) -> Vec<Candle> {
        self.candles.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn datasource_uuid(&self) -> Option<&str> {
        self.datasource_uuid.as_deref()
    }

    pub fn set_datasource_uuid(&mut self, uuid: Option<String>) {
        self.datasource_uuid = uuid;
    }

    pub fn clear(&mut self) {
        self.candles.clear();
        self.datasource_uuid = None;
        self.last_refresh = None;
    }

    /// Whether enough time has passed since the last successful refresh to
    /// justify another round-trip to the terminal. Takes the same
    /// `min_refresh` budget as [`HistoryCache::can_update`] -- use this
    /// variant when already holding the state guard, since `can_update`
    /// would deadlock trying to re-acquire it.
    pub fn needs_refresh(&self, min_refresh: Duration) -> bool {
        match self.last_refresh {
            None => true,
            Some(t) => t.elapsed() >= min_refresh,
        }
    }
}

pub struct HistoryCache {
    key: HistoryKey,
    min_refresh: Duration,
    state: Mutex<HistoryState>,
}

impl HistoryCache {
    pub fn new(key: HistoryKey, min_refresh: Duration) -> Self {
        HistoryCache {
            key,
            min_refresh,
            state: Mutex::new(HistoryState {
                candles: BTreeMap::new(),
                datasource_uuid: None,
                last_refresh: None,
            }),
        }
    }

    pub fn key(&self) -> &HistoryKey {
        &self.key
    }

    /// Serializes the whole refresh protocol for this key: holding the
    /// guard across the upstream RPC round-trip is deliberate, matching the
    /// original `async with cache.lock:` scope.
    pub async fn lock(&self) -> MutexGuard<'_, HistoryState> {
        self.state.lock().await
    }

    /// Whether enough time has passed since the last successful refresh to
    /// justify another round-trip to the terminal. Do not call this while
    /// already holding a guard from [`Self::lock`] -- see
    /// [`HistoryState::needs_refresh`] for that case.
    pub async fn can_update(&self) -> bool {
        let state = self.state.lock().await;
        state.needs_refresh(self.min_refresh)
    }

    pub fn min_refresh(&self) -> Duration {
        self.min_refresh
    }
}
