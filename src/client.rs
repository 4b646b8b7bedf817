//! The façade client (spec §5).
//!
//! Ties the socket pool, parameter engine, history cache, and event
//! pipeline together behind a three-phase lifecycle: constructed, then
//! initialized (pools live, background tasks running), then shutting down
//! (new operations refuse with [`BridgeError::Cancelled`]). Grounded on the
//! original `QuikLuaClientBase`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Europe::Moscow;
use serde_json::json;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventCallback, EventDispatcher, EventWatcher};
use crate::health::BackgroundTasks;
use crate::history::{Candle, HistoryCache, HistoryKey};
use crate::params::{ParamCache, ParamValue, ParamWatcher};
use crate::poll_task::{ParamCacheMap, PollTask};
use crate::socket_pool::{PoolStats, SocketPool};
use qbridge_wire::{
    DataSourceCreated, DataSourceSize, DataSourceTime, DataSourceTimeFields, DataSourceValue,
    Interval, InfoParamResponse, ParamExResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Constructed,
    Initialized,
    ShuttingDown,
}

/// Either one cadence for every parameter, or one per parameter name.
pub enum PollIntervals {
    Uniform(Duration),
    PerParam(Vec<Duration>),
}

impl PollIntervals {
    fn resolve(&self, n: usize) -> BridgeResult<Vec<Duration>> {
        let resolved = match self {
            PollIntervals::Uniform(d) => vec![*d; n],
            PollIntervals::PerParam(v) => {
                if v.len() != n {
                    return Err(BridgeError::Programming(format!(
                        "interval list has {} entries but {n} param names were given",
                        v.len()
                    )));
                }
                v.clone()
            }
        };
        if resolved.iter().any(|d| d.is_zero()) {
            return Err(BridgeError::Programming(
                "poll interval must be positive".into(),
            ));
        }
        Ok(resolved)
    }
}

/// Snapshot returned by [`BridgeClient::stats`]: pool stats plus a count of
/// what the client is currently tracking.
#[derive(Debug)]
pub struct ClientStats {
    pub rpc_pool: PoolStats,
    pub data_pool: PoolStats,
    pub subscribed_instruments: usize,
    pub subscribed_params: usize,
    pub history_cache_entries: usize,
}

pub struct BridgeClient {
    config: Config,
    state: Mutex<ClientState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    rpc_pool: Arc<SocketPool>,
    data_pool: Arc<SocketPool>,

    watcher: Arc<ParamWatcher>,
    param_caches: Arc<ParamCacheMap>,
    history_caches: Mutex<HashMap<HistoryKey, Arc<HistoryCache>>>,

    last_data_processed_utc: Arc<RwLock<Option<DateTime<Utc>>>>,
    last_quote_processed_utc: Arc<RwLock<Option<DateTime<Utc>>>>,
    last_event_processed_utc: Arc<RwLock<Option<DateTime<Utc>>>>,

    background: Mutex<Option<BackgroundTasks>>,
    event_watcher: Mutex<Option<EventWatcher>>,
    has_event_host: AtomicBool,
}

impl BridgeClient {
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let rpc_pool = Arc::new(SocketPool::with_curve(
            config.rpc_host.clone(),
            config.n_simultaneous_sockets,
            config.socket_timeout,
            config.curve_keys.clone(),
        ));
        let data_pool = if config.data_host.is_some() {
            Arc::new(SocketPool::with_curve(
                config.effective_data_host().to_owned(),
                config.n_simultaneous_sockets,
                config.socket_timeout,
                config.curve_keys.clone(),
            ))
        } else {
            rpc_pool.clone()
        };

        BridgeClient {
            has_event_host: AtomicBool::new(!config.event_host.is_empty()),
            config,
            state: Mutex::new(ClientState::Constructed),
            shutdown_tx,
            shutdown_rx,
            rpc_pool,
            data_pool,
            watcher: Arc::new(ParamWatcher::new()),
            param_caches: Arc::new(Mutex::new(HashMap::new())),
            history_caches: Mutex::new(HashMap::new()),
            last_data_processed_utc: Arc::new(RwLock::new(None)),
            last_quote_processed_utc: Arc::new(RwLock::new(None)),
            last_event_processed_utc: Arc::new(RwLock::new(None)),
            background: Mutex::new(None),
            event_watcher: Mutex::new(None),
        }
    }

    /// Starts the poll task and, if an event host is configured, the event
    /// watcher/dispatcher pair. Calling this twice is a programming error.
    pub async fn initialize(&self, on_event: Option<EventCallback>) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        if *state != ClientState::Constructed {
            return Err(BridgeError::Programming(
                "initialize called more than once".into(),
            ));
        }

        let poll_task = PollTask::new(
            self.rpc_pool.clone(),
            self.watcher.clone(),
            self.param_caches.clone(),
            self.config.params_poll_interval,
            self.last_quote_processed_utc.clone(),
        );
        let poll_shutdown = self.shutdown_rx.clone();
        let poll_handle = tokio::spawn(async move {
            poll_task.run(poll_shutdown).await;
        });

        let dispatcher_handle = if self.has_event_host.load(Ordering::Relaxed) {
            let Some(callback) = on_event else {
                return Err(BridgeError::Programming(
                    "event_host configured but no event callback was supplied".into(),
                ));
            };
            let (tx, rx) = tokio::sync::mpsc::channel(1024);
            let watcher = EventWatcher::spawn(
                self.config.event_host.clone(),
                self.config.event_filter.clone(),
                tx,
            );
            *self.event_watcher.lock().await = Some(watcher);

            let dispatcher = EventDispatcher::new(self.last_event_processed_utc.clone());
            let dispatcher_shutdown = self.shutdown_rx.clone();
            Some(tokio::spawn(async move {
                dispatcher.run(rx, callback, dispatcher_shutdown).await;
            }))
        } else {
            None
        };

        *self.background.lock().await = Some(BackgroundTasks::new(
            poll_handle,
            dispatcher_handle,
            self.shutdown_rx.clone(),
        ));

        *state = ClientState::Initialized;
        info!("bridge client initialized");
        Ok(())
    }

    async fn ensure_usable(&self) -> BridgeResult<()> {
        match *self.state.lock().await {
            ClientState::Constructed => Err(BridgeError::Programming(
                "client used before initialize()".into(),
            )),
            ClientState::ShuttingDown => Err(BridgeError::Cancelled),
            ClientState::Initialized => Ok(()),
        }
    }

    // -- RPC passthrough -----------------------------------------------

    pub async fn rpc_call(
        &self,
        method: &str,
        args: Option<serde_json::Value>,
    ) -> BridgeResult<serde_json::Value> {
        self.ensure_usable().await?;
        self.rpc_pool.call(method, args).await
    }

    pub async fn heartbeat(&self) -> BridgeResult<DateTime<Utc>> {
        self.ensure_usable().await?;
        if let Some(bg) = self.background.lock().await.as_ref() {
            bg.check()?;
        }

        let response = self
            .rpc_pool
            .call("getInfoParam", Some(json!({"param_name": "LASTRECORDTIME"})))
            .await?;
        let parsed: InfoParamResponse = serde_json::from_value(response)?;
        let local_time = chrono::NaiveTime::parse_from_str(&parsed.info_param, "%H:%M:%S")
            .map_err(|e| BridgeError::Generic(format!("bad LASTRECORDTIME: {e}")))?;
        let today: NaiveDate = Utc::now().naive_utc().date();
        let naive = NaiveDateTime::new(today, local_time);
        let moscow_time = Moscow
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| BridgeError::Generic("ambiguous local heartbeat timestamp".into()))?;
        let utc_time = moscow_time.with_timezone(&Utc);
        *self.last_data_processed_utc.write().await = Some(utc_time);
        Ok(utc_time)
    }

    pub async fn last_data_processed_utc(&self) -> Option<DateTime<Utc>> {
        *self.last_data_processed_utc.read().await
    }

    pub async fn last_quote_processed_utc(&self) -> Option<DateTime<Utc>> {
        *self.last_quote_processed_utc.read().await
    }

    pub async fn last_event_processed_utc(&self) -> Option<DateTime<Utc>> {
        *self.last_event_processed_utc.read().await
    }

    // -- Parameters ------------------------------------------------------

    pub async fn params_subscribe(
        &self,
        class_code: &str,
        sec_code: &str,
        intervals: PollIntervals,
        param_names: &[String],
    ) -> BridgeResult<()> {
        self.ensure_usable().await?;
        let resolved = intervals.resolve(param_names.len())?;

        {
            let guard = self.watcher.lock().await;
            for param in param_names {
                if guard.is_subscribed(class_code, sec_code, param) {
                    return Err(BridgeError::Programming(format!(
                        "{class_code}:{sec_code}:{param} is already subscribed"
                    )));
                }
            }
        }

        let cache = Arc::new(ParamCache::new(class_code, sec_code));
        let now = Utc::now();
        for param in param_names {
            self.rpc_pool
                .call(
                    "ParamRequest",
                    Some(json!({"class_code": class_code, "sec_code": sec_code, "db_name": param})),
                )
                .await?;
            let response = self
                .rpc_pool
                .call(
                    "getParamEx2",
                    Some(json!({"class_code": class_code, "sec_code": sec_code, "param_name": param})),
                )
                .await?;
            let parsed: ParamExResponse = serde_json::from_value(response)?;
            cache.process(param, &parsed.param_ex, now).await?;
        }

        {
            let mut guard = self.watcher.lock().await;
            for (param, interval) in param_names.iter().zip(&resolved) {
                guard.subscribe(class_code, sec_code, param, *interval);
            }
        }
        self.param_caches
            .lock()
            .await
            .insert((class_code.to_owned(), sec_code.to_owned()), cache);
        Ok(())
    }

    pub async fn params_unsubscribe(&self, class_code: &str, sec_code: &str) -> BridgeResult<()> {
        self.ensure_usable().await?;
        let key = (class_code.to_owned(), sec_code.to_owned());
        let existed = self.param_caches.lock().await.contains_key(&key);
        if !existed {
            return Ok(());
        }

        let params = {
            let mut guard = self.watcher.lock().await;
            let params = guard.params_for(class_code, sec_code);
            for param in &params {
                guard.unsubscribe(class_code, sec_code, param);
            }
            params
        };

        for param in &params {
            self.rpc_pool
                .call(
                    "CancelParamRequest",
                    Some(json!({"class_code": class_code, "sec_code": sec_code, "param_name": param})),
                )
                .await?;
        }

        self.param_caches.lock().await.remove(&key);
        Ok(())
    }

    pub async fn params_get(
        &self,
        class_code: &str,
        sec_code: &str,
        param_name: &str,
    ) -> BridgeResult<(ParamValue, DateTime<Utc>)> {
        self.ensure_usable().await?;

        if let Some(last_quote) = *self.last_quote_processed_utc.read().await {
            let staleness = Utc::now().signed_duration_since(last_quote);
            if staleness
                > chrono::Duration::from_std(self.config.params_delay_timeout)
                    .unwrap_or(chrono::Duration::MAX)
            {
                return Err(BridgeError::Connectivity(format!(
                    "quote poll loop has been stale for {}s",
                    staleness.num_seconds()
                )));
            }
        }

        let cache = {
            let caches = self.param_caches.lock().await;
            caches
                .get(&(class_code.to_owned(), sec_code.to_owned()))
                .cloned()
        };
        let Some(cache) = cache else {
            return Err(BridgeError::Programming(format!(
                "{class_code}:{sec_code} is not subscribed"
            )));
        };
        cache.get(param_name).await.ok_or_else(|| {
            BridgeError::Programming(format!("{param_name} is not subscribed on {class_code}:{sec_code}"))
        })
    }

    // -- History -----------------------------------------------------------

    async fn history_cache_for(&self, key: &HistoryKey) -> Arc<HistoryCache> {
        let mut caches = self.history_caches.lock().await;
        caches
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(HistoryCache::new(
                    key.clone(),
                    self.config.cache_min_update_interval,
                ))
            })
            .clone()
    }

    /// Closes the server cursor (if any) and drops the cached entry.
    pub async fn clear_price_history_cache(
        &self,
        class_code: &str,
        sec_code: &str,
        interval: Interval,
    ) {
        let key = HistoryKey::new(class_code, sec_code, interval);
        let cache = self.history_caches.lock().await.remove(&key);
        if let Some(cache) = cache {
            let uuid = cache.lock().await.datasource_uuid().map(str::to_owned);
            if let Some(uuid) = uuid {
                if let Err(e) = self
                    .rpc_pool
                    .call("datasource.Close", Some(json!({"datasource_uuid": uuid})))
                    .await
                {
                    warn!(error = %e, "failed to close a datasource cursor while clearing its cache");
                }
            }
        }
    }

    /// `class_code`/`sec_code`/`interval` identify the instrument and bar
    /// size; `use_caching` selects between the client's persistent cache
    /// for this key and a scratch one discarded at the end of this call;
    /// `copy` is accepted for API parity with the original (every value
    /// this returns is already an owned `Vec<Candle>`, so both branches are
    /// equivalent in Rust); `date_from` seeds the walk's stop point only
    /// when the selected cache has no prior bars yet.
    pub async fn get_price_history(
        &self,
        class_code: &str,
        sec_code: &str,
        interval: Interval,
        use_caching: bool,
        copy: bool,
        date_from: NaiveDateTime,
    ) -> BridgeResult<Vec<Candle>> {
        let _ = copy;
        self.ensure_usable().await?;
        let key = HistoryKey::new(class_code, sec_code, interval);
        let cache = if use_caching {
            self.history_cache_for(&key).await
        } else {
            Arc::new(HistoryCache::new(
                key.clone(),
                self.config.cache_min_update_interval,
            ))
        };
        let mut state = cache.lock().await;

        if !state.needs_refresh(cache.min_refresh()) {
            return Ok(state.all());
        }

        let datasource_uuid = match state.datasource_uuid() {
            Some(uuid) => uuid.to_owned(),
            None => {
                let response = self
                    .data_pool
                    .call(
                        "datasource.CreateDataSource",
                        Some(json!({
                            "class_code": class_code,
                            "sec_code": sec_code,
                            "interval": interval,
                            "param": "",
                        })),
                    )
                    .await?;
                let created: DataSourceCreated = serde_json::from_value(response)?;
                state.set_datasource_uuid(Some(created.datasource_uuid.clone()));
                created.datasource_uuid
            }
        };

        let backfill_deadline = Instant::now() + self.config.history_backfill_interval;
        let size = loop {
            if *self.shutdown_rx.borrow() {
                return Err(BridgeError::Cancelled);
            }
            let response = self
                .data_pool
                .call(
                    "datasource.Size",
                    Some(json!({"datasource_uuid": datasource_uuid})),
                )
                .await?;
            let size: DataSourceSize = serde_json::from_value(response)?;
            if size.value > 0 {
                break size.value;
            }
            if Instant::now() >= backfill_deadline {
                if state.len() == 0 {
                    return Err(BridgeError::NoHistory(format!(
                        "{class_code}:{sec_code}:{interval} returned no bars within {:?}",
                        self.config.history_backfill_interval
                    )));
                }
                break 0;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        };

        if size > 0 {
            let last_known = state.last_bar_ts().unwrap_or(date_from);
            let mut fresh = Vec::new();
            let mut idx = size;
            while idx >= 1 {
                if *self.shutdown_rx.borrow() {
                    return Err(BridgeError::Cancelled);
                }
                let t_response = self
                    .data_pool
                    .call(
                        "datasource.T",
                        Some(json!({"datasource_uuid": datasource_uuid, "candle_index": idx})),
                    )
                    .await?;
                let t: DataSourceTime = serde_json::from_value(t_response)?;
                let ts = fields_to_naive(&t.time)?;
                if ts <= last_known {
                    break;
                }
                let candle = self.fetch_ohlcv(&datasource_uuid, idx, ts).await?;
                fresh.push(candle);
                idx -= 1;
            }
            state.merge(fresh);
        }

        if !use_caching {
            if let Err(e) = self
                .data_pool
                .call(
                    "datasource.Close",
                    Some(json!({"datasource_uuid": datasource_uuid})),
                )
                .await
            {
                warn!(error = %e, "failed to close a non-caching datasource cursor");
            }
        }

        Ok(state.all())
    }

    async fn fetch_ohlcv_field(
        &self,
        datasource_uuid: &str,
        bar_index: i64,
        field: &'static str,
    ) -> BridgeResult<f64> {
        let response = self
            .data_pool
            .call(
                &format!("datasource.{field}"),
                Some(json!({"datasource_uuid": datasource_uuid, "candle_index": bar_index})),
            )
            .await?;
        let value: DataSourceValue = serde_json::from_value(response)?;
        Ok(value.value)
    }

    async fn fetch_ohlcv(
        &self,
        datasource_uuid: &str,
        bar_index: i64,
        ts: NaiveDateTime,
    ) -> BridgeResult<Candle> {
        let open = self.fetch_ohlcv_field(datasource_uuid, bar_index, "O").await?;
        let high = self.fetch_ohlcv_field(datasource_uuid, bar_index, "H").await?;
        let low = self.fetch_ohlcv_field(datasource_uuid, bar_index, "L").await?;
        let close = self.fetch_ohlcv_field(datasource_uuid, bar_index, "C").await?;
        let volume = self.fetch_ohlcv_field(datasource_uuid, bar_index, "V").await?;
        Ok(Candle {
            ts,
            open,
            high,
            low,
            close,
            volume,
        })
    }

    // -- Stats & shutdown ----------------------------------------------

    /// Pool stats for both sockets, plus how many instruments/parameters
    /// are currently being tracked.
    pub async fn stats(&self) -> ClientStats {
        ClientStats {
            rpc_pool: self.rpc_pool.stats(),
            data_pool: self.data_pool.stats(),
            subscribed_instruments: self.param_caches.lock().await.len(),
            subscribed_params: self.watcher.lock().await.count(),
            history_cache_entries: self.history_caches.lock().await.len(),
        }
    }

    pub fn stats_reset(&self) {
        self.rpc_pool.stats_reset();
        self.data_pool.stats_reset();
    }

    /// Idempotent. Closes every open history cursor and every active
    /// parameter subscription before tearing down background tasks.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        {
            let mut state = self.state.lock().await;
            if *state == ClientState::ShuttingDown {
                return Ok(());
            }
            *state = ClientState::ShuttingDown;
        }
        let _ = self.shutdown_tx.send(true);

        let datasource_uuids: Vec<String> = {
            let caches = self.history_caches.lock().await;
            let mut uuids = Vec::new();
            for cache in caches.values() {
                if let Some(uuid) = cache.lock().await.datasource_uuid() {
                    uuids.push(uuid.to_owned());
                }
            }
            uuids
        };
        for uuid in datasource_uuids {
            if let Err(e) = self
                .rpc_pool
                .call("datasource.Close", Some(json!({"datasource_uuid": uuid})))
                .await
            {
                warn!(error = %e, "failed to close a datasource cursor during shutdown");
            }
        }

        let subscriptions: Vec<(String, String)> =
            self.param_caches.lock().await.keys().cloned().collect();
        for (class_code, sec_code) in subscriptions {
            let params = {
                let mut guard = self.watcher.lock().await;
                let params = guard.params_for(&class_code, &sec_code);
                for param in &params {
                    guard.unsubscribe(&class_code, &sec_code, param);
                }
                params
            };
            for param in params {
                if let Err(e) = self
                    .rpc_pool
                    .call(
                        "CancelParamRequest",
                        Some(json!({"class_code": class_code, "sec_code": sec_code, "param_name": param})),
                    )
                    .await
                {
                    warn!(error = %e, "failed to cancel a parameter subscription during shutdown");
                }
            }
        }
        self.param_caches.lock().await.clear();
        *self.event_watcher.lock().await = None;
        info!("bridge client shut down");
        Ok(())
    }
}

fn fields_to_naive(fields: &DataSourceTimeFields) -> BridgeResult<NaiveDateTime> {
    let date = NaiveDate::from_ymd_opt(fields.year, fields.month, fields.day)
        .ok_or_else(|| BridgeError::Generic("invalid bar date".into()))?;
    let time = chrono::NaiveTime::from_hms_milli_opt(fields.hour, fields.min, fields.sec, fields.ms)
        .ok_or_else(|| BridgeError::Generic("invalid bar time".into()))?;
    Ok(NaiveDateTime::new(date, time))
}
