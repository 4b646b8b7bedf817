//! Typed configuration for [`crate::BridgeClient`] (spec §6).
//!
//! Mirrors the teacher's raw-then-typed config split: callers build a
//! [`Config`] through [`ConfigBuilder`], which applies the same defaults and
//! validation the original terminal bridge enforced, then hands back an
//! immutable, cheaply-clonable value the rest of the crate consumes.

use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};

/// CURVE keypair used to authenticate against the terminal's sockets.
#[derive(Debug, Clone)]
pub struct CurveKeys {
    pub server_public_key: [u8; 32],
    pub client_public_key: [u8; 32],
    pub client_secret_key: [u8; 32],
}

/// Which events to forward to the dispatcher, and how.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Empty means "forward everything".
    pub event_list: Vec<String>,
}

impl EventFilter {
    pub fn allows(&self, header: &str) -> bool {
        self.event_list.is_empty()
            || self
                .event_list
                .iter()
                .any(|e| e.eq_ignore_ascii_case(header))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_host: String,
    pub data_host: Option<String>,
    pub event_host: String,
    pub event_filter: EventFilter,
    pub socket_timeout: Duration,
    pub n_simultaneous_sockets: usize,
    pub history_backfill_interval: Duration,
    pub cache_min_update_interval: Duration,
    pub params_poll_interval: Duration,
    pub params_delay_timeout: Duration,
    pub curve_keys: Option<CurveKeys>,
    pub verbosity: tracing::Level,
}

impl Config {
    pub fn builder(rpc_host: impl Into<String>, event_host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(rpc_host, event_host)
    }

    /// Endpoint used for the blocking-data RPC pool, falling back to the
    /// main RPC host when no dedicated data host was configured.
    pub fn effective_data_host(&self) -> &str {
        self.data_host.as_deref().unwrap_or(&self.rpc_host)
    }
}

pub struct ConfigBuilder {
    rpc_host: String,
    data_host: Option<String>,
    event_host: String,
    event_list: Vec<String>,
    socket_timeout_ms: u64,
    n_simultaneous_sockets: usize,
    history_backfill_interval_sec: f64,
    cache_min_update_sec: f64,
    params_poll_interval_sec: f64,
    params_delay_timeout_sec: f64,
    curve_keys: Option<CurveKeys>,
    verbosity: tracing::Level,
}

/// Only loopback terminals are in scope; refusing anything else here is
/// cheaper than diagnosing a CURVE handshake failure against a LAN host.
fn is_loopback_host(host: &str) -> bool {
    let bare = host
        .strip_prefix("tcp://")
        .unwrap_or(host)
        .split(':')
        .next()
        .unwrap_or(host);
    bare == "127.0.0.1" || bare == "localhost"
}

impl ConfigBuilder {
    pub fn new(rpc_host: impl Into<String>, event_host: impl Into<String>) -> Self {
        ConfigBuilder {
            rpc_host: rpc_host.into(),
            data_host: None,
            event_host: event_host.into(),
            event_list: Vec::new(),
            socket_timeout_ms: 100,
            n_simultaneous_sockets: 5,
            history_backfill_interval_sec: 10.0,
            cache_min_update_sec: 0.2,
            params_poll_interval_sec: 0.1,
            params_delay_timeout_sec: 60.0,
            curve_keys: None,
            verbosity: tracing::Level::INFO,
        }
    }

    pub fn data_host(mut self, host: impl Into<String>) -> Self {
        self.data_host = Some(host.into());
        self
    }

    pub fn event_list(mut self, events: Vec<String>) -> Self {
        self.event_list = events;
        self
    }

    pub fn socket_timeout_ms(mut self, ms: u64) -> Self {
        self.socket_timeout_ms = ms;
        self
    }

    pub fn n_simultaneous_sockets(mut self, n: usize) -> Self {
        self.n_simultaneous_sockets = n;
        self
    }

    pub fn history_backfill_interval_sec(mut self, secs: f64) -> Self {
        self.history_backfill_interval_sec = secs;
        self
    }

    pub fn cache_min_update_sec(mut self, secs: f64) -> Self {
        self.cache_min_update_sec = secs;
        self
    }

    pub fn params_poll_interval_sec(mut self, secs: f64) -> Self {
        self.params_poll_interval_sec = secs;
        self
    }

    pub fn params_delay_timeout_sec(mut self, secs: f64) -> Self {
        self.params_delay_timeout_sec = secs;
        self
    }

    pub fn curve_keys(mut self, keys: CurveKeys) -> Self {
        self.curve_keys = Some(keys);
        self
    }

    pub fn verbosity(mut self, level: tracing::Level) -> Self {
        self.verbosity = level;
        self
    }

    pub fn build(self) -> BridgeResult<Config> {
        if !is_loopback_host(&self.rpc_host) {
            return Err(BridgeError::Programming(format!(
                "rpc_host must be 127.0.0.1 or localhost, got {:?}",
                self.rpc_host
            )));
        }
        if let Some(data_host) = &self.data_host {
            if !is_loopback_host(data_host) {
                return Err(BridgeError::Programming(format!(
                    "data_host must be 127.0.0.1 or localhost, got {data_host:?}"
                )));
            }
        }
        if self.n_simultaneous_sockets == 0 {
            return Err(BridgeError::Programming(
                "n_simultaneous_sockets must be at least 1".into(),
            ));
        }

        Ok(Config {
            rpc_host: self.rpc_host,
            data_host: self.data_host,
            event_host: self.event_host,
            event_filter: EventFilter {
                event_list: self.event_list,
            },
            socket_timeout: Duration::from_millis(self.socket_timeout_ms),
            n_simultaneous_sockets: self.n_simultaneous_sockets,
            history_backfill_interval: Duration::from_secs_f64(
                self.history_backfill_interval_sec,
            ),
            cache_min_update_interval: Duration::from_secs_f64(self.cache_min_update_sec),
            params_poll_interval: Duration::from_secs_f64(self.params_poll_interval_sec),
            params_delay_timeout: Duration::from_secs_f64(self.params_delay_timeout_sec),
            curve_keys: self.curve_keys,
            verbosity: self.verbosity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_loopback_rpc_host() {
        let err = Config::builder("tcp://10.0.0.5:5560", "tcp://127.0.0.1:5561")
            .build()
            .unwrap_err();
        assert!(matches!(err, BridgeError::Programming(_)));
    }

    #[test]
    fn accepts_localhost_alias() {
        let cfg = Config::builder("tcp://localhost:5560", "tcp://127.0.0.1:5561")
            .build()
            .unwrap();
        assert_eq!(cfg.effective_data_host(), "tcp://localhost:5560");
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::builder("tcp://127.0.0.1:5560", "tcp://127.0.0.1:5561")
            .build()
            .unwrap();
        assert_eq!(cfg.n_simultaneous_sockets, 5);
        assert_eq!(cfg.socket_timeout, Duration::from_millis(100));
        assert_eq!(cfg.params_poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn event_filter_empty_list_allows_everything() {
        let filter = EventFilter::default();
        assert!(filter.allows("OnTrade"));
    }

    #[test]
    fn event_filter_is_case_insensitive() {
        let filter = EventFilter {
            event_list: vec!["OnTrade".into()],
        };
        assert!(filter.allows("ontrade"));
        assert!(!filter.allows("OnOrder"));
    }
}
