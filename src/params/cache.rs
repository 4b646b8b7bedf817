//! Per-instrument parameter cache (spec §4.2).
//!
//! One [`ParamCache`] per `(class_code, sec_code)`, decoding `getParamEx2`
//! replies by `param_type` and tracking, per parameter, the last value and
//! the instant it last changed. Grounded on the original client's
//! `_params_watch_task` decode table.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::sync::RwLock;

use crate::error::{BridgeError, BridgeResult};
use qbridge_wire::ParamEx;

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Numeric(f64),
    /// A numeric (type 1/2) parameter whose `param_value` came back empty --
    /// distinct from [`ParamValue::Absent`], which covers text/time/date.
    NumericMissing,
    Text(String),
    Time(NaiveTime),
    Date(NaiveDate),
    Absent,
}

#[derive(Debug, Clone)]
struct Entry {
    value: ParamValue,
    last_change_utc: DateTime<Utc>,
}

pub struct ParamCache {
    class_code: String,
    sec_code: String,
    entries: RwLock<HashMap<String, Entry>>,
}

impl ParamCache {
    pub fn new(class_code: impl Into<String>, sec_code: impl Into<String>) -> Self {
        ParamCache {
            class_code: class_code.into(),
            sec_code: sec_code.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn class_code(&self) -> &str {
        &self.class_code
    }

    pub fn sec_code(&self) -> &str {
        &self.sec_code
    }

    /// Decode one `getParamEx2` reply and merge it in. `now` is the poll
    /// tick's timestamp, used for `last_change_utc` when the value moved.
    pub async fn process(
        &self,
        param_name: &str,
        ex: &ParamEx,
        now: DateTime<Utc>,
    ) -> BridgeResult<()> {
        let had_prior_value = {
            let entries = self.entries.read().await;
            entries.contains_key(param_name)
        };

        if ex.result != "1" {
            if had_prior_value {
                return Err(BridgeError::Connectivity(format!(
                    "{}:{}:{param_name} stopped returning a valid value (result={})",
                    self.class_code, self.sec_code, ex.result
                )));
            }
            return Err(BridgeError::Generic(format!(
                "{}:{}:{param_name} never returned a valid value (result={})",
                self.class_code, self.sec_code, ex.result
            )));
        }

        let value = decode_value(ex)?;

        let mut entries = self.entries.write().await;
        let changed = entries
            .get(param_name)
            .map(|prior| prior.value != value)
            .unwrap_or(true);
        let last_change_utc = if changed {
            now
        } else {
            entries
                .get(param_name)
                .map(|prior| prior.last_change_utc)
                .unwrap_or(now)
        };
        entries.insert(
            param_name.to_owned(),
            Entry {
                value,
                last_change_utc,
            },
        );
        Ok(())
    }

    pub async fn get(&self, param_name: &str) -> Option<(ParamValue, DateTime<Utc>)> {
        let entries = self.entries.read().await;
        entries
            .get(param_name)
            .map(|e| (e.value.clone(), e.last_change_utc))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn decode_value(ex: &ParamEx) -> BridgeResult<ParamValue> {
    match ex.param_type.as_str() {
        "1" | "2" => {
            let raw = ex.param_value.trim();
            if raw.is_empty() {
                return Ok(ParamValue::NumericMissing);
            }
            raw.parse::<f64>()
                .map(ParamValue::Numeric)
                .map_err(|_| BridgeError::Generic(format!("not a number: {raw:?}")))
        }
        "3" | "4" => Ok(ParamValue::Text(ex.param_image.clone())),
        "5" => {
            let raw = ex.param_image.trim();
            if raw.is_empty() {
                return Ok(ParamValue::Absent);
            }
            NaiveTime::parse_from_str(raw, "%H:%M:%S")
                .map(ParamValue::Time)
                .map_err(|_| BridgeError::Generic(format!("not a time: {raw:?}")))
        }
        "6" => {
            let raw = ex.param_image.trim();
            if raw.is_empty() {
                return Ok(ParamValue::Absent);
            }
            NaiveDate::parse_from_str(raw, "%d.%m.%Y")
                .map(ParamValue::Date)
                .map_err(|_| BridgeError::Generic(format!("not a date: {raw:?}")))
        }
        other => Err(BridgeError::Generic(format!(
            "unrecognized param_type: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ex(param_type: &str, result: &str, value: &str) -> ParamEx {
        ParamEx {
            param_type: param_type.into(),
            result: result.into(),
            param_image: value.into(),
            param_value: value.into(),
        }
    }

    fn ex_split(param_type: &str, result: &str, image: &str, value: &str) -> ParamEx {
        ParamEx {
            param_type: param_type.into(),
            result: result.into(),
            param_image: image.into(),
            param_value: value.into(),
        }
    }

    #[tokio::test]
    async fn numeric_param_decodes_and_records_change() {
        let cache = ParamCache::new("SPBFUT", "SiZ5");
        let t0 = Utc::now();
        cache.process("LAST", &ex("2", "1", "123.45"), t0).await.unwrap();
        let (value, changed_at) = cache.get("LAST").await.unwrap();
        assert_eq!(value, ParamValue::Numeric(123.45));
        assert_eq!(changed_at, t0);
    }

    #[tokio::test]
    async fn unchanged_value_keeps_original_change_timestamp() {
        let cache = ParamCache::new("SPBFUT", "SiZ5");
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);
        cache.process("LAST", &ex("2", "1", "100"), t0).await.unwrap();
        cache.process("LAST", &ex("2", "1", "100"), t1).await.unwrap();
        let (_, changed_at) = cache.get("LAST").await.unwrap();
        assert_eq!(changed_at, t0);
    }

    #[tokio::test]
    async fn failing_result_on_fresh_param_is_generic_error() {
        let cache = ParamCache::new("SPBFUT", "SiZ5");
        let err = cache
            .process("LAST", &ex("2", "0", ""), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Generic(_)));
    }

    #[tokio::test]
    async fn failing_result_after_prior_success_is_connectivity_error() {
        let cache = ParamCache::new("SPBFUT", "SiZ5");
        cache.process("LAST", &ex("2", "1", "100"), Utc::now()).await.unwrap();
        let err = cache
            .process("LAST", &ex("2", "0", ""), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Connectivity(_)));
    }

    #[tokio::test]
    async fn time_and_date_params_decode() {
        let cache = ParamCache::new("SPBFUT", "SiZ5");
        cache
            .process("LASTCHANGETIME", &ex("5", "1", "14:30:00"), Utc::now())
            .await
            .unwrap();
        cache
            .process("LASTCHANGEDATE", &ex("6", "1", "31.07.2026"), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            cache.get("LASTCHANGETIME").await.unwrap().0,
            ParamValue::Time(NaiveTime::from_hms_opt(14, 30, 0).unwrap())
        );
        assert_eq!(
            cache.get("LASTCHANGEDATE").await.unwrap().0,
            ParamValue::Date(NaiveDate::from_ymd_opt(2026, 7, 31).unwrap())
        );
    }

    #[tokio::test]
    async fn empty_value_is_absent_not_an_error() {
        let cache = ParamCache::new("SPBFUT", "SiZ5");
        cache.process("LASTCHANGETIME", &ex("5", "1", ""), Utc::now()).await.unwrap();
        assert_eq!(cache.get("LASTCHANGETIME").await.unwrap().0, ParamValue::Absent);
    }

    #[tokio::test]
    async fn empty_numeric_value_is_numeric_missing_not_absent() {
        let cache = ParamCache::new("SPBFUT", "SiZ5");
        cache.process("LAST", &ex("2", "1", ""), Utc::now()).await.unwrap();
        assert_eq!(cache.get("LAST").await.unwrap().0, ParamValue::NumericMissing);
    }

    #[tokio::test]
    async fn numeric_param_decodes_from_param_value_not_param_image() {
        let cache = ParamCache::new("SPBFUT", "SiZ5");
        cache
            .process("LAST", &ex_split("2", "1", "152 420", "152420.000000"), Utc::now())
            .await
            .unwrap();
        assert_eq!(cache.get("LAST").await.unwrap().0, ParamValue::Numeric(152_420.0));
    }

    #[tokio::test]
    async fn text_param_decodes_from_param_image_not_param_value() {
        let cache = ParamCache::new("SPBFUT", "SiZ5");
        cache
            .process("SHORTNAME", &ex_split("3", "1", "Si-9.26", "SiU6"), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            cache.get("SHORTNAME").await.unwrap().0,
            ParamValue::Text("Si-9.26".to_owned())
        );
    }

    #[tokio::test]
    async fn unrecognized_param_type_is_generic_error() {
        let cache = ParamCache::new("SPBFUT", "SiZ5");
        let err = cache
            .process("LAST", &ex("9", "1", "1"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Generic(_)));
    }
}
