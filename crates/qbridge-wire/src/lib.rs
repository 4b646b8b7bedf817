// qbridge-wire: wire envelope and shared types for the RPC/EVENTS bridge.
//
// The RPC envelope is not tagged the way a typical internal protocol would
// be -- it is dictated by the upstream terminal (see bridge spec, "Wire
// envelope"). Requests are `{method, args?}`; replies are either
// `{"result": {...}}` (success, unless `result.is_error`) or `{"error": {...}}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// RPC envelope
// ---------------------------------------------------------------------------

/// An outbound RPC request: `{"method": ..., "args": {...}}`.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, args: Option<serde_json::Value>) -> Self {
        RpcRequest {
            method: method.into(),
            args,
        }
    }
}

/// A decoded RPC reply.
///
/// A reply is successful iff `result` is present and `result.is_error` is
/// falsy. Anything else (`error` present, or `result.is_error == true`) is a
/// structured server-side rejection.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcReply {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl RpcReply {
    /// `true` iff this reply carries a successful `result`.
    pub fn is_success(&self) -> bool {
        match &self.result {
            Some(r) => !truthy(r.get("is_error")),
            None => false,
        }
    }
}

fn truthy(v: Option<&serde_json::Value>) -> bool {
    match v {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        Some(serde_json::Value::String(s)) => !s.is_empty() && s != "0",
        Some(_) => true,
    }
}

// ---------------------------------------------------------------------------
// getParamEx2
// ---------------------------------------------------------------------------

/// Body of the `param_ex` field returned by `getParamEx2`.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamEx {
    pub param_type: String,
    pub result: String,
    #[serde(default)]
    pub param_image: String,
    #[serde(default)]
    pub param_value: String,
}

/// Full `getParamEx2` response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamExResponse {
    pub param_ex: ParamEx,
}

// ---------------------------------------------------------------------------
// datasource.* responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceCreated {
    pub datasource_uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceSize {
    pub value: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceValue {
    pub value: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceTimeFields {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub min: u32,
    pub sec: u32,
    pub ms: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceTime {
    pub time: DataSourceTimeFields,
}

// ---------------------------------------------------------------------------
// getInfoParam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct InfoParamResponse {
    pub info_param: String,
}

// ---------------------------------------------------------------------------
// Event frames
// ---------------------------------------------------------------------------

/// Sentinel event headers that indicate server-side transport teardown
/// rather than an actual application event.
pub const TEARDOWN_HEADERS: [&str; 3] = ["OnDisconnected", "OnStop", "OnClose"];

pub fn is_teardown_header(header: &str) -> bool {
    TEARDOWN_HEADERS.contains(&header)
}

// ---------------------------------------------------------------------------
// Interval vocabulary
// ---------------------------------------------------------------------------

/// Candle interval, as named by the upstream `INTERVAL_*` vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    Tick,
    M1,
    M2,
    M3,
    M4,
    M5,
    M6,
    M10,
    M15,
    M30,
    H1,
    H2,
    H4,
    D1,
    W1,
    Mn1,
}

impl Interval {
    pub fn as_wire_str(self) -> &'static str {
        match self {
            Interval::Tick => "INTERVAL_TICK",
            Interval::M1 => "INTERVAL_M1",
            Interval::M2 => "INTERVAL_M2",
            Interval::M3 => "INTERVAL_M3",
            Interval::M4 => "INTERVAL_M4",
            Interval::M5 => "INTERVAL_M5",
            Interval::M6 => "INTERVAL_M6",
            Interval::M10 => "INTERVAL_M10",
            Interval::M15 => "INTERVAL_M15",
            Interval::M30 => "INTERVAL_M30",
            Interval::H1 => "INTERVAL_H1",
            Interval::H2 => "INTERVAL_H2",
            Interval::H4 => "INTERVAL_H4",
            Interval::D1 => "INTERVAL_D1",
            Interval::W1 => "INTERVAL_W1",
            Interval::Mn1 => "INTERVAL_MN1",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized interval: {0}")]
pub struct ParseIntervalError(pub String);

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "INTERVAL_TICK" => Interval::Tick,
            "INTERVAL_M1" => Interval::M1,
            "INTERVAL_M2" => Interval::M2,
            "INTERVAL_M3" => Interval::M3,
            "INTERVAL_M4" => Interval::M4,
            "INTERVAL_M5" => Interval::M5,
            "INTERVAL_M6" => Interval::M6,
            "INTERVAL_M10" => Interval::M10,
            "INTERVAL_M15" => Interval::M15,
            "INTERVAL_M30" => Interval::M30,
            "INTERVAL_H1" => Interval::H1,
            "INTERVAL_H2" => Interval::H2,
            "INTERVAL_H4" => Interval::H4,
            "INTERVAL_D1" => Interval::D1,
            "INTERVAL_W1" => Interval::W1,
            "INTERVAL_MN1" => Interval::Mn1,
            other => return Err(ParseIntervalError(other.to_owned())),
        })
    }
}

impl Serialize for Interval {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_wire_str())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Interval::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_success_requires_result_without_is_error() {
        let reply: RpcReply = serde_json::from_str(r#"{"result":{"value":1}}"#).unwrap();
        assert!(reply.is_success());
    }

    #[test]
    fn reply_is_error_flag_is_failure() {
        let reply: RpcReply =
            serde_json::from_str(r#"{"result":{"is_error":true,"code":404}}"#).unwrap();
        assert!(!reply.is_success());
    }

    #[test]
    fn reply_missing_result_is_failure() {
        let reply: RpcReply = serde_json::from_str(r#"{"error":{"code":1}}"#).unwrap();
        assert!(!reply.is_success());
    }

    #[test]
    fn interval_round_trips_wire_string() {
        for s in [
            "INTERVAL_TICK",
            "INTERVAL_M1",
            "INTERVAL_M30",
            "INTERVAL_H4",
            "INTERVAL_D1",
            "INTERVAL_W1",
            "INTERVAL_MN1",
        ] {
            let parsed: Interval = s.parse().unwrap();
            assert_eq!(parsed.as_wire_str(), s);
        }
    }

    #[test]
    fn interval_rejects_unknown_string() {
        assert!("INTERVAL_BOGUS".parse::<Interval>().is_err());
    }

    #[test]
    fn teardown_headers_are_recognized() {
        assert!(is_teardown_header("OnDisconnected"));
        assert!(is_teardown_header("OnStop"));
        assert!(is_teardown_header("OnClose"));
        assert!(!is_teardown_header("OnAllTrade"));
    }
}
