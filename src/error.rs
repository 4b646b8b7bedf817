//! Error taxonomy shared across the bridge client (spec §7).
//!
//! Five kinds: a structured server-side rejection (`Generic`), a transport
//! failure (`Connectivity`), an exhausted historical backfill (`NoHistory`),
//! cooperative shutdown (`Cancelled`), and caller misuse (`Programming`).
//! Nothing else should cross a public API boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Server returned a structured failure: unknown method, bad argument,
    /// type-incompatible parameter. Never retried.
    #[error("{0}")]
    Generic(String),

    /// Transport failed, timed out, retries exhausted, or a previously
    /// valid parameter subscription started failing server-side.
    #[error("{0}")]
    Connectivity(String),

    /// Backfill budget exceeded with zero bars ever returned.
    #[error("{0}")]
    NoHistory(String),

    /// Cooperative shutdown in progress.
    #[error("operation cancelled: client is shutting down")]
    Cancelled,

    /// Caller misuse: re-initialization, negative interval, mismatched
    /// list lengths, use before `initialize`.
    #[error("{0}")]
    Programming(String),

    #[error("transport: {0}")]
    Transport(#[from] zmq::Error),

    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
