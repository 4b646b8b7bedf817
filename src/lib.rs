//! Async client library for a market-data / order-routing terminal bridge.
//!
//! The terminal exposes two ZeroMQ sockets: a request/reply endpoint for
//! RPC calls and a publish/subscribe endpoint for server-pushed events.
//! [`BridgeClient`] multiplexes concurrent RPC calls over a bounded pool of
//! REQ connections, maintains a polled cache of per-instrument parameters,
//! caches historical candle series incrementally, and dispatches a filtered
//! event stream to a user-supplied handler.
//!
//! ```no_run
//! use qbridge::{BridgeClient, Config};
//!
//! # async fn run() -> qbridge::error::BridgeResult<()> {
//! let config = Config::builder("tcp://127.0.0.1:5560", "tcp://127.0.0.1:5561").build()?;
//! let client = BridgeClient::new(config);
//! client.initialize(None).await?;
//! let reply = client.rpc_call("getClassesList", None).await?;
//! println!("{reply}");
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod history;
pub mod params;
pub mod poll_task;
pub mod socket_pool;

pub use client::{BridgeClient, ClientStats, PollIntervals};
pub use config::{Config, ConfigBuilder, CurveKeys, EventFilter};
pub use error::{BridgeError, BridgeResult};
pub use events::{callback_from_handler, EventCallback, EventHandler, EventRecord};
pub use history::{default_date_from, Candle};
pub use params::ParamValue;
pub use qbridge_wire::Interval;
