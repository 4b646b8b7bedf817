//! Background-task liveness tracking (spec §4.6, "Heartbeat / health").
//!
//! `heartbeat()` is meant to double as a probe: if the poll task or the
//! event dispatcher have exited without shutdown having been requested,
//! that is a stuck subsystem, and the original client's deliberate choice
//! was to re-raise it from `heartbeat()` rather than let it fail silently.

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{BridgeError, BridgeResult};

pub struct BackgroundTasks {
    poll_task: Option<JoinHandle<()>>,
    event_dispatcher: Option<JoinHandle<()>>,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundTasks {
    pub fn new(
        poll_task: JoinHandle<()>,
        event_dispatcher: Option<JoinHandle<()>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        BackgroundTasks {
            poll_task: Some(poll_task),
            event_dispatcher,
            shutdown,
        }
    }

    /// `Err` iff a background task exited while shutdown had not been
    /// requested -- a stuck or crashed subsystem, not a clean stop.
    pub fn check(&self) -> BridgeResult<()> {
        if *self.shutdown.borrow() {
            return Ok(());
        }
        if let Some(h) = &self.poll_task {
            if h.is_finished() {
                return Err(BridgeError::Connectivity(
                    "parameter poll task exited unexpectedly".into(),
                ));
            }
        }
        if let Some(h) = &self.event_dispatcher {
            if h.is_finished() {
                return Err(BridgeError::Connectivity(
                    "event dispatcher task exited unexpectedly".into(),
                ));
            }
        }
        Ok(())
    }
}
