//! Protocol clients.
//!
//! Three independently reconnecting clients share one pattern: a persistent
//! connection state machine with fixed-delay reconnect, a keepalive
//! obligation, and a dispatch table from inbound message to local action.
//! Connection loss never blocks the rest of the process, and an in-flight
//! timelapse session survives any client's disconnect.

pub mod control;
pub mod moonraker;
pub mod rpc;

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Connection lifecycle of one protocol client. Transitions are driven only
/// by the owning client's thread; everyone else just reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the reconnect delay until the given instant.
    Backoff(Instant),
}

/// Shared observable connection status.
pub struct ClientStatus {
    state: Mutex<ConnectionState>,
}

impl ClientStatus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn set(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    /// Enter backoff for `delay`; returns the wake-up instant.
    pub fn enter_backoff(&self, delay: Duration) -> Instant {
        let until = Instant::now() + delay;
        self.set(ConnectionState::Backoff(until));
        until
    }
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self::new()
    }
}
