//! Client side of the conversation stream.
//!
//! One [`RealtimeClient`] per open conversation view. The client owns a
//! supervised task that connects, keeps the connection alive with pings,
//! reconnects with capped exponential backoff and feeds inbound frames into a
//! [`ConversationTimeline`]. The task stops when the client is closed, when
//! its cancellation token fires, or when the server closes normally.

pub mod backoff;
pub mod client;
pub mod timeline;

use std::time::Duration;

use thiserror::Error;

use crate::config::parsed_var;

pub use backoff::{backoff_delay, ReconnectPolicy};
pub use client::{Endpoint, RealtimeClient};
pub use timeline::ConversationTimeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub base_delay: Duration,
    pub cap_delay: Duration,
    /// Reconnect attempts before the client gives up and enters `Failed`.
    pub max_attempts: u32,
    pub heartbeat_interval: Duration,
    /// Silence longer than this is treated as a dead connection.
    pub heartbeat_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(10),
            max_attempts: 5,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
        }
    }
}

impl TransportConfig {
    /// Defaults overridden by `REALTIME_*` variables, all in milliseconds except
    /// `REALTIME_MAX_ATTEMPTS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_delay: Duration::from_millis(parsed_var(
                "REALTIME_BASE_DELAY_MS",
                defaults.base_delay.as_millis() as u64,
            )),
            cap_delay: Duration::from_millis(parsed_var(
                "REALTIME_CAP_DELAY_MS",
                defaults.cap_delay.as_millis() as u64,
            )),
            max_attempts: parsed_var("REALTIME_MAX_ATTEMPTS", defaults.max_attempts),
            heartbeat_interval: Duration::from_millis(parsed_var(
                "REALTIME_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval.as_millis() as u64,
            )),
            heartbeat_timeout: Duration::from_millis(parsed_var(
                "REALTIME_HEARTBEAT_TIMEOUT_MS",
                defaults.heartbeat_timeout.as_millis() as u64,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted. Only `retry()` leaves this state.
    Failed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected, message was not sent")]
    NotConnected,

    #[error("Connection was closed")]
    Closed,

    #[error("Connection failed after {attempts} reconnect attempts")]
    Failed { attempts: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_only_what_is_set() {
        std::env::set_var("REALTIME_BASE_DELAY_MS", "250");
        std::env::set_var("REALTIME_MAX_ATTEMPTS", "9");
        std::env::set_var("REALTIME_HEARTBEAT_TIMEOUT_MS", " ");

        let config = TransportConfig::from_env();
        let defaults = TransportConfig::default();

        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.max_attempts, 9);
        assert_eq!(config.cap_delay, defaults.cap_delay);
        assert_eq!(config.heartbeat_timeout, defaults.heartbeat_timeout);

        std::env::remove_var("REALTIME_BASE_DELAY_MS");
        std::env::remove_var("REALTIME_MAX_ATTEMPTS");
        std::env::remove_var("REALTIME_HEARTBEAT_TIMEOUT_MS");
    }
}
