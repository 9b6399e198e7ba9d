//! Reload endpoint and timing policy.
//!
//! Every duration is a parameter. Nothing in the reload runtime hard-codes a
//! timeout.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8899;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Address the dev server binds and clients connect to.
    pub bind: SocketAddr,
    /// How long a content script waits in `awaiting-peer`.
    pub peer_timeout_ms: u64,
    /// How long the server waits for the service worker's `done-update`.
    pub ack_timeout_ms: u64,
    pub backoff: Backoff,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            peer_timeout_ms: 5_000,
            ack_timeout_ms: 10_000,
            backoff: Backoff::default(),
        }
    }
}

impl ReloadConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// `ws://host:port`, as embedded in the generated clients.
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.bind)
    }
}

/// Client reconnect policy: exponential from `initial_ms`, capped at
/// `max_ms`, giving up after `max_retries` if set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub max_retries: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 5_000,
            max_retries: None,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (0-based); `None` once the
    /// retry bound is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_retries.is_some_and(|max| attempt >= max) {
            return None;
        }
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self.initial_ms.saturating_mul(factor).min(self.max_ms);
        Some(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ReloadConfig::default();
        assert_eq!(cfg.ws_url(), "ws://127.0.0.1:8899");
        assert_eq!(cfg.peer_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), Some(Duration::from_millis(250)));
        assert_eq!(b.delay(1), Some(Duration::from_millis(500)));
        assert_eq!(b.delay(4), Some(Duration::from_millis(4_000)));
        assert_eq!(b.delay(5), Some(Duration::from_millis(5_000)));
        assert_eq!(b.delay(60), Some(Duration::from_millis(5_000)));
    }

    #[test]
    fn backoff_retry_bound() {
        let b = Backoff {
            max_retries: Some(2),
            ..Backoff::default()
        };
        assert!(b.delay(1).is_some());
        assert_eq!(b.delay(2), None);
    }

    #[test]
    fn partial_config_deserializes() {
        let cfg: ReloadConfig = serde_json::from_str(r#"{"peer_timeout_ms": 50}"#).unwrap();
        assert_eq!(cfg.peer_timeout_ms, 50);
        assert_eq!(cfg.backoff, Backoff::default());
    }
}
