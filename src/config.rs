//! Environment configuration.
//!
//! Every knob has a typed default; unset or unparsable variables fall back
//! to it. `.env` files are loaded by the binary before this runs.

use std::time::Duration;

use crate::idmap::IdPairOrder;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_RENDER_INTERVAL_MS: u64 = 500;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    /// Per-endpoint outbound queue depth on the relay.
    pub channel_capacity: usize,
    pub session: SessionConfig,
}

/// Client-side session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub render_interval: Duration,
    pub id_pair_order: IdPairOrder,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            render_interval: Duration::from_millis(DEFAULT_RENDER_INTERVAL_MS),
            id_pair_order: IdPairOrder::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            channel_capacity: env_parse("COLLAB_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY).max(1),
            session: SessionConfig::from_env(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            render_interval: Duration::from_millis(
                env_parse("COLLAB_RENDER_INTERVAL_MS", DEFAULT_RENDER_INTERVAL_MS).max(1),
            ),
            id_pair_order: env_parse("COLLAB_ID_PAIR_ORDER", IdPairOrder::default()),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
