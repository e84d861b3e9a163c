// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Provider Configuration
//!
//! Process-wide defaults merged with caller overrides. Field names follow the
//! `camelCase` option names (`url`, `reconnectAfter`, `reChannelAfter`,
//! `clearInterval`, `clearOffset`) and durations are expressed in
//! milliseconds, so an overrides object deserialized with `serde` only needs
//! to carry the options it changes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_URL: &str = "amqp://localhost?heartbeat=60";
pub const DEFAULT_RECONNECT_AFTER: Duration = Duration::from_millis(60_000);
pub const DEFAULT_RE_CHANNEL_AFTER: Duration = Duration::from_millis(5_000);
pub const DEFAULT_CLEAR_INTERVAL: Duration = Duration::from_millis(3_600_000);
pub const DEFAULT_CLEAR_OFFSET: Duration = Duration::from_millis(86_400_000);

/// Provider configuration.
///
/// A `Provider` keeps its own copy, so the configuration is immutable once the
/// provider is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Broker URL
    pub url: String,
    /// Interval between two attempts of the reconnect loop
    #[serde(with = "millis")]
    pub reconnect_after: Duration,
    /// Interval between two attempts of the channel-recreate loop
    #[serde(with = "millis")]
    pub re_channel_after: Duration,
    /// Interval between two housekeeping sweeps
    #[serde(with = "millis")]
    pub clear_interval: Duration,
    /// Retention window: tracking entries older than this are swept
    #[serde(with = "millis")]
    pub clear_offset: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            url: DEFAULT_URL.to_owned(),
            reconnect_after: DEFAULT_RECONNECT_AFTER,
            re_channel_after: DEFAULT_RE_CHANNEL_AFTER,
            clear_interval: DEFAULT_CLEAR_INTERVAL,
            clear_offset: DEFAULT_CLEAR_OFFSET,
        }
    }
}

impl Config {
    /// Builds a configuration from an overrides object, taking the defaults
    /// for every option it does not carry.
    ///
    /// # Example
    /// ```
    /// let cfg = rabbitmq_provider::config::Config::from_overrides(
    ///     serde_json::json!({ "reconnectAfter": 500 }),
    /// ).unwrap();
    /// assert_eq!(cfg.reconnect_after.as_millis(), 500);
    /// ```
    pub fn from_overrides(overrides: serde_json::Value) -> Result<Config, serde_json::Error> {
        serde_json::from_value(overrides)
    }

    pub fn url(mut self, url: &str) -> Self {
        self.url = url.to_owned();
        self
    }

    pub fn reconnect_after(mut self, interval: Duration) -> Self {
        self.reconnect_after = interval;
        self
    }

    pub fn re_channel_after(mut self, interval: Duration) -> Self {
        self.re_channel_after = interval;
        self
    }

    pub fn clear_interval(mut self, interval: Duration) -> Self {
        self.clear_interval = interval;
        self
    }

    pub fn clear_offset(mut self, window: Duration) -> Self {
        self.clear_offset = window;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.url, "amqp://localhost?heartbeat=60");
        assert_eq!(cfg.reconnect_after, Duration::from_secs(60));
        assert_eq!(cfg.clear_interval, Duration::from_secs(3600));
        assert_eq!(cfg.clear_offset, Duration::from_secs(86400));
    }

    #[test]
    fn overrides_are_merged_over_defaults() {
        let cfg = Config::from_overrides(json!({
            "url": "amqp://broker:5672",
            "reChannelAfter": 250,
            "clearOffset": 1000
        }))
        .unwrap();

        assert_eq!(cfg.url, "amqp://broker:5672");
        assert_eq!(cfg.re_channel_after, Duration::from_millis(250));
        assert_eq!(cfg.clear_offset, Duration::from_secs(1));
        assert_eq!(cfg.reconnect_after, DEFAULT_RECONNECT_AFTER);
        assert_eq!(cfg.clear_interval, DEFAULT_CLEAR_INTERVAL);
    }

    #[test]
    fn rejects_non_numeric_intervals() {
        assert!(Config::from_overrides(json!({ "reconnectAfter": "soon" })).is_err());
    }
}
