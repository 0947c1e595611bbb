//! Broker configuration, loaded from defaults and `BROKER_*` environment
//! variable overrides (§6).
//!
//! Mirrors the override pattern used for CLI configuration elsewhere in
//! this codebase: start from [`Config::default`], then apply any
//! recognised environment variables, ignoring ones that fail to parse
//! rather than aborting startup.

use std::time::Duration;

/// Runtime configuration surface (§6 table).
#[derive(Debug, Clone)]
pub struct Config {
    /// TTL used when `set` omits one and `require_ttl` is off, in ms.
    pub default_ttl_ms: i64,
    /// Reject `set` without a positive TTL.
    pub require_ttl: bool,
    /// Cap on non-expired values; 0 disables the cap.
    pub max_items: usize,
    /// Per-connection buffer cap, in bytes.
    pub max_request_size: usize,
    /// Per-value size cap, in bytes.
    pub max_value_size: usize,
    /// HMAC key. When set, every request must carry a valid `hmac` field.
    pub secret: Option<String>,
    /// Sweeper cadence.
    pub sweeper_interval: Duration,
    /// Shut down after this much inactivity, if set.
    pub idle_timeout: Option<Duration>,
    /// Emit a heartbeat log event at this cadence, if set.
    pub heartbeat_interval: Option<Duration>,
    /// Severity threshold, forwarded to `env_logger` via `RUST_LOG`.
    pub log_level: String,
    /// Emit JSON log lines instead of `env_logger`'s human format.
    pub structured_logging: bool,
    /// Advisory flag echoed to clients; the broker never compresses.
    pub compression: bool,
    /// Advisory threshold echoed to clients.
    pub compression_threshold: usize,
    /// Override the random endpoint path suffix.
    pub pipe_id: Option<String>,
    /// Bound on the drain poll loop (§4.7).
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_ttl_ms: 1_800_000,
            require_ttl: true,
            max_items: 10_000,
            max_request_size: 1_048_576,
            max_value_size: 262_144,
            secret: None,
            sweeper_interval: Duration::from_millis(30_000),
            idle_timeout: None,
            heartbeat_interval: None,
            log_level: "info".to_string(),
            structured_logging: false,
            compression: true,
            compression_threshold: 1_024,
            pipe_id: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Build a [`Config`] from defaults plus `BROKER_*` environment
    /// variable overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = parse_env("BROKER_DEFAULT_TTL") {
            self.default_ttl_ms = v;
        }
        if let Some(v) = parse_bool_env("BROKER_REQUIRE_TTL") {
            self.require_ttl = v;
        }
        if let Some(v) = parse_env("BROKER_MAX_ITEMS") {
            self.max_items = v;
        }
        if let Some(v) = parse_env("BROKER_MAX_REQUEST_SIZE") {
            self.max_request_size = v;
        }
        if let Some(v) = parse_env("BROKER_MAX_VALUE_SIZE") {
            self.max_value_size = v;
        }
        if let Ok(secret) = std::env::var("BROKER_SECRET") {
            if !secret.is_empty() {
                self.secret = Some(secret);
            }
        }
        if let Some(ms) = parse_env::<u64>("BROKER_SWEEPER_INTERVAL") {
            self.sweeper_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("BROKER_IDLE_TIMEOUT") {
            self.idle_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_env::<u64>("BROKER_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval = Some(Duration::from_millis(ms));
        }
        if let Ok(level) = std::env::var("BROKER_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(v) = parse_bool_env("BROKER_STRUCTURED_LOGGING") {
            self.structured_logging = v;
        }
        if let Some(v) = parse_bool_env("BROKER_COMPRESSION") {
            self.compression = v;
        }
        if let Some(v) = parse_env("BROKER_COMPRESSION_THRESHOLD") {
            self.compression_threshold = v;
        }
        if let Ok(id) = std::env::var("BROKER_PIPE_ID") {
            if !id.is_empty() {
                self.pipe_id = Some(id);
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn parse_bool_env(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| match v.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = Config::default();
        assert_eq!(config.default_ttl_ms, 1_800_000);
        assert!(config.require_ttl);
        assert_eq!(config.max_items, 10_000);
        assert_eq!(config.max_request_size, 1_048_576);
        assert_eq!(config.max_value_size, 262_144);
        assert!(config.secret.is_none());
        assert_eq!(config.sweeper_interval, Duration::from_millis(30_000));
        assert!(config.idle_timeout.is_none());
        assert!(config.compression);
        assert_eq!(config.compression_threshold, 1_024);
    }
}
