//! Media node configuration.
//!
//! Loaded from environment variables; every component receives an
//! immutable snapshot at construction.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

/// Default codec/bandwidth profile name passed to the engine.
pub const DEFAULT_MEDIA_CONFIGURATION: &str = "default";

/// Default absolute uptime ceiling in days.
pub const DEFAULT_ACTIVE_UPTIME_LIMIT_DAYS: u64 = 7;

/// Default idle ceiling (time since last control operation) in hours.
pub const DEFAULT_MAX_TIME_SINCE_LAST_OPERATION_HOURS: u64 = 6;

/// Default interval between watchdog checks in seconds.
pub const DEFAULT_CHECK_UPTIME_INTERVAL_SECONDS: u64 = 1800;

/// Default maximum concurrent stats subscriptions. Zero disables stats
/// subscriptions entirely.
pub const DEFAULT_STATS_MAX_SUBSCRIPTIONS: usize = 10;

/// Default ceiling for a stats subscription's total duration in seconds.
pub const DEFAULT_STATS_MAX_TIMEOUT_SECONDS: u64 = 60;

/// Default floor for the stats collection interval in seconds.
pub const DEFAULT_STATS_MIN_INTERVAL_SECONDS: u64 = 1;

/// Default node id prefix when no id is configured.
pub const DEFAULT_NODE_ID_PREFIX: &str = "mn";

/// Media node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node instance.
    pub node_id: String,

    /// Public address substituted into gathered candidates.
    pub public_ip: String,

    /// Pattern matching private addresses to rewrite in candidates and
    /// descriptions. `None` disables rewriting.
    pub private_network_pattern: Option<regex::Regex>,

    /// Engine profile used when a request names none.
    pub default_media_configuration: String,

    /// Absolute uptime ceiling in days.
    pub active_uptime_limit_days: u64,

    /// Idle ceiling in hours.
    pub max_time_since_last_operation_hours: u64,

    /// Watchdog check interval in seconds.
    pub check_uptime_interval_seconds: u64,

    /// Maximum concurrent stats subscriptions (0 disables).
    pub stats_max_subscriptions: usize,

    /// Stats subscription duration ceiling in seconds.
    pub stats_max_timeout_seconds: u64,

    /// Stats collection interval floor in seconds.
    pub stats_min_interval_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let node_id = vars.get("MN_NODE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_NODE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        let public_ip = vars.get("MN_PUBLIC_IP").cloned().unwrap_or_default();

        let private_network_pattern = match vars.get("MN_PRIVATE_NET_PATTERN") {
            Some(pattern) => Some(regex::Regex::new(pattern).map_err(|e| {
                ConfigError::InvalidValue(format!("MN_PRIVATE_NET_PATTERN: {e}"))
            })?),
            None => None,
        };

        let default_media_configuration = vars
            .get("MN_DEFAULT_MEDIA_CONFIGURATION")
            .cloned()
            .unwrap_or_else(|| DEFAULT_MEDIA_CONFIGURATION.to_string());

        let active_uptime_limit_days = vars
            .get("MN_ACTIVE_UPTIME_LIMIT_DAYS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_ACTIVE_UPTIME_LIMIT_DAYS);

        let max_time_since_last_operation_hours = vars
            .get("MN_MAX_TIME_SINCE_LAST_OPERATION_HOURS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_TIME_SINCE_LAST_OPERATION_HOURS);

        let check_uptime_interval_seconds = vars
            .get("MN_CHECK_UPTIME_INTERVAL_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CHECK_UPTIME_INTERVAL_SECONDS);

        if check_uptime_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "MN_CHECK_UPTIME_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }

        let stats_max_subscriptions = vars
            .get("MN_STATS_MAX_SUBSCRIPTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_STATS_MAX_SUBSCRIPTIONS);

        let stats_max_timeout_seconds = vars
            .get("MN_STATS_MAX_TIMEOUT_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_STATS_MAX_TIMEOUT_SECONDS);

        let stats_min_interval_seconds = vars
            .get("MN_STATS_MIN_INTERVAL_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_STATS_MIN_INTERVAL_SECONDS);

        if stats_min_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "MN_STATS_MIN_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            node_id,
            public_ip,
            private_network_pattern,
            default_media_configuration,
            active_uptime_limit_days,
            max_time_since_last_operation_hours,
            check_uptime_interval_seconds,
            stats_max_subscriptions,
            stats_max_timeout_seconds,
            stats_min_interval_seconds,
        })
    }

    /// Absolute uptime ceiling as a duration.
    #[must_use]
    pub fn active_uptime_limit(&self) -> Duration {
        Duration::from_secs(self.active_uptime_limit_days * 24 * 60 * 60)
    }

    /// Idle ceiling as a duration.
    #[must_use]
    pub fn max_time_since_last_operation(&self) -> Duration {
        Duration::from_secs(self.max_time_since_last_operation_hours * 60 * 60)
    }

    /// Watchdog check interval as a duration.
    #[must_use]
    pub fn check_uptime_interval(&self) -> Duration {
        Duration::from_secs(self.check_uptime_interval_seconds)
    }

    /// Stats subscription duration ceiling as a duration.
    #[must_use]
    pub fn stats_max_timeout(&self) -> Duration {
        Duration::from_secs(self.stats_max_timeout_seconds)
    }

    /// Stats collection interval floor as a duration.
    #[must_use]
    pub fn stats_min_interval(&self) -> Duration {
        Duration::from_secs(self.stats_min_interval_seconds)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_with_defaults() {
        let vars = HashMap::new();

        let config = Config::from_vars(&vars).expect("config should load");

        assert!(config.node_id.starts_with(DEFAULT_NODE_ID_PREFIX));
        assert!(config.public_ip.is_empty());
        assert!(config.private_network_pattern.is_none());
        assert_eq!(
            config.active_uptime_limit_days,
            DEFAULT_ACTIVE_UPTIME_LIMIT_DAYS
        );
        assert_eq!(config.stats_max_subscriptions, DEFAULT_STATS_MAX_SUBSCRIPTIONS);
        assert_eq!(config.stats_min_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_from_vars_with_overrides() {
        let vars = HashMap::from([
            ("MN_NODE_ID".to_string(), "mn-test-1".to_string()),
            ("MN_PUBLIC_IP".to_string(), "198.51.100.7".to_string()),
            (
                "MN_PRIVATE_NET_PATTERN".to_string(),
                r"10\.0\.\d+\.\d+".to_string(),
            ),
            ("MN_ACTIVE_UPTIME_LIMIT_DAYS".to_string(), "2".to_string()),
            ("MN_STATS_MAX_SUBSCRIPTIONS".to_string(), "3".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("config should load");

        assert_eq!(config.node_id, "mn-test-1");
        assert_eq!(config.public_ip, "198.51.100.7");
        assert!(config
            .private_network_pattern
            .as_ref()
            .unwrap()
            .is_match("10.0.3.17"));
        assert_eq!(config.active_uptime_limit(), Duration::from_secs(2 * 86400));
        assert_eq!(config.stats_max_subscriptions, 3);
    }

    #[test]
    fn test_invalid_private_net_pattern_is_rejected() {
        let vars = HashMap::from([(
            "MN_PRIVATE_NET_PATTERN".to_string(),
            "10.(unclosed".to_string(),
        )]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_zero_watchdog_interval_is_rejected() {
        let vars = HashMap::from([(
            "MN_CHECK_UPTIME_INTERVAL_SECONDS".to_string(),
            "0".to_string(),
        )]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }
}
