//! Tunables for cache lifetimes, lock leases and id layout.
//!
//! # Invariants
//! - Every TTL is non-zero.
//! - The null-sentinel TTL never outlives the regular cache TTL.

use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Regular cache entry lifetime.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 30 * 60;
/// Lifetime of the "confirmed absent" sentinel.
pub const DEFAULT_NULL_TTL_SECS: u64 = 2 * 60;
/// Lease of the per-user seckill order lock.
pub const DEFAULT_ORDER_LOCK_TTL_SECS: u64 = 10;
/// 2022-01-01T00:00:00Z.
pub const DEFAULT_ID_EPOCH_SECS: i64 = 1_640_995_200;

/// Core configuration, deserializable from any serde source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub cache_ttl_secs: u64,
    pub null_ttl_secs: u64,
    pub order_lock_ttl_secs: u64,
    pub id_epoch_secs: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            null_ttl_secs: DEFAULT_NULL_TTL_SECS,
            order_lock_ttl_secs: DEFAULT_ORDER_LOCK_TTL_SECS,
            id_epoch_secs: DEFAULT_ID_EPOCH_SECS,
        }
    }
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid core config: {}", self.0)
    }
}

impl Error for ConfigError {}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("cache_ttl_secs", self.cache_ttl_secs),
            ("null_ttl_secs", self.null_ttl_secs),
            ("order_lock_ttl_secs", self.order_lock_ttl_secs),
        ] {
            if value == 0 {
                return Err(ConfigError(format!("{name} must be greater than zero")));
            }
        }
        if self.null_ttl_secs > self.cache_ttl_secs {
            return Err(ConfigError(format!(
                "null_ttl_secs ({}) must not exceed cache_ttl_secs ({})",
                self.null_ttl_secs, self.cache_ttl_secs
            )));
        }
        if self.id_epoch_secs < 0 {
            return Err(ConfigError("id_epoch_secs must not be negative".into()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn null_ttl(&self) -> Duration {
        Duration::from_secs(self.null_ttl_secs)
    }

    pub fn order_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.order_lock_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::CoreConfig;

    #[test]
    fn defaults_are_valid() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: CoreConfig = serde_json::from_str(r#"{"null_ttl_secs": 60}"#).unwrap();
        assert_eq!(config.null_ttl_secs, 60);
        assert_eq!(config.cache_ttl_secs, CoreConfig::default().cache_ttl_secs);
    }

    #[test]
    fn null_ttl_longer_than_cache_ttl_is_rejected() {
        let config = CoreConfig {
            cache_ttl_secs: 10,
            null_ttl_secs: 20,
            ..CoreConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("null_ttl_secs"));
    }
}
