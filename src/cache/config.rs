//! Cache configuration.
//!
//! Deserializable from any serde source (a config file section, JSON) or read
//! from `RCACHE_*` environment variables with [`CacheConfig::from_env`].

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_TTL_SHORT_SECS: u64 = 60;
const DEFAULT_TTL_MEDIUM_SECS: u64 = 300;
const DEFAULT_TTL_LONG_SECS: u64 = 3600;

/// Invalid cache configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("TTL tiers must satisfy short < medium < long (got {short}s, {medium}s, {long}s)")]
    TierOrder { short: u64, medium: u64, long: u64 },

    #[error("unknown TTL {0:?}; expected SHORT, MEDIUM, LONG or a number of seconds")]
    UnknownTtl(String),

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Concrete durations behind the named TTL tiers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TtlTiers {
    pub short_secs: u64,
    pub medium_secs: u64,
    pub long_secs: u64,
}

impl Default for TtlTiers {
    fn default() -> Self {
        Self {
            short_secs: DEFAULT_TTL_SHORT_SECS,
            medium_secs: DEFAULT_TTL_MEDIUM_SECS,
            long_secs: DEFAULT_TTL_LONG_SECS,
        }
    }
}

impl TtlTiers {
    pub fn short(&self) -> Duration {
        Duration::from_secs(self.short_secs)
    }

    pub fn medium(&self) -> Duration {
        Duration::from_secs(self.medium_secs)
    }

    pub fn long(&self) -> Duration {
        Duration::from_secs(self.long_secs)
    }
}

/// Settings for a [`Cache`](super::Cache) instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch. When off, reads miss and writes are dropped.
    pub enabled: bool,
    /// Coalesce concurrent `wrap` misses on the same key into one producer call.
    pub single_flight: bool,
    pub ttl: TtlTiers,
    /// Period of the background tag sweep; `None` leaves sweeping to the caller.
    pub tag_sweep_interval_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            single_flight: true,
            ttl: TtlTiers::default(),
            tag_sweep_interval_secs: None,
        }
    }
}

impl CacheConfig {
    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let TtlTiers {
            short_secs,
            medium_secs,
            long_secs,
        } = self.ttl;
        if short_secs < medium_secs && medium_secs < long_secs {
            Ok(())
        } else {
            Err(ConfigError::TierOrder {
                short: short_secs,
                medium: medium_secs,
                long: long_secs,
            })
        }
    }

    pub fn tag_sweep_interval(&self) -> Option<Duration> {
        self.tag_sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Reads overrides from the process environment:
    ///
    /// | Variable                  | Field                     |
    /// |---------------------------|---------------------------|
    /// | `RCACHE_ENABLED`          | `enabled`                 |
    /// | `RCACHE_SINGLE_FLIGHT`    | `single_flight`           |
    /// | `RCACHE_TTL_SHORT_SECS`   | `ttl.short_secs`          |
    /// | `RCACHE_TTL_MEDIUM_SECS`  | `ttl.medium_secs`         |
    /// | `RCACHE_TTL_LONG_SECS`    | `ttl.long_secs`           |
    /// | `RCACHE_TAG_SWEEP_SECS`   | `tag_sweep_interval_secs` |
    ///
    /// The result is validated before it is returned.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "RCACHE_ENABLED", parse_bool)? {
            config.enabled = v;
        }
        if let Some(v) = parse_var(&lookup, "RCACHE_SINGLE_FLIGHT", parse_bool)? {
            config.single_flight = v;
        }
        if let Some(v) = parse_var(&lookup, "RCACHE_TTL_SHORT_SECS", parse_u64)? {
            config.ttl.short_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "RCACHE_TTL_MEDIUM_SECS", parse_u64)? {
            config.ttl.medium_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "RCACHE_TTL_LONG_SECS", parse_u64)? {
            config.ttl.long_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "RCACHE_TAG_SWEEP_SECS", parse_u64)? {
            config.tag_sweep_interval_secs = Some(v);
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<F, T>(
    lookup: &F,
    var: &'static str,
    parse: fn(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => parse(value.trim())
            .map(Some)
            .ok_or(ConfigError::InvalidEnv { var, value }),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert!(config.single_flight);
        assert_eq!(config.ttl.short_secs, 60);
        assert_eq!(config.ttl.medium_secs, 300);
        assert_eq!(config.ttl.long_secs, 3600);
        assert_eq!(config.tag_sweep_interval(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tiers_must_be_strictly_increasing() {
        let config = CacheConfig {
            ttl: TtlTiers {
                short_secs: 300,
                medium_secs: 300,
                long_secs: 600,
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TierOrder { short: 300, medium: 300, .. })
        ));
    }

    #[test]
    fn deserializes_partial_json() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"single_flight": false, "ttl": {"long_secs": 86400}}"#)
                .unwrap();
        assert!(config.enabled);
        assert!(!config.single_flight);
        assert_eq!(config.ttl.short_secs, 60);
        assert_eq!(config.ttl.long_secs, 86400);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = CacheConfig::from_lookup(lookup(&[
            ("RCACHE_ENABLED", "off"),
            ("RCACHE_TTL_SHORT_SECS", "10"),
            ("RCACHE_TAG_SWEEP_SECS", "120"),
        ]))
        .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.ttl.short_secs, 10);
        assert_eq!(config.tag_sweep_interval(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn env_rejects_garbage() {
        let err = CacheConfig::from_lookup(lookup(&[("RCACHE_SINGLE_FLIGHT", "maybe")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                var: "RCACHE_SINGLE_FLIGHT",
                value: "maybe".to_string()
            }
        );
    }

    #[test]
    fn env_is_validated() {
        let err = CacheConfig::from_lookup(lookup(&[("RCACHE_TTL_LONG_SECS", "5")])).unwrap_err();
        assert!(matches!(err, ConfigError::TierOrder { long: 5, .. }));
    }

    #[test]
    fn zero_sweep_interval_disables_sweeper() {
        let config = CacheConfig {
            tag_sweep_interval_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(config.tag_sweep_interval(), None);
    }
}
