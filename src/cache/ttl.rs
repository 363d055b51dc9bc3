//! Time-to-live values: a named tier or an explicit duration.

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer, de};

use super::config::{ConfigError, TtlTiers};

/// How long an entry should live.
///
/// Named tiers are resolved against the deployment's [`TtlTiers`] at write
/// time, so callers never hard-code magnitudes.
///
/// Deserializes from either a tier name (`"SHORT"`, `"medium"`, ...) or an
/// integer number of seconds.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rcache::cache::{Ttl, TtlTiers};
///
/// let tiers = TtlTiers::default();
/// assert_eq!(Ttl::Short.resolve(&tiers), Duration::from_secs(60));
/// assert_eq!("90".parse::<Ttl>().unwrap(), Ttl::secs(90));
/// assert_eq!("long".parse::<Ttl>().unwrap(), Ttl::Long);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ttl {
    Short,
    Medium,
    Long,
    Exact(Duration),
}

impl Ttl {
    pub fn secs(secs: u64) -> Self {
        Self::Exact(Duration::from_secs(secs))
    }

    /// Resolves the tier to a concrete duration.
    pub fn resolve(self, tiers: &TtlTiers) -> Duration {
        match self {
            Self::Short => tiers.short(),
            Self::Medium => tiers.medium(),
            Self::Long => tiers.long(),
            Self::Exact(duration) => duration,
        }
    }
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        Self::Exact(duration)
    }
}

impl FromStr for Ttl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Self::secs(secs));
        }
        match s.to_ascii_uppercase().as_str() {
            "SHORT" => Ok(Self::Short),
            "MEDIUM" => Ok(Self::Medium),
            "LONG" => Ok(Self::Long),
            _ => Err(ConfigError::UnknownTtl(s.to_owned())),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TtlRepr {
    Seconds(u64),
    Named(String),
}

impl<'de> Deserialize<'de> for Ttl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match TtlRepr::deserialize(deserializer)? {
            TtlRepr::Seconds(secs) => Ok(Self::secs(secs)),
            TtlRepr::Named(name) => name.parse().map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_resolve_in_order() {
        let tiers = TtlTiers::default();
        assert!(Ttl::Short.resolve(&tiers) < Ttl::Medium.resolve(&tiers));
        assert!(Ttl::Medium.resolve(&tiers) < Ttl::Long.resolve(&tiers));
    }

    #[test]
    fn exact_ignores_tiers() {
        let tiers = TtlTiers::default();
        assert_eq!(Ttl::secs(5).resolve(&tiers), Duration::from_secs(5));
    }

    #[test]
    fn parse_rejects_unknown_names() {
        assert!(matches!(
            "forever".parse::<Ttl>(),
            Err(ConfigError::UnknownTtl(name)) if name == "forever"
        ));
    }

    #[test]
    fn deserializes_names_and_seconds() {
        let ttls: Vec<Ttl> = serde_json::from_str(r#"["MEDIUM", 30, "short"]"#).unwrap();
        assert_eq!(ttls, vec![Ttl::Medium, Ttl::secs(30), Ttl::Short]);
        assert!(serde_json::from_str::<Ttl>(r#""eternal""#).is_err());
    }
}
