//! Configuration for document parsing and acquisition.
//!
//! Everything here can be deserialized (for example from TOML); durations
//! are written in humantime notation ("10m", "1day").

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::Error;
use crate::meta::Fingerprint;

/// What to do with content found after a descriptor's `router-signature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingContent {
    #[default]
    Reject,
    Ignore,
}

/// Strictness options for the document grammars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParseOptions {
    pub trailing_content: TrailingContent,
}

/// A directory authority we may always fall back to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Authority {
    pub nickname: String,
    /// Hostname or IPv4 address.
    pub address: String,
    pub dir_port: u16,
    /// Hex fingerprint of the authority's v3 identity key, if known.
    #[serde(default)]
    pub v3ident: Option<String>,
}

impl Authority {
    pub fn v3ident_fingerprint(&self) -> Option<Fingerprint> {
        self.v3ident
            .as_deref()
            .and_then(|id| Fingerprint::from_str_hex(id).ok())
    }
}

/// Timing and sizing of downloads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Delay before retrying after the 1st, 2nd, ... failure; the last
    /// entry applies to every later failure.
    #[serde(deserialize_with = "delay_list")]
    pub retry_delays: Vec<Duration>,
    /// A failure count is forgotten after this long without a new failure.
    #[serde(with = "humantime_serde")]
    pub failure_reset: Duration,
    /// How long a fetched descriptor is kept.
    #[serde(with = "humantime_serde")]
    pub descriptor_retention: Duration,
    /// Descriptors published more recently than this are not fetched yet.
    #[serde(with = "humantime_serde")]
    pub min_publication_age: Duration,
    /// Launch a round once this many descriptors are downloadable...
    pub round_threshold: usize,
    /// ...or once this long has passed since the previous round.
    #[serde(with = "humantime_serde")]
    pub round_interval: Duration,
    pub max_descriptors_per_mirror: usize,
    pub min_mirrors: usize,
    /// Below this many descriptors per mirror, use fewer mirrors.
    pub min_descriptors_per_request: usize,
    /// How often to re-check whether a descriptor round is due.
    #[serde(with = "humantime_serde")]
    pub descriptor_check_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            retry_delays: vec![
                Duration::from_secs(0),
                Duration::from_secs(60),
                Duration::from_secs(5 * 60),
                Duration::from_secs(10 * 60),
                Duration::from_secs(24 * 60 * 60),
            ],
            failure_reset: Duration::from_secs(60 * 60),
            descriptor_retention: Duration::from_secs(48 * 60 * 60),
            min_publication_age: Duration::from_secs(10 * 60),
            round_threshold: 16,
            round_interval: Duration::from_secs(10 * 60),
            max_descriptors_per_mirror: 128,
            min_mirrors: 3,
            min_descriptors_per_request: 4,
            descriptor_check_interval: Duration::from_secs(10),
        }
    }
}

fn delay_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
    let delays: Vec<humantime_serde::Serde<Duration>> = Vec::deserialize(deserializer)?;
    Ok(delays.into_iter().map(|d| d.into_inner()).collect())
}

/// Return the default parallelism for a descriptor round.
fn default_parallelism() -> usize {
    4
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirConfig {
    pub authorities: Vec<Authority>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub parse: ParseOptions,
    /// How many mirror requests of one round may be outstanding at once.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Seed for the scheduler's randomness; fresh entropy if unset.
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

impl DirConfig {
    pub fn new(authorities: Vec<Authority>) -> Self {
        DirConfig {
            authorities,
            schedule: ScheduleConfig::default(),
            parse: ParseOptions::default(),
            parallelism: default_parallelism(),
            rng_seed: None,
        }
    }

    /// Check the values that deserialization alone cannot.
    pub fn validate(&self) -> Result<(), Error> {
        if self.authorities.is_empty() {
            return Err(Error::NoAuthorities);
        }
        for auth in &self.authorities {
            if auth.v3ident.is_some() && auth.v3ident_fingerprint().is_none() {
                return Err(Error::InvalidConfig(format!(
                    "v3ident of authority {} is not a hex fingerprint",
                    auth.nickname
                )));
            }
        }
        let s = &self.schedule;
        if s.retry_delays.is_empty() {
            return Err(Error::InvalidConfig("retry_delays is empty".into()));
        }
        if s.max_descriptors_per_mirror == 0 || s.min_mirrors == 0 || self.parallelism == 0 {
            return Err(Error::InvalidConfig(
                "mirror and parallelism limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let s = ScheduleConfig::default();
        assert_eq!(s.retry_delays.len(), 5);
        assert_eq!(s.retry_delays[4], Duration::from_secs(86400));
        assert_eq!(s.round_threshold, 16);
        assert_eq!(ParseOptions::default().trailing_content, TrailingContent::Reject);
        assert!(DirConfig::new(vec![]).validate().is_err());
    }

    #[test]
    fn from_toml() {
        let cfg: DirConfig = toml::from_str(
            r#"
            parallelism = 2
            rng_seed = 7

            [[authorities]]
            nickname = "auth1"
            address = "192.0.2.5"
            dir_port = 80
            v3ident = "A1DA625EBABD2FC0DE51FDC05116994A55171AD0"

            [schedule]
            retry_delays = ["0s", "30s", "1h"]
            round_interval = "5m"

            [parse]
            trailing_content = "ignore"
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.parallelism, 2);
        assert_eq!(cfg.rng_seed, Some(7));
        assert_eq!(cfg.schedule.retry_delays[2], Duration::from_secs(3600));
        assert_eq!(cfg.schedule.round_interval, Duration::from_secs(300));
        assert_eq!(cfg.schedule.min_mirrors, 3);
        assert_eq!(cfg.parse.trailing_content, TrailingContent::Ignore);
        assert!(cfg.authorities[0].v3ident_fingerprint().is_some());
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = DirConfig::new(vec![Authority {
            nickname: "auth1".into(),
            address: "192.0.2.5".into(),
            dir_port: 80,
            v3ident: Some("xyz".into()),
        }]);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
        cfg.authorities[0].v3ident = None;
        cfg.schedule.retry_delays.clear();
        assert!(cfg.validate().is_err());
        assert!(toml::from_str::<DirConfig>("authorities = []\nbogus = 1\n").is_err());
    }
}
