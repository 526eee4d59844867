//! keyrack configuration
//!
//! Configuration file: ~/.config/keyrack/config.yaml (or
//! $KEYRACK_HOME/config/config.yaml). Every field has a default, so a
//! missing file is the same as an empty one.

use crate::error::{KeyrackError, Result};
use chrono::{DateTime, Utc};
use keyrack_core::Paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable consulted by the secure vault's unlock path
pub const PASSPHRASE_ENV: &str = "KEYRACK_PASSPHRASE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyrackConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Extra identity files tried before the default locations
    #[serde(default)]
    pub identities: Vec<PathBuf>,
}

impl KeyrackConfig {
    /// Load configuration from default location
    pub fn load(paths: &Paths) -> Result<Self> {
        Self::load_from(&paths.config_file())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| KeyrackError::malformed(path, e.to_string()))?;

        // Surface a bad ttl at load time rather than at first unlock
        parse_duration(&config.daemon.session_ttl)?;

        Ok(config)
    }
}

/// Session daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Upper bound on any single IPC round trip
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// TTL for unlocked keys that declare no max duration
    #[serde(default = "default_session_ttl")]
    pub session_ttl: String,

    /// How long `unlock` waits for a freshly spawned daemon
    #[serde(default = "default_spawn_wait_ms")]
    pub spawn_wait_ms: u64,
}

fn default_timeout_ms() -> u64 {
    750
}

fn default_session_ttl() -> String {
    "9h".to_string()
}

fn default_spawn_wait_ms() -> u64 {
    2000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            session_ttl: default_session_ttl(),
            spawn_wait_ms: default_spawn_wait_ms(),
        }
    }
}

impl DaemonConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    pub fn session_ttl(&self) -> Result<chrono::Duration> {
        parse_duration(&self.session_ttl)
    }
}

/// Parse `<n>s|m|h|d|w` into a duration
///
/// Out-of-range counts, and durations whose deadline from now would not be
/// representable, are `InvalidDuration`.
pub fn parse_duration(s: &str) -> Result<chrono::Duration> {
    let s = s.trim();
    let invalid = || KeyrackError::InvalidDuration(s.to_string());
    if s.len() < 2 || !s.is_char_boundary(s.len() - 1) {
        return Err(invalid());
    }

    let (num, unit) = s.split_at(s.len() - 1);
    let num: i64 = num.parse().map_err(|_| invalid())?;
    if num <= 0 {
        return Err(invalid());
    }

    let duration = match unit {
        "s" => chrono::Duration::try_seconds(num),
        "m" => chrono::Duration::try_minutes(num),
        "h" => chrono::Duration::try_hours(num),
        "d" => chrono::Duration::try_days(num),
        "w" => chrono::Duration::try_weeks(num),
        _ => None,
    }
    .ok_or_else(invalid)?;

    Utc::now().checked_add_signed(duration).ok_or_else(invalid)?;
    Ok(duration)
}

/// `now + ttl`, or `InvalidDuration` when that is past the end of time
pub fn expiry_after(now: DateTime<Utc>, ttl: chrono::Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| KeyrackError::InvalidDuration(format!("{}s", ttl.num_seconds())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30m").unwrap(), chrono::Duration::minutes(30));
        assert_eq!(parse_duration("9h").unwrap(), chrono::Duration::hours(9));
        assert_eq!(parse_duration(" 2d ").unwrap(), chrono::Duration::days(2));
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10y").is_err());
        assert!(parse_duration("-1h").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        for s in ["99999999999999999w", "100000000000d", "9223372036854775807s"] {
            let err = parse_duration(s).unwrap_err();
            assert!(matches!(err, KeyrackError::InvalidDuration(_)), "{}: {}", s, err);
        }
        assert_eq!(parse_duration("2w").unwrap(), chrono::Duration::weeks(2));
    }

    #[test]
    fn test_expiry_after_overflow() {
        let now = Utc::now();
        assert_eq!(
            expiry_after(now, chrono::Duration::hours(1)).unwrap(),
            now + chrono::Duration::hours(1)
        );
        assert!(expiry_after(DateTime::<Utc>::MAX_UTC, chrono::Duration::seconds(1)).is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let tmp = TempDir::new().unwrap();
        let config = KeyrackConfig::load_from(&tmp.path().join("config.yaml")).unwrap();
        assert_eq!(config.daemon.timeout_ms, 750);
        assert_eq!(config.daemon.session_ttl, "9h");
        assert!(config.identities.is_empty());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "daemon:\n  timeout_ms: 100\n").unwrap();

        let config = KeyrackConfig::load_from(&path).unwrap();
        assert_eq!(config.daemon.timeout_ms, 100);
        assert_eq!(config.daemon.spawn_wait_ms, 2000);
    }

    #[test]
    fn test_bad_ttl_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "daemon:\n  session_ttl: forever\n").unwrap();

        assert!(KeyrackConfig::load_from(&path).is_err());

        std::fs::write(&path, "daemon:\n  session_ttl: 99999999999999999w\n").unwrap();
        assert!(KeyrackConfig::load_from(&path).is_err());
    }
}
