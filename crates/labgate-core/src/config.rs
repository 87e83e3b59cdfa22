//! Arbitration settings snapshot.
//!
//! [`ArbitrationConfig`] is read-only once constructed. It is normally loaded
//! from `LABGATE_*` environment variables via [`ArbitrationConfig::from_env`];
//! every field has a default suitable for a bench setup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ArbitrationError;

/// Smallest interval the cleanup sweep will run at.
pub const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(100);

/// Settings consumed by the arbitration subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    /// Global kill-switch. When false, every command is permitted.
    pub enable_equipment_locks: bool,
    /// Default lease timeout for acquired locks.
    pub lock_timeout_sec: u64,
    /// Idle time after which a session is ended.
    pub session_timeout_sec: u64,
    /// When false, exclusive requests that cannot be granted are denied.
    pub enable_lock_queue: bool,
    /// When false, observe leases cannot be acquired.
    pub enable_observer_mode: bool,
    /// Whether transport disconnects end the session.
    pub auto_release_on_disconnect: bool,
    /// Per-equipment cap on retained lock events.
    pub event_history_limit: usize,
    /// Explicit cleanup sweep interval. Derived from the timeouts when unset.
    pub cleanup_interval_ms: Option<u64>,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        ArbitrationConfig {
            enable_equipment_locks: true,
            lock_timeout_sec: 300,
            session_timeout_sec: 600,
            enable_lock_queue: true,
            enable_observer_mode: true,
            auto_release_on_disconnect: true,
            event_history_limit: 100,
            cleanup_interval_ms: None,
        }
    }
}

impl ArbitrationConfig {
    /// Loads configuration from environment variables with defaults.
    ///
    /// | Env Var                               | Default |
    /// |---------------------------------------|---------|
    /// | `LABGATE_ENABLE_EQUIPMENT_LOCKS`      | `true`  |
    /// | `LABGATE_LOCK_TIMEOUT_SEC`            | `300`   |
    /// | `LABGATE_SESSION_TIMEOUT_SEC`         | `600`   |
    /// | `LABGATE_ENABLE_LOCK_QUEUE`           | `true`  |
    /// | `LABGATE_ENABLE_OBSERVER_MODE`        | `true`  |
    /// | `LABGATE_AUTO_RELEASE_ON_DISCONNECT`  | `true`  |
    /// | `LABGATE_EVENT_HISTORY_LIMIT`         | `100`   |
    /// | `LABGATE_CLEANUP_INTERVAL_MS`         | derived |
    pub fn from_env() -> Result<Self, ArbitrationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ArbitrationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ArbitrationConfig::default();
        let config = ArbitrationConfig {
            enable_equipment_locks: parse_or(
                &lookup,
                "LABGATE_ENABLE_EQUIPMENT_LOCKS",
                defaults.enable_equipment_locks,
            )?,
            lock_timeout_sec: parse_or(&lookup, "LABGATE_LOCK_TIMEOUT_SEC", defaults.lock_timeout_sec)?,
            session_timeout_sec: parse_or(
                &lookup,
                "LABGATE_SESSION_TIMEOUT_SEC",
                defaults.session_timeout_sec,
            )?,
            enable_lock_queue: parse_or(&lookup, "LABGATE_ENABLE_LOCK_QUEUE", defaults.enable_lock_queue)?,
            enable_observer_mode: parse_or(
                &lookup,
                "LABGATE_ENABLE_OBSERVER_MODE",
                defaults.enable_observer_mode,
            )?,
            auto_release_on_disconnect: parse_or(
                &lookup,
                "LABGATE_AUTO_RELEASE_ON_DISCONNECT",
                defaults.auto_release_on_disconnect,
            )?,
            event_history_limit: parse_or(
                &lookup,
                "LABGATE_EVENT_HISTORY_LIMIT",
                defaults.event_history_limit,
            )?,
            cleanup_interval_ms: match lookup("LABGATE_CLEANUP_INTERVAL_MS") {
                Some(raw) => Some(parse_value("LABGATE_CLEANUP_INTERVAL_MS", &raw)?),
                None => None,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the arbitration core cannot operate with.
    pub fn validate(&self) -> Result<(), ArbitrationError> {
        if self.lock_timeout_sec == 0 {
            return Err(invalid("lock_timeout_sec", "must be greater than zero"));
        }
        if self.session_timeout_sec == 0 {
            return Err(invalid("session_timeout_sec", "must be greater than zero"));
        }
        if self.event_history_limit == 0 {
            return Err(invalid("event_history_limit", "must be greater than zero"));
        }
        if self.cleanup_interval_ms == Some(0) {
            return Err(invalid("cleanup_interval_ms", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_sec)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_sec)
    }

    /// Interval between cleanup sweeps.
    ///
    /// Defaults to a tenth of the smaller timeout, never below
    /// [`MIN_CLEANUP_INTERVAL`].
    pub fn cleanup_interval(&self) -> Duration {
        match self.cleanup_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => {
                let smallest = self.lock_timeout().min(self.session_timeout());
                (smallest / 10).max(MIN_CLEANUP_INTERVAL)
            }
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ArbitrationError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ArbitrationError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| invalid(key, &format!("'{raw}': {e}")))
}

fn invalid(key: &str, reason: &str) -> ArbitrationError {
    ArbitrationError::InvalidConfig {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = ArbitrationConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ArbitrationConfig::default());
        assert_eq!(config.lock_timeout(), Duration::from_secs(300));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(30));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = ArbitrationConfig::from_lookup(lookup_from(&[
            ("LABGATE_ENABLE_EQUIPMENT_LOCKS", "false"),
            ("LABGATE_LOCK_TIMEOUT_SEC", "30"),
            ("LABGATE_ENABLE_LOCK_QUEUE", "false"),
            ("LABGATE_CLEANUP_INTERVAL_MS", "250"),
        ]))
        .unwrap();
        assert!(!config.enable_equipment_locks);
        assert!(!config.enable_lock_queue);
        assert_eq!(config.lock_timeout_sec, 30);
        assert_eq!(config.cleanup_interval(), Duration::from_millis(250));
    }

    #[test]
    fn unparsable_value_is_rejected() {
        let err = ArbitrationConfig::from_lookup(lookup_from(&[(
            "LABGATE_SESSION_TIMEOUT_SEC",
            "soon",
        )]))
        .unwrap_err();
        assert!(matches!(
            err,
            ArbitrationError::InvalidConfig { ref key, .. } if key == "LABGATE_SESSION_TIMEOUT_SEC"
        ));
    }

    #[test]
    fn zero_timeout_fails_validation() {
        let config = ArbitrationConfig {
            lock_timeout_sec: 0,
            ..ArbitrationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn cleanup_interval_tracks_smallest_timeout_with_floor() {
        let config = ArbitrationConfig {
            lock_timeout_sec: 1,
            session_timeout_sec: 60,
            ..ArbitrationConfig::default()
        };
        assert_eq!(config.cleanup_interval(), MIN_CLEANUP_INTERVAL);

        let config = ArbitrationConfig {
            lock_timeout_sec: 120,
            session_timeout_sec: 50,
            ..ArbitrationConfig::default()
        };
        assert_eq!(config.cleanup_interval(), Duration::from_secs(5));
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let config: ArbitrationConfig =
            serde_json::from_str(r#"{ "enable_observer_mode": false }"#).unwrap();
        assert!(!config.enable_observer_mode);
        assert_eq!(config.lock_timeout_sec, 300);
    }
}
