//! Coordination configuration.
//!
//! Every tunable of the controller, lock manager, and poller lives here so a
//! process can build all three from one environment. `from_env` reads
//! `HANGAR_*` variables on top of the defaults.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::identity::OwnerId;
use crate::resource::ResourceState;

/// Default TTL applied to locks that omit `lockTTL` (24 hours).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Lock manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// TTL used when a lock omits `lockTTL`. `None` means such locks never expire.
    pub default_ttl: Option<Duration>,
    /// Retries for `unlock()` on transient store errors.
    pub unlock_max_retries: u32,
    /// Fixed delay between `unlock()` retries.
    pub unlock_retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(DEFAULT_LOCK_TTL),
            unlock_max_retries: 5,
            unlock_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Watch reconnect settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    /// Delay before re-registering after a stream ends normally.
    pub refresh_interval: Duration,
    /// Delay before re-registering after a registration or stream error.
    pub error_delay: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(1),
            error_delay: Duration::from_secs(5),
        }
    }
}

/// Unlock poller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Interval between status checks of a lock's referenced operation.
    pub poll_interval: Duration,
    /// Operation states that release the lock.
    pub terminal_states: Vec<ResourceState>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            terminal_states: ResourceState::default_terminal(),
        }
    }
}

/// Reconciliation controller settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Attempts for the best-effort status write after a handler finishes.
    pub status_write_retries: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            status_write_retries: 3,
        }
    }
}

/// Configuration for one coordinating process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationConfig {
    /// Claim owner identity of this process.
    pub owner_id: OwnerId,
    /// Lock manager settings.
    pub lock: LockConfig,
    /// Watch reconnect settings.
    pub watch: WatchConfig,
    /// Unlock poller settings.
    pub poller: PollerConfig,
    /// Controller settings.
    pub controller: ControllerConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            owner_id: OwnerId::generate(),
            lock: LockConfig::default(),
            watch: WatchConfig::default(),
            poller: PollerConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

impl CoordinationConfig {
    /// Builds configuration from `HANGAR_*` environment variables.
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `HANGAR_OWNER_ID` | claim identity (generated when unset) |
    /// | `HANGAR_LOCK_DEFAULT_TTL_MS` | default lock TTL, `0` = never expires |
    /// | `HANGAR_UNLOCK_MAX_RETRIES` | unlock retry budget |
    /// | `HANGAR_UNLOCK_RETRY_DELAY_MS` | delay between unlock retries |
    /// | `HANGAR_POLL_INTERVAL_MS` | unlock poller interval |
    /// | `HANGAR_TERMINAL_STATES` | comma-separated terminal states |
    /// | `HANGAR_WATCH_REFRESH_INTERVAL_MS` | delay after a clean stream end |
    /// | `HANGAR_WATCH_ERROR_DELAY_MS` | delay after a stream error |
    /// | `HANGAR_STATUS_WRITE_RETRIES` | controller status write attempts |
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is malformed or the result fails validation.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(owner) = env_string("HANGAR_OWNER_ID") {
            config.owner_id = OwnerId::new(owner)?;
        }
        if let Some(ttl) = env_u64("HANGAR_LOCK_DEFAULT_TTL_MS")? {
            config.lock.default_ttl = (ttl > 0).then(|| Duration::from_millis(ttl));
        }
        if let Some(retries) = env_u32("HANGAR_UNLOCK_MAX_RETRIES")? {
            config.lock.unlock_max_retries = retries;
        }
        if let Some(delay) = env_millis("HANGAR_UNLOCK_RETRY_DELAY_MS")? {
            config.lock.unlock_retry_delay = delay;
        }
        if let Some(interval) = env_millis("HANGAR_POLL_INTERVAL_MS")? {
            config.poller.poll_interval = interval;
        }
        if let Some(states) = env_string("HANGAR_TERMINAL_STATES") {
            config.poller.terminal_states = parse_states(&states);
        }
        if let Some(interval) = env_millis("HANGAR_WATCH_REFRESH_INTERVAL_MS")? {
            config.watch.refresh_interval = interval;
        }
        if let Some(delay) = env_millis("HANGAR_WATCH_ERROR_DELAY_MS")? {
            config.watch.error_delay = delay;
        }
        if let Some(retries) = env_u32("HANGAR_STATUS_WRITE_RETRIES")? {
            config.controller.status_write_retries = retries;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if an interval is zero or no terminal states are configured.
    pub fn validate(&self) -> Result<()> {
        if self.poller.poll_interval.is_zero() {
            return Err(Error::InvalidInput(
                "HANGAR_POLL_INTERVAL_MS must be greater than 0".into(),
            ));
        }
        if self.poller.terminal_states.is_empty() {
            return Err(Error::InvalidInput(
                "HANGAR_TERMINAL_STATES must name at least one state".into(),
            ));
        }
        if self.watch.error_delay.is_zero() {
            return Err(Error::InvalidInput(
                "HANGAR_WATCH_ERROR_DELAY_MS must be greater than 0".into(),
            ));
        }
        if self.controller.status_write_retries == 0 {
            return Err(Error::InvalidInput(
                "HANGAR_STATUS_WRITE_RETRIES must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_states(value: &str) -> Vec<ResourceState> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ResourceState::from)
        .collect()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    Ok(env_u64(name)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoordinationConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.lock.default_ttl, Some(DEFAULT_LOCK_TTL));
        assert_eq!(config.lock.unlock_max_retries, 5);
        assert!(
            config
                .poller
                .terminal_states
                .contains(&ResourceState::Succeeded)
        );
    }

    #[test]
    fn parse_states_skips_blanks() {
        assert_eq!(
            parse_states("succeeded, ,failed,"),
            vec![ResourceState::Succeeded, ResourceState::Failed]
        );
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let mut config = CoordinationConfig::default();
        config.poller.poll_interval = Duration::ZERO;
        let err = config.validate().expect_err("zero interval");
        assert!(err.to_string().contains("HANGAR_POLL_INTERVAL_MS"));
    }

    #[test]
    fn validate_rejects_empty_terminal_states() {
        let mut config = CoordinationConfig::default();
        config.poller.terminal_states.clear();
        assert!(config.validate().is_err());
    }
}
