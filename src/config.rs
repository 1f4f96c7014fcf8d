use std::{path::PathBuf, time::Duration};

use chrono_tz::Tz;
use thiserror::Error;

pub const DEFAULT_GPU_INDEX: u32 = 0;
pub const DEFAULT_HISTORY: usize = 1000;
pub const DEFAULT_DMON_POLL_SECS: f64 = 1.0;
pub const DEFAULT_PROC_POLL_SECS: f64 = 3.0;
pub const DEFAULT_TIMEZONE: Tz = Tz::UTC;
pub const DEFAULT_REFRESH_MS: u64 = 250;
pub const DEFAULT_NVIDIA_SMI: &str = "nvidia-smi";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a positive number of seconds, got {value}")]
    InvalidInterval { name: &'static str, value: f64 },
    #[error("history size must be at least 1")]
    EmptyHistory,
    #[error("refresh rate must be at least 1 ms")]
    InvalidRefresh,
}

/// How the streaming sampler reacts to its command dying.
#[derive(Clone, Debug, PartialEq)]
pub struct RestartPolicy {
    /// Consecutive failed launches before telemetry is given up.
    pub max_consecutive_failures: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Uptime after which a launch that produced readings counts as healthy.
    pub healthy_after: Duration,
}

impl RestartPolicy {
    /// Failure streak after a launch ended, given the streak before it.
    ///
    /// A healthy launch makes its own exit the first failure of a new
    /// streak; a launch that died early extends the current one.
    pub fn failure_streak(&self, failures: u32, readings: u64, uptime: Duration) -> u32 {
        if readings > 0 && uptime >= self.healthy_after {
            1
        } else {
            failures.saturating_add(1)
        }
    }

    /// Delay before the next launch after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            healthy_after: Duration::from_secs(10),
        }
    }
}

/// Session configuration, built once at startup and handed to each component.
#[derive(Clone, Debug)]
pub struct Config {
    pub gpu_index: u32,
    pub history_size: usize,
    pub dmon_interval: Duration,
    pub process_interval: Duration,
    pub timezone: Tz,
    pub refresh_rate: Duration,
    pub nvidia_smi: String,
    pub log_file: Option<PathBuf>,
    pub restart: RestartPolicy,
    /// Time a stopping streaming command gets before it is killed.
    pub shutdown_grace: Duration,
    pub query_timeout: Duration,
}

impl Config {
    /// Builds a config from raw user values, rejecting nonsensical ones.
    pub fn new(
        gpu_index: u32,
        history_size: usize,
        dmon_poll_secs: f64,
        proc_poll_secs: f64,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            gpu_index,
            history_size,
            dmon_interval: seconds(DMON_INTERVAL, dmon_poll_secs)?,
            process_interval: seconds(PROCESS_INTERVAL, proc_poll_secs)?,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_refresh_ms(mut self, refresh_ms: u64) -> Result<Self, ConfigError> {
        self.refresh_rate = Duration::from_millis(refresh_ms);
        self.validate()?;
        Ok(self)
    }

    /// Checks the values every component relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_size == 0 {
            return Err(ConfigError::EmptyHistory);
        }
        for (name, interval) in [
            (DMON_INTERVAL, self.dmon_interval),
            (PROCESS_INTERVAL, self.process_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::InvalidInterval {
                    name,
                    value: interval.as_secs_f64(),
                });
            }
        }
        if self.refresh_rate.is_zero() {
            return Err(ConfigError::InvalidRefresh);
        }
        Ok(())
    }
}

const DMON_INTERVAL: &str = "dmon poll interval";
const PROCESS_INTERVAL: &str = "process poll interval";

fn seconds(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidInterval { name, value });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidInterval { name, value })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gpu_index: DEFAULT_GPU_INDEX,
            history_size: DEFAULT_HISTORY,
            dmon_interval: Duration::from_secs_f64(DEFAULT_DMON_POLL_SECS),
            process_interval: Duration::from_secs_f64(DEFAULT_PROC_POLL_SECS),
            timezone: DEFAULT_TIMEZONE,
            refresh_rate: Duration::from_millis(DEFAULT_REFRESH_MS),
            nvidia_smi: DEFAULT_NVIDIA_SMI.to_string(),
            log_file: None,
            restart: RestartPolicy::default(),
            shutdown_grace: Duration::from_secs(2),
            query_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_intervals() {
        assert!(matches!(
            Config::new(0, 10, 0.0, 3.0),
            Err(ConfigError::InvalidInterval { .. })
        ));
        assert!(matches!(
            Config::new(0, 10, 1.0, f64::NAN),
            Err(ConfigError::InvalidInterval { .. })
        ));
        assert_eq!(Config::new(0, 0, 1.0, 3.0).unwrap_err(), ConfigError::EmptyHistory);
    }

    #[test]
    fn accepts_fractional_seconds() {
        let config = Config::new(1, 50, 0.5, 2.5).unwrap();
        assert_eq!(config.dmon_interval, Duration::from_millis(500));
        assert_eq!(config.process_interval, Duration::from_millis(2500));
        assert_eq!(config.gpu_index, 1);
    }

    #[test]
    fn validate_checks_assembled_values() {
        assert_eq!(Config::default().validate(), Ok(()));

        let config = Config {
            history_size: 0,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyHistory));

        let config = Config {
            process_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidInterval { name: "process poll interval", .. })
        ));

        // Rounds to a zero duration
        assert!(Config::new(0, 10, 1e-12, 3.0).is_err());
        assert_eq!(
            Config::default().with_refresh_ms(0).unwrap_err(),
            ConfigError::InvalidRefresh
        );
    }

    #[test]
    fn only_healthy_launches_reset_the_failure_streak() {
        let policy = RestartPolicy::default();
        let healthy = policy.healthy_after;

        assert_eq!(policy.failure_streak(2, 0, healthy * 2), 3);
        assert_eq!(policy.failure_streak(2, 1, Duration::from_millis(5)), 3);
        assert_eq!(policy.failure_streak(2, 40, healthy), 1);
        assert_eq!(policy.failure_streak(u32::MAX, 0, Duration::ZERO), u32::MAX);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }
}
