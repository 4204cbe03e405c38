/*
 * Copyright (C) 2024 The Fleetctl Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */


use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Upper bound for ratio settings such as the retry jitter.
pub const MAX_RATIO: f64 = 10.0;

/// Tunables recognised by the fleet controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    ExpectationsTimeout,
    AnnotationRetrySteps,
    AnnotationRetryDelay,
    AnnotationRetryJitter,
    CacheSyncPollPeriod,
    LogFormat,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::ExpectationsTimeout => "FLEETCTL_EXPECTATIONS_TIMEOUT",
            Config::AnnotationRetrySteps => "FLEETCTL_ANNOTATION_RETRY_STEPS",
            Config::AnnotationRetryDelay => "FLEETCTL_ANNOTATION_RETRY_DELAY",
            Config::AnnotationRetryJitter => "FLEETCTL_ANNOTATION_RETRY_JITTER",
            Config::CacheSyncPollPeriod => "FLEETCTL_CACHE_SYNC_POLL_PERIOD",
            Config::LogFormat => "FLEETCTL_LOG_FORMAT",
        }
    }

    /// Returns the built-in default for the config parameter.
    pub fn default_value(&self) -> &'static str {
        match self {
            // A dropped watch event wakes a dormant controller after this long.
            Config::ExpectationsTimeout => "5m",
            Config::AnnotationRetrySteps => "5",
            Config::AnnotationRetryDelay => "100ms",
            Config::AnnotationRetryJitter => "1.0",
            Config::CacheSyncPollPeriod => "100ms",
            Config::LogFormat => "text",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn value(&self) -> String {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_value().to_string())
    }

    pub fn duration(&self) -> Result<Duration, ConfigError> {
        let raw = self.value();
        humantime::parse_duration(&raw).map_err(|err| self.invalid(raw, err.to_string()))
    }

    pub fn count(&self) -> Result<u32, ConfigError> {
        let raw = self.value();
        match raw.parse::<u32>() {
            Ok(0) => Err(self.invalid(raw, "must be at least 1".to_string())),
            Ok(value) => Ok(value),
            Err(err) => Err(self.invalid(raw, err.to_string())),
        }
    }

    pub fn ratio(&self) -> Result<f64, ConfigError> {
        let raw = self.value();
        match raw.parse::<f64>() {
            Ok(value) if (0.0..=MAX_RATIO).contains(&value) => Ok(value),
            Ok(_) => Err(self.invalid(raw, format!("must be between 0 and {}", MAX_RATIO))),
            Err(err) => Err(self.invalid(raw, err.to_string())),
        }
    }

    fn invalid(&self, value: String, reason: String) -> ConfigError {
        ConfigError::Invalid {
            variable: self.env_var(),
            value,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid {
        variable: &'static str,
        value: String,
        reason: String,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid {
                variable,
                value,
                reason,
            } => write!(f, "invalid value '{}' for {}: {}", value, variable, reason),
        }
    }
}

impl Error for ConfigError {}

/// Settings for the expectation stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectationsConfig {
    /// Age after which an unfulfilled expectation no longer blocks a sync.
    pub timeout: Duration,
}

impl Default for ExpectationsConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl ExpectationsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            timeout: Config::ExpectationsTimeout.duration()?,
        })
    }
}

/// Fixed-delay retry budget with jitter, used for optimistic-concurrency loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Total number of attempts, including the first one.
    pub steps: u32,
    /// Base delay between attempts.
    pub duration: Duration,
    /// Each delay is stretched by up to `duration * jitter`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            steps: 5,
            duration: Duration::from_millis(100),
            jitter: 1.0,
        }
    }
}

impl BackoffConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            steps: Config::AnnotationRetrySteps.count()?,
            duration: Config::AnnotationRetryDelay.duration()?,
            jitter: Config::AnnotationRetryJitter.ratio()?,
        })
    }

    /// Returns the base delay stretched by `sample * jitter`, where `sample`
    /// is expected in `[0, 1)`.
    /// Falls back to the base delay if the stretched delay is not
    /// representable.
    pub fn jittered(&self, sample: f64) -> Duration {
        if self.jitter <= 0.0 {
            return self.duration;
        }
        let extra = self.duration.as_secs_f64() * sample.clamp(0.0, 1.0) * self.jitter;
        Duration::try_from_secs_f64(extra)
            .ok()
            .and_then(|extra| self.duration.checked_add(extra))
            .unwrap_or(self.duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSyncConfig {
    pub poll_period: Duration,
}

impl Default for CacheSyncConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_millis(100),
        }
    }
}

impl CacheSyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            poll_period: Config::CacheSyncPollPeriod.duration()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleetctl::test_support::EnvGuard;
    use serial_test::serial;

    const ALL: [Config; 6] = [
        Config::ExpectationsTimeout,
        Config::AnnotationRetrySteps,
        Config::AnnotationRetryDelay,
        Config::AnnotationRetryJitter,
        Config::CacheSyncPollPeriod,
        Config::LogFormat,
    ];

    fn clear_all() -> Vec<EnvGuard> {
        ALL.iter().map(|config| EnvGuard::unset(config.env_var())).collect()
    }

    #[test]
    #[serial(env)]
    fn defaults_match_struct_defaults() {
        let _guards = clear_all();
        assert_eq!(
            ExpectationsConfig::from_env().unwrap(),
            ExpectationsConfig::default()
        );
        assert_eq!(BackoffConfig::from_env().unwrap(), BackoffConfig::default());
        assert_eq!(
            CacheSyncConfig::from_env().unwrap(),
            CacheSyncConfig::default()
        );
    }

    #[test]
    #[serial(env)]
    fn environment_overrides_defaults() {
        let _guards = clear_all();
        let _timeout = EnvGuard::set("FLEETCTL_EXPECTATIONS_TIMEOUT", "90s");
        let _steps = EnvGuard::set("FLEETCTL_ANNOTATION_RETRY_STEPS", "3");
        let _delay = EnvGuard::set("FLEETCTL_ANNOTATION_RETRY_DELAY", "20ms");

        assert_eq!(
            ExpectationsConfig::from_env().unwrap().timeout,
            Duration::from_secs(90)
        );
        let backoff = BackoffConfig::from_env().unwrap();
        assert_eq!(backoff.steps, 3);
        assert_eq!(backoff.duration, Duration::from_millis(20));
        assert_eq!(backoff.jitter, 1.0);
    }

    #[test]
    #[serial(env)]
    fn invalid_values_name_the_variable() {
        let _guards = clear_all();
        let _steps = EnvGuard::set("FLEETCTL_ANNOTATION_RETRY_STEPS", "0");
        let err = BackoffConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("FLEETCTL_ANNOTATION_RETRY_STEPS"));

        let _delay = EnvGuard::set("FLEETCTL_CACHE_SYNC_POLL_PERIOD", "soon");
        assert!(CacheSyncConfig::from_env().is_err());
    }

    #[test]
    #[serial(env)]
    fn oversized_jitter_is_rejected() {
        let _guards = clear_all();
        let _jitter = EnvGuard::set("FLEETCTL_ANNOTATION_RETRY_JITTER", "1e30");
        let err = BackoffConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("FLEETCTL_ANNOTATION_RETRY_JITTER"));

        let _jitter = EnvGuard::set("FLEETCTL_ANNOTATION_RETRY_JITTER", "2.5");
        assert_eq!(BackoffConfig::from_env().unwrap().jitter, 2.5);
    }

    #[test]
    fn jitter_stretches_delay_within_bounds() {
        let backoff = BackoffConfig {
            steps: 5,
            duration: Duration::from_millis(100),
            jitter: 1.0,
        };
        assert_eq!(backoff.jittered(0.0), Duration::from_millis(100));
        assert_eq!(backoff.jittered(0.5), Duration::from_millis(150));
        assert_eq!(backoff.jittered(7.0), Duration::from_millis(200));

        let fixed = BackoffConfig {
            jitter: 0.0,
            ..backoff
        };
        assert_eq!(fixed.jittered(0.9), Duration::from_millis(100));

        let unbounded = BackoffConfig {
            jitter: 1e30,
            ..backoff
        };
        assert_eq!(unbounded.jittered(1.0), Duration::from_millis(100));
    }
}
