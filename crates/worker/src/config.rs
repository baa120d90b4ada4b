//! Host configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::RetryPolicy;

/// Environment variable prefix read by [`HostConfig::from_env`].
pub const ENV_PREFIX: &str = "COURIER_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot parse {key}={value:?}")]
    Parse { key: String, value: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Configuration for a [`WorkerHost`](crate::WorkerHost).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Name for logging
    pub name: String,
    /// Fixed number of concurrent workers
    pub worker_count: usize,
    /// Per-message deadline
    pub message_timeout: Duration,
    /// Deliveries allowed before a transient failure is dead-lettered
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
    /// How long one lease call may wait for a message
    pub lease_wait: Duration,
    /// Initial pause after an empty poll or a failed transport call
    pub idle_poll_interval: Duration,
    /// Cap for the idle/transport backoff
    pub max_idle_poll_interval: Duration,
    /// How long in-flight handlers may run after shutdown before they are cancelled
    pub shutdown_grace: Duration,
    /// Attempts for an acknowledge/redelivery/dead-letter call
    pub transport_retry_limit: u32,
    /// How often held leases (in flight or backlogged) are renewed
    pub lease_renewal_interval: Duration,
    /// Visibility requested on each renewal; must exceed the renewal interval
    pub lease_extension: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "courier-host".to_string(),
            worker_count: 4,
            message_timeout: Duration::from_secs(30),
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            jitter: true,
            lease_wait: Duration::from_secs(1),
            idle_poll_interval: Duration::from_millis(100),
            max_idle_poll_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            transport_retry_limit: 5,
            lease_renewal_interval: Duration::from_secs(10),
            lease_extension: Duration::from_secs(30),
        }
    }
}

impl HostConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_lease_wait(mut self, wait: Duration) -> Self {
        self.lease_wait = wait;
        self
    }

    pub fn with_idle_poll(mut self, interval: Duration, max: Duration) -> Self {
        self.idle_poll_interval = interval;
        self.max_idle_poll_interval = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_transport_retry_limit(mut self, limit: u32) -> Self {
        self.transport_retry_limit = limit;
        self
    }

    pub fn with_lease_renewal(mut self, interval: Duration, extension: Duration) -> Self {
        self.lease_renewal_interval = interval;
        self.lease_extension = extension;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
            jitter: self.jitter,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("worker_count", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.transport_retry_limit == 0 {
            return Err(ConfigError::invalid("transport_retry_limit", "must be at least 1"));
        }

        let positive = [
            ("message_timeout", self.message_timeout),
            ("base_backoff", self.base_backoff),
            ("lease_wait", self.lease_wait),
            ("idle_poll_interval", self.idle_poll_interval),
            ("shutdown_grace", self.shutdown_grace),
            ("lease_renewal_interval", self.lease_renewal_interval),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::invalid(field, "must be greater than zero"));
        }

        if self.max_backoff < self.base_backoff {
            return Err(ConfigError::invalid(
                "max_backoff",
                format!("{:?} is below base_backoff {:?}", self.max_backoff, self.base_backoff),
            ));
        }
        if self.max_idle_poll_interval < self.idle_poll_interval {
            return Err(ConfigError::invalid(
                "max_idle_poll_interval",
                format!(
                    "{:?} is below idle_poll_interval {:?}",
                    self.max_idle_poll_interval, self.idle_poll_interval
                ),
            ));
        }
        if self.lease_extension <= self.lease_renewal_interval {
            return Err(ConfigError::invalid(
                "lease_extension",
                format!(
                    "{:?} must exceed lease_renewal_interval {:?}",
                    self.lease_extension, self.lease_renewal_interval
                ),
            ));
        }
        Ok(())
    }

    /// Defaults overlaid with `COURIER_*` environment variables.
    ///
    /// Durations are given in milliseconds, e.g. `COURIER_MESSAGE_TIMEOUT_MS=5000`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let reader = EnvReader { lookup };
        let mut config = Self::default();

        if let Some(name) = reader.raw("NAME") {
            config.name = name;
        }
        reader.parse("WORKER_COUNT", &mut config.worker_count)?;
        reader.millis("MESSAGE_TIMEOUT_MS", &mut config.message_timeout)?;
        reader.parse("MAX_ATTEMPTS", &mut config.max_attempts)?;
        reader.millis("BASE_BACKOFF_MS", &mut config.base_backoff)?;
        reader.millis("MAX_BACKOFF_MS", &mut config.max_backoff)?;
        reader.parse("JITTER", &mut config.jitter)?;
        reader.millis("LEASE_WAIT_MS", &mut config.lease_wait)?;
        reader.millis("IDLE_POLL_INTERVAL_MS", &mut config.idle_poll_interval)?;
        reader.millis("MAX_IDLE_POLL_INTERVAL_MS", &mut config.max_idle_poll_interval)?;
        reader.millis("SHUTDOWN_GRACE_MS", &mut config.shutdown_grace)?;
        reader.parse("TRANSPORT_RETRY_LIMIT", &mut config.transport_retry_limit)?;
        reader.millis("LEASE_RENEWAL_INTERVAL_MS", &mut config.lease_renewal_interval)?;
        reader.millis("LEASE_EXTENSION_MS", &mut config.lease_extension)?;

        config.validate()?;
        Ok(config)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{suffix}"))
    }

    fn parse<T: std::str::FromStr>(&self, suffix: &str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = self.raw(suffix) {
            *slot = value.trim().parse().map_err(|_| ConfigError::Parse {
                key: format!("{ENV_PREFIX}{suffix}"),
                value,
            })?;
        }
        Ok(())
    }

    fn millis(&self, suffix: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut ms = u64::try_from(slot.as_millis()).unwrap_or(u64::MAX);
        self.parse(suffix, &mut ms)?;
        *slot = Duration::from_millis(ms);
        Ok(())
    }
}
