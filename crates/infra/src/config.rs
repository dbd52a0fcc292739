//! Typed configuration loaded from the environment.
//!
//! Every knob has a default except `DATABASE_URL`, which is only required by
//! the Postgres wiring. Malformed numbers and zero intervals are rejected
//! instead of silently falling back to the default.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use fulfillment_core::{Stage, WorkerId};

use crate::jobs::{BackoffPolicy, BreakerPolicy, DrainOptions, RunnerConfig, WorkerSettings};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var: var.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn require_url(&self) -> Result<&str, ConfigError> {
        self.url.as_deref().ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub poll_interval: Duration,
    pub breaker_cooldown: Duration,
    pub breaker_threshold: u32,
    pub reap_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    pub max_per_invocation: usize,
    pub max_errors_per_invocation: usize,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagesConfig {
    /// HTTP processor URL per stage; stages without one have no processor
    pub endpoints: BTreeMap<Stage, String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    /// Bearer token for the trigger endpoint; unset disables the check
    pub cron_secret: Option<String>,
    pub bind_addr: SocketAddr,
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentConfig {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub jobs: JobsConfig,
    pub stages: StagesConfig,
    pub api: ApiConfig,
}

impl FulfillmentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let worker_id = match env.get("WORKER_ID") {
            Some(id) => WorkerId::new(id.clone())
                .map_err(|e| ConfigError::invalid("WORKER_ID", id, e.to_string()))?,
            None => WorkerId::generate(&format!("worker-{}", std::process::id())),
        };

        let mut endpoints = BTreeMap::new();
        for stage in Stage::ALL {
            let var = format!("STAGE_ENDPOINT_{}", stage.env_suffix());
            if let Some(url) = env.get(&var) {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::invalid(var, url, "expected an http(s) URL"));
                }
                endpoints.insert(stage, url);
            }
        }

        let bind_addr = match env.get("BIND_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|e: std::net::AddrParseError| ConfigError::invalid("BIND_ADDR", raw, e.to_string()))?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let config = Self {
            database: DatabaseConfig {
                url: env.get("DATABASE_URL"),
                max_connections: env.positive("DATABASE_MAX_CONNECTIONS", 5)?,
            },
            worker: WorkerConfig {
                worker_id,
                poll_interval: env.millis("WORKER_POLL_INTERVAL_MS", 2_000)?,
                breaker_cooldown: env.millis("WORKER_BREAKER_COOLDOWN_MS", 60_000)?,
                breaker_threshold: env.positive("WORKER_BREAKER_THRESHOLD", 3)?,
                reap_interval: env.millis("JOB_REAP_INTERVAL_MS", 30_000)?,
            },
            jobs: JobsConfig {
                max_per_invocation: env.positive("JOBS_MAX_PER_INVOCATION", 10)?,
                max_errors_per_invocation: env.positive("JOBS_MAX_ERRORS_PER_INVOCATION", 3)?,
                lease_ttl: env.millis("JOB_LEASE_TTL_MS", 300_000)?,
                heartbeat_interval: env.millis_or_zero("JOB_HEARTBEAT_INTERVAL_MS", 60_000)?,
                backoff_base: env.millis("JOB_BACKOFF_BASE_MS", 5_000)?,
                backoff_max: env.millis("JOB_BACKOFF_MAX_MS", 300_000)?,
            },
            stages: StagesConfig {
                endpoints,
                timeout: env.millis("STAGE_TIMEOUT_MS", 30_000)?,
            },
            api: ApiConfig {
                cron_secret: env.get("CRON_SECRET"),
                bind_addr,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.heartbeat_interval >= self.jobs.lease_ttl {
            return Err(ConfigError::invalid(
                "JOB_HEARTBEAT_INTERVAL_MS",
                self.jobs.heartbeat_interval.as_millis().to_string(),
                "must be shorter than JOB_LEASE_TTL_MS",
            ));
        }
        if self.jobs.backoff_base > self.jobs.backoff_max {
            return Err(ConfigError::invalid(
                "JOB_BACKOFF_BASE_MS",
                self.jobs.backoff_base.as_millis().to_string(),
                "must not exceed JOB_BACKOFF_MAX_MS",
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(self.jobs.backoff_base, self.jobs.backoff_max)
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            lease_ttl: self.jobs.lease_ttl,
            heartbeat_interval: self.jobs.heartbeat_interval,
            breaker: BreakerPolicy {
                threshold: self.worker.breaker_threshold,
                cooldown: self.worker.breaker_cooldown,
            },
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings::new(self.worker.worker_id.clone())
            .with_poll_interval(self.worker.poll_interval)
            .with_reap_interval(self.worker.reap_interval)
    }

    /// Drain bounds, with an optional caller-requested cap that can only lower the limit.
    pub fn drain_options(&self, requested_max: Option<usize>) -> DrainOptions {
        let max_jobs = requested_max
            .map(|n| n.clamp(1, self.jobs.max_per_invocation))
            .unwrap_or(self.jobs.max_per_invocation);

        DrainOptions {
            max_jobs,
            max_errors: self.jobs.max_errors_per_invocation,
            reap_first: true,
        }
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed value; blank counts as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn positive<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr + PartialEq + Default,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        let value: T = raw
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, raw.clone(), e.to_string()))?;
        if value == T::default() {
            return Err(ConfigError::invalid(key, raw, "must be greater than zero"));
        }
        Ok(value)
    }

    fn millis(&self, key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
        self.positive(key, default_ms).map(Duration::from_millis)
    }

    /// Like `millis`, but `0` is accepted (it switches the feature off).
    fn millis_or_zero(&self, key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(Duration::from_millis(default_ms));
        };
        raw.parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::invalid(key, raw, e.to_string()))
    }
}
