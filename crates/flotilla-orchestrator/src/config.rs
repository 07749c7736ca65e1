//! Orchestrator configuration.
//!
//! Plain structs with literal defaults, plus strict environment loaders for
//! deployments that tune them. Every duration is validated to be positive;
//! a malformed value is a hard configuration error, never a silent default.

use std::time::Duration;

use flotilla_core::error::{Error, Result};

const ENV_WORKERS: &str = "FLOTILLA_SCHEDULER_WORKERS";
const ENV_VISIBILITY_TIMEOUT_SECS: &str = "FLOTILLA_BROKER_VISIBILITY_TIMEOUT_SECS";
const ENV_MAX_RETRIES: &str = "FLOTILLA_BROKER_MAX_RETRIES";
const ENV_RANDOMNESS_RANGE: &str = "FLOTILLA_SCHEDULER_RANDOMNESS_RANGE";
const ENV_OVER_ASK_FACTOR: &str = "FLOTILLA_SCHEDULER_OVER_ASK_FOR_BIDS_FACTOR";

const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_INITIAL_RETRY_DELAY_SECS: u64 = 1;
const DEFAULT_SUBSEQUENT_RETRY_DELAY_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 10;
const DEFAULT_JANITOR_INTERVAL_MILLIS: u64 = 500;
const DEFAULT_RANDOMNESS_RANGE: f64 = 5.0;
const DEFAULT_DEQUEUE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 1;
const DEFAULT_BACKOFF_CAP_SECS: u64 = 30;
const DEFAULT_WORKER_MAX_RETRIES: u32 = 3;
const DEFAULT_QUEUE_BACKOFF_SECS: u64 = 5;

/// Evaluation-broker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// How long a delivery may stay unacked before the janitor re-delivers
    /// it.
    pub visibility_timeout: Duration,
    /// Delay before the first timeout-driven redelivery.
    pub initial_retry_delay: Duration,
    /// Delay before second and later timeout-driven redeliveries.
    pub subsequent_retry_delay: Duration,
    /// Delivery budget; beyond this the evaluation is failed with reason
    /// `delivery-exceeded`.
    pub max_retries: u32,
    /// How often the janitor scans the delayed set and inflight table.
    pub janitor_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            initial_retry_delay: Duration::from_secs(DEFAULT_INITIAL_RETRY_DELAY_SECS),
            subsequent_retry_delay: Duration::from_secs(DEFAULT_SUBSEQUENT_RETRY_DELAY_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            janitor_interval: Duration::from_millis(DEFAULT_JANITOR_INTERVAL_MILLIS),
        }
    }
}

/// Scheduler and worker-pool tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Number of worker tasks pulling from the broker.
    pub workers: usize,
    /// Upper bound of the uniform jitter added to node rank scores, to
    /// spread placements across equally ranked nodes.
    pub randomness_range: f64,
    /// Extra bids requested per needed partition to absorb rejections;
    /// at least 1.
    pub over_ask_for_bids_factor: u32,
    /// How long a worker blocks on an empty broker before looping.
    pub dequeue_timeout: Duration,
    /// First retry backoff of the worker loop.
    pub backoff_base: Duration,
    /// Backoff ceiling of the worker loop.
    pub backoff_cap: Duration,
    /// How many retriable failures a worker tolerates per evaluation before
    /// failing it.
    pub worker_max_retries: u32,
    /// How long an unplaceable partition waits before its follow-up
    /// evaluation re-checks the fleet.
    pub queue_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get),
            randomness_range: DEFAULT_RANDOMNESS_RANGE,
            over_ask_for_bids_factor: 1,
            dequeue_timeout: Duration::from_secs(DEFAULT_DEQUEUE_TIMEOUT_SECS),
            backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            backoff_cap: Duration::from_secs(DEFAULT_BACKOFF_CAP_SECS),
            worker_max_retries: DEFAULT_WORKER_MAX_RETRIES,
            queue_backoff: Duration::from_secs(DEFAULT_QUEUE_BACKOFF_SECS),
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrchestratorConfig {
    /// Broker tuning.
    pub broker: BrokerConfig,
    /// Scheduler and worker tuning.
    pub scheduler: SchedulerConfig,
}

impl OrchestratorConfig {
    /// Loads configuration from the process environment with strict
    /// validation, falling back to defaults for unset keys.
    ///
    /// # Errors
    ///
    /// Returns a validation error when an environment value is malformed,
    /// zero where a positive value is required, or out of range.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a validation error when an environment value is malformed,
    /// zero where a positive value is required, or out of range.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(workers) = parse_positive_u64(&get_env, ENV_WORKERS)? {
            config.scheduler.workers = usize::try_from(workers).map_err(|_| {
                Error::validation(format!("{ENV_WORKERS} value {workers} exceeds supported range"))
            })?;
        }
        if let Some(secs) = parse_positive_u64(&get_env, ENV_VISIBILITY_TIMEOUT_SECS)? {
            config.broker.visibility_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = parse_positive_u64(&get_env, ENV_MAX_RETRIES)? {
            config.broker.max_retries = u32::try_from(retries).map_err(|_| {
                Error::validation(format!(
                    "{ENV_MAX_RETRIES} value {retries} exceeds supported range"
                ))
            })?;
        }
        if let Some(raw) = get_env(ENV_RANDOMNESS_RANGE) {
            let range: f64 = raw.parse().map_err(|_| {
                Error::validation(format!(
                    "{ENV_RANDOMNESS_RANGE} must be a number, got '{raw}'"
                ))
            })?;
            if !range.is_finite() || range < 0.0 {
                return Err(Error::validation(format!(
                    "{ENV_RANDOMNESS_RANGE} must be finite and non-negative, got {range}"
                )));
            }
            config.scheduler.randomness_range = range;
        }
        if let Some(factor) = parse_positive_u64(&get_env, ENV_OVER_ASK_FACTOR)? {
            config.scheduler.over_ask_for_bids_factor = u32::try_from(factor).map_err(|_| {
                Error::validation(format!(
                    "{ENV_OVER_ASK_FACTOR} value {factor} exceeds supported range"
                ))
            })?;
        }

        Ok(config)
    }
}

fn parse_positive_u64<F>(get_env: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u64>()
        .map_err(|_| Error::validation(format!("{key} must be a positive integer, got '{raw}'")))?;
    if parsed == 0 {
        return Err(Error::validation(format!("{key} must be greater than zero")));
    }
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_spec() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.broker.visibility_timeout, Duration::from_secs(60));
        assert_eq!(config.scheduler.over_ask_for_bids_factor, 1);
        assert!(config.scheduler.workers >= 1);
        assert_eq!(config.scheduler.backoff_base, Duration::from_secs(1));
        assert_eq!(config.scheduler.backoff_cap, Duration::from_secs(30));
    }

    #[test]
    fn env_overrides_apply() {
        let config = OrchestratorConfig::from_env_with(env(&[
            (ENV_WORKERS, "2"),
            (ENV_VISIBILITY_TIMEOUT_SECS, "120"),
            (ENV_OVER_ASK_FACTOR, "3"),
        ]))
        .unwrap();
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.broker.visibility_timeout, Duration::from_secs(120));
        assert_eq!(config.scheduler.over_ask_for_bids_factor, 3);
    }

    #[test]
    fn zero_and_garbage_are_rejected() {
        assert!(OrchestratorConfig::from_env_with(env(&[(ENV_WORKERS, "0")])).is_err());
        assert!(
            OrchestratorConfig::from_env_with(env(&[(ENV_VISIBILITY_TIMEOUT_SECS, "soon")]))
                .is_err()
        );
        assert!(
            OrchestratorConfig::from_env_with(env(&[(ENV_RANDOMNESS_RANGE, "-1")])).is_err()
        );
    }
}
