//! Compute-node configuration.

use std::time::Duration;

use flotilla_core::error::{Error, Result};
use flotilla_core::network::NetworkKind;

const ENV_DEFAULT_NETWORK: &str = "FLOTILLA_EXECUTOR_DEFAULT_NETWORK_TYPE";
const ENV_ROOT_CLEANUP_DELAY_SECS: &str = "FLOTILLA_EXECUTOR_ROOT_CLEANUP_DELAY_SECS";
const ENV_PORT_RANGE: &str = "FLOTILLA_PORTS_RANGE";

/// Default delay before an execution's scratch directory is removed.
const DEFAULT_ROOT_CLEANUP_DELAY_SECS: u64 = 60 * 60;
/// Default host port range handed out by the allocator.
const DEFAULT_PORT_RANGE: (u16, u16) = (20000, 32000);

const DEFAULT_MAX_STREAM_FILE_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_MAX_STREAM_RETURN_BYTES: u64 = 2048;

/// Byte caps on stdout/stderr capture and return.
///
/// Enforced by the executor backend; the core only conveys them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLimits {
    /// Cap on stdout captured to disk.
    pub max_stdout_capture_bytes: u64,
    /// Cap on stdout returned in the run result.
    pub max_stdout_return_bytes: u64,
    /// Cap on stderr captured to disk.
    pub max_stderr_capture_bytes: u64,
    /// Cap on stderr returned in the run result.
    pub max_stderr_return_bytes: u64,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_stdout_capture_bytes: DEFAULT_MAX_STREAM_FILE_BYTES,
            max_stdout_return_bytes: DEFAULT_MAX_STREAM_RETURN_BYTES,
            max_stderr_capture_bytes: DEFAULT_MAX_STREAM_FILE_BYTES,
            max_stderr_return_bytes: DEFAULT_MAX_STREAM_RETURN_BYTES,
        }
    }
}

/// Tuning for one compute node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeConfig {
    /// Network kind applied when a task asks for `Default`.
    pub default_network_type: NetworkKind,
    /// Delay before an execution's scratch directory is removed.
    pub root_cleanup_delay: Duration,
    /// Inclusive host port range the allocator hands out.
    pub port_range: (u16, u16),
    /// Byte caps conveyed to the executor backend.
    pub output_limits: OutputLimits,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            default_network_type: NetworkKind::None,
            root_cleanup_delay: Duration::from_secs(DEFAULT_ROOT_CLEANUP_DELAY_SECS),
            port_range: DEFAULT_PORT_RANGE,
            output_limits: OutputLimits::default(),
        }
    }
}

impl ComputeConfig {
    /// Loads configuration from the process environment with strict
    /// validation, falling back to defaults for unset keys.
    ///
    /// # Errors
    ///
    /// Returns a validation error when an environment value is malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a validation error when an environment value is malformed.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = get_env(ENV_DEFAULT_NETWORK) {
            config.default_network_type = match raw.to_ascii_lowercase().as_str() {
                "none" => NetworkKind::None,
                "bridge" => NetworkKind::Bridge,
                "host" => NetworkKind::Host,
                "full" => NetworkKind::Full,
                other => {
                    return Err(Error::validation(format!(
                        "{ENV_DEFAULT_NETWORK} must be one of none, bridge, host, full; got '{other}'"
                    )))
                }
            };
        }
        if let Some(raw) = get_env(ENV_ROOT_CLEANUP_DELAY_SECS) {
            let secs = raw.parse::<u64>().map_err(|_| {
                Error::validation(format!(
                    "{ENV_ROOT_CLEANUP_DELAY_SECS} must be an integer, got '{raw}'"
                ))
            })?;
            config.root_cleanup_delay = Duration::from_secs(secs);
        }
        if let Some(raw) = get_env(ENV_PORT_RANGE) {
            let Some((low, high)) = raw.split_once('-') else {
                return Err(Error::validation(format!(
                    "{ENV_PORT_RANGE} must look like '20000-32000', got '{raw}'"
                )));
            };
            let low: u16 = low.trim().parse().map_err(|_| {
                Error::validation(format!("{ENV_PORT_RANGE} low bound '{low}' is not a port"))
            })?;
            let high: u16 = high.trim().parse().map_err(|_| {
                Error::validation(format!("{ENV_PORT_RANGE} high bound '{high}' is not a port"))
            })?;
            if low > high {
                return Err(Error::validation(format!(
                    "{ENV_PORT_RANGE} bounds are inverted: {low} > {high}"
                )));
            }
            config.port_range = (low, high);
        }

        Ok(config)
    }
}
