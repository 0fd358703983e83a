//! Config for the evaluation session behaviors.
//!
//! Configuration can be created programmatically using
//! [`Configuration::new()`] or by reading environment variables using
//! [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! - `RACE_LOG` — enable logging to a file (default: `false`)
//! - `RACE_CONCURRENT_RUNS` — bound on simultaneously outstanding runs
//!   (default: number of physical CPUs)
//! - `RACE_CACHE_RUNS` — serve known runs from the history (default: `true`)

use std::env;

/// Configuration for evaluation session behaviors.
#[derive(Debug, Clone, Copy)]
pub struct Configuration {
    pub(crate) log: bool,
    pub(crate) concurrent_runs: usize,
    pub(crate) cache_runs: bool,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Logging to file is disabled.
    /// - The number of concurrently outstanding runs is bounded by the number
    ///   of physical CPUs.
    /// - Runs already present in the history are served from it.
    pub fn new() -> Self {
        Self {
            log: false,
            concurrent_runs: num_cpus::get_physical(),
            cache_runs: true,
        }
    }

    /// Create configuration from environment variables; unset or unparseable
    /// variables fall back to the defaults of [`Configuration::new()`].
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        let defaults = Self::new();
        Self {
            log: get_env_flag("RACE_LOG", defaults.log),
            concurrent_runs: env::var("RACE_CONCURRENT_RUNS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.concurrent_runs),
            cache_runs: get_env_flag("RACE_CACHE_RUNS", defaults.cache_runs),
        }
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Sets the bound on simultaneously outstanding runs.
    pub fn with_concurrent_runs(mut self, value: usize) -> Self {
        self.concurrent_runs = value;
        self
    }

    /// Enable or disable serving known runs from the history.
    pub fn with_cache_runs(mut self, value: bool) -> Self {
        self.cache_runs = value;
        self
    }

    pub fn concurrent_runs(&self) -> usize {
        self.concurrent_runs
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
