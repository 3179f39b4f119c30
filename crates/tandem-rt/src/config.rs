// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Builder-style setters plus `from_env()`:
//!
//! - `TANDEM_PROCS`: processor slots; 0 or unset means available parallelism
//! - `TANDEM_DEADLOCK`: `off`/`0`/`false` disables the liveness monitor
//! - `TANDEM_WATCHDOG_MS`: liveness monitor interval in milliseconds

use std::thread;
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_PROCS: &str = "TANDEM_PROCS";
pub const ENV_DEADLOCK: &str = "TANDEM_DEADLOCK";
pub const ENV_WATCHDOG_MS: &str = "TANDEM_WATCHDOG_MS";

const DEFAULT_WATCHDOG: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Processor slots. 0 means one per available CPU.
    pub procs: usize,
    pub deadlock_detection: bool,
    pub watchdog_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            procs: 0,
            deadlock_detection: true,
            watchdog_interval: DEFAULT_WATCHDOG,
        }
    }
}

impl RuntimeConfig {
    pub fn with_procs(mut self, procs: usize) -> Self {
        self.procs = procs;
        self
    }

    pub fn with_deadlock_detection(mut self, on: bool) -> Self {
        self.deadlock_detection = on;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Defaults overridden by the `TANDEM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_PROCS) {
            config.procs = parse_number(ENV_PROCS, &v)? as usize;
        }
        if let Some(v) = lookup(ENV_DEADLOCK) {
            config.deadlock_detection = parse_switch(ENV_DEADLOCK, &v)?;
        }
        if let Some(v) = lookup(ENV_WATCHDOG_MS) {
            config.watchdog_interval = Duration::from_millis(parse_number(ENV_WATCHDOG_MS, &v)?);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog_interval < Duration::from_millis(1) {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }

    /// Slot count with 0 resolved to the machine's parallelism.
    pub fn effective_procs(&self) -> usize {
        if self.procs == 0 {
            thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            self.procs
        }
    }
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::NotANumber {
        var,
        value: value.to_string(),
    })
}

fn parse_switch(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "1" | "true" | "yes" => Ok(true),
        "off" | "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::NotASwitch {
            var,
            value: value.to_string(),
        }),
    }
}
