use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::OptsvaError;

pub const ENV_SWEEP_MS: &str = "OPTSVA_SWEEP_MS";
pub const ENV_HEARTBEAT_MS: &str = "OPTSVA_HEARTBEAT_MS";
pub const ENV_MAX_RETRIES: &str = "OPTSVA_MAX_RETRIES";
pub const ENV_WAIT_POLL_MS: &str = "OPTSVA_WAIT_POLL_MS";
pub const ENV_WAIT_STATS: &str = "OPTSVA_WAIT_STATS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptsvaConfig {
    /// How often the failure monitor sweeps its tracked transactions. A
    /// transaction is declared failed when no heartbeat arrived between two
    /// consecutive sweeps.
    pub sweep_interval_ms: u64,
    /// Heartbeat period; must be shorter than the sweep period.
    pub heartbeat_interval_ms: u64,
    /// Bound on re-executions of a transaction body after `Retry` or a
    /// transport fault.
    pub max_retries: usize,
    /// Slice used by blocking waits that also watch the task scheduler's
    /// health.
    pub wait_poll_ms: u64,
    pub wait_stats_enabled: bool,
}

impl Default for OptsvaConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 15_000,
            heartbeat_interval_ms: 5_000,
            max_retries: 16,
            wait_poll_ms: 50,
            wait_stats_enabled: false,
        }
    }
}

impl OptsvaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sweep_interval_ms = interval_ms;
        self
    }

    pub fn heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn wait_poll_ms(mut self, poll_ms: u64) -> Self {
        self.wait_poll_ms = poll_ms;
        self
    }

    pub fn wait_stats_enabled(mut self, enabled: bool) -> Self {
        self.wait_stats_enabled = enabled;
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms)
    }

    pub fn validate(&self) -> Result<(), OptsvaError> {
        if self.sweep_interval_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(OptsvaError::InvalidConfig(
                "sweep and heartbeat intervals must be positive".into(),
            ));
        }
        if self.heartbeat_interval_ms >= self.sweep_interval_ms {
            return Err(OptsvaError::InvalidConfig(format!(
                "heartbeat interval ({} ms) must be shorter than the sweep interval ({} ms)",
                self.heartbeat_interval_ms, self.sweep_interval_ms
            )));
        }
        if self.max_retries == 0 {
            return Err(OptsvaError::InvalidConfig("max_retries must be at least 1".into()));
        }
        if self.wait_poll_ms == 0 {
            return Err(OptsvaError::InvalidConfig("wait_poll_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, OptsvaError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, OptsvaError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Defaults overridden by the `OPTSVA_*` environment variables.
    pub fn from_env() -> Result<Self, OptsvaError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, OptsvaError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = non_empty(lookup(ENV_SWEEP_MS)) {
            self.sweep_interval_ms = parse_var(ENV_SWEEP_MS, &value)?;
        }
        if let Some(value) = non_empty(lookup(ENV_HEARTBEAT_MS)) {
            self.heartbeat_interval_ms = parse_var(ENV_HEARTBEAT_MS, &value)?;
        }
        if let Some(value) = non_empty(lookup(ENV_MAX_RETRIES)) {
            self.max_retries = parse_var(ENV_MAX_RETRIES, &value)?;
        }
        if let Some(value) = non_empty(lookup(ENV_WAIT_POLL_MS)) {
            self.wait_poll_ms = parse_var(ENV_WAIT_POLL_MS, &value)?;
        }
        if let Some(value) = non_empty(lookup(ENV_WAIT_STATS)) {
            self.wait_stats_enabled = matches!(value.as_str(), "1" | "true" | "on" | "yes");
        }
        self.validate()?;
        Ok(self)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_var<N: std::str::FromStr>(key: &str, value: &str) -> Result<N, OptsvaError> {
    value
        .trim()
        .parse()
        .map_err(|_| OptsvaError::InvalidConfig(format!("{key}: cannot parse '{value}'")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OptsvaConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_secs(15));
        assert!(config.heartbeat_interval() < config.sweep_interval());
    }

    #[test]
    fn heartbeat_must_be_shorter_than_sweep() {
        let config = OptsvaConfig::new()
            .sweep_interval_ms(100)
            .heartbeat_interval_ms(100);
        assert!(matches!(config.validate(), Err(OptsvaError::InvalidConfig(_))));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = OptsvaConfig::from_json_str(r#"{"sweep_interval_ms": 200, "heartbeat_interval_ms": 50}"#)
            .unwrap();
        assert_eq!(config.sweep_interval_ms, 200);
        assert_eq!(config.heartbeat_interval_ms, 50);
        assert_eq!(config.max_retries, OptsvaConfig::default().max_retries);
    }

    #[test]
    fn overrides_replace_defaults() {
        let vars: HashMap<&str, &str> = [
            (ENV_SWEEP_MS, "400"),
            (ENV_HEARTBEAT_MS, "100"),
            (ENV_WAIT_STATS, "true"),
            (ENV_MAX_RETRIES, ""),
        ]
        .into_iter()
        .collect();
        let config = OptsvaConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.sweep_interval_ms, 400);
        assert_eq!(config.heartbeat_interval_ms, 100);
        assert!(config.wait_stats_enabled);
        assert_eq!(config.max_retries, 16);
    }

    #[test]
    fn unparsable_override_is_rejected() {
        let err = OptsvaConfig::default()
            .with_overrides(|key| (key == ENV_SWEEP_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_SWEEP_MS));
    }
}
