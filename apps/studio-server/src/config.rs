// [[STUDIO]]/apps/studio-server/src/config.rs
// Purpose: Process configuration read from STUDIO_* environment variables.
// Architecture: Application Boot
// Dependencies: thiserror

use std::time::Duration;
use thiserror::Error;

use crate::registry::RunSettings;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudioConfig {
    pub host: String,
    pub port: u16,
    pub example: String,
    pub event_buffer: Option<usize>,
    pub input_timeout: Option<Duration>,
    pub run_retention: Duration,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            example: "ordered".to_string(),
            event_buffer: None,
            input_timeout: None,
            run_retention: Duration::from_secs(600),
        }
    }
}

impl StudioConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(host) = get("STUDIO_HOST") {
            config.host = host;
        }
        if let Some(port) = get("STUDIO_PORT") {
            config.port = parse("STUDIO_PORT", "a port number", &port)?;
        }
        if let Some(example) = get("STUDIO_EXAMPLE") {
            config.example = example;
        }
        if let Some(buffer) = get("STUDIO_EVENT_BUFFER") {
            let capacity: usize = parse("STUDIO_EVENT_BUFFER", "a non-negative integer", &buffer)?;
            config.event_buffer = (capacity > 0).then_some(capacity);
        }
        if let Some(secs) = get("STUDIO_INPUT_TIMEOUT_SECS") {
            let secs: u64 = parse("STUDIO_INPUT_TIMEOUT_SECS", "whole seconds", &secs)?;
            config.input_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = get("STUDIO_RUN_RETENTION_SECS") {
            config.run_retention = Duration::from_secs(parse("STUDIO_RUN_RETENTION_SECS", "whole seconds", &secs)?);
        }
        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            event_buffer: self.event_buffer,
            input_timeout: self.input_timeout,
            retention: self.run_retention,
        }
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, expected: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        expected,
        value: value.to_string(),
    })
}

/// Truthy values accepted by boolean switches: 1, true, yes, y, on.
pub fn flag(value: Option<String>, default: bool) -> bool {
    match value {
        Some(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<StudioConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StudioConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, StudioConfig::default());
        assert_eq!(config.bind_addr(), "127.0.0.1:8000");
        assert_eq!(config.run_settings().event_buffer, None);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("STUDIO_HOST", "0.0.0.0"),
            ("STUDIO_PORT", "9100"),
            ("STUDIO_EXAMPLE", "parallel_joins"),
            ("STUDIO_EVENT_BUFFER", "64"),
            ("STUDIO_INPUT_TIMEOUT_SECS", "30"),
            ("STUDIO_RUN_RETENTION_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:9100");
        assert_eq!(config.example, "parallel_joins");
        assert_eq!(config.event_buffer, Some(64));
        assert_eq!(config.input_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.run_retention, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_buffer_means_unbounded() {
        let config = load(&[("STUDIO_EVENT_BUFFER", "0"), ("STUDIO_INPUT_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(config.event_buffer, None);
        assert_eq!(config.input_timeout, None);
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let err = load(&[("STUDIO_PORT", "eighty")]).unwrap_err();
        assert_eq!(err.to_string(), "STUDIO_PORT must be a port number, got \"eighty\"");
        assert!(load(&[("STUDIO_EVENT_BUFFER", "-1")]).is_err());
    }

    #[test]
    fn test_flag() {
        assert!(flag(Some(" Yes ".into()), false));
        assert!(!flag(Some("off".into()), true));
        assert!(flag(None, true));
    }
}
