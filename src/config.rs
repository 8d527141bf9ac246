use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::models::Target;

pub const DEFAULT_POLL_INTERVAL_MINUTES: i64 = 15;
pub const DEFAULT_FAILURE_THRESHOLD: i64 = 3;
pub const DEFAULT_OPEN_COOLDOWN_SECONDS: i64 = 60;

/// One week
pub const MAX_POLL_INTERVAL_MINUTES: i64 = 7 * 24 * 60;
/// One day
pub const MAX_OPEN_COOLDOWN_SECONDS: i64 = 24 * 60 * 60;
pub const MAX_FAILURE_THRESHOLD: i64 = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub poll_interval_minutes: i64,
    /// Alert endpoint; empty or absent disables alerting
    pub webhook_url: Option<String>,
    pub circuit_breaker: CircuitBreakerSettings,
    pub apps: Vec<Target>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_minutes: DEFAULT_POLL_INTERVAL_MINUTES,
            webhook_url: None,
            circuit_breaker: CircuitBreakerSettings::default(),
            apps: Vec::new(),
        }
    }
}

/// Circuit breaker thresholds as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerSettings {
    pub failure_threshold: i64,
    pub open_cooldown_seconds: i64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_cooldown_seconds: DEFAULT_OPEN_COOLDOWN_SECONDS,
        }
    }
}

impl Config {
    /// Load configuration from a JSON (or YAML) file.
    ///
    /// A missing or malformed file is an error: the poller cannot start without targets.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = content
            .parse()
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        info!(
            path = %path.display(),
            targets = config.apps.len(),
            interval_minutes = config.poll_interval_minutes,
            "Loaded configuration"
        );

        Ok(config)
    }

    /// Replace zero, negative and empty settings with their defaults and cap
    /// oversized ones
    pub fn normalize(mut self) -> Self {
        if self.poll_interval_minutes <= 0 {
            self.poll_interval_minutes = DEFAULT_POLL_INTERVAL_MINUTES;
        }
        if self.circuit_breaker.failure_threshold <= 0 {
            self.circuit_breaker.failure_threshold = DEFAULT_FAILURE_THRESHOLD;
        }
        if self.circuit_breaker.open_cooldown_seconds <= 0 {
            self.circuit_breaker.open_cooldown_seconds = DEFAULT_OPEN_COOLDOWN_SECONDS;
        }
        self.poll_interval_minutes = self.poll_interval_minutes.min(MAX_POLL_INTERVAL_MINUTES);
        self.circuit_breaker.failure_threshold =
            self.circuit_breaker.failure_threshold.min(MAX_FAILURE_THRESHOLD);
        self.circuit_breaker.open_cooldown_seconds =
            self.circuit_breaker.open_cooldown_seconds.min(MAX_OPEN_COOLDOWN_SECONDS);
        self.webhook_url = self
            .webhook_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        self
    }

    /// Reject targets that cannot form a storage key
    pub fn validate(&self) -> Result<()> {
        for (index, app) in self.apps.iter().enumerate() {
            if app.app_id.trim().is_empty() || app.country.trim().is_empty() {
                anyhow::bail!(
                    "apps[{}] must have a non-empty appId and country, got {:?}",
                    index,
                    app
                );
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        let minutes = self.poll_interval_minutes.clamp(1, MAX_POLL_INTERVAL_MINUTES);
        Duration::from_secs(minutes as u64 * 60)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self
                .circuit_breaker
                .failure_threshold
                .clamp(1, MAX_FAILURE_THRESHOLD) as u32,
            cooldown: Duration::from_secs(
                self.circuit_breaker
                    .open_cooldown_seconds
                    .clamp(1, MAX_OPEN_COOLDOWN_SECONDS) as u64,
            ),
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // YAML is a superset of JSON, so both config styles go through serde_yaml
        let config: Config = serde_yaml::from_str(s)?;
        let config = config.normalize();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval_minutes, 15);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.open_cooldown_seconds, 60);
        assert!(config.apps.is_empty());
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "pollIntervalMinutes": 5,
            "webhookUrl": "https://hooks.example.com/alerts",
            "circuitBreaker": { "failureThreshold": 4, "openCooldownSeconds": 30 },
            "apps": [
                { "appId": "595068606", "country": "us" },
                { "appId": "284882215", "country": "it", "name": "Facebook" }
            ]
        }"#;

        let config: Config = json.parse().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(300));
        assert_eq!(config.webhook_url.as_deref(), Some("https://hooks.example.com/alerts"));
        assert_eq!(config.breaker_config().failure_threshold, 4);
        assert_eq!(config.breaker_config().cooldown, Duration::from_secs(30));
        assert_eq!(config.apps.len(), 2);
        assert_eq!(config.apps[1].name.as_deref(), Some("Facebook"));
    }

    #[test]
    fn test_zero_and_missing_values_use_defaults() {
        let json = r#"{
            "pollIntervalMinutes": 0,
            "webhookUrl": "",
            "circuitBreaker": { "failureThreshold": -1 },
            "apps": []
        }"#;

        let config: Config = json.parse().unwrap();
        assert_eq!(config.poll_interval_minutes, 15);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.open_cooldown_seconds, 60);
        assert!(config.webhook_url.is_none());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
pollIntervalMinutes: 10
apps:
  - appId: "595068606"
    country: gb
"#;

        let config: Config = yaml.parse().unwrap();
        assert_eq!(config.poll_interval_minutes, 10);
        assert_eq!(config.apps[0].key(), "595068606-gb");
    }

    #[test]
    fn test_oversized_values_are_capped() {
        let json = r#"{
            "pollIntervalMinutes": 9223372036854775807,
            "circuitBreaker": {
                "failureThreshold": 9223372036854775807,
                "openCooldownSeconds": 9223372036854775807
            }
        }"#;

        let config: Config = json.parse().unwrap();
        assert_eq!(config.poll_interval_minutes, MAX_POLL_INTERVAL_MINUTES);
        assert_eq!(config.poll_interval(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.breaker_config().failure_threshold, 1000);
        assert_eq!(config.breaker_config().cooldown, Duration::from_secs(86400));

        // fields set directly, bypassing normalize
        let mut raw = Config::default();
        raw.poll_interval_minutes = i64::MAX;
        raw.circuit_breaker.open_cooldown_seconds = i64::MAX;
        assert_eq!(raw.poll_interval(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(raw.breaker_config().cooldown, Duration::from_secs(86400));
    }

    #[test]
    fn test_rejects_empty_target_fields() {
        let json = r#"{ "apps": [ { "appId": "", "country": "us" } ] }"#;
        assert!(json.parse::<Config>().is_err());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(dir.path().join("apps.json")).is_err());
    }
}
