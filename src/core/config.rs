use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::errors::{CoordError, Result};

pub const DEFAULT_TTL_SECONDS: u64 = 900;
pub const DEFAULT_ORCHESTRATION_TTL_SECONDS: u64 = 1800;
pub const DEFAULT_KEY_PREFIX: &str = "agent_lock";
/// Upper bound for any lock TTL (30 days)
pub const MAX_TTL_SECONDS: u64 = 30 * 24 * 60 * 60;

const ENV_DEFAULT_TTL: &str = "STEPGATE_DEFAULT_TTL_SECONDS";
const ENV_ORCHESTRATION_TTL: &str = "STEPGATE_ORCHESTRATION_TTL_SECONDS";
const ENV_KEY_PREFIX: &str = "STEPGATE_KEY_PREFIX";
const ENV_INSTANCE_ID: &str = "STEPGATE_INSTANCE_ID";

/// Configuration shared by the lock, coordination and orchestration managers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// TTL for a single coordinated task
    pub default_ttl_seconds: u64,
    /// TTL for each step lock taken inside an orchestration run
    pub orchestration_ttl_seconds: u64,
    /// Namespace for derived lock keys
    pub key_prefix: String,
    /// Caller-supplied identifier written into lock metadata for diagnostics
    pub instance_id: Option<String>,
    /// Run every member of a ready set concurrently
    pub parallel_waves: bool,
    /// Upper bound on concurrently running steps when `parallel_waves` is set
    pub max_parallel_steps: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            orchestration_ttl_seconds: DEFAULT_ORCHESTRATION_TTL_SECONDS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            instance_id: None,
            parallel_waves: false,
            max_parallel_steps: 4,
        }
    }
}

impl CoordinationConfig {
    pub fn builder() -> CoordinationConfigBuilder {
        CoordinationConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_seconds == 0 {
            return Err(CoordError::configuration_field(
                "default_ttl_seconds cannot be zero",
                "default_ttl_seconds",
            ));
        }
        if self.orchestration_ttl_seconds == 0 {
            return Err(CoordError::configuration_field(
                "orchestration_ttl_seconds cannot be zero",
                "orchestration_ttl_seconds",
            ));
        }
        for (field, ttl) in [
            ("default_ttl_seconds", self.default_ttl_seconds),
            ("orchestration_ttl_seconds", self.orchestration_ttl_seconds),
        ] {
            validate_ttl(ttl, field)?;
        }
        if self.orchestration_ttl_seconds < self.default_ttl_seconds {
            return Err(CoordError::configuration_field(
                "orchestration_ttl_seconds must not be shorter than default_ttl_seconds",
                "orchestration_ttl_seconds",
            ));
        }
        validate_key_prefix(&self.key_prefix)?;
        if self.max_parallel_steps == 0 {
            return Err(CoordError::configuration_field(
                "max_parallel_steps must be greater than 0",
                "max_parallel_steps",
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoordError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Overlay `STEPGATE_*` environment variables on top of this config.
    pub fn apply_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_DEFAULT_TTL) {
            self.default_ttl_seconds = parse_seconds(ENV_DEFAULT_TTL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_ORCHESTRATION_TTL) {
            self.orchestration_ttl_seconds = parse_seconds(ENV_ORCHESTRATION_TTL, &raw)?;
        }
        if let Some(prefix) = lookup(ENV_KEY_PREFIX) {
            self.key_prefix = prefix;
        }
        if let Some(instance) = lookup(ENV_INSTANCE_ID) {
            self.instance_id = Some(instance);
        }
        self.validate()?;
        Ok(self)
    }
}

/// Prefixes are joined to key components with ':' so they may not contain one.
pub(crate) fn validate_key_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(CoordError::configuration_field(
            "key_prefix cannot be empty",
            "key_prefix",
        ));
    }
    if prefix.contains(':') {
        return Err(CoordError::configuration_field(
            "key_prefix cannot contain ':'",
            "key_prefix",
        ));
    }
    Ok(())
}

pub(crate) fn validate_ttl(ttl_seconds: u64, field: &str) -> Result<()> {
    if ttl_seconds > MAX_TTL_SECONDS {
        return Err(CoordError::configuration_field(
            format!("{} cannot exceed {} seconds", field, MAX_TTL_SECONDS),
            field,
        ));
    }
    Ok(())
}

fn parse_seconds(var: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|e| {
        CoordError::configuration_field(format!("{} is not a number of seconds: {}", var, e), var)
    })
}

/// Builder for CoordinationConfig
#[derive(Debug, Default)]
pub struct CoordinationConfigBuilder {
    config: CoordinationConfig,
}

impl CoordinationConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_ttl_seconds(mut self, ttl: u64) -> Self {
        self.config.default_ttl_seconds = ttl;
        self
    }

    pub fn orchestration_ttl_seconds(mut self, ttl: u64) -> Self {
        self.config.orchestration_ttl_seconds = ttl;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    pub fn instance_id(mut self, instance: impl Into<String>) -> Self {
        self.config.instance_id = Some(instance.into());
        self
    }

    pub fn parallel_waves(mut self, enabled: bool) -> Self {
        self.config.parallel_waves = enabled;
        self
    }

    pub fn max_parallel_steps(mut self, max: usize) -> Self {
        self.config.max_parallel_steps = max;
        self
    }

    pub fn build(self) -> Result<CoordinationConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_ttl_seconds, 900);
        assert!(config.orchestration_ttl_seconds > config.default_ttl_seconds);
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(CoordinationConfig::builder()
            .default_ttl_seconds(0)
            .build()
            .is_err());
        assert!(CoordinationConfig::builder()
            .key_prefix("a:b")
            .build()
            .is_err());
        assert!(CoordinationConfig::builder()
            .default_ttl_seconds(60)
            .orchestration_ttl_seconds(30)
            .build()
            .is_err());
        assert!(CoordinationConfig::builder()
            .default_ttl_seconds(u64::MAX)
            .orchestration_ttl_seconds(u64::MAX)
            .build()
            .is_err());
        assert!(CoordinationConfig::builder()
            .orchestration_ttl_seconds(MAX_TTL_SECONDS + 1)
            .build()
            .is_err());
        assert!(CoordinationConfig::builder()
            .orchestration_ttl_seconds(MAX_TTL_SECONDS)
            .build()
            .is_ok());
        assert!(CoordinationConfig::builder()
            .max_parallel_steps(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_yaml_loading_fills_defaults() {
        let config = CoordinationConfig::from_yaml_str(
            "default_ttl_seconds: 120\ninstance_id: worker-7\n",
        )
        .unwrap();
        assert_eq!(config.default_ttl_seconds, 120);
        assert_eq!(config.instance_id.as_deref(), Some("worker-7"));
        assert_eq!(config.key_prefix, DEFAULT_KEY_PREFIX);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_DEFAULT_TTL, "30"),
            (ENV_KEY_PREFIX, "tenant_a"),
            (ENV_INSTANCE_ID, "pod-3"),
        ]
        .into_iter()
        .collect();

        let config = CoordinationConfig::default()
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.default_ttl_seconds, 30);
        assert_eq!(config.key_prefix, "tenant_a");
        assert_eq!(config.instance_id.as_deref(), Some("pod-3"));

        let bad = CoordinationConfig::default()
            .apply_overrides(|name| (name == ENV_DEFAULT_TTL).then(|| "soon".to_string()));
        assert!(bad.is_err());
    }
}
