//! Layered YAML configuration
//!
//! Files given with `-c` are merged in order, later keys winning; mappings
//! merge recursively, everything else is replaced. Environment overrides are
//! applied last.

use crate::supervisor::readiness::{Backoff, BasicAuth, RetryPolicy};
use crate::{Result, TopowatchError};
use serde::Deserialize;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use topowatch_agent::AgentConfig;
use topowatch_common::{env, parse_analyzers, Capture, DEFAULT_ANALYZER_PORT};

/// The only configuration backend
pub const FILE_BACKEND: &str = "file";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub analyzer: AnalyzerConfig,
    pub logging: LoggingConfig,
    pub agent: AgentSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub listen: String,
    pub tls: bool,
    pub auth: Option<AuthConfig>,
    pub readiness: ReadinessConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            listen: format!("127.0.0.1:{}", DEFAULT_ANALYZER_PORT),
            tls: false,
            auth: None,
            readiness: ReadinessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// 0 retries forever
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
    /// Per-request timeout
    pub timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: BackoffKind::Exponential,
            delay_ms: 100,
            max_delay_ms: 5000,
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: LogFileConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: LogFileConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogFileConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub topology: TopologyConfig,
    pub captures: Vec<Capture>,
    /// Filled from the environment by the supervisor
    pub analyzers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub probes: Vec<String>,
    pub netns: serde_json::Value,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        let defaults = AgentConfig::default();
        Self {
            probes: defaults.probes,
            netns: defaults.netns,
        }
    }
}

impl Config {
    /// Load and merge `files` through `backend`, then apply the process
    /// environment.
    pub fn load(backend: Option<&str>, files: &[PathBuf]) -> Result<Self> {
        let mut config = Self::from_files(backend, files)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_files(backend: Option<&str>, files: &[PathBuf]) -> Result<Self> {
        if let Some(backend) = backend.filter(|b| *b != FILE_BACKEND) {
            return Err(TopowatchError::ConfigError(format!(
                "unsupported configuration backend '{}'",
                backend
            )));
        }

        let mut merged = Value::Mapping(Default::default());
        for file in files {
            merge(&mut merged, read_yaml(file)?);
        }

        serde_yaml::from_value(merged)
            .map_err(|e| TopowatchError::ConfigError(format!("invalid configuration: {}", e)))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| TopowatchError::ConfigError(e.to_string()))?;
        let mut merged = Value::Mapping(Default::default());
        merge(&mut merged, value);
        serde_yaml::from_value(merged).map_err(|e| TopowatchError::ConfigError(e.to_string()))
    }

    /// Apply overrides from `lookup` (the process environment in production)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(env::LOGGING_FILE_PATH).filter(|p| !p.is_empty()) {
            self.logging.file.path = Some(PathBuf::from(path));
        }
        if let Some(analyzers) = lookup(env::ANALYZERS) {
            self.agent.analyzers = parse_analyzers(&analyzers);
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let readiness = &self.analyzer.readiness;
        let delay = Duration::from_millis(readiness.delay_ms);
        RetryPolicy {
            max_attempts: (readiness.max_attempts > 0).then_some(readiness.max_attempts),
            backoff: match readiness.backoff {
                BackoffKind::Fixed => Backoff::Fixed(delay),
                BackoffKind::Exponential => Backoff::Exponential {
                    initial: delay,
                    max: Duration::from_millis(readiness.max_delay_ms).max(delay),
                },
            },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.analyzer.readiness.timeout_ms)
    }

    pub fn analyzer_auth(&self) -> Option<BasicAuth> {
        self.analyzer.auth.as_ref().map(|auth| BasicAuth {
            username: auth.username.clone(),
            password: auth.password.clone(),
        })
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            probes: self.agent.topology.probes.clone(),
            netns: self.agent.topology.netns.clone(),
            captures: self.agent.captures.clone(),
            analyzers: self.agent.analyzers.clone(),
        }
    }
}

fn read_yaml(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        TopowatchError::ConfigError(format!("can't read {}: {}", path.display(), e))
    })?;
    serde_yaml::from_str(&text)
        .map_err(|e| TopowatchError::ConfigError(format!("{}: {}", path.display(), e)))
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        // Empty documents leave the base untouched
        (_, Value::Null) => {}
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
