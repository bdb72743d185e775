use crate::engine::RegistryAuth;
use crate::secret_string::SecretString;
use crate::steps::BaseSelector;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use std::{env, fs, path::Path};

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)}").expect("valid env var pattern"));

static DURATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|ms|s|m|h)").expect("valid duration pattern")
});

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("both base-image and base-layer-id are set; only one of them is allowed")]
    ConflictingBase,
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("invalid log level {0:?}")]
    InvalidLogLevel(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub listen: SocketAddr,
    pub log_level: String,
    pub registry: Registry,
    pub base: Base,
    #[serde(deserialize_with = "deserialize_duration")]
    pub run_test_every: Duration,
    pub engine: Engine,
    pub prometheus: Prometheus,
    pub cloudwatch: CloudWatch,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Registry {
    pub host: String,
    pub repository: String,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Base {
    pub image: Option<String>,
    pub layer_id: Option<String>,
    pub public: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Engine {
    pub url: String,
    pub api_version: String,
    pub ca_certificate_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Prometheus {
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CloudWatch {
    pub access_key: Option<String>,
    pub secret_key: Option<SecretString>,
    pub namespace: Option<String>,
    pub region: String,
    pub metrics: CloudWatchMetricNames,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CloudWatchMetricNames {
    pub success: String,
    pub failure: String,
    pub pull_time: String,
    pub push_time: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8000)),
            log_level: "info".to_string(),
            registry: Registry::default(),
            base: Base::default(),
            run_test_every: Duration::from_secs(120),
            engine: Engine::default(),
            prometheus: Prometheus::default(),
            cloudwatch: CloudWatch::default(),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8888".to_string(),
            api_version: "v3.0.0".to_string(),
            ca_certificate_paths: Vec::new(),
        }
    }
}

impl Default for CloudWatch {
    fn default() -> Self {
        Self {
            access_key: None,
            secret_key: None,
            namespace: None,
            region: "us-east-1".to_string(),
            metrics: CloudWatchMetricNames::default(),
        }
    }
}

impl Default for CloudWatchMetricNames {
    fn default() -> Self {
        Self {
            success: "MonitorSuccess".to_string(),
            failure: "MonitorFailure".to_string(),
            pull_time: "MonitorPullTime".to_string(),
            push_time: "MonitorPushTime".to_string(),
        }
    }
}

impl Config {
    /// Checks the enumerated required settings once, before anything is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.username.trim().is_empty() {
            return Err(ConfigError::Missing("username"));
        }
        if self.registry.password.is_empty() {
            return Err(ConfigError::Missing("password"));
        }
        if self.registry.host.trim().is_empty() {
            return Err(ConfigError::Missing("registry-host"));
        }
        if self.registry.repository.trim().is_empty() {
            return Err(ConfigError::Missing("repository"));
        }
        if non_empty(&self.base.image).is_some() && non_empty(&self.base.layer_id).is_some() {
            return Err(ConfigError::ConflictingBase);
        }
        self.tracing_level()?;
        Ok(())
    }

    /// The configured base selector, or `None` when it has to be resolved from
    /// the repository's image history.
    pub fn base_selector(&self) -> Option<BaseSelector> {
        if let Some(image) = non_empty(&self.base.image) {
            return Some(BaseSelector::BaseImage(image.to_string()));
        }
        non_empty(&self.base.layer_id).map(|id| BaseSelector::BaseLayerId(id.to_string()))
    }

    pub fn registry_auth(&self) -> RegistryAuth {
        RegistryAuth {
            username: self.registry.username.clone(),
            password: self.registry.password.clone(),
        }
    }

    /// Credentials for pulls; a public base image is pulled anonymously.
    pub fn pull_auth(&self) -> Option<RegistryAuth> {
        (!self.base.public).then(|| self.registry_auth())
    }

    /// CloudWatch reporting requires access key, secret key and namespace.
    pub fn cloudwatch_enabled(&self) -> bool {
        non_empty(&self.cloudwatch.access_key).is_some()
            && self
                .cloudwatch
                .secret_key
                .as_ref()
                .is_some_and(|secret| !secret.is_empty())
            && non_empty(&self.cloudwatch.namespace).is_some()
    }

    /// `fatal` and `panic` are accepted as aliases of `error`.
    pub fn tracing_level(&self) -> Result<tracing::Level, ConfigError> {
        match self.log_level.trim().to_ascii_lowercase().as_str() {
            "fatal" | "panic" => Ok(tracing::Level::ERROR),
            level => level
                .parse()
                .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone())),
        }
    }
}

pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Runs before the tracing subscriber is installed, so it does not log.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let mut missing = None;
    let result = ENV_VAR_PATTERN.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    if let Some(var_name) = missing {
        anyhow::bail!("Missing environment variable: {}", var_name);
    }
    Ok(result.into_owned())
}

/// Parses Go-style durations such as `2m`, `1h30m`, `45s` or `1.5s`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let trimmed = input.trim();
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let mut position = 0;
    let mut nanos = 0f64;
    for caps in DURATION_PATTERN.captures_iter(trimmed) {
        let whole = caps.get(0).ok_or_else(invalid)?;
        if whole.start() != position {
            return Err(invalid());
        }
        position = whole.end();

        let value: f64 = caps[1].parse().map_err(|_| invalid())?;
        let unit_nanos = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            _ => 3600e9,
        };
        nanos += value * unit_nanos;
    }

    if position == 0 || position != trimmed.len() {
        return Err(invalid());
    }
    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}
