use crate::config::{Config, load_config, parse_duration};
use crate::secret_string::SecretString;
use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Every flag can also be set through `REGISTRY_MONITOR_<FLAG>`. Flags win
/// over environment variables, which win over the config file.
#[derive(Debug, Parser)]
#[command(
    name = "registry-monitor",
    version,
    about = "Continuously pulls and pushes a test image to verify a container registry"
)]
pub struct Cli {
    /// YAML config file; `${VAR}` placeholders are expanded from the environment
    #[arg(long, env = "REGISTRY_MONITOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address of the health, status and metrics endpoints
    #[arg(long, env = "REGISTRY_MONITOR_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// trace, debug, info, warn or error
    #[arg(long, env = "REGISTRY_MONITOR_LOGLEVEL")]
    pub loglevel: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_REGISTRY_HOST")]
    pub registry_host: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_REPOSITORY")]
    pub repository: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Repository-relative base image the top layer is rebuilt from
    #[arg(long, env = "REGISTRY_MONITOR_BASE_IMAGE")]
    pub base_image: Option<String>,

    /// Layer id the top layer is rebuilt from
    #[arg(long, env = "REGISTRY_MONITOR_BASE_LAYER_ID")]
    pub base_layer_id: Option<String>,

    /// Pull images without credentials
    #[arg(
        long,
        env = "REGISTRY_MONITOR_PUBLIC_BASE",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub public_base: Option<bool>,

    /// Interval between successful tests, e.g. `2m` or `1h30m`
    #[arg(long, env = "REGISTRY_MONITOR_RUN_TEST_EVERY", value_parser = parse_duration)]
    pub run_test_every: Option<Duration>,

    #[arg(long, env = "REGISTRY_MONITOR_ENGINE_URL")]
    pub engine_url: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_ENGINE_API_VERSION")]
    pub engine_api_version: Option<String>,

    #[arg(long, env = "PROMETHEUS_NAMESPACE")]
    pub prometheus_namespace: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_AWS_ACCESS_KEY")]
    pub aws_access_key: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_AWS_SECRET_KEY", hide_env_values = true)]
    pub aws_secret_key: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_CLOUDWATCH_NAMESPACE")]
    pub cloudwatch_namespace: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_CLOUDWATCH_REGION")]
    pub cloudwatch_region: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_CLOUDWATCH_METRIC_SUCCESS")]
    pub cloudwatch_metric_success: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_CLOUDWATCH_METRIC_FAILURE")]
    pub cloudwatch_metric_failure: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_CLOUDWATCH_METRIC_PULL_TIME")]
    pub cloudwatch_metric_pull_time: Option<String>,

    #[arg(long, env = "REGISTRY_MONITOR_CLOUDWATCH_METRIC_PUSH_TIME")]
    pub cloudwatch_metric_push_time: Option<String>,
}

fn overlay<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl Cli {
    /// Where the base configuration comes from, for the startup log.
    pub fn config_source(&self) -> String {
        match &self.config {
            Some(path) => format!("config file {}", path.display()),
            None => "built-in defaults".to_string(),
        }
    }

    /// Loads the config file (or the defaults), applies command line and
    /// environment settings on top and validates the result.
    pub fn resolve_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => Config::default(),
        };
        self.apply(&mut config);
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    fn apply(self, config: &mut Config) {
        overlay(&mut config.listen, self.listen);
        overlay(&mut config.log_level, self.loglevel);

        let registry = &mut config.registry;
        overlay(&mut registry.host, self.registry_host);
        overlay(&mut registry.repository, self.repository);
        overlay(&mut registry.username, self.username);
        overlay(&mut registry.password, self.password.map(SecretString::from));

        let base = &mut config.base;
        if self.base_image.is_some() {
            base.image = self.base_image;
        }
        if self.base_layer_id.is_some() {
            base.layer_id = self.base_layer_id;
        }
        overlay(&mut base.public, self.public_base);

        overlay(&mut config.run_test_every, self.run_test_every);
        overlay(&mut config.engine.url, self.engine_url);
        overlay(&mut config.engine.api_version, self.engine_api_version);
        overlay(&mut config.prometheus.namespace, self.prometheus_namespace);

        let cloudwatch = &mut config.cloudwatch;
        if self.aws_access_key.is_some() {
            cloudwatch.access_key = self.aws_access_key;
        }
        if let Some(secret) = self.aws_secret_key {
            cloudwatch.secret_key = Some(SecretString::from(secret));
        }
        if self.cloudwatch_namespace.is_some() {
            cloudwatch.namespace = self.cloudwatch_namespace;
        }
        overlay(&mut cloudwatch.region, self.cloudwatch_region);
        overlay(&mut cloudwatch.metrics.success, self.cloudwatch_metric_success);
        overlay(&mut cloudwatch.metrics.failure, self.cloudwatch_metric_failure);
        overlay(&mut cloudwatch.metrics.pull_time, self.cloudwatch_metric_pull_time);
        overlay(&mut cloudwatch.metrics.push_time, self.cloudwatch_metric_push_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::steps::BaseSelector;
    use std::fs;

    const REQUIRED: [&str; 9] = [
        "registry-monitor",
        "--registry-host",
        "registry.example.com",
        "--repository",
        "monitor/app",
        "--username",
        "robot",
        "--password",
        "s3cret",
    ];

    fn parse(extra: &[&str]) -> Cli {
        Cli::try_parse_from(REQUIRED.iter().chain(extra)).expect("valid arguments")
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&[
            "--run-test-every",
            "45s",
            "--base-image",
            "alpine",
            "--public-base",
            "--listen",
            "127.0.0.1:9100",
        ])
        .resolve_config()
        .unwrap();

        assert_eq!(config.registry.host, "registry.example.com");
        assert_eq!(config.registry.password.expose_secret(), "s3cret");
        assert_eq!(config.run_test_every, Duration::from_secs(45));
        assert_eq!(config.listen.port(), 9100);
        assert!(config.base.public);
        assert_eq!(
            config.base_selector(),
            Some(BaseSelector::BaseImage("alpine".to_string()))
        );
        assert_eq!(config.engine.url, "http://127.0.0.1:8888");
    }

    #[test]
    fn test_config_source() {
        assert_eq!(parse(&[]).config_source(), "built-in defaults");
        assert_eq!(
            parse(&["--config", "/etc/registry-monitor.yaml"]).config_source(),
            "config file /etc/registry-monitor.yaml"
        );
    }

    #[test]
    fn test_public_base_accepts_explicit_value() {
        let cli = parse(&["--public-base", "false"]);
        assert_eq!(cli.public_base, Some(false));
        assert!(!cli.resolve_config().unwrap().base.public);
    }

    #[test]
    fn test_invalid_duration_is_rejected_while_parsing() {
        let args = REQUIRED.iter().chain(&["--run-test-every", "often"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_missing_required_setting_is_reported() {
        let err = Cli::try_parse_from(["registry-monitor", "--username", "robot"])
            .unwrap()
            .resolve_config()
            .unwrap_err();
        let cause = err.downcast_ref::<ConfigError>().expect("config error");
        assert_eq!(*cause, ConfigError::Missing("password"));
    }

    #[test]
    fn test_conflicting_base_selectors_are_rejected() {
        let err = parse(&["--base-image", "alpine", "--base-layer-id", "abc"])
            .resolve_config()
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::ConflictingBase)
        );
    }

    #[test]
    fn test_flags_override_config_file() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(
            tmp_file.path(),
            "registry:\n  host: file.example.com\n  repository: from/file\nrunTestEvery: 10m\ncloudwatch:\n  region: eu-west-1\n",
        )
        .expect("Failed to write config");

        let path = tmp_file.path().to_string_lossy().to_string();
        let config = parse(&["--config", &path, "--cloudwatch-metric-success", "Ok"])
            .resolve_config()
            .unwrap();

        assert_eq!(config.registry.host, "registry.example.com");
        assert_eq!(config.registry.repository, "monitor/app");
        assert_eq!(config.run_test_every, Duration::from_secs(600));
        assert_eq!(config.cloudwatch.region, "eu-west-1");
        assert_eq!(config.cloudwatch.metrics.success, "Ok");
        assert_eq!(config.cloudwatch.metrics.failure, "MonitorFailure");
    }

    #[test]
    fn test_cloudwatch_flags_enable_reporting() {
        let config = parse(&[
            "--aws-access-key",
            "AKIA",
            "--aws-secret-key",
            "secret",
            "--cloudwatch-namespace",
            "Registry",
        ])
        .resolve_config()
        .unwrap();
        assert!(config.cloudwatch_enabled());
    }
}
