use crate::config::{CloudWatchMetricNames, Config, non_empty};
use crate::metrics::{MetricEvent, RemoteSink};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_cloudwatch::Client;
use aws_sdk_cloudwatch::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_cloudwatch::primitives::DateTime;
use aws_sdk_cloudwatch::types::{MetricDatum, StandardUnit};
use std::time::SystemTime;
use tracing::info;

static CREDENTIALS_PROVIDER: &str = "registry-monitor";

/// Publishes probe events with `PutMetricData`.
pub struct CloudWatchSink {
    client: Client,
    namespace: String,
    names: CloudWatchMetricNames,
}

impl CloudWatchSink {
    /// Returns `None` unless access key, secret key and namespace are all set.
    pub fn from_config(config: &Config) -> Option<Self> {
        if !config.cloudwatch_enabled() {
            return None;
        }
        let settings = &config.cloudwatch;
        let access_key = non_empty(&settings.access_key)?;
        let secret_key = settings.secret_key.as_ref()?;
        let namespace = non_empty(&settings.namespace)?;

        info!(
            "Configuring CloudWatch metrics reporting to namespace {} in region {}",
            namespace, settings.region
        );
        let credentials = Credentials::new(
            access_key,
            secret_key.expose_secret(),
            None,
            None,
            CREDENTIALS_PROVIDER,
        );
        let sdk_config = aws_sdk_cloudwatch::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .build();

        Some(Self {
            client: Client::from_conf(sdk_config),
            namespace: namespace.to_string(),
            names: settings.metrics.clone(),
        })
    }

    fn metric_name(&self, event: MetricEvent) -> &str {
        match event {
            MetricEvent::Success => &self.names.success,
            MetricEvent::Failure => &self.names.failure,
            MetricEvent::PullDuration => &self.names.pull_time,
            MetricEvent::PushDuration => &self.names.push_time,
        }
    }
}

fn unit(event: MetricEvent) -> StandardUnit {
    match event {
        MetricEvent::Success | MetricEvent::Failure => StandardUnit::Count,
        MetricEvent::PullDuration | MetricEvent::PushDuration => StandardUnit::Seconds,
    }
}

#[async_trait]
impl RemoteSink for CloudWatchSink {
    async fn put_metric(&self, event: MetricEvent, value: f64) -> anyhow::Result<()> {
        let metric_name = self.metric_name(event);
        let datum = MetricDatum::builder()
            .metric_name(metric_name)
            .timestamp(DateTime::from(SystemTime::now()))
            .unit(unit(event))
            .value(value)
            .build();

        self.client
            .put_metric_data()
            .namespace(&self.namespace)
            .metric_data(datum)
            .send()
            .await
            .with_context(|| format!("Failed to put CloudWatch metric {}", metric_name))?;
        Ok(())
    }
}
