use async_trait::async_trait;
use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The four events a probe cycle reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    Success,
    Failure,
    PullDuration,
    PushDuration,
}

impl MetricEvent {
    #[inline]
    pub fn as_label(&self) -> &'static str {
        match self {
            MetricEvent::Success => "success",
            MetricEvent::Failure => "failure",
            MetricEvent::PullDuration => "pull_duration",
            MetricEvent::PushDuration => "push_duration",
        }
    }
}

/// Push-based metrics destination. Errors are logged by the caller and never
/// reach the monitor.
#[async_trait]
pub trait RemoteSink: Send + Sync + 'static {
    async fn put_metric(&self, event: MetricEvent, value: f64) -> anyhow::Result<()>;
}

/// Local prometheus registry plus an optional remote sink.
///
/// ## Metrics
/// - `monitor_success` - Counter of successful pull/push cycles
/// - `monitor_failure` - Counter of failed pull/push cycles
/// - `monitor_pull` - Histogram of test image pull time in seconds
/// - `monitor_push` - Histogram of test image push time in seconds
pub struct MonitorMetrics {
    success: IntCounter,
    failure: IntCounter,
    pull_duration: Histogram,
    push_duration: Histogram,
    registry: Registry,
    remote: Option<Arc<dyn RemoteSink>>,
}

impl MonitorMetrics {
    pub fn new(
        namespace: &str,
        remote: Option<Arc<dyn RemoteSink>>,
    ) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let success = IntCounter::with_opts(
            Opts::new(
                "monitor_success",
                "The registry monitor successfully completed a pull and push operation",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(success.clone()))?;

        let failure = IntCounter::with_opts(
            Opts::new(
                "monitor_failure",
                "The registry monitor failed to complete a pull and push operation",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(failure.clone()))?;

        let pull_duration = Histogram::with_opts(
            HistogramOpts::new("monitor_pull", "The time for the monitor pull operation")
                .namespace(namespace)
                .buckets(duration_buckets()),
        )?;
        registry.register(Box::new(pull_duration.clone()))?;

        let push_duration = Histogram::with_opts(
            HistogramOpts::new("monitor_push", "The time for the monitor push operation")
                .namespace(namespace)
                .buckets(duration_buckets()),
        )?;
        registry.register(Box::new(push_duration.clone()))?;

        Ok(Self {
            success,
            failure,
            pull_duration,
            push_duration,
            registry,
            remote,
        })
    }

    pub async fn record_success(&self) {
        self.success.inc();
        self.forward(MetricEvent::Success, 1.0).await;
    }

    pub async fn record_failure(&self) {
        self.failure.inc();
        self.forward(MetricEvent::Failure, 1.0).await;
    }

    pub async fn record_pull_duration(&self, duration: Duration) {
        self.pull_duration.observe(duration.as_secs_f64());
        self.forward(MetricEvent::PullDuration, duration.as_secs_f64())
            .await;
    }

    pub async fn record_push_duration(&self, duration: Duration) {
        self.push_duration.observe(duration.as_secs_f64());
        self.forward(MetricEvent::PushDuration, duration.as_secs_f64())
            .await;
    }

    async fn forward(&self, event: MetricEvent, value: f64) {
        let Some(remote) = &self.remote else {
            return;
        };
        match remote.put_metric(event, value).await {
            Ok(()) => debug!("Reported {} metric to remote sink", event.as_label()),
            Err(e) => warn!(
                "Failed to report {} metric to remote sink: {:#}",
                event.as_label(),
                e
            ),
        }
    }

    /// Renders the registry in the prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

fn duration_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(MetricEvent, f64)>>,
        fail: bool,
    }

    #[async_trait]
    impl RemoteSink for RecordingSink {
        async fn put_metric(&self, event: MetricEvent, value: f64) -> anyhow::Result<()> {
            self.events.lock().unwrap().push((event, value));
            if self.fail {
                anyhow::bail!("remote sink unavailable");
            }
            Ok(())
        }
    }

    fn rendered(metrics: &MonitorMetrics) -> Vec<String> {
        metrics
            .render()
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_records_all_four_events_locally() {
        let metrics = MonitorMetrics::new("", None).unwrap();
        metrics.record_success().await;
        metrics.record_success().await;
        metrics.record_failure().await;
        metrics.record_pull_duration(Duration::from_millis(1500)).await;
        metrics.record_push_duration(Duration::from_secs(3)).await;

        let lines = rendered(&metrics);
        assert!(lines.contains(&"monitor_success 2".to_string()));
        assert!(lines.contains(&"monitor_failure 1".to_string()));
        assert!(lines.contains(&"monitor_pull_count 1".to_string()));
        assert!(lines.contains(&"monitor_pull_sum 1.5".to_string()));
        assert!(lines.contains(&"monitor_push_count 1".to_string()));
    }

    #[tokio::test]
    async fn test_namespace_prefixes_metric_names() {
        let metrics = MonitorMetrics::new("quay", None).unwrap();
        metrics.record_success().await;
        assert!(rendered(&metrics).contains(&"quay_monitor_success 1".to_string()));
    }

    #[tokio::test]
    async fn test_forwards_events_to_remote_sink() {
        let sink = Arc::new(RecordingSink::default());
        let metrics = MonitorMetrics::new("", Some(sink.clone() as Arc<dyn RemoteSink>)).unwrap();
        metrics.record_failure().await;
        metrics.record_push_duration(Duration::from_millis(250)).await;

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                (MetricEvent::Failure, 1.0),
                (MetricEvent::PushDuration, 0.25)
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_sink_errors_are_swallowed() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let metrics = MonitorMetrics::new("", Some(sink.clone() as Arc<dyn RemoteSink>)).unwrap();
        metrics.record_success().await;

        assert!(rendered(&metrics).contains(&"monitor_success 1".to_string()));
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_render_uses_text_format() {
        let metrics = MonitorMetrics::new("", None).unwrap();
        let body = metrics.render().unwrap();
        assert!(body.contains("# TYPE monitor_success counter"));
        assert!(body.contains("# TYPE monitor_pull histogram"));
    }
}
