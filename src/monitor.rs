use crate::engine::ContainerEngine;
use crate::interval::IntervalController;
use crate::state::MonitorContext;
use crate::steps::{self, BaseSelector, LayerDeletion, ProbeTarget, Step, StepError};
use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Result of one probe cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    TransientFailure { step: Step, cause: String },
    StructuralFailure { step: Step, cause: String },
}

impl CycleOutcome {
    /// Structural failures stop the monitor until the process is restarted.
    pub fn halts(&self) -> bool {
        matches!(self, CycleOutcome::StructuralFailure { .. })
    }
}

/// Drives probe cycles and owns every write to the health state.
pub struct Monitor {
    ctx: MonitorContext,
    interval: IntervalController,
    target: Option<ProbeTarget>,
}

impl Monitor {
    pub fn new(ctx: MonitorContext) -> Self {
        let interval = IntervalController::new(ctx.config.run_test_every);
        Self {
            ctx,
            interval,
            target: None,
        }
    }

    pub fn interval(&self) -> &IntervalController {
        &self.interval
    }

    /// Runs one full cycle and applies its outcome to status, interval and
    /// metrics. An `Err` is fatal for the whole process.
    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleOutcome> {
        let target = self.target().await?;
        self.ctx.health.set_status(true);

        let outcome = match self.ctx.connector.connect().await {
            Ok(engine) => match self.probe(engine.as_ref(), &target).await {
                Ok(()) => CycleOutcome::Success,
                Err(StepError::Transient { step, source }) => CycleOutcome::TransientFailure {
                    step,
                    cause: source.to_string(),
                },
                Err(StepError::Structural { step, source }) => CycleOutcome::StructuralFailure {
                    step,
                    cause: source.to_string(),
                },
                Err(fatal @ StepError::Fatal { .. }) => {
                    error!("Test failed fatally at {} step", fatal.step());
                    return Err(anyhow::Error::new(fatal)
                        .context("Registry monitor cannot continue"));
                }
            },
            Err(e) => CycleOutcome::TransientFailure {
                step: Step::Connect,
                cause: e.to_string(),
            },
        };

        self.apply(&outcome).await;
        Ok(outcome)
    }

    /// Resolves the base selector on first use and keeps it for the process lifetime.
    async fn target(&mut self) -> anyhow::Result<ProbeTarget> {
        if let Some(target) = &self.target {
            return Ok(target.clone());
        }

        let config = &self.ctx.config;
        let base = match config.base_selector() {
            Some(base) => base,
            None => {
                let engine = self
                    .ctx
                    .connector
                    .connect()
                    .await
                    .context("Failed to connect to container engine to resolve base layer id")?;
                steps::resolve_base_layer(engine.as_ref(), &config.registry.repository)
                    .await
                    .context("Failed to grab base layer id")?
            }
        };

        let target = ProbeTarget::new(config, base);
        self.target = Some(target.clone());
        Ok(target)
    }

    async fn probe(
        &self,
        engine: &dyn ContainerEngine,
        target: &ProbeTarget,
    ) -> Result<(), StepError> {
        info!("Pulling test image");
        let pull_time = steps::pull_test_image(engine, target).await?;
        self.ctx.metrics.record_pull_duration(pull_time).await;

        if let BaseSelector::BaseImage(base_image) = &target.base {
            info!("Pulling specified base image {}", base_image);
            steps::pull_base_image(engine, target).await?;
        }

        info!("Deleting top layer");
        match steps::delete_top_layer(engine, target).await? {
            LayerDeletion::Deleted(id) => info!("Deleted top layer {}", id),
            LayerDeletion::NoLayerToDelete => {
                info!("No layer tagged latest in {}, nothing to delete", target.history_target())
            }
        }

        info!("Creating new top layer");
        steps::create_tag_layer(engine, target).await?;

        info!("Pushing test image");
        let push_time = steps::push_test_image(engine, target).await?;
        self.ctx.metrics.record_push_duration(push_time).await;
        Ok(())
    }

    async fn apply(&mut self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Success => {
                info!("Test successful");
                self.interval.on_success();
                self.ctx.health.set_status(true);
                self.ctx.metrics.record_success().await;
            }
            CycleOutcome::TransientFailure { step, cause } => {
                error!("Test failed at {} step: {}", step, cause);
                self.interval.on_transient_failure();
                self.ctx.health.set_status(false);
                self.ctx.metrics.record_failure().await;
            }
            CycleOutcome::StructuralFailure { step, cause } => {
                error!("Test failed at {} step: {}", step, cause);
                self.ctx.health.mark_unhealthy();
            }
        }
    }
}

/// Runs probe cycles until a structural failure halts the monitor or the
/// token is cancelled. Returns `Err` only for fatal failures.
///
/// Cancellation is observed between cycles only, so a started container is
/// always killed before the monitor stops.
pub async fn run(ctx: MonitorContext, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut monitor = Monitor::new(ctx);
    let mut first_cycle = true;

    loop {
        if !first_cycle {
            let interval = monitor.interval();
            let delay = interval.current();
            if delay == interval.configured() {
                info!("Sleeping for {:?}", delay);
            } else {
                info!("Retrying in {:?}", delay);
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        first_cycle = false;
        if shutdown.is_cancelled() {
            break;
        }

        info!("Starting test");
        let outcome = monitor.run_cycle().await?;

        if outcome.halts() {
            warn!("Registry monitor halted; the process must be restarted to resume testing");
            return Ok(());
        }
    }

    info!("Registry monitor stopped");
    Ok(())
}
