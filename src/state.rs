use crate::config::Config;
use crate::engine::EngineConnector;
use crate::metrics::MonitorMetrics;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything the monitor task needs, shared with the webserver.
#[derive(Clone)]
pub struct MonitorContext {
    pub(crate) config: Arc<Config>,
    pub(crate) connector: Arc<dyn EngineConnector>,
    pub(crate) metrics: Arc<MonitorMetrics>,
    pub(crate) health: Arc<HealthState>,
}

/// Liveness and latest-cycle flags.
///
/// Written only by the monitor task, read concurrently by HTTP handlers.
/// `healthy` starts `true` and, once cleared, stays `false` for the lifetime
/// of the process. `status` reflects the latest cycle only.
#[derive(Debug)]
pub struct HealthState {
    healthy: AtomicBool,
    status: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            status: AtomicBool::new(false),
        }
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn status(&self) -> bool {
        self.status.load(Ordering::Acquire)
    }

    /// `true` never overrides an earlier `false`.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.fetch_and(healthy, Ordering::AcqRel);
    }

    pub fn mark_unhealthy(&self) {
        self.set_healthy(false);
    }

    pub fn set_status(&self, status: bool) {
        self.status.store(status, Ordering::Release);
    }
}
