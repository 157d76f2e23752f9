use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use labelsquor_core::OrchestratorConfig;
use labelsquor_store::WorkItemStore;

use crate::dispatcher::Dispatcher;
use crate::events::{EventBus, EventSubscriber};
use crate::executor::StageExecutor;
use crate::handler::HandlerRegistry;
use crate::metrics::OrchestratorMetrics;
use crate::quota::QuotaManager;
use crate::sweeper::ResumeSweeper;
use crate::worker::Worker;

/// The running engine: `num_workers` claim loops, the resume sweeper, and
/// the outbox delivery loop, all under one cancellation token.
pub struct WorkerPool {
    tracker: TaskTracker,
    shutdown: CancellationToken,
    grace: Duration,
}

impl WorkerPool {
    /// Spawn the engine's background tasks.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        store: Arc<dyn WorkItemStore>,
        registry: Arc<HandlerRegistry>,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
        quota: Arc<QuotaManager>,
        config: Arc<OrchestratorConfig>,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let dispatcher = Arc::new(Dispatcher::new(store.clone()));
        let executor = Arc::new(StageExecutor::new(
            store.clone(),
            metrics.clone(),
            Duration::from_secs(config.stage_timeout_seconds),
        ));

        for n in 0..config.num_workers {
            let worker = Worker::new(
                format!("worker-{n}"),
                store.clone(),
                dispatcher.clone(),
                executor.clone(),
                registry.clone(),
                quota.clone(),
                config.clone(),
                metrics.clone(),
                shutdown.clone(),
            );
            tracker.spawn(worker.run());
        }

        let sweeper = ResumeSweeper::new(
            store.clone(),
            quota,
            config.clone(),
            metrics.clone(),
            shutdown.clone(),
        );
        tracker.spawn(sweeper.run());

        let bus = EventBus::new(
            store,
            subscribers,
            Duration::from_millis(config.event_poll_interval_ms),
            metrics,
            shutdown.clone(),
        );
        tracker.spawn(bus.run());

        tracker.close();
        info!(num_workers = config.num_workers, "engine started");

        Self {
            tracker,
            shutdown,
            grace: Duration::from_secs(config.shutdown_grace_seconds),
        }
    }

    /// Request a graceful stop: no new claims are taken, in-flight stages
    /// get up to the configured grace period to commit their transition,
    /// then the pool exits. Leases of anything still in flight expire
    /// naturally and are reclaimed by the next instance.
    pub async fn shutdown(self) {
        info!("engine shutdown requested");
        self.shutdown.cancel();
        if tokio::time::timeout(self.grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                grace_seconds = self.grace.as_secs(),
                "shutdown grace elapsed with tasks still running"
            );
        }
        info!("engine stopped");
    }

    /// Whether every background task has finished.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.tracker.is_empty()
    }
}
