//! Routing of received samples to local shards or global owners.

use std::sync::Arc;

use tally_metrics::{GlobalRouter, Metric, Owner};
use tally_statsd::metric;
use tally_system::Addr;
use tokio_util::task::task_tracker::TaskTrackerToken;

use crate::services::forward::ForwardToOwner;
use crate::services::shards::WorkerPool;
use crate::statsd::ServerCounters;

#[derive(Clone, Debug)]
struct GlobalRoute {
    router: Arc<GlobalRouter>,
    forwarder: Addr<ForwardToOwner>,
}

/// Entry point for samples, shared by all listeners and endpoints.
///
/// In global mode, samples that require global aggregation and are owned by another node are
/// forwarded to their owner. All other samples are aggregated in the local shards.
///
/// The ingestor is registered as a source with the [`WorkerPool`]. The final flush on shutdown
/// waits until all clones have been dropped.
#[derive(Clone, Debug)]
pub struct Ingestor {
    pool: Arc<WorkerPool>,
    global: Option<GlobalRoute>,
    _source: TaskTrackerToken,
}

impl Ingestor {
    /// Creates an ingestor that aggregates everything locally.
    pub fn local(pool: Arc<WorkerPool>) -> Self {
        Self {
            _source: pool.source(),
            pool,
            global: None,
        }
    }

    /// Creates an ingestor that forwards samples owned by peers through `forwarder`.
    pub fn global(
        pool: Arc<WorkerPool>,
        router: Arc<GlobalRouter>,
        forwarder: Addr<ForwardToOwner>,
    ) -> Self {
        Self {
            _source: pool.source(),
            pool,
            global: Some(GlobalRoute { router, forwarder }),
        }
    }

    /// Ingests a sample received from an instrumented application.
    pub async fn ingest(&self, mut metric: Metric) {
        let scope = metric.take_scope();

        if let Some(global) = &self.global
            && scope.requires_global(metric.kind())
            && let Owner::Remote(node) = global.router.owner(&metric.key())
        {
            global.forwarder.send(ForwardToOwner { node, metric });
            return;
        }

        self.pool.ingest(metric).await;
    }

    /// Ingests samples forwarded by another agent.
    ///
    /// Forwarded samples are never forwarded again. Samples for keys owned by another node are
    /// still aggregated here, which happens while the peer lists of agents disagree.
    pub async fn import(&self, metrics: Vec<Metric>) {
        for metric in metrics {
            if let Some(global) = &self.global
                && !global.router.owns(&metric.key())
            {
                metric!(counter(ServerCounters::ImportMisrouted) += 1);
            }

            self.pool.ingest(metric).await;
        }
    }
}
