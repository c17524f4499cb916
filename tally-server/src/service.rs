use std::sync::Arc;

use anyhow::{Context, Result};
use tally_config::{Config, SinkConfig};
use tally_metrics::{GlobalRouter, NodeId};
use tally_system::{Addr, ServiceRunner, ShutdownHandle};
use tokio::runtime::Runtime;

use crate::ingest::Ingestor;
use crate::services::dispatch::SinkDispatcherService;
use crate::services::flush::{FlushCoordinator, FlushService};
use crate::services::forward::ForwarderService;
use crate::services::shards::WorkerPool;
use crate::sinks::Sink;

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Global mode is enabled without an identity for this agent.
    #[error("global mode requires a node_id")]
    MissingNodeId,

    /// A sink could not be created from its definition.
    #[error("invalid sink {0}")]
    InvalidSink(String),

    /// The HTTP client could not be created.
    #[error("could not create http client")]
    HttpClient,
}

/// Creates a multi-threaded runtime with the given thread name prefix.
pub fn create_runtime(name: &'static str, threads: Option<usize>) -> Result<Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.thread_name(name).enable_all();
    if let Some(threads) = threads {
        builder.worker_threads(threads);
    }

    Ok(builder.build()?)
}

#[derive(Debug)]
struct StateInner {
    config: Arc<Config>,
    ingestor: Ingestor,
    flush: Addr<FlushCoordinator>,
    shutdown: ShutdownHandle,
}

/// Server state.
///
/// Holds the addresses of all services that endpoints and listeners talk to. Once the last clone
/// of the state is dropped, the forwarder stops.
#[derive(Clone, Debug)]
pub struct ServiceState {
    inner: Arc<StateInner>,
}

impl ServiceState {
    /// Starts all services and returns addresses to all of them.
    pub fn start(
        config: Arc<Config>,
        services: &mut ServiceRunner,
        shutdown: ShutdownHandle,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(ServiceError::HttpClient)?;

        let sinks = create_sinks(config.sinks(), &client)?;
        let dispatcher = services.start(SinkDispatcherService::new(
            sinks,
            config.shutdown_timeout(),
            shutdown.clone(),
        ));

        let aggregator = config.aggregator().clone();
        let pool = Arc::new(WorkerPool::start(&aggregator, services));

        let flush = services.start(FlushService::new(
            aggregator,
            pool.clone(),
            dispatcher.recipient(),
            shutdown.clone(),
        ));

        let ingestor = if config.global_enabled() {
            let global = config.global();
            let local = global
                .node_id
                .as_deref()
                .map(NodeId::new)
                .ok_or(ServiceError::MissingNodeId)?;
            let peers: Vec<_> = global
                .peers
                .iter()
                .map(|peer| NodeId::new(peer.as_str()))
                .collect();

            tally_log::info!(node = %local, "global aggregation enabled");
            let router = GlobalRouter::new(local, &peers, global.virtual_nodes);
            let forwarder =
                services.start(ForwarderService::new(config.forward().clone(), client));

            Ingestor::global(pool, Arc::new(router), forwarder)
        } else {
            Ingestor::local(pool)
        };

        Ok(Self {
            inner: Arc::new(StateInner {
                config,
                ingestor,
                flush,
                shutdown,
            }),
        })
    }

    /// Returns a reference to the tally configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the entry point for samples.
    pub fn ingestor(&self) -> &Ingestor {
        &self.inner.ingestor
    }

    /// Returns the address of the flush coordinator.
    pub fn flush(&self) -> &Addr<FlushCoordinator> {
        &self.inner.flush
    }

    /// Returns `true` once a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.get().is_some()
    }
}

fn create_sinks(
    configs: &[SinkConfig],
    client: &reqwest::Client,
) -> Result<Vec<(SinkConfig, Sink)>> {
    configs
        .iter()
        .map(|config| {
            let sink = Sink::from_config(config, client)
                .with_context(|| ServiceError::InvalidSink(config.name.clone()))?;
            tally_log::info!(sink = %config.name, "configured sink");
            Ok((config.clone(), sink))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use tally_system::shutdown_channel;

    use super::*;
    use crate::services::flush::ForceFlush;

    #[tokio::test]
    async fn test_force_flush_through_state() {
        tally_test::setup();

        let config = Config::from_json_value(serde_json::json!({
            "aggregator": {"flush_interval": 3600, "align_to_interval": false, "shards": 2},
            "sinks": [{"name": "console", "type": "log"}],
        }))
        .unwrap();

        let mut services = ServiceRunner::new();
        let (trigger, shutdown) = shutdown_channel();
        let state = ServiceState::start(Arc::new(config), &mut services, shutdown).unwrap();

        let metric = tally_metrics::Metric::new(
            "requests",
            tally_metrics::MetricValue::Counter(2.0),
            tally_metrics::UnixTimestamp::now(),
        );
        state.ingestor().ingest(metric).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let report = state.flush().send(ForceFlush).await.unwrap();
        assert_eq!(report.interval.generation, 1);
        assert_eq!(report.metrics, 1);
        assert!(report.stragglers.is_empty());

        trigger.shutdown(None);
        drop(state);
        services.join().await;
    }
}
