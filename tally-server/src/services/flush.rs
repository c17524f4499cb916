//! The flush coordinator closing aggregation windows.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tally_common::{UnixTimestamp, until_next_boundary};
use tally_metrics::{AggregatorConfig, FlushInterval, SinkBatch};
use tally_statsd::metric;
use tally_system::{
    AsyncResponse, FromMessage, Interface, Receiver, Recipient, Sender, Service, ShutdownHandle,
};
use tokio::time::{Instant, Sleep};

use crate::services::dispatch::{Dispatch, DispatchReport};
use crate::services::shards::{Rotation, WorkerPool};
use crate::statsd::{ServerGauges, ServerTimers};

/// Runs a flush cycle immediately, independent of the regular interval.
#[derive(Debug)]
pub struct ForceFlush;

/// The outcome of a flush cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FlushReport {
    /// The closed window.
    pub interval: FlushInterval,
    /// Number of shards that contributed to the batch.
    pub shards: usize,
    /// Shards that did not rotate in time and report their samples with the next window.
    pub stragglers: Vec<usize>,
    /// Number of records in the batch.
    pub metrics: usize,
}

/// Interface of the [`FlushService`].
#[derive(Debug)]
pub enum FlushCoordinator {
    /// See [`ForceFlush`].
    ForceFlush(ForceFlush, Sender<FlushReport>),
}

impl Interface for FlushCoordinator {}

impl FromMessage<ForceFlush> for FlushCoordinator {
    type Response = AsyncResponse<FlushReport>;

    fn from_message(message: ForceFlush, sender: Sender<FlushReport>) -> Self {
        Self::ForceFlush(message, sender)
    }
}

/// The phase of a flush cycle.
///
/// A cycle always runs through all phases in order and ends in `Idle`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushState {
    /// Waiting for the next tick.
    Idle,
    /// Waiting for the shards to close the window.
    Rotating,
    /// Assembling the batch from the closed maps.
    Collecting,
    /// Handing the batch to the dispatcher.
    Dispatching,
}

impl FlushState {
    fn next(self) -> Self {
        match self {
            Self::Idle => Self::Rotating,
            Self::Rotating => Self::Collecting,
            Self::Collecting => Self::Dispatching,
            Self::Dispatching => Self::Idle,
        }
    }
}

/// Service closing one aggregation window per flush interval.
///
/// On every tick, all shards are rotated into a new generation, their closed maps are assembled
/// into a [`SinkBatch`], and the batch is handed to the dispatcher without waiting for the
/// delivery. Ticks are aligned to multiples of the interval unless disabled.
///
/// On shutdown, the service waits for all sources of samples to stop, up to the rotation timeout.
/// A final cycle then flushes everything received so far, including samples still queued at the
/// shards, and the service stops.
pub struct FlushService {
    config: AggregatorConfig,
    pool: Arc<WorkerPool>,
    dispatcher: Recipient<Dispatch, AsyncResponse<DispatchReport>>,
    shutdown: ShutdownHandle,
    state: FlushState,
    generation: u64,
    window_start: UnixTimestamp,
    next_flush: Pin<Box<Sleep>>,
}

impl FlushService {
    /// Creates a coordinator for the shards in `pool`.
    pub fn new(
        config: AggregatorConfig,
        pool: Arc<WorkerPool>,
        dispatcher: Recipient<Dispatch, AsyncResponse<DispatchReport>>,
        shutdown: ShutdownHandle,
    ) -> Self {
        let mut service = Self {
            config,
            pool,
            dispatcher,
            shutdown,
            state: FlushState::Idle,
            generation: 0,
            window_start: UnixTimestamp::now(),
            next_flush: Box::pin(tokio::time::sleep(Duration::ZERO)),
        };

        service.schedule_next();
        service
    }

    fn schedule_next(&mut self) {
        let interval = self.config.flush_interval();
        let delay = if self.config.align_to_interval {
            until_next_boundary(interval, SystemTime::now())
        } else {
            interval
        };

        self.next_flush.as_mut().reset(Instant::now() + delay);
    }

    fn enter(&mut self, state: FlushState) {
        debug_assert_eq!(self.state.next(), state, "invalid flush transition");
        tally_log::trace!(generation = self.generation, "flush {:?}", state);
        self.state = state;
    }

    async fn flush(&mut self, drain: bool) -> FlushReport {
        let start = Instant::now();

        let end = UnixTimestamp::now();
        self.generation += 1;
        let interval = FlushInterval {
            generation: self.generation,
            start: self.window_start,
            end,
        };
        self.window_start = end;

        self.enter(FlushState::Rotating);
        let rotation_timeout = self.config.rotation_timeout();
        let Rotation { closed, stragglers } = if drain {
            self.pool.drain(interval, rotation_timeout).await
        } else {
            self.pool.rotate(interval, rotation_timeout).await
        };

        self.enter(FlushState::Collecting);
        let shards = closed.len();
        let batch = SinkBatch::collect(interval, closed, &self.config.percentiles);
        metric!(gauge(ServerGauges::FlushRecords) = batch.len() as u64);

        self.enter(FlushState::Dispatching);
        let report = FlushReport {
            interval,
            shards,
            stragglers,
            metrics: batch.len(),
        };

        if batch.is_empty() {
            tally_log::trace!(generation = interval.generation, "nothing to flush");
        } else {
            tally_log::debug!(
                generation = interval.generation,
                "flushing {} metrics",
                batch.len()
            );
            // Back to idle without waiting for the delivery.
            self.dispatcher.send(Dispatch(batch));
        }

        self.enter(FlushState::Idle);
        metric!(timer(ServerTimers::FlushDuration) = start.elapsed());

        report
    }

    async fn handle_message(&mut self, message: FlushCoordinator) {
        match message {
            FlushCoordinator::ForceFlush(ForceFlush, sender) => {
                let report = self.flush(false).await;
                sender.send(report);
            }
        }
    }
}

impl Service for FlushService {
    type Interface = FlushCoordinator;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;

                _ = &mut self.next_flush => {
                    self.flush(false).await;
                    self.schedule_next();
                }
                Some(message) = rx.recv() => self.handle_message(message).await,
                _ = shutdown.notified() => break,
            }
        }

        let timeout = self.config.rotation_timeout();
        if tokio::time::timeout(timeout, self.pool.sources_stopped())
            .await
            .is_err()
        {
            tally_log::warn!("sources still active after {timeout:?}, flushing anyway");
        }

        tally_log::info!("flushing metrics before shutdown");
        let report = self.flush(true).await;
        tally_log::info!(
            generation = report.interval.generation,
            "final flush of {} metrics",
            report.metrics
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use similar_asserts::assert_eq;
    use tally_metrics::{FlushedValue, Metric, MetricValue};
    use tally_system::{Addr, ServiceRunner, ShutdownTrigger, shutdown_channel};

    use super::*;
    use crate::ingest::Ingestor;

    struct TestDispatcher(Dispatch, Sender<DispatchReport>);

    impl Interface for TestDispatcher {}

    impl FromMessage<Dispatch> for TestDispatcher {
        type Response = AsyncResponse<DispatchReport>;

        fn from_message(message: Dispatch, sender: Sender<DispatchReport>) -> Self {
            Self(message, sender)
        }
    }

    type Batches = Arc<Mutex<Vec<SinkBatch>>>;

    struct Harness {
        services: ServiceRunner,
        pool: Arc<WorkerPool>,
        flush: Addr<FlushCoordinator>,
        trigger: ShutdownTrigger,
        batches: Batches,
    }

    fn start(config: AggregatorConfig) -> Harness {
        let batches = Batches::default();
        let received = batches.clone();
        let (dispatcher, _) = tally_test::mock_service("dispatcher", (), move |_, message: TestDispatcher| {
            let TestDispatcher(Dispatch(batch), sender) = message;
            received.lock().unwrap().push(batch);
            sender.send(DispatchReport::default());
        });

        let (trigger, handle) = shutdown_channel();
        let mut services = ServiceRunner::new();
        let pool = Arc::new(WorkerPool::start(&config, &mut services));
        let flush = services.start(FlushService::new(
            config,
            pool.clone(),
            dispatcher.recipient(),
            handle,
        ));

        Harness {
            services,
            pool,
            flush,
            trigger,
            batches,
        }
    }

    fn config() -> AggregatorConfig {
        AggregatorConfig {
            flush_interval: 10,
            align_to_interval: false,
            shards: 2,
            ..Default::default()
        }
    }

    fn sample(name: &str, value: MetricValue) -> Metric {
        Metric::new(name, value, UnixTimestamp::now())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush() {
        tally_test::setup();
        let harness = start(config());

        for value in [1.0, 7.0, 3.0] {
            harness.pool.ingest(sample("load", MetricValue::Gauge(value))).await;
        }
        for member in ["a", "a", "b"] {
            let value = MetricValue::Set(member.to_owned());
            harness.pool.ingest(sample("users", value)).await;
        }
        settle().await;

        let report = harness.flush.send(ForceFlush).await.unwrap();
        insta::assert_json_snapshot!(report, {
            ".interval.start" => "[timestamp]",
            ".interval.end" => "[timestamp]",
        }, @r#"
        {
          "interval": {
            "generation": 1,
            "start": "[timestamp]",
            "end": "[timestamp]"
          },
          "shards": 2,
          "stragglers": [],
          "metrics": 2
        }
        "#);

        settle().await;
        let batches = harness.batches.lock().unwrap();
        let values: Vec<_> = batches[0]
            .metrics()
            .iter()
            .map(|metric| (metric.name.as_str(), metric.value.clone()))
            .collect();
        assert_eq!(
            values,
            vec![("load", FlushedValue::Gauge(3.0)), ("users", FlushedValue::Set(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let harness = start(config());

        harness
            .pool
            .ingest(sample("requests", MetricValue::Counter(1.0)))
            .await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        harness
            .pool
            .ingest(sample("requests", MetricValue::Counter(2.0)))
            .await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        let batches = harness.batches.lock().unwrap();
        let summary: Vec<_> = batches
            .iter()
            .map(|batch| (batch.interval().generation, batch.metrics()[0].value.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, FlushedValue::Counter(1.0)),
                (2, FlushedValue::Counter(2.0)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_cross_generation_leakage() {
        let harness = start(config());

        harness
            .pool
            .ingest(sample("requests", MetricValue::Counter(5.0)))
            .await;
        settle().await;
        harness.flush.send(ForceFlush).await.unwrap();

        for _ in 0..10 {
            harness
                .pool
                .ingest(sample("requests", MetricValue::Counter(100.0)))
                .await;
        }
        settle().await;
        harness.flush.send(ForceFlush).await.unwrap();
        settle().await;

        let batches = harness.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].metrics()[0].value, FlushedValue::Counter(5.0));
        assert_eq!(batches[1].metrics()[0].value, FlushedValue::Counter(1000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_not_dispatched() {
        let harness = start(config());

        let report = harness.flush.send(ForceFlush).await.unwrap();
        assert_eq!(report.metrics, 0);

        settle().await;
        assert!(harness.batches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_on_shutdown() {
        tally_test::setup();
        let Harness {
            mut services,
            pool,
            flush,
            trigger,
            batches,
        } = start(config());

        pool.ingest(sample("requests", MetricValue::Counter(4.0))).await;
        settle().await;

        trigger.shutdown(Some(Duration::from_secs(5)));
        drop(flush);
        drop(pool);
        services.join().await;
        settle().await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].metrics()[0].value, FlushedValue::Counter(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_drains_queues() {
        let Harness {
            mut services,
            pool,
            flush,
            trigger,
            batches,
        } = start(config());

        // No settling, most samples are still queued when the shutdown arrives.
        for _ in 0..1000 {
            pool.ingest(sample("requests", MetricValue::Counter(4.0)))
                .await;
        }
        assert_eq!(pool.dropped(), 0);

        trigger.shutdown(Some(Duration::from_secs(5)));
        drop(flush);
        drop(pool);
        services.join().await;
        settle().await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].metrics()[0].value, FlushedValue::Counter(4000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_waits_for_sources() {
        tally_test::setup();
        let Harness {
            mut services,
            pool,
            flush,
            trigger,
            batches,
        } = start(config());

        let ingestor = Ingestor::local(pool.clone());
        ingestor
            .ingest(sample("requests", MetricValue::Counter(4.0)))
            .await;

        trigger.shutdown(Some(Duration::from_secs(5)));
        settle().await;

        // The source has not stopped yet, its samples still belong to the final flush.
        ingestor
            .ingest(sample("requests", MetricValue::Counter(6.0)))
            .await;
        settle().await;
        assert!(batches.lock().unwrap().is_empty());

        drop(ingestor);
        drop(flush);
        drop(pool);
        services.join().await;
        settle().await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].metrics()[0].value, FlushedValue::Counter(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_gives_up_on_stuck_sources() {
        let Harness {
            mut services,
            pool,
            flush,
            trigger,
            batches,
        } = start(config());

        let ingestor = Ingestor::local(pool.clone());
        ingestor
            .ingest(sample("requests", MetricValue::Counter(4.0)))
            .await;

        trigger.shutdown(Some(Duration::from_secs(5)));
        drop(flush);
        drop(pool);

        // Still waiting for the ingestor within the rotation timeout.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(batches.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        {
            let batches = batches.lock().unwrap();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].metrics()[0].value, FlushedValue::Counter(4.0));
        }

        // The shard services keep running until the ingestor is dropped.
        drop(ingestor);
        services.join().await;
    }

    #[test]
    fn test_state_cycle() {
        let mut state = FlushState::Idle;
        let mut visited = vec![state];
        for _ in 0..4 {
            state = state.next();
            visited.push(state);
        }

        assert_eq!(
            visited,
            vec![
                FlushState::Idle,
                FlushState::Rotating,
                FlushState::Collecting,
                FlushState::Dispatching,
                FlushState::Idle,
            ]
        );
    }
}
