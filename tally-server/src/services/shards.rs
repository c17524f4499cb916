//! Shard workers owning the aggregation state of the keyspace.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tally_metrics::{AggregatorConfig, ClosedShard, FlushInterval, Metric, Shard, ShardRouter};
use tally_statsd::metric;
use tally_system::{Addr, FromMessage, Interface, NoResponse, Receiver, Service, ServiceRunner};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;

use crate::statsd::{ServerCounters, ServerTimers};

/// Closes the active generation of a shard.
///
/// The closed map is sent back through `reply`. If the receiving side is gone by the time the
/// shard processes the rotation, the map is merged back into the new generation.
#[derive(Debug)]
pub struct RotateShard {
    /// The generation to close.
    pub interval: FlushInterval,
    /// Moves all queued samples into the closing generation first.
    pub drain: bool,
    /// Receives the closed map.
    pub reply: oneshot::Sender<ClosedShard>,
}

impl Interface for RotateShard {}

impl FromMessage<Self> for RotateShard {
    type Response = NoResponse;

    fn from_message(message: Self, _: ()) -> Self {
        message
    }
}

/// Task owning a single [`Shard`].
///
/// Samples arrive on a bounded queue, rotations on the service inbox. Rotations are always
/// handled first, so samples still waiting in the queue count towards the new generation. A
/// draining rotation instead takes the queued samples into the closing generation.
pub struct ShardService {
    shard: Shard,
    samples: mpsc::Receiver<Metric>,
}

impl ShardService {
    /// Creates the worker of an empty shard reading samples from `samples`.
    pub fn new(shard: Shard, samples: mpsc::Receiver<Metric>) -> Self {
        Self { shard, samples }
    }

    fn handle_rotate(&mut self, message: RotateShard) {
        let RotateShard {
            interval,
            drain,
            reply,
        } = message;

        if drain {
            while let Ok(metric) = self.samples.try_recv() {
                self.shard.ingest(metric);
            }
        }

        let closed = self.shard.rotate(interval);
        if let Err(closed) = reply.send(closed) {
            tally_log::warn!(
                shard = self.shard.id(),
                generation = interval.generation,
                "shard rotated after the flush gave up, keeping samples for the next generation"
            );
            self.shard.restore(closed);
        }
    }
}

impl Service for ShardService {
    type Interface = RotateShard;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        loop {
            tokio::select! {
                biased;

                Some(message) = rx.recv() => self.handle_rotate(message),
                Some(metric) = self.samples.recv() => self.shard.ingest(metric),

                else => break,
            }
        }

        tally_log::debug!(shard = self.shard.id(), "shard worker stopped");
    }
}

/// The closed maps of one rotation across all shards.
#[derive(Debug)]
pub struct Rotation {
    /// Closed maps of the shards that responded in time, in shard order.
    pub closed: Vec<ClosedShard>,
    /// Indexes of the shards that did not respond in time.
    pub stragglers: Vec<usize>,
}

struct ShardHandle {
    samples: mpsc::Sender<Metric>,
    control: Addr<RotateShard>,
}

/// A fixed set of shard workers and the routing of samples to them.
pub struct WorkerPool {
    router: ShardRouter,
    shards: Vec<ShardHandle>,
    enqueue_timeout: Duration,
    dropped: AtomicU64,
    sources: TaskTracker,
}

impl WorkerPool {
    /// Starts one [`ShardService`] per configured shard.
    pub fn start(config: &AggregatorConfig, services: &mut ServiceRunner) -> Self {
        let shard_count = config.shard_count().unwrap_or(std::num::NonZeroUsize::MIN);

        let shards = (0..shard_count.get())
            .map(|id| {
                let (samples, rx) = mpsc::channel(config.shard_queue_size.max(1));
                let shard = Shard::new(id, config.sketch_accuracy);
                let control = services.start(ShardService::new(shard, rx));
                ShardHandle { samples, control }
            })
            .collect();

        Self {
            router: ShardRouter::new(shard_count),
            shards,
            enqueue_timeout: config.enqueue_timeout(),
            dropped: AtomicU64::new(0),
            sources: TaskTracker::new(),
        }
    }

    /// Registers a source of samples, such as a listener or an endpoint.
    ///
    /// The source counts as active until the token and all its clones are dropped.
    pub fn source(&self) -> TaskTrackerToken {
        self.sources.token()
    }

    /// Waits until all sources of samples have stopped.
    ///
    /// No new sources can be registered once this has been called.
    pub async fn sources_stopped(&self) {
        self.sources.close();
        self.sources.wait().await;
    }

    /// Returns the number of samples dropped since the pool started.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Hands a sample to the shard owning its key.
    ///
    /// If the queue of the shard is full, this waits for up to the enqueue timeout and then
    /// drops the sample.
    pub async fn ingest(&self, metric: Metric) {
        let shard_id = self.router.route(&metric.key());
        let shard = &self.shards[shard_id];

        let enqueued = if self.enqueue_timeout.is_zero() {
            shard.samples.try_send(metric).is_ok()
        } else {
            shard
                .samples
                .send_timeout(metric, self.enqueue_timeout)
                .await
                .is_ok()
        };

        if !enqueued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metric!(
                counter(ServerCounters::SamplesDropped) += 1,
                shard = &shard_id.to_string()
            );
        }
    }

    /// Rotates all shards to `interval` and collects their closed maps.
    ///
    /// Waits at most `timeout` for the shards. Shards that respond later keep their samples for
    /// the next generation.
    pub async fn rotate(&self, interval: FlushInterval, timeout: Duration) -> Rotation {
        self.rotate_shards(interval, timeout, false).await
    }

    /// Like [`rotate`](Self::rotate), but samples still queued at the shards are included in the
    /// closed maps.
    ///
    /// Used for the last rotation before shutdown, after all sources have stopped.
    pub async fn drain(&self, interval: FlushInterval, timeout: Duration) -> Rotation {
        self.rotate_shards(interval, timeout, true).await
    }

    async fn rotate_shards(
        &self,
        interval: FlushInterval,
        timeout: Duration,
        drain: bool,
    ) -> Rotation {
        let start = Instant::now();

        let requests = self.shards.iter().map(|shard| {
            let (reply, rx) = oneshot::channel();
            shard.control.send(RotateShard {
                interval,
                drain,
                reply,
            });
            tokio::time::timeout_at(start + timeout, rx)
        });

        let results = futures::future::join_all(requests).await;
        metric!(timer(ServerTimers::FlushRotation) = start.elapsed());

        let mut rotation = Rotation {
            closed: Vec::with_capacity(results.len()),
            stragglers: Vec::new(),
        };

        for (shard_id, result) in results.into_iter().enumerate() {
            match result {
                Ok(Ok(closed)) => rotation.closed.push(closed),
                Ok(Err(_)) => {
                    tally_log::error!(shard = shard_id, "shard worker is gone");
                    rotation.stragglers.push(shard_id);
                }
                Err(_) => {
                    tally_log::warn!(
                        shard = shard_id,
                        generation = interval.generation,
                        "shard did not rotate within {timeout:?}"
                    );
                    metric!(
                        counter(ServerCounters::ShardStraggler) += 1,
                        shard = &shard_id.to_string()
                    );
                    rotation.stragglers.push(shard_id);
                }
            }
        }

        rotation
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("shards", &self.shards.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
impl WorkerPool {
    fn len(&self) -> usize {
        self.shards.len()
    }

    /// Creates a pool from raw channels, so tests can play the role of a shard.
    pub(crate) fn from_channels(
        shards: Vec<(mpsc::Sender<Metric>, Addr<RotateShard>)>,
        enqueue_timeout: Duration,
    ) -> Self {
        let count = std::num::NonZeroUsize::new(shards.len()).unwrap();
        Self {
            router: ShardRouter::new(count),
            shards: shards
                .into_iter()
                .map(|(samples, control)| ShardHandle { samples, control })
                .collect(),
            enqueue_timeout,
            dropped: AtomicU64::new(0),
            sources: TaskTracker::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tally_metrics::{FlushedValue, MetricValue, SinkBatch, UnixTimestamp};

    use super::*;

    fn interval(generation: u64) -> FlushInterval {
        FlushInterval {
            generation,
            start: UnixTimestamp::from_secs(generation * 10),
            end: UnixTimestamp::from_secs(generation * 10 + 10),
        }
    }

    fn counter(name: &str, value: f64) -> Metric {
        Metric::new(
            name,
            MetricValue::Counter(value),
            UnixTimestamp::from_secs(4711),
        )
    }

    fn config(shards: usize, queue_size: usize) -> AggregatorConfig {
        AggregatorConfig {
            shards,
            shard_queue_size: queue_size,
            ..Default::default()
        }
    }

    fn values(rotation: Rotation, generation: u64) -> Vec<(String, FlushedValue)> {
        let batch = SinkBatch::collect(interval(generation), rotation.closed, &[0.5]);
        batch
            .metrics()
            .iter()
            .map(|metric| (metric.name.clone(), metric.value.clone()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotate_collects_all_shards() {
        tally_test::setup();

        let mut services = ServiceRunner::new();
        let pool = WorkerPool::start(&config(4, 16), &mut services);
        assert_eq!(pool.len(), 4);

        for value in [5.0, 3.0, 2.0] {
            pool.ingest(counter("requests", value)).await;
        }
        pool.ingest(counter("errors", 1.0)).await;

        // Let the workers drain their queues before rotating.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let rotation = pool.rotate(interval(1), Duration::from_secs(1)).await;
        assert_eq!(rotation.closed.len(), 4);
        assert!(rotation.stragglers.is_empty());

        assert_eq!(
            values(rotation, 1),
            vec![
                ("errors".to_owned(), FlushedValue::Counter(1.0)),
                ("requests".to_owned(), FlushedValue::Counter(10.0)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_samples_land_in_next_generation() {
        let mut services = ServiceRunner::new();
        let pool = WorkerPool::start(&config(1, 16), &mut services);

        // No yield between ingesting and rotating, the sample is still queued when the shard
        // processes the rotation.
        pool.ingest(counter("requests", 1.0)).await;
        let first = pool.rotate(interval(1), Duration::from_secs(1)).await;
        assert_eq!(values(first, 1), vec![]);

        let second = pool.rotate(interval(2), Duration::from_secs(1)).await;
        assert_eq!(
            values(second, 2),
            vec![("requests".to_owned(), FlushedValue::Counter(1.0))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_includes_queued_samples() {
        let mut services = ServiceRunner::new();
        let pool = WorkerPool::start(&config(2, 1024), &mut services);

        for _ in 0..1000 {
            pool.ingest(counter("requests", 4.0)).await;
        }
        assert_eq!(pool.dropped(), 0);

        let rotation = pool.drain(interval(1), Duration::from_secs(1)).await;
        assert!(rotation.stragglers.is_empty());
        assert_eq!(
            values(rotation, 1),
            vec![("requests".to_owned(), FlushedValue::Counter(4000.0))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_stopped() {
        let (samples, _samples_rx) = mpsc::channel(1);
        let (control, _control_rx) = Addr::custom();
        let pool = Arc::new(WorkerPool::from_channels(
            vec![(samples, control)],
            Duration::ZERO,
        ));

        let source = pool.source();
        let waiting = tokio::spawn({
            let pool = pool.clone();
            async move { pool.sources_stopped().await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiting.is_finished());

        drop(source);
        tokio::time::timeout(Duration::from_millis(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops() {
        let (samples, _keep_rx) = mpsc::channel(2);
        let (control, _control_rx) = Addr::custom();
        let pool = WorkerPool::from_channels(vec![(samples, control)], Duration::ZERO);

        for _ in 0..5 {
            pool.ingest(counter("requests", 1.0)).await;
        }

        assert_eq!(pool.dropped(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_counter_grows_monotonically() {
        let (samples, mut rx) = mpsc::channel(4);
        let (control, _control_rx) = Addr::custom();
        let pool = WorkerPool::from_channels(vec![(samples, control)], Duration::ZERO);

        let mut last = 0;
        for round in 0..10 {
            for _ in 0..8 {
                pool.ingest(counter("requests", 1.0)).await;
            }

            // The consumer is slower than the producer, the queue never holds more than its bound.
            let mut drained = 0;
            while drained < 2 && rx.try_recv().is_ok() {
                drained += 1;
            }

            assert!(pool.dropped() > last, "no drops in round {round}");
            last = pool.dropped();
        }

        assert!(rx.len() <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_timeout_waits_for_space() {
        let (samples, mut rx) = mpsc::channel(1);
        let (control, _control_rx) = Addr::custom();
        let pool = WorkerPool::from_channels(vec![(samples, control)], Duration::from_millis(50));

        pool.ingest(counter("requests", 1.0)).await;

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            rx.recv().await;
            rx
        });

        // Blocks until the consumer made space.
        pool.ingest(counter("requests", 1.0)).await;
        assert_eq!(pool.dropped(), 0);

        let mut rx = consumer.await.unwrap();
        // The queue is full again and nobody consumes it anymore.
        pool.ingest(counter("requests", 1.0)).await;
        assert_eq!(pool.dropped(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_excluded() {
        tally_test::setup();

        let (samples, _samples_rx) = mpsc::channel(1);
        let (control, mut control_rx) = Addr::custom();
        let pool = WorkerPool::from_channels(vec![(samples, control)], Duration::ZERO);

        let start = Instant::now();
        let rotation = pool.rotate(interval(1), Duration::from_millis(500)).await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert!(rotation.closed.is_empty());
        assert_eq!(rotation.stragglers, vec![0]);

        // The rotation is still delivered, but nobody waits for the result anymore.
        let message = control_rx.recv().await.unwrap();
        assert_eq!(message.interval, interval(1));
        assert!(message.reply.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_rotation_restores_samples() {
        tally_test::setup();

        let (samples, rx) = mpsc::channel(16);
        let mut services = ServiceRunner::new();
        let control = services.start(ShardService::new(Shard::new(0, 0.01), rx));

        samples.send(counter("requests", 5.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        // The flush stopped waiting before the shard processed the rotation.
        let (reply, late_rx) = oneshot::channel();
        drop(late_rx);
        control.send(RotateShard {
            interval: interval(1),
            drain: false,
            reply,
        });

        samples.send(counter("requests", 3.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let (reply, rx) = oneshot::channel();
        control.send(RotateShard {
            interval: interval(2),
            drain: false,
            reply,
        });
        let closed = rx.await.unwrap();
        assert_eq!(closed.interval, interval(2));

        let batch = SinkBatch::collect(interval(2), vec![closed], &[0.5]);
        assert_eq!(batch.metrics()[0].value, FlushedValue::Counter(8.0));

        drop(control);
        drop(samples);
        services.join().await;
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "rotated to generation 1 after generation 1")]
    async fn test_repeated_generation_panics() {
        let (samples, rx) = mpsc::channel(16);
        let mut services = ServiceRunner::new();
        let control = services.start(ShardService::new(Shard::new(0, 0.01), rx));

        for _ in 0..2 {
            let (reply, _rx) = oneshot::channel();
            control.send(RotateShard {
                interval: interval(1),
                drain: false,
                reply,
            });
        }

        drop(control);
        drop(samples);
        services.join().await;
    }
}
