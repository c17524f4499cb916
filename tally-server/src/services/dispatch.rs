//! Delivery of flushed batches to all configured sinks.

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use tally_common::RetryBackoff;
use tally_config::SinkConfig;
use tally_metrics::SinkBatch;
use tally_statsd::metric;
use tally_system::{
    AsyncResponse, FromMessage, Interface, Receiver, Sender, Service, Shutdown, ShutdownHandle,
};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::sinks::{Sink, SinkError};
use crate::statsd::{ServerCounters, ServerTimers};

/// Delivers a batch to every sink.
///
/// Responds with a [`DispatchReport`] once all sinks have completed. The batch is delivered
/// regardless of whether the response is awaited.
#[derive(Debug)]
pub struct Dispatch(pub SinkBatch);

/// The result of delivering one batch to one sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SinkOutcome {
    /// All records were accepted.
    Delivered {
        /// Attempts across all chunks of the batch.
        attempts: u32,
    },
    /// The sink kept failing until the last attempt, the remaining records were dropped.
    Failed {
        /// Attempts across all chunks of the batch.
        attempts: u32,
    },
    /// The sink had too many deliveries in flight, the batch was dropped without an attempt.
    Shed,
}

/// Outcomes of one [`Dispatch`] per sink name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatchReport {
    /// The generation of the dispatched batch.
    pub generation: u64,
    /// The outcome for each sink.
    pub sinks: BTreeMap<String, SinkOutcome>,
}

#[cfg(test)]
impl DispatchReport {
    fn outcome(&self, sink: &str) -> Option<SinkOutcome> {
        self.sinks.get(sink).copied()
    }
}

/// Interface of the [`SinkDispatcherService`].
#[derive(Debug)]
pub enum SinkDispatcher {
    /// See [`Dispatch`].
    Dispatch(Dispatch, Sender<DispatchReport>),
}

impl Interface for SinkDispatcher {}

impl FromMessage<Dispatch> for SinkDispatcher {
    type Response = AsyncResponse<DispatchReport>;

    fn from_message(message: Dispatch, sender: Sender<DispatchReport>) -> Self {
        Self::Dispatch(message, sender)
    }
}

#[derive(Debug)]
struct SinkSlot {
    config: SinkConfig,
    sink: Sink,
    permits: Arc<Semaphore>,
}

impl SinkSlot {
    async fn attempt(&self, chunk: &SinkBatch) -> Result<(), SinkError> {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.sink.flush(chunk)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(timeout)),
        }
    }

    async fn deliver(&self, batch: SinkBatch) -> SinkOutcome {
        let start = Instant::now();
        let name = self.config.name.as_str();
        let generation = batch.interval().generation;
        let max_attempts = self.config.max_attempts as usize;

        let mut attempts = 0;
        for chunk in batch.chunks(self.config.max_batch_size) {
            let mut backoff =
                RetryBackoff::new(self.config.initial_backoff(), self.config.max_backoff());

            loop {
                let delay = backoff.next_backoff();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                attempts += 1;
                let error = match self.attempt(&chunk).await {
                    Ok(()) => break,
                    Err(error) => error,
                };

                if backoff.attempt() >= max_attempts {
                    tally_log::error!(
                        error = &error as &dyn Error,
                        sink = name,
                        generation,
                        "dropping batch after {} attempts",
                        backoff.attempt(),
                    );
                    metric!(counter(ServerCounters::SinkFailed) += 1, sink = name);
                    metric!(
                        timer(ServerTimers::SinkDelivery) = start.elapsed(),
                        sink = name,
                        outcome = "failed",
                    );
                    return SinkOutcome::Failed { attempts };
                }

                tally_log::warn!(
                    error = &error as &dyn Error,
                    sink = name,
                    generation,
                    "sink delivery failed, retrying"
                );
                metric!(counter(ServerCounters::SinkRetry) += 1, sink = name);
            }
        }

        metric!(
            timer(ServerTimers::SinkDelivery) = start.elapsed(),
            sink = name,
            outcome = "delivered",
        );
        SinkOutcome::Delivered { attempts }
    }
}

/// Service delivering batches to all sinks concurrently.
///
/// Every sink is delivered in its own task, so a slow or failing sink never holds back another.
/// Each sink bounds its deliveries in flight. A batch arriving while a sink is at its bound is
/// dropped for that sink.
///
/// The service stops once all addresses are dropped. It then waits for pending deliveries up to
/// the timeout of the shutdown, or up to the drain timeout if no shutdown was signaled.
#[derive(Debug)]
pub struct SinkDispatcherService {
    sinks: Vec<Arc<SinkSlot>>,
    tracker: TaskTracker,
    drain_timeout: Duration,
    shutdown: ShutdownHandle,
}

impl SinkDispatcherService {
    /// Creates a dispatcher for the given sinks.
    pub fn new(
        sinks: Vec<(SinkConfig, Sink)>,
        drain_timeout: Duration,
        shutdown: ShutdownHandle,
    ) -> Self {
        let sinks = sinks
            .into_iter()
            .map(|(config, sink)| {
                let permits = Arc::new(Semaphore::new(config.max_in_flight));
                Arc::new(SinkSlot {
                    config,
                    sink,
                    permits,
                })
            })
            .collect();

        Self {
            sinks,
            tracker: TaskTracker::new(),
            drain_timeout,
            shutdown,
        }
    }

    fn handle_dispatch(&self, batch: SinkBatch, sender: Sender<DispatchReport>) {
        let mut report = DispatchReport {
            generation: batch.interval().generation,
            sinks: BTreeMap::new(),
        };

        let mut deliveries = Vec::with_capacity(self.sinks.len());
        for slot in &self.sinks {
            let name = slot.config.name.clone();

            let Ok(permit) = Arc::clone(&slot.permits).try_acquire_owned() else {
                tally_log::warn!(
                    sink = %name,
                    generation = report.generation,
                    "sink has {} deliveries in flight, dropping batch",
                    slot.config.max_in_flight,
                );
                metric!(counter(ServerCounters::SinkShed) += 1, sink = &name);
                report.sinks.insert(name, SinkOutcome::Shed);
                continue;
            };

            let slot = Arc::clone(slot);
            let batch = batch.clone();
            let handle = self.tracker.spawn(async move {
                let outcome = slot.deliver(batch).await;
                drop(permit);
                outcome
            });

            deliveries.push((name, handle));
        }

        self.tracker.spawn(async move {
            for (name, handle) in deliveries {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        tally_log::error!(
                            error = &error as &dyn Error,
                            sink = %name,
                            "sink delivery did not complete"
                        );
                        SinkOutcome::Failed { attempts: 0 }
                    }
                };
                report.sinks.insert(name, outcome);
            }

            sender.send(report);
        });
    }

    fn handle_message(&self, message: SinkDispatcher) {
        match message {
            SinkDispatcher::Dispatch(Dispatch(batch), sender) => {
                self.handle_dispatch(batch, sender)
            }
        }
    }

    async fn drain(&self, timeout: Duration) {
        self.tracker.close();

        if self.tracker.is_empty() {
            return;
        }

        tally_log::info!("waiting for {} pending deliveries", self.tracker.len());
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            tally_log::warn!(
                "abandoning {} deliveries after {timeout:?}",
                self.tracker.len()
            );
        }
    }
}

impl Service for SinkDispatcherService {
    type Interface = SinkDispatcher;

    async fn run(self, mut rx: Receiver<Self::Interface>) {
        // Batches are accepted until the last address is gone, since the final flush is sent
        // after the shutdown signal.
        while let Some(message) = rx.recv().await {
            self.handle_message(message);
        }

        let drain_timeout = match self.shutdown.get() {
            Some(Shutdown { timeout }) => timeout.unwrap_or_default(),
            None => self.drain_timeout,
        };

        self.drain(drain_timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use tally_config::SinkKind;
    use tally_metrics::{FlushInterval, FlushedMetric, FlushedValue, UnixTimestamp};
    use tally_system::{Addr, ServiceRunner, shutdown_channel};

    use super::*;
    use crate::sinks::test::TestSink;

    fn batch(generation: u64, records: usize) -> SinkBatch {
        let interval = FlushInterval {
            generation,
            start: UnixTimestamp::from_secs(100),
            end: UnixTimestamp::from_secs(110),
        };
        let metrics = (0..records)
            .map(|index| FlushedMetric {
                name: format!("endpoint.{index}"),
                tags: Default::default(),
                value: FlushedValue::Counter(1.0),
            })
            .collect();
        SinkBatch::new(interval, metrics)
    }

    fn sink(name: &str, test_sink: &TestSink) -> (SinkConfig, Sink) {
        (
            SinkConfig::new(name, SinkKind::Blackhole),
            Sink::Test(test_sink.clone()),
        )
    }

    fn start(sinks: Vec<(SinkConfig, Sink)>) -> Addr<SinkDispatcher> {
        let (_trigger, handle) = shutdown_channel();
        SinkDispatcherService::new(sinks, Duration::from_secs(10), handle).start_detached()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_isolation() {
        tally_test::setup();

        let healthy = TestSink::default();
        let broken = TestSink::failing(u32::MAX);
        let addr = start(vec![sink("healthy", &healthy), sink("broken", &broken)]);

        let start = Instant::now();
        let report = addr.send(Dispatch(batch(1, 3))).await.unwrap();

        assert_eq!(
            report.outcome("healthy"),
            Some(SinkOutcome::Delivered { attempts: 1 })
        );
        assert_eq!(
            report.outcome("broken"),
            Some(SinkOutcome::Failed { attempts: 3 })
        );

        // The healthy sink got the batch right away while the broken one was still retrying.
        assert_eq!(healthy.calls(), vec![start]);
        assert_eq!(healthy.batches()[0].len(), 3);
        assert_eq!(
            broken.calls(),
            vec![
                start,
                start + Duration::from_millis(100),
                start + Duration::from_millis(250),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_delivered() {
        let flaky = TestSink::failing(2);
        let addr = start(vec![sink("flaky", &flaky)]);

        let start = Instant::now();
        let report = addr.send(Dispatch(batch(1, 1))).await.unwrap();

        assert_eq!(
            report.outcome("flaky"),
            Some(SinkOutcome::Delivered { attempts: 3 })
        );
        assert_eq!(start.elapsed(), Duration::from_millis(250));
        assert_eq!(flaky.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        tally_test::setup();

        let slow = TestSink::delayed(Duration::from_secs(10));
        let (mut config, sink) = sink("slow", &slow);
        config.timeout_ms = 1000;
        config.max_attempts = 2;
        let addr = start(vec![(config, sink)]);

        let start = Instant::now();
        let report = addr.send(Dispatch(batch(1, 1))).await.unwrap();

        assert_eq!(
            report.outcome("slow"),
            Some(SinkOutcome::Failed { attempts: 2 })
        );
        assert_eq!(start.elapsed(), Duration::from_millis(2100));
        assert!(slow.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shed_newest_when_in_flight() {
        let slow = TestSink::delayed(Duration::from_secs(1));
        let fast = TestSink::default();
        let (mut config, test_sink) = sink("slow", &slow);
        config.max_in_flight = 1;
        let addr = start(vec![(config, test_sink), sink("fast", &fast)]);

        let first = addr.send(Dispatch(batch(1, 1)));
        let second = addr.send(Dispatch(batch(2, 1)));

        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert_eq!(
            first.outcome("slow"),
            Some(SinkOutcome::Delivered { attempts: 1 })
        );
        assert_eq!(second.outcome("slow"), Some(SinkOutcome::Shed));
        assert_eq!(
            second.outcome("fast"),
            Some(SinkOutcome::Delivered { attempts: 1 })
        );

        let generations: Vec<_> = slow
            .batches()
            .iter()
            .map(|batch| batch.interval().generation)
            .collect();
        assert_eq!(generations, vec![1]);
        assert_eq!(fast.batches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunked_delivery() {
        let chunked = TestSink::default();
        let (mut config, test_sink) = sink("chunked", &chunked);
        config.max_batch_size = 2;
        let addr = start(vec![(config, test_sink)]);

        let report = addr.send(Dispatch(batch(1, 5))).await.unwrap();
        assert_eq!(
            report.outcome("chunked"),
            Some(SinkOutcome::Delivered { attempts: 3 })
        );

        let sizes: Vec<_> = chunked.batches().iter().map(SinkBatch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_on_shutdown() {
        let slow = TestSink::delayed(Duration::from_secs(2));
        let (trigger, handle) = shutdown_channel();

        let mut services = ServiceRunner::new();
        let addr = services.start(SinkDispatcherService::new(
            vec![sink("slow", &slow)],
            Duration::ZERO,
            handle,
        ));

        let start = Instant::now();
        let request = addr.send(Dispatch(batch(1, 1)));
        trigger.shutdown(Some(Duration::from_secs(5)));
        drop(addr);

        services.join().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(
            request.await.unwrap().outcome("slow"),
            Some(SinkOutcome::Delivered { attempts: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandons_after_shutdown_timeout() {
        let slow = TestSink::delayed(Duration::from_secs(20));
        let (trigger, handle) = shutdown_channel();

        let mut services = ServiceRunner::new();
        let addr = services.start(SinkDispatcherService::new(
            vec![sink("slow", &slow)],
            Duration::from_secs(60),
            handle,
        ));

        let start = Instant::now();
        drop(addr.send(Dispatch(batch(1, 1))));
        trigger.shutdown(Some(Duration::from_secs(1)));
        drop(addr);

        services.join().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert!(slow.batches().is_empty());
    }
}
