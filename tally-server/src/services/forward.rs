//! Forwarding of metrics to the global aggregators owning them.

use std::collections::BTreeMap;
use std::error::Error;
use std::mem;

use tally_config::ForwardConfig;
use tally_metrics::{Metric, NodeId};
use tally_statsd::metric;
use tally_system::{FromMessage, Interface, NoResponse, Receiver, Service};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::task::TaskTracker;

use crate::statsd::{ServerCounters, ServerGauges, ServerTimers};

/// Sends a metric to the global aggregator that owns its key.
#[derive(Debug)]
pub struct ForwardToOwner {
    /// The owner on the global ring.
    pub node: NodeId,
    /// The metric, with scope tags already removed.
    pub metric: Metric,
}

impl Interface for ForwardToOwner {}

impl FromMessage<Self> for ForwardToOwner {
    type Response = NoResponse;

    fn from_message(message: Self, _: ()) -> Self {
        message
    }
}

#[derive(Debug, PartialEq)]
enum Pushed {
    /// The metric waits for the next flush.
    Buffered,
    /// The buffer of the node reached the batch size and must be sent now.
    Ready(Vec<Metric>),
    /// The buffers are full.
    Dropped,
}

/// Per-node buffers of metrics waiting to be forwarded.
#[derive(Debug)]
struct ForwardBuffers {
    buffers: BTreeMap<NodeId, Vec<Metric>>,
    buffered: usize,
    max_batch_size: usize,
    max_buffered: usize,
}

impl ForwardBuffers {
    fn new(config: &ForwardConfig) -> Self {
        Self {
            buffers: BTreeMap::new(),
            buffered: 0,
            max_batch_size: config.max_batch_size.max(1),
            max_buffered: config.max_buffered,
        }
    }

    fn push(&mut self, node: &NodeId, metric: Metric) -> Pushed {
        if self.buffered >= self.max_buffered {
            metric!(
                counter(ServerCounters::ForwardDropped) += 1,
                node = node.as_str()
            );
            return Pushed::Dropped;
        }

        let buffer = self.buffers.entry(node.clone()).or_default();
        buffer.push(metric);
        self.buffered += 1;

        if buffer.len() < self.max_batch_size {
            return Pushed::Buffered;
        }

        let batch = mem::take(buffer);
        self.buffered -= batch.len();
        Pushed::Ready(batch)
    }

    fn take_all(&mut self) -> impl Iterator<Item = (NodeId, Vec<Metric>)> + use<> {
        self.buffered = 0;
        mem::take(&mut self.buffers)
            .into_iter()
            .filter(|(_, batch)| !batch.is_empty())
    }
}

/// Service posting metrics to the `/api/import` endpoint of their global owners.
///
/// Metrics are buffered per node and sent when the buffer of a node reaches the batch size, or
/// at the latest after the flush interval. Every batch is sent once. Failed batches are counted
/// and dropped.
///
/// The service stops once all addresses are dropped, after sending the remaining buffers.
#[derive(Debug)]
pub struct ForwarderService {
    config: ForwardConfig,
    client: reqwest::Client,
    buffers: ForwardBuffers,
    tracker: TaskTracker,
}

impl ForwarderService {
    /// Creates a forwarder sending with the given client.
    pub fn new(config: ForwardConfig, client: reqwest::Client) -> Self {
        Self {
            buffers: ForwardBuffers::new(&config),
            config,
            client,
            tracker: TaskTracker::new(),
        }
    }

    fn send(&self, node: NodeId, metrics: Vec<Metric>) {
        let client = self.client.clone();
        let timeout = self.config.timeout();

        self.tracker.spawn(async move {
            let url = format!("http://{node}/api/import");
            let count = metrics.len() as i64;
            let start = Instant::now();

            let result = client
                .post(&url)
                .timeout(timeout)
                .json(&metrics)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            metric!(
                timer(ServerTimers::ForwardRequest) = start.elapsed(),
                node = node.as_str()
            );

            match result {
                Ok(_) => metric!(counter(ServerCounters::MetricsForwarded) += count),
                Err(error) => {
                    tally_log::error!(
                        error = &error as &dyn Error,
                        node = %node,
                        "failed to forward {count} metrics"
                    );
                    metric!(
                        counter(ServerCounters::ForwardFailed) += count,
                        node = node.as_str()
                    );
                }
            }
        });
    }

    fn handle_forward(&mut self, message: ForwardToOwner) {
        let ForwardToOwner { node, metric } = message;
        if let Pushed::Ready(batch) = self.buffers.push(&node, metric) {
            self.send(node, batch);
        }
    }

    fn flush_all(&mut self) {
        for (node, batch) in self.buffers.take_all() {
            metric!(
                gauge(ServerGauges::ForwardBuffered) = batch.len() as u64,
                node = node.as_str()
            );
            self.send(node, batch);
        }
    }
}

impl Service for ForwarderService {
    type Interface = ForwardToOwner;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => self.flush_all(),
                message = rx.recv() => match message {
                    Some(message) => self.handle_forward(message),
                    None => break,
                },
            }
        }

        self.flush_all();
        self.tracker.close();

        let timeout = self.config.timeout();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            tally_log::warn!("abandoning {} forward requests", self.tracker.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use tally_metrics::{MetricValue, UnixTimestamp};
    use tokio::sync::mpsc;

    use super::*;

    fn counter(value: f64) -> Metric {
        Metric::new(
            "requests",
            MetricValue::Counter(value),
            UnixTimestamp::from_secs(4711),
        )
    }

    fn config(max_batch_size: usize, max_buffered: usize) -> ForwardConfig {
        ForwardConfig {
            flush_interval_ms: 60_000,
            max_batch_size,
            max_buffered,
            ..Default::default()
        }
    }

    #[test]
    fn test_buffers_batch_per_node() {
        let mut buffers = ForwardBuffers::new(&config(2, 100));
        let a = NodeId::new("10.0.0.1:8127");
        let b = NodeId::new("10.0.0.2:8127");

        assert_eq!(buffers.push(&a, counter(1.0)), Pushed::Buffered);
        assert_eq!(buffers.push(&b, counter(2.0)), Pushed::Buffered);
        assert_eq!(
            buffers.push(&a, counter(3.0)),
            Pushed::Ready(vec![counter(1.0), counter(3.0)])
        );

        let rest: Vec<_> = buffers.take_all().collect();
        assert_eq!(rest, vec![(b, vec![counter(2.0)])]);
        assert_eq!(buffers.take_all().count(), 0);
    }

    #[test]
    fn test_buffers_drop_when_full() {
        let mut buffers = ForwardBuffers::new(&config(10, 2));
        let node = NodeId::new("10.0.0.1:8127");

        let captures = tally_statsd::with_capturing_test_client(|| {
            assert_eq!(buffers.push(&node, counter(1.0)), Pushed::Buffered);
            assert_eq!(buffers.push(&node, counter(2.0)), Pushed::Buffered);
            assert_eq!(buffers.push(&node, counter(3.0)), Pushed::Dropped);
        });

        assert_eq!(captures, vec!["forward.dropped:1|c|#node:10.0.0.1:8127"]);

        // Space is freed once the buffers are sent.
        assert_eq!(buffers.take_all().count(), 1);
        assert_eq!(buffers.push(&node, counter(4.0)), Pushed::Buffered);
    }

    async fn capture(
        State(tx): State<mpsc::UnboundedSender<Vec<Metric>>>,
        Json(metrics): Json<Vec<Metric>>,
    ) -> StatusCode {
        tx.send(metrics).ok();
        StatusCode::ACCEPTED
    }

    #[tokio::test]
    async fn test_forward_to_node() {
        tally_test::setup();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/api/import", post(capture))
            .with_state(tx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node = NodeId::new(listener.local_addr().unwrap().to_string());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let forwarder = ForwarderService::new(config(2, 100), reqwest::Client::new());
        let addr = forwarder.start_detached();

        for value in [1.0, 2.0, 3.0] {
            addr.send(ForwardToOwner {
                node: node.clone(),
                metric: counter(value),
            });
        }

        let timeout = Duration::from_secs(5);
        let first = tokio::time::timeout(timeout, rx.recv()).await.unwrap();
        assert_eq!(first, Some(vec![counter(1.0), counter(2.0)]));

        // The remainder is sent when the forwarder stops.
        drop(addr);
        let second = tokio::time::timeout(timeout, rx.recv()).await.unwrap();
        assert_eq!(second, Some(vec![counter(3.0)]));
    }

    #[tokio::test]
    async fn test_periodic_flush_under_load() {
        tally_test::setup();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/api/import", post(capture))
            .with_state(tx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let quiet = NodeId::new(listener.local_addr().unwrap().to_string());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let config = ForwardConfig {
            flush_interval_ms: 10,
            max_batch_size: 1_000_000,
            max_buffered: 1_000,
            timeout_ms: 100,
        };
        let addr = ForwarderService::new(config, reqwest::Client::new()).start_detached();

        addr.send(ForwardToOwner {
            node: quiet.clone(),
            metric: counter(1.0),
        });

        // Keeps the inbox of the forwarder busy with metrics for another node.
        let busy = NodeId::new("127.0.0.1:1");
        let flood = tokio::spawn({
            let addr = addr.clone();
            async move {
                loop {
                    for _ in 0..160 {
                        addr.send(ForwardToOwner {
                            node: busy.clone(),
                            metric: counter(2.0),
                        });
                    }
                    tokio::task::yield_now().await;
                }
            }
        });

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        flood.abort();

        assert_eq!(received.unwrap(), Some(vec![counter(1.0)]));
    }
}
