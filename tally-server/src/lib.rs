//! The tally agent.
//!
//! This module contains the [`run`] function which starts the agent. It receives statsd samples
//! over UDP, aggregates them per flush interval and delivers one batch per interval to every
//! configured sink.
//!
//! See the [`Config`] documentation for more information on configuration options.
//!
//! # Path of a Sample through Tally
//!
//! ```mermaid
//! graph LR
//!
//! client(Application)
//! listener(Statsd Listener)
//! import(Import Endpoint)
//! ingestor{Ingestor}
//! forwarder(Forwarder)
//! shards(Shards)
//! flush(Flush Coordinator)
//! dispatcher(Sink Dispatcher)
//! sinks(Sinks)
//!
//! client-->listener
//! listener-->ingestor
//! import-->ingestor
//! ingestor-->shards
//! ingestor-- global mode -->forwarder
//! forwarder-- peer import -->import
//! flush-- rotate -->shards
//! flush-->dispatcher
//! dispatcher-->sinks
//! ```
//!
//! ## Aggregation
//!
//! Every metric key belongs to exactly one shard, and every shard is owned by a single task. The
//! listener parses each datagram and enqueues the samples into the bounded queues of their
//! shards. When a queue is full, the sample is dropped and counted.
//!
//! ## Flushing
//!
//! Once per interval, the flush coordinator asks every shard to rotate. A shard swaps its map for
//! an empty one and returns the closed map. Shards that do not answer within the rotation timeout
//! keep their samples, which are reported with the next interval. The closed maps are assembled
//! into a single read-only batch.
//!
//! ## Delivery
//!
//! The dispatcher hands the batch to all sinks concurrently. Each sink retries failed attempts
//! with exponential backoff and limits the number of deliveries in flight. When this limit is
//! reached, the newest batch is dropped for that sink. A slow or failing sink never delays the
//! other sinks or the next flush.
//!
//! ## Global Mode
//!
//! Percentiles cannot be merged after the fact. In global mode, histograms and timers are
//! forwarded to the single agent owning their key on a consistent hash ring, which aggregates
//! them from all hosts.

#![warn(missing_docs)]

mod endpoints;
mod ingest;
mod service;
mod services;
mod sinks;
mod statsd;

use std::sync::Arc;
use std::time::Duration;

use tally_config::Config;
use tally_system::{Controller, ServiceRunner};

pub use self::ingest::Ingestor;
pub use self::service::{ServiceError, ServiceState, create_runtime};
pub use self::services::server::ServerError;

use crate::services::listener::StatsdListener;
use crate::services::server::HttpServer;

/// Grace period for services to stop after a shutdown without timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Runs the tally agent and blocks until it has shut down.
///
/// The agent stops on `SIGTERM` after flushing and delivering pending metrics within the
/// configured shutdown timeout. `SIGINT` stops it without waiting for deliveries.
pub fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    tally_log::info!("tally agent starting");

    let runtime = create_runtime("main-rt", config.max_thread_count())?;
    runtime.block_on(async {
        Controller::start(config.shutdown_timeout());
        let shutdown = Controller::shutdown_handle();

        let mut services = ServiceRunner::new();
        let state = ServiceState::start(config.clone(), &mut services, shutdown.clone())?;

        for addr in config.statsd_addrs() {
            let listener = StatsdListener::bind(
                addr,
                config.max_packet_size(),
                state.ingestor().clone(),
                shutdown.clone(),
            )?;
            services.start(listener);
        }

        if let Some(addr) = config.http_addr() {
            services.start(HttpServer::new(addr, state.clone(), shutdown.clone())?);
        }

        // Services hold the state from here on, so it is released once they stop.
        drop(state);

        let mut signal = shutdown;
        tokio::select! {
            _ = services.join() => {},
            _ = async {
                let shutdown = signal.notified().await;
                let timeout = shutdown.timeout.unwrap_or(SHUTDOWN_GRACE);
                tokio::time::sleep(timeout + SHUTDOWN_GRACE).await;
            } => {
                tally_log::warn!("services did not stop in time, exiting");
            },
        }

        anyhow::Ok(())
    })?;

    drop(runtime);
    tally_log::info!("tally has shut down");
    Ok(())
}
