//! Services of the tally agent.
//!
//! Samples flow from the [`listener`](listener::StatsdListener) and the import endpoint through
//! the [`Ingestor`](crate::Ingestor) into the shards of the [`WorkerPool`](shards::WorkerPool).
//! The [`FlushService`](flush::FlushService) rotates all shards once per interval and hands the
//! resulting batch to the [`SinkDispatcherService`](dispatch::SinkDispatcherService). In global
//! mode, samples owned by other nodes go to the [`ForwarderService`](forward::ForwarderService)
//! instead.

pub mod dispatch;
pub mod flush;
pub mod forward;
pub mod listener;
pub mod server;
pub mod shards;
