use std::hash::Hasher as _;
use std::num::NonZeroUsize;

use hash32::{Hasher as _, Murmur3Hasher};

use crate::protocol::MetricKey;

/// Assigns metric keys to a fixed number of shards.
///
/// The assignment is a pure function of the key and the shard count, so each key is owned by the
/// same shard for the lifetime of the process.
#[derive(Clone, Copy, Debug)]
pub struct ShardRouter {
    shards: NonZeroUsize,
}

impl ShardRouter {
    /// Creates a router over `shards` shards.
    pub fn new(shards: NonZeroUsize) -> Self {
        Self { shards }
    }

    /// Returns the number of shards.
    pub fn shards(&self) -> usize {
        self.shards.get()
    }

    /// Returns the index of the shard owning `key`.
    pub fn route(&self, key: &MetricKey) -> usize {
        let mut hasher = Murmur3Hasher::default();
        key.write_bytes(|bytes| hasher.write(bytes));
        hasher.finish32() as usize % self.shards.get()
    }
}
