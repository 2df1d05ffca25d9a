//! Durable, bounded stream with consumer-group delivery.
//!
//! Delivery is at-least-once: an entry handed out by [`DurableQueue::read_new`]
//! stays on the group's pending list until [`DurableQueue::acknowledge`] is
//! called for it. A consumer that restarts under the same name gets its
//! unacknowledged entries back from [`DurableQueue::read_pending`]; entries
//! stuck on a consumer that never returns can be moved with
//! [`DurableQueue::claim_idle`].

pub mod memory;
pub mod sqlx_queue;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryQueue;
pub use sqlx_queue::SqlxQueue;

/// Default bound on stream length.
pub const DEFAULT_MAXLEN: usize = 10_000;

/// Entries are field/value maps, not raw bytes.
pub type Fields = BTreeMap<String, String>;

/// Monotonic, never-reused position in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub i64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: EntryId,
    pub fields: Fields,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("field encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("consumer group '{0}' does not exist")]
    NoSuchGroup(String),
}

#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Stream this client is bound to.
    fn stream(&self) -> &str;

    /// Appends an entry, trimming the oldest entries beyond the bound.
    async fn append(&self, fields: Fields) -> Result<EntryId, QueueError>;

    /// Creates `group` positioned at the start of the stream.
    ///
    /// Returns `false` (not an error) when the group already exists; the
    /// existing cursor is left untouched.
    async fn ensure_consumer_group(&self, group: &str) -> Result<bool, QueueError>;

    /// Claims up to `count` entries never delivered to any consumer of
    /// `group`, waiting up to `block` for one to arrive.
    ///
    /// An empty result means the wait timed out.
    async fn read_new(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Entries delivered to `consumer` and not yet acknowledged, oldest
    /// first. Does not block.
    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Reassigns to `consumer` entries that have sat unacknowledged on other
    /// consumers for at least `min_idle`.
    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Removes `id` from the group's pending list. Returns whether it was
    /// pending.
    async fn acknowledge(&self, group: &str, id: EntryId) -> Result<bool, QueueError>;

    /// Entries currently retained in the stream.
    async fn len(&self) -> Result<usize, QueueError>;

    /// Entries delivered to `group` and not yet acknowledged.
    async fn pending_count(&self, group: &str) -> Result<usize, QueueError>;
}
