//! Analytics worker.
//!
//! Data flow:
//! DurableQueue (consumer group) → Tick → OnlineStats → HotStateStore → ack
//!
//! Processing is strictly sequential: an entry is applied, published and
//! acknowledged before the next one is looked at. An entry whose publish
//! fails stays pending and is retried through the pending list.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::analytics::OnlineStats;
use crate::market::Tick;
use crate::metrics::Counters;
use crate::queue::{DurableQueue, EntryId, QueueEntry, QueueError};
use crate::state::{self, HotState, HotStateStore, StoreError, market_state_key};
use crate::time::format_ms;

/// Pause after a failed queue or store round-trip.
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Entry ids remembered for redelivery detection.
const APPLIED_MEMORY: usize = 10_000;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("hot state: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub group: String,
    pub consumer: String,
    pub batch: usize,
    pub block: Duration,
    pub claim_idle: Option<Duration>,
}

/// What happened to one delivered entry. All three end acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Applied,
    Duplicate,
    Malformed,
}

pub struct AnalyticsWorker {
    queue: Arc<dyn DurableQueue>,
    store: Arc<dyn HotStateStore>,
    cfg: WorkerConfig,
    counters: Counters,
    stats: HashMap<String, OnlineStats>,
    applied: BTreeSet<EntryId>,
}

impl AnalyticsWorker {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        store: Arc<dyn HotStateStore>,
        cfg: WorkerConfig,
        counters: Counters,
    ) -> Self {
        Self {
            queue,
            store,
            cfg,
            counters,
            stats: HashMap::new(),
            applied: BTreeSet::new(),
        }
    }

    /// Current statistics for `symbol`, if any tick has been applied.
    pub fn stats(&self, symbol: &str) -> Option<&OnlineStats> {
        self.stats.get(symbol)
    }

    /// Creates the consumer group if needed. An existing group is fine.
    pub async fn prepare(&self) -> Result<(), QueueError> {
        if self.queue.ensure_consumer_group(&self.cfg.group).await? {
            info!(group = %self.cfg.group, "consumer group created");
        } else {
            debug!(group = %self.cfg.group, "consumer group already present");
        }
        Ok(())
    }

    /// Drains entries delivered to this consumer name but never
    /// acknowledged, e.g. by a previous run that crashed mid-batch.
    #[instrument(skip(self), fields(consumer = %self.cfg.consumer))]
    pub async fn recover_pending(&mut self) -> Result<usize, WorkerError> {
        let mut total = 0;
        loop {
            let entries = self
                .queue
                .read_pending(&self.cfg.group, &self.cfg.consumer, self.cfg.batch)
                .await?;
            if entries.is_empty() {
                break;
            }
            total += self.process_batch(&entries).await?;
        }

        if total > 0 {
            info!(entries = total, "recovered pending entries");
        }
        Ok(total)
    }

    /// One blocking read, plus an idle-entry sweep when the read comes back
    /// empty. Returns the number of entries handled.
    pub async fn poll_once(&mut self) -> Result<usize, WorkerError> {
        let entries = self
            .queue
            .read_new(
                &self.cfg.group,
                &self.cfg.consumer,
                self.cfg.batch,
                self.cfg.block,
            )
            .await?;

        if !entries.is_empty() {
            return self.process_batch(&entries).await;
        }

        let Some(min_idle) = self.cfg.claim_idle else {
            return Ok(0);
        };

        let claimed = self
            .queue
            .claim_idle(&self.cfg.group, &self.cfg.consumer, min_idle, self.cfg.batch)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        Counters::add(&self.counters.entries_reclaimed, claimed.len() as u64);
        info!(entries = claimed.len(), "claimed idle entries from other consumers");
        self.process_batch(&claimed).await
    }

    /// Runs until the task is dropped.
    #[instrument(skip(self), fields(group = %self.cfg.group, consumer = %self.cfg.consumer))]
    pub async fn run(mut self) {
        while let Err(e) = self.prepare().await {
            error!(error = %e, "consumer group setup failed; retrying");
            tokio::time::sleep(ERROR_PAUSE).await;
        }

        info!(stream = %self.queue.stream(), "analytics worker started");

        let mut recover = true;
        loop {
            let res = if recover {
                self.recover_pending().await
            } else {
                self.poll_once().await
            };

            match res {
                Ok(_) => recover = false,
                Err(e) => {
                    // Whatever was left of the batch is still pending on us.
                    error!(error = %e, "worker iteration failed");
                    recover = true;
                    tokio::time::sleep(ERROR_PAUSE).await;
                }
            }
        }
    }

    async fn process_batch(&mut self, entries: &[QueueEntry]) -> Result<usize, WorkerError> {
        for entry in entries {
            self.process_entry(entry).await?;
        }
        Ok(entries.len())
    }

    /// Applies, publishes and acknowledges one entry.
    pub async fn process_entry(&mut self, entry: &QueueEntry) -> Result<EntryOutcome, WorkerError> {
        let tick = match Tick::from_fields(&entry.fields) {
            Ok(t) => t,
            Err(e) => {
                Counters::incr(&self.counters.entries_malformed);
                warn!(entry_id = %entry.id, error = %e, "dropping malformed entry");
                self.ack(entry.id).await?;
                return Ok(EntryOutcome::Malformed);
            }
        };

        if self.applied.contains(&entry.id) {
            Counters::incr(&self.counters.entries_duplicate);
            debug!(entry_id = %entry.id, "entry already applied; acknowledging only");
            self.ack(entry.id).await?;
            return Ok(EntryOutcome::Duplicate);
        }

        let mut stats = self.stats.get(tick.symbol()).cloned().unwrap_or_default();
        stats.update(tick.price());

        let doc = HotState {
            symbol: tick.symbol().to_string(),
            price: tick.price(),
            mean: stats.mean(),
            std: stats.std_dev(),
            z_score: stats.z_score(tick.price()),
            timestamp: tick.exchange_ts_ms(),
        };

        let key = market_state_key(tick.symbol());
        if let Err(e) = state::publish(self.store.as_ref(), &key, &doc).await {
            Counters::incr(&self.counters.publish_failures);
            return Err(e.into());
        }

        // Committed only once the snapshot is out.
        self.stats.insert(doc.symbol.clone(), stats);
        self.remember(entry.id);
        Counters::incr(&self.counters.entries_processed);

        debug!(
            entry_id = %entry.id,
            symbol = %doc.symbol,
            price = doc.price,
            z = doc.z_score,
            exchange_time = %format_ms(doc.timestamp),
            "tick applied"
        );

        self.ack(entry.id).await?;
        Ok(EntryOutcome::Applied)
    }

    async fn ack(&self, id: EntryId) -> Result<(), QueueError> {
        if !self.queue.acknowledge(&self.cfg.group, id).await? {
            debug!(entry_id = %id, "entry was no longer pending");
        }
        Ok(())
    }

    fn remember(&mut self, id: EntryId) {
        self.applied.insert(id);
        while self.applied.len() > APPLIED_MEMORY {
            self.applied.pop_first();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Fields, MemoryQueue};
    use crate::state::MemoryHotStateStore;

    fn cfg() -> WorkerConfig {
        WorkerConfig {
            group: "g".into(),
            consumer: "c1".into(),
            batch: 10,
            block: Duration::ZERO,
            claim_idle: None,
        }
    }

    fn tick(symbol: &str, price: f64, ts: i64) -> Fields {
        Tick::new(symbol, price, 1.0, ts).unwrap().to_fields()
    }

    async fn setup() -> (Arc<MemoryQueue>, MemoryHotStateStore, AnalyticsWorker, Counters) {
        let q = Arc::new(MemoryQueue::new("s", 100));
        let store = MemoryHotStateStore::new();
        let counters = Counters::default();
        let w = AnalyticsWorker::new(q.clone(), Arc::new(store.clone()), cfg(), counters.clone());
        w.prepare().await.unwrap();
        (q, store, w, counters)
    }

    #[tokio::test]
    async fn publishes_running_stats_and_acks() {
        let (q, store, mut w, counters) = setup().await;
        for (i, p) in [1.0, 2.0, 3.0, 4.0, 5.0].into_iter().enumerate() {
            q.append(tick("BTCUSDT", p, i as i64)).await.unwrap();
        }

        assert_eq!(w.poll_once().await.unwrap(), 5);

        let doc: HotState = state::fetch(&store, "market_state:btcusdt").await.unwrap().unwrap();
        assert_eq!(doc.price, 5.0);
        assert!((doc.mean - 3.0).abs() < 1e-12);
        assert!((doc.std - 2.5_f64.sqrt()).abs() < 1e-12);
        assert!((doc.z_score - 2.0 / 2.5_f64.sqrt()).abs() < 1e-12);
        assert_eq!(doc.timestamp, 4);

        assert_eq!(q.pending_count("g").await.unwrap(), 0);
        assert_eq!(Counters::get(&counters.entries_processed), 5);
    }

    #[tokio::test]
    async fn first_tick_has_zero_z() {
        let (q, store, mut w, _) = setup().await;
        q.append(tick("ETHUSDT", 3000.0, 1)).await.unwrap();
        w.poll_once().await.unwrap();

        let doc: HotState = state::fetch(&store, "market_state:ethusdt").await.unwrap().unwrap();
        assert_eq!(doc.std, 0.0);
        assert_eq!(doc.z_score, 0.0);
    }

    #[tokio::test]
    async fn symbols_keep_separate_stats() {
        let (q, _, mut w, _) = setup().await;
        q.append(tick("A", 1.0, 1)).await.unwrap();
        q.append(tick("B", 100.0, 2)).await.unwrap();
        q.append(tick("A", 3.0, 3)).await.unwrap();
        w.poll_once().await.unwrap();

        assert_eq!(w.stats("A").unwrap().count(), 2);
        assert_eq!(w.stats("A").unwrap().mean(), 2.0);
        assert_eq!(w.stats("B").unwrap().count(), 1);
    }

    #[tokio::test]
    async fn malformed_entries_are_acked_and_counted() {
        let (q, store, mut w, counters) = setup().await;
        q.append(Fields::from([("symbol".to_string(), "X".to_string())]))
            .await
            .unwrap();

        assert_eq!(w.poll_once().await.unwrap(), 1);
        assert_eq!(q.pending_count("g").await.unwrap(), 0);
        assert_eq!(Counters::get(&counters.entries_malformed), 1);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn redelivered_entry_is_not_applied_twice() {
        let (q, _, mut w, counters) = setup().await;
        q.append(tick("A", 10.0, 1)).await.unwrap();
        let entries = q.read_new("g", "c1", 10, Duration::ZERO).await.unwrap();

        assert_eq!(w.process_entry(&entries[0]).await.unwrap(), EntryOutcome::Applied);
        assert_eq!(w.process_entry(&entries[0]).await.unwrap(), EntryOutcome::Duplicate);

        assert_eq!(w.stats("A").unwrap().count(), 1);
        assert_eq!(Counters::get(&counters.entries_duplicate), 1);
    }

    #[tokio::test]
    async fn restart_recovers_unacked_entries() {
        let (q, store, _, _) = setup().await;
        q.append(tick("A", 1.0, 1)).await.unwrap();
        q.append(tick("A", 2.0, 2)).await.unwrap();

        // A previous run read the batch and died before acknowledging.
        assert_eq!(q.read_new("g", "c1", 10, Duration::ZERO).await.unwrap().len(), 2);
        assert_eq!(q.pending_count("g").await.unwrap(), 2);

        let mut w = AnalyticsWorker::new(q.clone(), Arc::new(store.clone()), cfg(), Counters::default());
        assert_eq!(w.recover_pending().await.unwrap(), 2);
        assert_eq!(q.pending_count("g").await.unwrap(), 0);
        assert_eq!(w.stats("A").unwrap().count(), 2);
    }

    #[tokio::test]
    async fn idle_entries_of_a_dead_consumer_are_claimed() {
        let (q, _, _, _) = setup().await;
        q.append(tick("A", 1.0, 1)).await.unwrap();
        q.read_new("g", "dead", 10, Duration::ZERO).await.unwrap();

        let counters = Counters::default();
        let mut w = AnalyticsWorker::new(
            q.clone(),
            Arc::new(MemoryHotStateStore::new()),
            WorkerConfig {
                claim_idle: Some(Duration::ZERO),
                ..cfg()
            },
            counters.clone(),
        );

        assert_eq!(w.poll_once().await.unwrap(), 1);
        assert_eq!(q.pending_count("g").await.unwrap(), 0);
        assert_eq!(Counters::get(&counters.entries_reclaimed), 1);
    }
}
