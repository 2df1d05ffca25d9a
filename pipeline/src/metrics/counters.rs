use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimal counters for operational visibility.
#[derive(Clone, Default, Debug)]
pub struct Counters {
    // ingest
    pub frames_received: Arc<AtomicU64>,
    pub frames_malformed: Arc<AtomicU64>,
    pub ticks_appended: Arc<AtomicU64>,
    pub append_failures: Arc<AtomicU64>,
    pub reconnects: Arc<AtomicU64>,

    // worker
    pub entries_processed: Arc<AtomicU64>,
    pub entries_malformed: Arc<AtomicU64>,
    pub entries_duplicate: Arc<AtomicU64>,
    pub entries_reclaimed: Arc<AtomicU64>,
    pub publish_failures: Arc<AtomicU64>,

    // pairs
    pub price_fetch_failures: Arc<AtomicU64>,
    pub pair_samples: Arc<AtomicU64>,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// One log line with every total.
    pub fn log_totals(&self) {
        tracing::info!(
            frames_received = Self::get(&self.frames_received),
            frames_malformed = Self::get(&self.frames_malformed),
            ticks_appended = Self::get(&self.ticks_appended),
            append_failures = Self::get(&self.append_failures),
            reconnects = Self::get(&self.reconnects),
            entries_processed = Self::get(&self.entries_processed),
            entries_malformed = Self::get(&self.entries_malformed),
            entries_duplicate = Self::get(&self.entries_duplicate),
            entries_reclaimed = Self::get(&self.entries_reclaimed),
            publish_failures = Self::get(&self.publish_failures),
            price_fetch_failures = Self::get(&self.price_fetch_failures),
            pair_samples = Self::get(&self.pair_samples),
            "counters"
        );
    }
}
