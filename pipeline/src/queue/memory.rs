//! In-process queue with the same delivery semantics as the SQL one.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DurableQueue, EntryId, Fields, QueueEntry, QueueError};
use crate::time::now_ms;

#[derive(Debug)]
struct Pending {
    consumer: String,
    delivered_ms: i64,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: i64,
    pending: BTreeMap<i64, Pending>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<QueueEntry>,
    next_id: i64,
    groups: HashMap<String, Group>,
}

impl Inner {
    fn fields_of(&self, id: i64) -> Option<&Fields> {
        // ids are strictly increasing, so the deque is sorted.
        let idx = self
            .entries
            .binary_search_by_key(&id, |e| e.id.0)
            .ok()?;
        self.entries.get(idx).map(|e| &e.fields)
    }
}

pub struct MemoryQueue {
    stream: String,
    maxlen: usize,
    inner: Mutex<Inner>,
    appended: Notify,
}

impl MemoryQueue {
    pub fn new(stream: impl Into<String>, maxlen: usize) -> Self {
        Self {
            stream: stream.into(),
            maxlen: maxlen.max(1),
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Default::default()
            }),
            appended: Notify::new(),
        }
    }

    fn claim_new(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let mut inner = self.inner.lock();
        let cursor = inner
            .groups
            .get(group)
            .map(|g| g.last_delivered)
            .ok_or_else(|| QueueError::NoSuchGroup(group.to_string()))?;

        let batch: Vec<QueueEntry> = inner
            .entries
            .iter()
            .filter(|e| e.id.0 > cursor)
            .take(count)
            .cloned()
            .collect();

        if let (Some(last), Some(g)) = (batch.last(), inner.groups.get_mut(group)) {
            let now = now_ms();
            g.last_delivered = last.id.0;
            for e in &batch {
                g.pending.insert(
                    e.id.0,
                    Pending {
                        consumer: consumer.to_string(),
                        delivered_ms: now,
                    },
                );
            }
        }

        Ok(batch)
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    fn stream(&self) -> &str {
        &self.stream
    }

    async fn append(&self, fields: Fields) -> Result<EntryId, QueueError> {
        let id = {
            let mut inner = self.inner.lock();
            let id = EntryId(inner.next_id);
            inner.next_id += 1;
            inner.entries.push_back(QueueEntry { id, fields });

            while inner.entries.len() > self.maxlen {
                if let Some(old) = inner.entries.pop_front() {
                    for g in inner.groups.values_mut() {
                        g.pending.remove(&old.id.0);
                    }
                }
            }
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_consumer_group(&self, group: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        if inner.groups.contains_key(group) {
            return Ok(false);
        }
        inner.groups.insert(group.to_string(), Group::default());
        Ok(true)
    }

    async fn read_new(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let deadline = Instant::now() + block;

        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            // Register before checking so an append in between is not missed.
            notified.as_mut().enable();

            let batch = self.claim_new(group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get(group)
            .ok_or_else(|| QueueError::NoSuchGroup(group.to_string()))?;

        let ids: Vec<i64> = g
            .pending
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .map(|(id, _)| *id)
            .take(count)
            .collect();

        let out: Vec<QueueEntry> = ids
            .iter()
            .filter_map(|id| {
                inner.fields_of(*id).map(|f| QueueEntry {
                    id: EntryId(*id),
                    fields: f.clone(),
                })
            })
            .collect();

        let now = now_ms();
        if let Some(g) = inner.groups.get_mut(group) {
            for e in &out {
                if let Some(p) = g.pending.get_mut(&e.id.0) {
                    p.delivered_ms = now;
                }
            }
        }

        Ok(out)
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let now = now_ms();
        let cutoff = now - min_idle.as_millis() as i64;

        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get(group)
            .ok_or_else(|| QueueError::NoSuchGroup(group.to_string()))?;

        let ids: Vec<i64> = g
            .pending
            .iter()
            .filter(|(_, p)| p.consumer != consumer && p.delivered_ms <= cutoff)
            .map(|(id, _)| *id)
            .take(count)
            .collect();

        let out: Vec<QueueEntry> = ids
            .iter()
            .filter_map(|id| {
                inner.fields_of(*id).map(|f| QueueEntry {
                    id: EntryId(*id),
                    fields: f.clone(),
                })
            })
            .collect();

        if let Some(g) = inner.groups.get_mut(group) {
            for e in &out {
                if let Some(p) = g.pending.get_mut(&e.id.0) {
                    p.consumer = consumer.to_string();
                    p.delivered_ms = now;
                }
            }
        }

        Ok(out)
    }

    async fn acknowledge(&self, group: &str, id: EntryId) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| QueueError::NoSuchGroup(group.to_string()))?;
        Ok(g.pending.remove(&id.0).is_some())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.inner.lock().entries.len())
    }

    async fn pending_count(&self, group: &str) -> Result<usize, QueueError> {
        let inner = self.inner.lock();
        inner
            .groups
            .get(group)
            .map(|g| g.pending.len())
            .ok_or_else(|| QueueError::NoSuchGroup(group.to_string()))
    }
}
