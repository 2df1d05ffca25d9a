use std::time::Duration;

use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::{DEFAULT_MAXLEN, DurableQueue, EntryId, Fields, QueueEntry, QueueError};
use crate::logger::warn_if_slow;
use crate::time::now_ms;

/// How often a blocked `read_new` re-checks the table for entries appended
/// by other processes.
const BLOCK_POLL: Duration = Duration::from_millis(100);

/// SQLx-backed stream. Entries, group cursors and pending lists live in
/// three tables (see `db::schema`), so any number of processes can share one
/// database.
pub struct SqlxQueue {
    pool: AnyPool,
    stream: String,
    maxlen: usize,
    /// Wakes blocked readers on appends made through this client.
    appended: Notify,
}

impl SqlxQueue {
    pub fn new(pool: AnyPool, stream: impl Into<String>) -> Self {
        Self::with_maxlen(pool, stream, DEFAULT_MAXLEN)
    }

    pub fn with_maxlen(pool: AnyPool, stream: impl Into<String>, maxlen: usize) -> Self {
        Self {
            pool,
            stream: stream.into(),
            maxlen: maxlen.max(1),
            appended: Notify::new(),
        }
    }

    async fn group_cursor(&self, group: &str) -> Result<i64, QueueError> {
        let row = sqlx::query(
            r#"SELECT last_delivered_id FROM stream_groups WHERE stream = ? AND group_name = ?;"#,
        )
        .bind(&self.stream)
        .bind(group)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.get::<i64, _>("last_delivered_id"))
            .ok_or_else(|| QueueError::NoSuchGroup(group.to_string()))
    }

    /// One non-blocking claim attempt. Uses compare-and-set on the group
    /// cursor so two consumers racing for the same range cannot both win.
    async fn try_claim_new(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        loop {
            let cursor = self.group_cursor(group).await?;

            let mut tx = self.pool.begin().await?;

            let rows = sqlx::query(
                r#"
SELECT id, fields FROM stream_entries
WHERE stream = ? AND id > ?
ORDER BY id
LIMIT ?;
"#,
            )
            .bind(&self.stream)
            .bind(cursor)
            .bind(count as i64)
            .fetch_all(&mut *tx)
            .await?;

            if rows.is_empty() {
                tx.rollback().await?;
                return Ok(Vec::new());
            }

            let entries: Vec<QueueEntry> = rows.iter().map(row_to_entry).collect();
            let new_cursor = entries.last().map(|e| e.id.0).unwrap_or(cursor);

            let moved = sqlx::query(
                r#"
UPDATE stream_groups SET last_delivered_id = ?
WHERE stream = ? AND group_name = ? AND last_delivered_id = ?;
"#,
            )
            .bind(new_cursor)
            .bind(&self.stream)
            .bind(group)
            .bind(cursor)
            .execute(&mut *tx)
            .await?;

            if moved.rows_affected() == 0 {
                // Another consumer advanced the cursor first.
                tx.rollback().await?;
                debug!(group, consumer, "lost cursor race; retrying claim");
                continue;
            }

            let now = now_ms();
            for e in &entries {
                sqlx::query(
                    r#"
INSERT INTO stream_pending (stream, group_name, entry_id, consumer, delivered_ms, delivery_count)
VALUES (?, ?, ?, ?, ?, 1);
"#,
                )
                .bind(&self.stream)
                .bind(group)
                .bind(e.id.0)
                .bind(consumer)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            return Ok(entries);
        }
    }
}

#[async_trait]
impl DurableQueue for SqlxQueue {
    fn stream(&self) -> &str {
        &self.stream
    }

    #[instrument(skip(self, fields), fields(stream = %self.stream), level = "debug")]
    async fn append(&self, fields: Fields) -> Result<EntryId, QueueError> {
        let encoded = serde_json::to_string(&fields)?;

        let id = warn_if_slow("queue_append", Duration::from_millis(50), async {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query(
                r#"INSERT INTO stream_entries (stream, fields, created_ms) VALUES (?, ?, ?) RETURNING id;"#,
            )
            .bind(&self.stream)
            .bind(&encoded)
            .bind(now_ms())
            .fetch_one(&mut *tx)
            .await?;
            let id: i64 = row.get("id");

            // Oldest id that survives the bound; everything before it goes.
            let floor = sqlx::query(
                r#"SELECT id FROM stream_entries WHERE stream = ? ORDER BY id DESC LIMIT 1 OFFSET ?;"#,
            )
            .bind(&self.stream)
            .bind((self.maxlen - 1) as i64)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(floor) = floor {
                let floor: i64 = floor.get("id");
                sqlx::query(r#"DELETE FROM stream_entries WHERE stream = ? AND id < ?;"#)
                    .bind(&self.stream)
                    .bind(floor)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(r#"DELETE FROM stream_pending WHERE stream = ? AND entry_id < ?;"#)
                    .bind(&self.stream)
                    .bind(floor)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok::<_, QueueError>(id)
        })
        .await?;

        self.appended.notify_waiters();
        Ok(EntryId(id))
    }

    #[instrument(skip(self), fields(stream = %self.stream))]
    async fn ensure_consumer_group(&self, group: &str) -> Result<bool, QueueError> {
        let res = sqlx::query(
            r#"
INSERT INTO stream_groups (stream, group_name, last_delivered_id, created_ms)
VALUES (?, ?, 0, ?)
ON CONFLICT (stream, group_name) DO NOTHING;
"#,
        )
        .bind(&self.stream)
        .bind(group)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        let created = res.rows_affected() > 0;
        if created {
            debug!(group, "consumer group created at stream origin");
        } else {
            debug!(group, "consumer group already exists");
        }
        Ok(created)
    }

    #[instrument(skip(self), fields(stream = %self.stream), level = "debug")]
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
            notified.as_mut().enable();

            let batch = self.try_claim_new(group, consumer, count).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = (deadline - now).min(BLOCK_POLL);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    #[instrument(skip(self), fields(stream = %self.stream))]
    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        self.group_cursor(group).await?;

        let rows = sqlx::query(
            r#"
SELECT e.id AS id, e.fields AS fields
FROM stream_pending p
JOIN stream_entries e ON e.id = p.entry_id
WHERE p.stream = ? AND p.group_name = ? AND p.consumer = ?
ORDER BY p.entry_id
LIMIT ?;
"#,
        )
        .bind(&self.stream)
        .bind(group)
        .bind(consumer)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        let entries: Vec<QueueEntry> = rows.iter().map(row_to_entry).collect();

        let now = now_ms();
        for e in &entries {
            sqlx::query(
                r#"
UPDATE stream_pending SET delivered_ms = ?, delivery_count = delivery_count + 1
WHERE stream = ? AND group_name = ? AND entry_id = ?;
"#,
            )
            .bind(now)
            .bind(&self.stream)
            .bind(group)
            .bind(e.id.0)
            .execute(&self.pool)
            .await?;
        }

        Ok(entries)
    }

    #[instrument(skip(self), fields(stream = %self.stream))]
    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        self.group_cursor(group).await?;

        let now = now_ms();
        let cutoff = now - min_idle.as_millis() as i64;

        let rows = sqlx::query(
            r#"
SELECT e.id AS id, e.fields AS fields
FROM stream_pending p
JOIN stream_entries e ON e.id = p.entry_id
WHERE p.stream = ? AND p.group_name = ? AND p.consumer <> ? AND p.delivered_ms <= ?
ORDER BY p.entry_id
LIMIT ?;
"#,
        )
        .bind(&self.stream)
        .bind(group)
        .bind(consumer)
        .bind(cutoff)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for r in &rows {
            let entry = row_to_entry(r);

            // Conditional so a concurrent claimer cannot double-own the entry.
            let res = sqlx::query(
                r#"
UPDATE stream_pending
SET consumer = ?, delivered_ms = ?, delivery_count = delivery_count + 1
WHERE stream = ? AND group_name = ? AND entry_id = ? AND consumer <> ? AND delivered_ms <= ?;
"#,
            )
            .bind(consumer)
            .bind(now)
            .bind(&self.stream)
            .bind(group)
            .bind(entry.id.0)
            .bind(consumer)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

            if res.rows_affected() > 0 {
                claimed.push(entry);
            }
        }

        Ok(claimed)
    }

    #[instrument(skip(self), fields(stream = %self.stream), level = "debug")]
    async fn acknowledge(&self, group: &str, id: EntryId) -> Result<bool, QueueError> {
        let res = sqlx::query(
            r#"DELETE FROM stream_pending WHERE stream = ? AND group_name = ? AND entry_id = ?;"#,
        )
        .bind(&self.stream)
        .bind(group)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS n FROM stream_entries WHERE stream = ?;"#)
            .bind(&self.stream)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n").max(0) as usize)
    }

    async fn pending_count(&self, group: &str) -> Result<usize, QueueError> {
        self.group_cursor(group).await?;

        let row = sqlx::query(
            r#"SELECT COUNT(*) AS n FROM stream_pending WHERE stream = ? AND group_name = ?;"#,
        )
        .bind(&self.stream)
        .bind(group)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n").max(0) as usize)
    }
}

/// Maps a row to an entry. A row whose field blob fails to decode comes back
/// with no fields, so the consumer can drop and acknowledge it instead of
/// wedging the group on a poison entry.
fn row_to_entry(r: &sqlx::any::AnyRow) -> QueueEntry {
    let id = EntryId(r.get::<i64, _>("id"));
    let raw: String = r.get("fields");
    let fields = serde_json::from_str::<Fields>(&raw).unwrap_or_else(|e| {
        warn!(entry_id = %id, error = %e, "undecodable stream entry");
        Fields::new()
    });
    QueueEntry { id, fields }
}
