use std::time::Duration;

use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use tracing::instrument;

use super::{HotStateStore, StoreError};
use crate::logger::warn_if_slow;
use crate::time::now_ms;

/// SQLx-backed hot state. One row per key, overwritten in place.
pub struct SqlxHotStateStore {
    pool: AnyPool,
}

impl SqlxHotStateStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HotStateStore for SqlxHotStateStore {
    #[instrument(skip(self, doc), level = "debug")]
    async fn put(&self, key: &str, doc: serde_json::Value) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(&doc)?;

        warn_if_slow("hot_state_put", Duration::from_millis(50), async {
            sqlx::query(
                r#"
INSERT INTO hot_state (key, doc, updated_ms) VALUES (?, ?, ?)
ON CONFLICT (key) DO UPDATE SET doc = excluded.doc, updated_ms = excluded.updated_ms;
"#,
            )
            .bind(key)
            .bind(&encoded)
            .bind(now_ms())
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query(r#"SELECT doc FROM hot_state WHERE key = ?;"#)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let raw: String = r.get("doc");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }
}
