use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Stream entries. AUTOINCREMENT keeps ids from being reused after trims,
    // which the group cursors depend on.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS stream_entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  stream TEXT NOT NULL,
  fields TEXT NOT NULL,
  created_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Consumer groups
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS stream_groups (
  stream TEXT NOT NULL,
  group_name TEXT NOT NULL,
  last_delivered_id BIGINT NOT NULL,
  created_ms BIGINT NOT NULL,
  PRIMARY KEY (stream, group_name)
);
"#,
    )
    .execute(pool)
    .await?;

    // Delivered but unacknowledged
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS stream_pending (
  stream TEXT NOT NULL,
  group_name TEXT NOT NULL,
  entry_id BIGINT NOT NULL,
  consumer TEXT NOT NULL,
  delivered_ms BIGINT NOT NULL,
  delivery_count BIGINT NOT NULL,
  PRIMARY KEY (stream, group_name, entry_id)
);
"#,
    )
    .execute(pool)
    .await?;

    // Hot state (last write wins)
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS hot_state (
  key TEXT PRIMARY KEY,
  doc TEXT NOT NULL,
  updated_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_stream_entries_stream ON stream_entries(stream, id);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_stream_pending_consumer ON stream_pending(stream, group_name, consumer);"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
