use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{HotStateStore, StoreError};

/// In-memory hot state, keyed like the SQL store.
#[derive(Clone, Default)]
pub struct MemoryHotStateStore {
    inner: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl MemoryHotStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl HotStateStore for MemoryHotStateStore {
    /// Last write wins.
    async fn put(&self, key: &str, doc: serde_json::Value) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        g.insert(key.to_string(), doc);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let g = self.inner.read().await;
        Ok(g.get(key).cloned())
    }
}
