//! Hot state: latest analytics snapshot per key, last write wins.
//!
//! The worker and the pair poller write here; the presentation layer only
//! reads. No history is kept.

pub mod memory;
pub mod sqlx_store;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryHotStateStore;
pub use sqlx_store::SqlxHotStateStore;

const MARKET_STATE_PREFIX: &str = "market_state";
const PAIR_STATE_PREFIX: &str = "pair_state";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("document encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait HotStateStore: Send + Sync {
    async fn put(&self, key: &str, doc: serde_json::Value) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;
}

/// Single-asset snapshot published by the analytics worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotState {
    pub symbol: String,
    pub price: f64,
    pub mean: f64,
    pub std: f64,
    pub z_score: f64,
    /// Exchange timestamp of the tick (ms epoch).
    pub timestamp: i64,
}

pub fn market_state_key(symbol: &str) -> String {
    format!("{}:{}", MARKET_STATE_PREFIX, symbol.to_ascii_lowercase())
}

pub fn pair_state_key(symbol_y: &str, symbol_x: &str) -> String {
    format!(
        "{}:{}-{}",
        PAIR_STATE_PREFIX,
        symbol_y.to_ascii_uppercase(),
        symbol_x.to_ascii_uppercase()
    )
}

pub async fn publish<T: Serialize>(
    store: &dyn HotStateStore,
    key: &str,
    doc: &T,
) -> Result<(), StoreError> {
    store.put(key, serde_json::to_value(doc)?).await
}

pub async fn fetch<T: DeserializeOwned>(
    store: &dyn HotStateStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_and_normalized() {
        assert_eq!(market_state_key("BTCUSDT"), "market_state:btcusdt");
        assert_eq!(pair_state_key("ethusdt", "btcusdt"), "pair_state:ETHUSDT-BTCUSDT");
    }

    #[tokio::test]
    async fn typed_round_trip_through_store() {
        let store = MemoryHotStateStore::new();
        let doc = HotState {
            symbol: "BTCUSDT".into(),
            price: 100.0,
            mean: 99.5,
            std: 0.5,
            z_score: 1.0,
            timestamp: 1_700_000_000_000,
        };

        publish(&store, &market_state_key("BTCUSDT"), &doc)
            .await
            .unwrap();
        let back: Option<HotState> = fetch(&store, "market_state:btcusdt").await.unwrap();
        assert_eq!(back, Some(doc));

        let missing: Option<HotState> = fetch(&store, "market_state:ethusdt").await.unwrap();
        assert!(missing.is_none());
    }
}
