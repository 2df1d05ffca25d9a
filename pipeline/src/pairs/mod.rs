//! Two-asset view.
//!
//! Independent of the queue: a poller fetches both legs from a
//! request/response price source, appends to a session buffer and publishes
//! the latest pair signal to the hot-state store.

pub mod poller;
pub mod session;

use async_trait::async_trait;
use thiserror::Error;

pub use poller::{
    PairControl, PairPoller, PairPollerConfig, PairSnapshot, PairStatus, StepOutcome, export_csv,
};
pub use session::{InvalidWindow, PairSession};

#[derive(Error, Debug)]
pub enum PriceSourceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Latest traded price by symbol.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn latest_price(&self, symbol: &str) -> Result<f64, PriceSourceError>;
}
