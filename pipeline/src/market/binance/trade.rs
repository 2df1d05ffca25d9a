//! Trade frame normalization.
//!
//! Raw frame fields are remapped onto [`Tick`]:
//! `s` → symbol, `p` → price, `q` → volume, `T` → exchange timestamp.

use serde::Deserialize;
use thiserror::Error;

use super::de::de_str;
use crate::market::types::{Tick, TickError};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid trade: {0}")]
    Invalid(#[from] TickError),
}

#[derive(Debug, Deserialize)]
struct BinanceTrade {
    #[serde(rename = "s")]
    symbol: String,

    #[serde(rename = "p", deserialize_with = "de_str")]
    price: f64,

    #[serde(rename = "q", deserialize_with = "de_str")]
    quantity: f64,

    #[serde(rename = "T")]
    trade_time_ms: i64,
}

#[derive(Debug, Deserialize)]
struct EventKind {
    #[serde(rename = "e")]
    kind: Option<String>,
}

/// Parses one text frame.
///
/// `Ok(None)` for frames that are valid but carry no trade (subscription
/// acks, other event kinds). `Err` for frames that claim to be trades but
/// cannot be normalized.
pub fn parse_trade_frame(raw: &str) -> Result<Option<Tick>, FrameError> {
    let kind: EventKind = serde_json::from_str(raw)?;
    match kind.kind.as_deref() {
        Some("trade") => {}
        _ => return Ok(None),
    }

    let trade: BinanceTrade = serde_json::from_str(raw)?;
    let tick = Tick::new(trade.symbol, trade.price, trade.quantity, trade.trade_time_ms)?;
    Ok(Some(tick))
}
