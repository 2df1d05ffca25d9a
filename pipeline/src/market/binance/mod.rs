//! Binance USD-M futures adapters: trade stream (websocket) and ticker
//! price (REST).

pub mod de;
pub mod feed;
pub mod rest;
pub mod trade;

pub use feed::BinanceTradeSource;
pub use rest::BinancePriceClient;
pub use trade::{FrameError, parse_trade_frame};
