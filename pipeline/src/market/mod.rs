pub mod binance;
pub mod types;

pub use types::{Tick, TickError};
