use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::Fields;

const FIELD_SYMBOL: &str = "symbol";
const FIELD_PRICE: &str = "price";
const FIELD_VOLUME: &str = "volume";
const FIELD_TIMESTAMP: &str = "timestamp";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TickError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is not a valid number: '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("field '{field}' out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// One normalized trade. Immutable once built; construct through
/// [`Tick::new`] so the numeric checks always run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    symbol: String,
    price: f64,
    volume: f64,
    /// Exchange trade time, ms since epoch.
    exchange_ts_ms: i64,
}

impl Tick {
    pub fn new(
        symbol: impl Into<String>,
        price: f64,
        volume: f64,
        exchange_ts_ms: i64,
    ) -> Result<Self, TickError> {
        let symbol = symbol.into();
        if symbol.trim().is_empty() {
            return Err(TickError::MissingField(FIELD_SYMBOL));
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(TickError::OutOfRange {
                field: FIELD_PRICE,
                value: price,
            });
        }
        if !volume.is_finite() || volume < 0.0 {
            return Err(TickError::OutOfRange {
                field: FIELD_VOLUME,
                value: volume,
            });
        }

        Ok(Self {
            symbol,
            price,
            volume,
            exchange_ts_ms,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn exchange_ts_ms(&self) -> i64 {
        self.exchange_ts_ms
    }

    /// Queue representation: a flat field/value map.
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            (FIELD_SYMBOL.to_string(), self.symbol.clone()),
            (FIELD_PRICE.to_string(), self.price.to_string()),
            (FIELD_VOLUME.to_string(), self.volume.to_string()),
            (FIELD_TIMESTAMP.to_string(), self.exchange_ts_ms.to_string()),
        ])
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, TickError> {
        let symbol = required(fields, FIELD_SYMBOL)?;
        let price = number::<f64>(fields, FIELD_PRICE)?;
        let volume = number::<f64>(fields, FIELD_VOLUME)?;
        let ts = number::<i64>(fields, FIELD_TIMESTAMP)?;
        Self::new(symbol, price, volume, ts)
    }
}

fn required<'a>(fields: &'a Fields, field: &'static str) -> Result<&'a str, TickError> {
    fields
        .get(field)
        .map(String::as_str)
        .ok_or(TickError::MissingField(field))
}

fn number<T: std::str::FromStr>(fields: &Fields, field: &'static str) -> Result<T, TickError> {
    let raw = required(fields, field)?;
    raw.trim().parse::<T>().map_err(|_| TickError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_round_trip_preserves_values() {
        let t = Tick::new("BTCUSDT", 64_123.45, 0.002, 1_700_000_000_123).unwrap();
        let back = Tick::from_fields(&t.to_fields()).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn rejects_non_positive_or_non_finite_price() {
        assert!(Tick::new("BTCUSDT", 0.0, 1.0, 0).is_err());
        assert!(Tick::new("BTCUSDT", f64::NAN, 1.0, 0).is_err());
        assert!(Tick::new("BTCUSDT", 1.0, -1.0, 0).is_err());
        assert!(Tick::new(" ", 1.0, 1.0, 0).is_err());
    }

    #[test]
    fn from_fields_reports_the_bad_field() {
        let mut f = Tick::new("BTCUSDT", 1.0, 1.0, 5).unwrap().to_fields();
        f.insert("price".into(), "abc".into());
        assert_eq!(
            Tick::from_fields(&f).unwrap_err(),
            TickError::InvalidNumber {
                field: "price",
                value: "abc".into()
            }
        );

        f.remove("timestamp");
        f.insert("price".into(), "1.5".into());
        assert_eq!(
            Tick::from_fields(&f).unwrap_err(),
            TickError::MissingField("timestamp")
        );
    }
}
