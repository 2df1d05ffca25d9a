use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::de::de_str;
use crate::pairs::{PriceSource, PriceSourceError};

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    #[serde(deserialize_with = "de_str")]
    price: f64,
}

/// Latest-price endpoint (`/fapi/v1/ticker/price?symbol=...`).
#[derive(Clone)]
pub struct BinancePriceClient {
    http: Client,
    url: Url,
}

impl BinancePriceClient {
    pub fn new(url: Url) -> Result<Self, PriceSourceError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(2))
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self { http, url })
    }
}

#[async_trait]
impl PriceSource for BinancePriceClient {
    #[instrument(skip(self), level = "debug")]
    async fn latest_price(&self, symbol: &str) -> Result<f64, PriceSourceError> {
        let resp = self
            .http
            .get(self.url.clone())
            .query(&[("symbol", symbol)])
            .send()
            .await?
            .error_for_status()?;

        let ticker: TickerPrice = resp.json().await?;

        if !ticker.symbol.eq_ignore_ascii_case(symbol) {
            return Err(PriceSourceError::InvalidResponse(format!(
                "asked for {symbol}, got {}",
                ticker.symbol
            )));
        }
        if !ticker.price.is_finite() || ticker.price <= 0.0 {
            return Err(PriceSourceError::InvalidResponse(format!(
                "non-positive price {} for {symbol}",
                ticker.price
            )));
        }

        debug!(price = ticker.price, "ticker price fetched");
        Ok(ticker.price)
    }
}
