use async_trait::async_trait;
use futures::StreamExt;
use futures::future::ready;
use reqwest::Url;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::ingest::{FeedError, FeedSource, FrameStream};

/// Futures trade stream for one symbol (`<base>/<symbol>@trade`).
#[derive(Debug, Clone)]
pub struct BinanceTradeSource {
    url: Url,
}

impl BinanceTradeSource {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl FeedSource for BinanceTradeSource {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    async fn connect(&self) -> Result<FrameStream, FeedError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        let frames = ws.filter_map(|msg| {
            ready(match msg {
                Ok(Message::Text(t)) => Some(Ok(t.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| "no close frame".to_string());
                    Some(Err(FeedError::Closed(reason)))
                }
                Ok(other) => {
                    // Ping replies are queued by tungstenite itself.
                    debug!(msg_type = ?other, "ignoring non-text websocket message");
                    None
                }
                Err(e) => Some(Err(FeedError::Transport(e.to_string()))),
            })
        });

        Ok(frames.boxed())
    }
}
