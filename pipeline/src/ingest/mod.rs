//! Feed ingestion.
//!
//! Data flow:
//! Feed source → normalize → DurableQueue::append
//!
//! The ingestor is an explicit state machine:
//!
//! ```text
//! Disconnected → Connecting → Connected
//!                    ↑            │ (drop / idle / transport error)
//!                    └── Error ←──┘
//! ```
//!
//! Every transport failure goes through `Error` and back to `Connecting`
//! after a backoff delay. Nothing in here terminates the process.

pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

pub use backoff::Backoff;

use crate::market::binance::parse_trade_frame;
use crate::metrics::counters::Counters;
use crate::queue::DurableQueue;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("closed by peer: {0}")]
    Closed(String),
}

/// Raw text frames from one live connection. The stream ending, or yielding
/// an error, means the connection is gone.
pub type FrameStream = BoxStream<'static, Result<String, FeedError>>;

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Human-readable target, for logs.
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<FrameStream, FeedError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// A live connection that delivers nothing for this long is treated as
    /// dead and reconnected.
    pub idle_timeout: Duration,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    Eof,
    Idle,
    Failed(FeedError),
}

pub struct FeedIngestor<S> {
    source: S,
    queue: Arc<dyn DurableQueue>,
    cfg: IngestorConfig,
    counters: Counters,
    state_tx: watch::Sender<FeedState>,
}

impl<S: FeedSource> FeedIngestor<S> {
    pub fn new(
        source: S,
        queue: Arc<dyn DurableQueue>,
        cfg: IngestorConfig,
        counters: Counters,
    ) -> Self {
        let (state_tx, _) = watch::channel(FeedState::Disconnected);
        Self {
            source,
            queue,
            cfg,
            counters,
            state_tx,
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<FeedState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, next: FeedState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "feed state transition");
        }
    }

    /// Runs until the task is dropped.
    #[instrument(skip(self), fields(feed = %self.source.describe()))]
    pub async fn run(self) {
        let mut backoff = Backoff::new(self.cfg.reconnect_min, self.cfg.reconnect_max);
        let mut attempts: u64 = 0;

        info!("feed ingestor started");

        loop {
            self.transition(FeedState::Connecting);
            if attempts > 0 {
                Counters::incr(&self.counters.reconnects);
            }
            attempts += 1;

            match self.source.connect().await {
                Ok(frames) => {
                    self.transition(FeedState::Connected);
                    backoff.reset();
                    info!(attempt = attempts, "feed connected");

                    match self.pump(frames).await {
                        SessionEnd::Eof => warn!("feed stream ended"),
                        SessionEnd::Idle => warn!(
                            idle_ms = self.cfg.idle_timeout.as_millis() as u64,
                            "feed idle past timeout"
                        ),
                        SessionEnd::Failed(e) => warn!(error = %e, "feed connection lost"),
                    }
                }
                Err(e) => {
                    error!(error = %e, attempt = attempts, "feed connect failed");
                }
            }

            self.transition(FeedState::Error);

            let delay = backoff.next_delay();
            warn!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempts,
                "disconnected; reconnecting"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Drains one connection into the queue.
    async fn pump(&self, mut frames: FrameStream) -> SessionEnd {
        loop {
            let next = match tokio::time::timeout(self.cfg.idle_timeout, frames.next()).await {
                Ok(next) => next,
                Err(_) => return SessionEnd::Idle,
            };

            let raw = match next {
                None => return SessionEnd::Eof,
                Some(Err(e)) => return SessionEnd::Failed(e),
                Some(Ok(raw)) => raw,
            };

            Counters::incr(&self.counters.frames_received);
            trace!(raw_frame = %raw, "frame received");
            self.handle_frame(&raw).await;
        }
    }

    async fn handle_frame(&self, raw: &str) {
        let tick = match parse_trade_frame(raw) {
            Ok(Some(tick)) => tick,
            Ok(None) => {
                debug!("non-trade frame ignored");
                return;
            }
            Err(e) => {
                Counters::incr(&self.counters.frames_malformed);
                warn!(error = %e, raw = %raw, "dropping malformed frame");
                return;
            }
        };

        match self.queue.append(tick.to_fields()).await {
            Ok(id) => {
                Counters::incr(&self.counters.ticks_appended);
                trace!(entry_id = %id, symbol = %tick.symbol(), price = tick.price(), "tick queued");
            }
            Err(e) => {
                // The queue is the only sink; a failed append loses this tick
                // but must not take the feed down.
                Counters::incr(&self.counters.append_failures);
                error!(error = %e, symbol = %tick.symbol(), "queue append failed; tick dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use futures::stream;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::Instrument;
    use tracing_test::traced_test;

    fn trade(ts: i64, price: &str) -> String {
        format!(
            r#"{{"e":"trade","E":{ts},"T":{ts},"s":"BTCUSDT","t":1,"p":"{price}","q":"0.010","m":false}}"#
        )
    }

    enum Script {
        Refuse,
        /// Frames, then whatever the last item says (error or end).
        Frames(Vec<Result<String, FeedError>>),
        /// Frames, then silence.
        Hang(Vec<String>),
    }

    #[derive(Default)]
    struct ScriptedFeed {
        sessions: Mutex<VecDeque<Script>>,
        connects: AtomicUsize,
    }

    impl ScriptedFeed {
        fn new(sessions: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
                connects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FeedSource for Arc<ScriptedFeed> {
        fn describe(&self) -> String {
            "scripted".into()
        }

        async fn connect(&self) -> Result<FrameStream, FeedError> {
            // Let observers see `Connecting` before the outcome lands.
            tokio::task::yield_now().await;
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = self.sessions.lock().pop_front();
            match next.unwrap_or(Script::Hang(Vec::new())) {
                Script::Refuse => Err(FeedError::Connect("refused".into())),
                Script::Frames(items) => Ok(stream::iter(items).boxed()),
                Script::Hang(frames) => Ok(stream::iter(frames.into_iter().map(Ok::<String, FeedError>))
                    .chain(stream::pending())
                    .boxed()),
            }
        }
    }

    fn fast_cfg() -> IngestorConfig {
        IngestorConfig {
            reconnect_min: Duration::from_millis(1),
            reconnect_max: Duration::from_millis(4),
            idle_timeout: Duration::from_secs(60),
        }
    }

    async fn wait_for_len(q: &MemoryQueue, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while q.len().await.unwrap() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ticks should reach the queue");
    }

    #[tokio::test]
    #[traced_test]
    async fn reconnects_after_drop_and_resumes_delivery() {
        let feed = ScriptedFeed::new(vec![
            Script::Frames(vec![
                Ok(trade(1, "100.0")),
                Ok(trade(2, "101.0")),
                Err(FeedError::Transport("reset by peer".into())),
            ]),
            Script::Refuse,
            Script::Hang(vec![trade(3, "102.0")]),
        ]);
        let q = Arc::new(MemoryQueue::new("s", 100));
        let counters = Counters::default();

        let ingestor = FeedIngestor::new(feed.clone(), q.clone(), fast_cfg(), counters.clone());
        let mut state = ingestor.state();
        let handle = tokio::spawn(ingestor.run().in_current_span());

        // The dropped connection must go through Error and back to Connecting.
        tokio::time::timeout(Duration::from_secs(5), async {
            state.wait_for(|s| *s == FeedState::Error).await.unwrap();
            state.wait_for(|s| *s == FeedState::Connecting).await.unwrap();
        })
        .await
        .expect("Error then Connecting");

        wait_for_len(&q, 3).await;

        assert_eq!(*state.borrow(), FeedState::Connected);
        assert_eq!(feed.connects.load(Ordering::SeqCst), 3);
        assert_eq!(Counters::get(&counters.reconnects), 2);
        assert_eq!(Counters::get(&counters.ticks_appended), 3);
        assert!(!handle.is_finished());
        assert!(logs_contain("feed connection lost"));
        assert!(logs_contain("disconnected; reconnecting"));
        assert!(logs_contain("from=Error to=Connecting"));

        handle.abort();
    }

    #[tokio::test]
    async fn malformed_and_foreign_frames_do_not_reach_the_queue() {
        let feed = ScriptedFeed::new(vec![Script::Hang(vec![
            "{not json".into(),
            r#"{"result":null,"id":1}"#.into(),
            trade(1, "-3"),
            trade(2, "100.5"),
        ])]);
        let q = Arc::new(MemoryQueue::new("s", 100));
        let counters = Counters::default();

        let handle = tokio::spawn(
            FeedIngestor::new(feed, q.clone(), fast_cfg(), counters.clone()).run(),
        );
        wait_for_len(&q, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(q.len().await.unwrap(), 1);
        assert_eq!(Counters::get(&counters.frames_received), 4);
        assert_eq!(Counters::get(&counters.frames_malformed), 2);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_is_recycled_after_idle_timeout() {
        let feed = ScriptedFeed::new(vec![Script::Hang(Vec::new())]);
        let q = Arc::new(MemoryQueue::new("s", 100));
        let cfg = IngestorConfig {
            idle_timeout: Duration::from_secs(10),
            ..fast_cfg()
        };

        let ingestor = FeedIngestor::new(feed.clone(), q, cfg, Counters::default());
        let mut state = ingestor.state();
        let handle = tokio::spawn(ingestor.run());

        state
            .wait_for(|s| *s == FeedState::Connected)
            .await
            .unwrap();
        state.wait_for(|s| *s == FeedState::Error).await.unwrap();
        state
            .wait_for(|s| *s == FeedState::Connected)
            .await
            .unwrap();

        assert!(feed.connects.load(Ordering::SeqCst) >= 2);
        handle.abort();
    }
}
