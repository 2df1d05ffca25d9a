//! Pair poller
//!
//! Periodically fetches both legs of the tracked pair, appends one
//! `PairSample` per successful dual fetch to the session buffer, and
//! publishes a `PairSnapshot` into the hot-state store.
//!
//! Data flow:
//! PriceSource (y, x) → PairSession → PairAnalytics → HotStateStore
//!
//! Controls (pause/resume, pair, window, resample) arrive through a
//! [`PairControl`] handle and are applied at the top of each iteration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};

use super::session::{InvalidWindow, session_analytics};
use super::{PairSession, PriceSource};
use crate::analytics::{PairSample, PairSignal, ResampleRule};
use crate::metrics::Counters;
use crate::state::{self, HotStateStore, pair_state_key};
use crate::time::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PairStatus {
    Live,
    Paused,
}

/// Hot-state document for the pair view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSnapshot {
    pub symbol_y: String,
    pub symbol_x: String,
    pub status: PairStatus,
    pub window: usize,
    pub resample: String,
    pub raw_samples: usize,
    pub resampled_samples: usize,
    pub price_y: Option<f64>,
    pub price_x: Option<f64>,
    pub signal: PairSignal,
    /// `|spread_z| > z_threshold` on a ready signal.
    pub signal_triggered: bool,
    pub updated_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PairPollerConfig {
    pub poll_every: Duration,
    pub z_threshold: f64,
    /// CSV export target on pause; no export when `None`.
    pub export_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
enum PairCommand {
    SwitchPair { symbol_y: String, symbol_x: String },
    SetWindow(usize),
    SetResample(ResampleRule),
    Stop,
}

/// Handle for steering a running poller.
#[derive(Clone)]
pub struct PairControl {
    live: Arc<watch::Sender<bool>>,
    cmds: mpsc::UnboundedSender<PairCommand>,
}

impl PairControl {
    pub fn pause(&self) {
        self.live.send_replace(false);
    }

    pub fn resume(&self) {
        self.live.send_replace(true);
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Starts tracking another pair; the session buffer is cleared.
    pub fn switch_pair(&self, symbol_y: &str, symbol_x: &str) {
        self.send(PairCommand::SwitchPair {
            symbol_y: symbol_y.trim().to_ascii_uppercase(),
            symbol_x: symbol_x.trim().to_ascii_uppercase(),
        });
    }

    pub fn set_window(&self, window: usize) -> Result<(), InvalidWindow> {
        session_analytics(window)?;
        self.send(PairCommand::SetWindow(window));
        Ok(())
    }

    pub fn set_resample(&self, rule: ResampleRule) {
        self.send(PairCommand::SetResample(rule));
    }

    /// Ends the poller after its next iteration, exporting first if it was
    /// live.
    pub fn stop(&self) {
        self.send(PairCommand::Stop);
    }

    fn send(&self, cmd: PairCommand) {
        if self.cmds.send(cmd).is_err() {
            debug!("pair poller is gone; control ignored");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Stopped,
}

pub struct PairPoller<P> {
    source: P,
    store: Arc<dyn HotStateStore>,
    session: PairSession,
    cfg: PairPollerConfig,
    counters: Counters,
    live_rx: watch::Receiver<bool>,
    cmd_rx: mpsc::UnboundedReceiver<PairCommand>,
    was_live: bool,
}

impl<P: PriceSource> PairPoller<P> {
    /// Builds a poller that starts live, and its control handle.
    pub fn new(
        source: P,
        store: Arc<dyn HotStateStore>,
        session: PairSession,
        cfg: PairPollerConfig,
        counters: Counters,
    ) -> (Self, PairControl) {
        let (live_tx, live_rx) = watch::channel(true);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let poller = Self {
            source,
            store,
            session,
            cfg,
            counters,
            live_rx,
            cmd_rx,
            was_live: true,
        };
        let control = PairControl {
            live: Arc::new(live_tx),
            cmds: cmd_tx,
        };
        (poller, control)
    }

    pub fn session(&self) -> &PairSession {
        &self.session
    }

    /// Runs until [`PairControl::stop`] is called.
    #[instrument(skip(self), fields(y = %self.session.symbol_y(), x = %self.session.symbol_x()))]
    pub async fn run(mut self) {
        let mut ticker = interval(self.cfg.poll_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            every_ms = self.cfg.poll_every.as_millis() as u64,
            window = self.session.window(),
            resample = %self.session.resample(),
            "pair poller started"
        );

        loop {
            ticker.tick().await;
            if self.step().await == StepOutcome::Stopped {
                info!("pair poller stopped");
                return;
            }
        }
    }

    /// One iteration: apply controls, honour the live toggle, then fetch,
    /// append and publish.
    pub async fn step(&mut self) -> StepOutcome {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if cmd == PairCommand::Stop {
                if self.was_live {
                    self.on_paused().await;
                }
                return StepOutcome::Stopped;
            }
            self.apply(cmd).await;
        }

        let live = *self.live_rx.borrow_and_update();
        match (self.was_live, live) {
            (true, false) => {
                self.was_live = false;
                self.on_paused().await;
                return StepOutcome::Continue;
            }
            (false, false) => return StepOutcome::Continue,
            (false, true) => {
                self.was_live = true;
                info!("pair view resumed");
            }
            (true, true) => {}
        }

        if let Some(sample) = self.fetch_sample().await {
            self.session.push(sample);
            Counters::incr(&self.counters.pair_samples);
            self.publish(PairStatus::Live).await;
        }

        StepOutcome::Continue
    }

    async fn apply(&mut self, cmd: PairCommand) {
        match cmd {
            PairCommand::SwitchPair { symbol_y, symbol_x } => {
                info!(
                    from_y = %self.session.symbol_y(),
                    from_x = %self.session.symbol_x(),
                    to_y = %symbol_y,
                    to_x = %symbol_x,
                    "switching pair; session buffer cleared"
                );
                self.session.switch_pair(symbol_y, symbol_x);
            }
            PairCommand::SetWindow(w) => match self.session.set_window(w) {
                Ok(()) => info!(window = w, "pair window changed"),
                Err(e) => warn!(error = %e, "pair window change rejected"),
            },
            PairCommand::SetResample(rule) => {
                self.session.set_resample(rule);
                info!(resample = %rule, "pair resample rule changed");
            }
            PairCommand::Stop => {}
        }

        let status = if self.was_live {
            PairStatus::Live
        } else {
            PairStatus::Paused
        };
        self.publish(status).await;
    }

    /// Both legs, or nothing.
    async fn fetch_sample(&self) -> Option<PairSample> {
        let (y, x) = (self.session.symbol_y(), self.session.symbol_x());
        let (py, px) = tokio::join!(self.source.latest_price(y), self.source.latest_price(x));

        match (py, px) {
            (Ok(price_y), Ok(price_x)) => Some(PairSample {
                ts_ms: now_ms(),
                price_y,
                price_x,
            }),
            (py, px) => {
                Counters::incr(&self.counters.price_fetch_failures);
                if let Err(e) = py {
                    warn!(symbol = %y, error = %e, "price fetch failed; sample skipped");
                }
                if let Err(e) = px {
                    warn!(symbol = %x, error = %e, "price fetch failed; sample skipped");
                }
                None
            }
        }
    }

    fn snapshot(&self, status: PairStatus) -> PairSnapshot {
        let (eval, resampled_samples) = self.session.evaluate_with_len();
        let signal_triggered = eval
            .signal
            .metrics()
            .is_some_and(|m| m.spread_z.abs() > self.cfg.z_threshold);
        let last = self.session.samples().last();

        PairSnapshot {
            symbol_y: self.session.symbol_y().to_string(),
            symbol_x: self.session.symbol_x().to_string(),
            status,
            window: self.session.window(),
            resample: self.session.resample().to_string(),
            raw_samples: self.session.samples().len(),
            resampled_samples,
            price_y: last.map(|s| s.price_y),
            price_x: last.map(|s| s.price_x),
            signal: eval.signal,
            signal_triggered,
            updated_ms: now_ms(),
        }
    }

    async fn publish(&self, status: PairStatus) {
        let snap = self.snapshot(status);
        let key = pair_state_key(&snap.symbol_y, &snap.symbol_x);

        if snap.signal_triggered {
            info!(key = %key, "pair z-score beyond threshold");
        }

        if let Err(e) = state::publish(self.store.as_ref(), &key, &snap).await {
            Counters::incr(&self.counters.publish_failures);
            warn!(key = %key, error = %e, "pair snapshot publish failed");
        }
    }

    async fn on_paused(&self) {
        info!(samples = self.session.samples().len(), "pair view paused");
        self.publish(PairStatus::Paused).await;

        let Some(dir) = self.cfg.export_dir.as_deref() else {
            return;
        };
        match export_csv(&self.session, dir).await {
            Ok(path) => info!(path = %path.display(), "pair session exported"),
            Err(e) => warn!(error = ?e, "pair session export failed"),
        }
    }
}

/// Writes the session buffer to `<dir>/<Y>_<X>_arb_data.csv`.
pub async fn export_csv(session: &PairSession, dir: &Path) -> anyhow::Result<PathBuf> {
    let mut buf = Vec::new();
    session.write_csv(&mut buf).context("render csv")?;

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create export dir {}", dir.display()))?;

    let path = dir.join(session.export_filename());
    tokio::fs::write(&path, buf)
        .await
        .with_context(|| format!("write {}", path.display()))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairs::PriceSourceError;
    use crate::state::MemoryHotStateStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// Serves scripted prices per symbol; an empty script is an error.
    #[derive(Default)]
    struct ScriptedPrices {
        prices: Mutex<HashMap<String, VecDeque<f64>>>,
    }

    impl ScriptedPrices {
        fn with(series: &[(&str, &[f64])]) -> Self {
            let prices = series
                .iter()
                .map(|(s, p)| (s.to_string(), p.iter().copied().collect()))
                .collect();
            Self {
                prices: Mutex::new(prices),
            }
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedPrices {
        async fn latest_price(&self, symbol: &str) -> Result<f64, PriceSourceError> {
            self.prices
                .lock()
                .get_mut(symbol)
                .and_then(|q| q.pop_front())
                .ok_or_else(|| PriceSourceError::InvalidResponse(format!("no price for {symbol}")))
        }
    }

    fn poller(
        source: ScriptedPrices,
        window: usize,
        export_dir: Option<PathBuf>,
    ) -> (PairPoller<ScriptedPrices>, PairControl, MemoryHotStateStore, Counters) {
        let session = PairSession::new("ETHUSDT", "BTCUSDT", window, ResampleRule::Tick).unwrap();
        poller_over(source, session, export_dir)
    }

    fn poller_over(
        source: ScriptedPrices,
        session: PairSession,
        export_dir: Option<PathBuf>,
    ) -> (PairPoller<ScriptedPrices>, PairControl, MemoryHotStateStore, Counters) {
        let store = MemoryHotStateStore::new();
        let counters = Counters::default();
        let (p, c) = PairPoller::new(
            source,
            Arc::new(store.clone()),
            session,
            PairPollerConfig {
                poll_every: Duration::from_millis(10),
                z_threshold: 2.0,
                export_dir,
            },
            counters.clone(),
        );
        (p, c, store, counters)
    }

    async fn snapshot(store: &MemoryHotStateStore, key: &str) -> PairSnapshot {
        state::fetch(store, key).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn live_step_appends_and_publishes() {
        let src = ScriptedPrices::with(&[("ETHUSDT", &[3000.0]), ("BTCUSDT", &[60000.0])]);
        let (mut p, _c, store, counters) = poller(src, 10, None);

        assert_eq!(p.step().await, StepOutcome::Continue);
        assert_eq!(p.session().samples().len(), 1);
        assert_eq!(Counters::get(&counters.pair_samples), 1);

        let snap = snapshot(&store, "pair_state:ETHUSDT-BTCUSDT").await;
        assert_eq!(snap.status, PairStatus::Live);
        assert_eq!(snap.price_y, Some(3000.0));
        assert_eq!(snap.signal, PairSignal::InsufficientData { have: 1, need: 11 });
        assert!(!snap.signal_triggered);
    }

    #[tokio::test]
    async fn one_failed_leg_skips_the_sample() {
        let src = ScriptedPrices::with(&[("ETHUSDT", &[3000.0])]);
        let (mut p, _c, store, counters) = poller(src, 10, None);

        p.step().await;
        assert!(p.session().samples().is_empty());
        assert_eq!(Counters::get(&counters.price_fetch_failures), 1);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn ready_signal_after_window_plus_one() {
        let xs: Vec<f64> = (0..11).map(|i| 5.0 + (i % 3) as f64 + 0.5 * i as f64).collect();
        let ys: Vec<f64> = xs.iter().enumerate().map(|(i, x)| 2.0 * x + (i % 2) as f64).collect();
        let src = ScriptedPrices::with(&[("ETHUSDT", &ys), ("BTCUSDT", &xs)]);
        let (mut p, _c, store, _) = poller(src, 10, None);

        for _ in 0..10 {
            p.step().await;
        }
        let snap = snapshot(&store, "pair_state:ETHUSDT-BTCUSDT").await;
        assert!(snap.signal.metrics().is_none());

        p.step().await;
        let snap = snapshot(&store, "pair_state:ETHUSDT-BTCUSDT").await;
        let m = snap.signal.metrics().expect("ready after window + 1 samples");
        assert_eq!(snap.signal_triggered, m.spread_z.abs() > 2.0);
        assert_eq!(snap.raw_samples, 11);
        assert_eq!(snap.resampled_samples, 11);
    }

    #[tokio::test]
    async fn pause_stops_sampling_and_exports() {
        let dir = std::env::temp_dir().join(format!("pairs-export-{}", uuid::Uuid::new_v4()));
        let src = ScriptedPrices::with(&[("ETHUSDT", &[1.0, 2.0, 3.0]), ("BTCUSDT", &[1.0, 2.0, 3.0])]);
        let (mut p, c, store, _) = poller(src, 10, Some(dir.clone()));

        p.step().await;
        assert!(c.is_live());
        c.pause();
        assert!(!c.is_live());
        p.step().await;
        p.step().await;

        assert_eq!(p.session().samples().len(), 1);
        let snap = snapshot(&store, "pair_state:ETHUSDT-BTCUSDT").await;
        assert_eq!(snap.status, PairStatus::Paused);

        let csv = std::fs::read_to_string(dir.join("ETHUSDT_BTCUSDT_arb_data.csv")).unwrap();
        assert_eq!(csv.lines().count(), 2);

        c.resume();
        assert!(c.is_live());
        p.step().await;
        assert_eq!(p.session().samples().len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn switching_pair_clears_and_republishes() {
        let src = ScriptedPrices::with(&[
            ("ETHUSDT", &[1.0]),
            ("BTCUSDT", &[1.0, 2.0]),
            ("SOLUSDT", &[9.0]),
        ]);
        let (mut p, c, store, _) = poller(src, 10, None);

        p.step().await;
        c.switch_pair("solusdt", "btcusdt");
        p.step().await;

        assert_eq!(p.session().symbol_y(), "SOLUSDT");
        assert_eq!(p.session().samples().len(), 1);
        let snap = snapshot(&store, "pair_state:SOLUSDT-BTCUSDT").await;
        assert_eq!(snap.raw_samples, 1);
    }

    #[tokio::test]
    async fn windows_below_the_floor_are_rejected_at_the_handle() {
        let (mut p, c, _, _) = poller(ScriptedPrices::default(), 10, None);
        assert_eq!(c.set_window(9).unwrap_err(), InvalidWindow(9));
        assert_eq!(c.set_window(3).unwrap_err(), InvalidWindow(3));

        p.step().await;
        assert_eq!(p.session().window(), 10);

        c.set_window(20).unwrap();
        p.step().await;
        assert_eq!(p.session().window(), 20);
    }

    #[tokio::test]
    async fn snapshot_counts_resampled_points() {
        let mut session = PairSession::new("ETHUSDT", "BTCUSDT", 10, ResampleRule::Tick).unwrap();
        for i in 0..12 {
            session.push(PairSample {
                ts_ms: i * 1_000,
                price_y: 10.0 + i as f64,
                price_x: 5.0 + (i * i) as f64,
            });
        }
        let (mut p, c, store, _) = poller_over(ScriptedPrices::default(), session, None);

        c.set_resample(ResampleRule::Every(Duration::from_secs(10)));
        p.step().await;

        let snap = snapshot(&store, "pair_state:ETHUSDT-BTCUSDT").await;
        assert_eq!(snap.resample, "10s");
        assert_eq!(snap.raw_samples, 12);
        assert_eq!(snap.resampled_samples, 2);
        assert_eq!(snap.signal, PairSignal::InsufficientData { have: 2, need: 11 });
    }

    #[tokio::test]
    async fn stop_ends_the_loop() {
        let (p, c, store, _) = poller(ScriptedPrices::default(), 10, None);
        c.stop();
        tokio::time::timeout(Duration::from_secs(1), p.run())
            .await
            .expect("poller should stop");

        let snap = snapshot(&store, "pair_state:ETHUSDT-BTCUSDT").await;
        assert_eq!(snap.status, PairStatus::Paused);
    }
}
