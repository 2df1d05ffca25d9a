//! Two-asset rolling regression.
//!
//! Every point gets its own hedge ratio from the trailing window that ends
//! at it, and the spread at that point uses that beta. The hedge is
//! re-estimated continuously; there is no single global regression.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_WINDOW: usize = 30;

/// Relative floor under which var(x) is treated as zero.
const VARIANCE_EPSILON_REL: f64 = 1e-14;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("rolling window must hold at least 2 samples, got {0}")]
pub struct WindowTooSmall(pub usize);

/// One successful dual-price observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairSample {
    pub ts_ms: i64,
    pub price_y: f64,
    pub price_x: f64,
}

/// A sample with the rolling metrics computed at its position.
///
/// `None` marks a value the window cannot define yet (or at all, for a
/// degenerate window).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairPoint {
    pub ts_ms: i64,
    pub price_y: f64,
    pub price_x: f64,
    pub correlation: Option<f64>,
    pub beta: Option<f64>,
    pub spread: Option<f64>,
    pub spread_mean: Option<f64>,
    pub spread_std: Option<f64>,
    pub z_score: f64,
}

/// Metrics at the latest evaluable point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairWindowMetrics {
    pub ts_ms: i64,
    pub correlation: Option<f64>,
    pub beta: f64,
    pub spread: f64,
    pub spread_mean: Option<f64>,
    pub spread_std: Option<f64>,
    pub spread_z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PairSignal {
    /// Fewer than `window + 1` points after resampling.
    InsufficientData { have: usize, need: usize },
    /// Enough points, but var(x) over the latest window is ~0 so no hedge
    /// ratio exists.
    Undefined { ts_ms: i64 },
    Ready(PairWindowMetrics),
}

impl PairSignal {
    pub fn metrics(&self) -> Option<&PairWindowMetrics> {
        match self {
            PairSignal::Ready(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PairEvaluation {
    /// Per-point metrics; empty while data is insufficient.
    pub series: Vec<PairPoint>,
    pub signal: PairSignal,
}

#[derive(Debug, Clone, Copy)]
pub struct PairAnalytics {
    window: usize,
}

impl PairAnalytics {
    pub fn new(window: usize) -> Result<Self, WindowTooSmall> {
        if window < 2 {
            return Err(WindowTooSmall(window));
        }
        Ok(Self { window })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Minimum number of points before anything is reported.
    pub fn required_points(&self) -> usize {
        self.window + 1
    }

    /// Evaluates an already-resampled, time-ordered sample sequence.
    pub fn evaluate(&self, samples: &[PairSample]) -> PairEvaluation {
        if samples.len() < self.required_points() {
            return PairEvaluation {
                series: Vec::new(),
                signal: PairSignal::InsufficientData {
                    have: samples.len(),
                    need: self.required_points(),
                },
            };
        }

        let series = self.series(samples);
        let signal = match series.last() {
            Some(last) => match (last.beta, last.spread) {
                (Some(beta), Some(spread)) => PairSignal::Ready(PairWindowMetrics {
                    ts_ms: last.ts_ms,
                    correlation: last.correlation,
                    beta,
                    spread,
                    spread_mean: last.spread_mean,
                    spread_std: last.spread_std,
                    spread_z: last.z_score,
                }),
                _ => PairSignal::Undefined { ts_ms: last.ts_ms },
            },
            None => PairSignal::InsufficientData {
                have: 0,
                need: self.required_points(),
            },
        };

        PairEvaluation { series, signal }
    }

    /// Computes rolling metrics for every point of the sequence.
    pub fn series(&self, samples: &[PairSample]) -> Vec<PairPoint> {
        let w = self.window;
        let mut points: Vec<PairPoint> = samples
            .iter()
            .map(|s| PairPoint {
                ts_ms: s.ts_ms,
                price_y: s.price_y,
                price_x: s.price_x,
                correlation: None,
                beta: None,
                spread: None,
                spread_mean: None,
                spread_std: None,
                z_score: 0.0,
            })
            .collect();

        // Pass 1: regression per trailing window.
        for end in (w - 1)..samples.len() {
            let m = Moments::over(&samples[end + 1 - w..=end]);
            let p = &mut points[end];
            p.correlation = m.correlation();
            p.beta = m.beta();
            p.spread = p.beta.map(|beta| p.price_y - beta * p.price_x);
        }

        // Pass 2: spread statistics need a full window of defined spreads.
        for end in (w - 1)..points.len() {
            let spreads: Option<Vec<f64>> = points[end + 1 - w..=end]
                .iter()
                .map(|p| p.spread)
                .collect();
            let Some(spreads) = spreads else {
                continue;
            };

            let (mean, std) = mean_and_std(&spreads);
            let p = &mut points[end];
            p.spread_mean = Some(mean);
            p.spread_std = Some(std);
            if let Some(spread) = p.spread {
                if std > 0.0 {
                    p.z_score = (spread - mean) / std;
                }
            }
        }

        points
    }
}

/// Two-pass sample moments of one window.
struct Moments {
    mean_x: f64,
    var_x: f64,
    var_y: f64,
    cov: f64,
}

impl Moments {
    fn over(window: &[PairSample]) -> Self {
        let n = window.len() as f64;
        let mean_x = window.iter().map(|s| s.price_x).sum::<f64>() / n;
        let mean_y = window.iter().map(|s| s.price_y).sum::<f64>() / n;

        let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
        for s in window {
            let dx = s.price_x - mean_x;
            let dy = s.price_y - mean_y;
            sxx += dx * dx;
            syy += dy * dy;
            sxy += dx * dy;
        }

        let ddof = n - 1.0;
        Self {
            mean_x,
            var_x: sxx / ddof,
            var_y: syy / ddof,
            cov: sxy / ddof,
        }
    }

    fn x_is_flat(&self) -> bool {
        self.var_x <= VARIANCE_EPSILON_REL * self.mean_x.abs().max(1.0).powi(2)
    }

    fn beta(&self) -> Option<f64> {
        if self.x_is_flat() {
            return None;
        }
        let beta = self.cov / self.var_x;
        beta.is_finite().then_some(beta)
    }

    fn correlation(&self) -> Option<f64> {
        let denom = (self.var_x * self.var_y).sqrt();
        if self.x_is_flat() || denom <= 0.0 {
            return None;
        }
        let corr = self.cov / denom;
        corr.is_finite().then_some(corr.clamp(-1.0, 1.0))
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let ss = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
    (mean, (ss / (n - 1.0)).sqrt())
}
