use std::collections::HashMap;
use std::io::{self, Write};

use thiserror::Error;

use crate::analytics::{PairAnalytics, PairEvaluation, PairPoint, PairSample, ResampleRule};
use crate::config::MIN_PAIR_WINDOW;

const CSV_HEADER: &str =
    "timestamp,price_y,price_x,correlation,beta,spread,spread_mean,spread_std,z_score";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("pair window must be at least {MIN_PAIR_WINDOW}, got {0}")]
pub struct InvalidWindow(pub usize);

/// Builds the engine for a session window. The engine itself accepts
/// smaller windows; the pair view does not.
pub fn session_analytics(window: usize) -> Result<PairAnalytics, InvalidWindow> {
    if window < MIN_PAIR_WINDOW {
        return Err(InvalidWindow(window));
    }
    PairAnalytics::new(window).map_err(|_| InvalidWindow(window))
}

/// Raw samples for the tracked pair plus the view settings applied on read.
///
/// Raw samples are never rewritten, so changing the window or the resample
/// rule re-evaluates the whole session. Switching pair starts over.
#[derive(Debug, Clone)]
pub struct PairSession {
    symbol_y: String,
    symbol_x: String,
    samples: Vec<PairSample>,
    analytics: PairAnalytics,
    resample: ResampleRule,
}

impl PairSession {
    pub fn new(
        symbol_y: impl Into<String>,
        symbol_x: impl Into<String>,
        window: usize,
        resample: ResampleRule,
    ) -> Result<Self, InvalidWindow> {
        Ok(Self {
            symbol_y: symbol_y.into(),
            symbol_x: symbol_x.into(),
            samples: Vec::new(),
            analytics: session_analytics(window)?,
            resample,
        })
    }

    pub fn symbol_y(&self) -> &str {
        &self.symbol_y
    }

    pub fn symbol_x(&self) -> &str {
        &self.symbol_x
    }

    pub fn window(&self) -> usize {
        self.analytics.window()
    }

    pub fn resample(&self) -> ResampleRule {
        self.resample
    }

    pub fn samples(&self) -> &[PairSample] {
        &self.samples
    }

    pub fn push(&mut self, sample: PairSample) {
        self.samples.push(sample);
    }

    /// Tracks a different pair. Samples of the old pair are dropped.
    pub fn switch_pair(&mut self, symbol_y: impl Into<String>, symbol_x: impl Into<String>) {
        self.symbol_y = symbol_y.into();
        self.symbol_x = symbol_x.into();
        self.samples.clear();
    }

    /// Rejected windows leave the current one in place.
    pub fn set_window(&mut self, window: usize) -> Result<(), InvalidWindow> {
        self.analytics = session_analytics(window)?;
        Ok(())
    }

    pub fn set_resample(&mut self, rule: ResampleRule) {
        self.resample = rule;
    }

    pub fn evaluate(&self) -> PairEvaluation {
        self.evaluate_with_len().0
    }

    /// Evaluation plus the resampled point count it ran over.
    pub fn evaluate_with_len(&self) -> (PairEvaluation, usize) {
        let points = self.resample.apply(&self.samples);
        (self.analytics.evaluate(&points), points.len())
    }

    pub fn export_filename(&self) -> String {
        format!("{}_{}_arb_data.csv", self.symbol_y, self.symbol_x)
    }

    /// Writes every raw sample with the metrics of the point it fell into.
    /// Metric cells stay empty where the window has not produced a value.
    pub fn write_csv<W: Write>(&self, mut out: W) -> io::Result<()> {
        let eval = self.evaluate();
        let by_label: HashMap<i64, &PairPoint> =
            eval.series.iter().map(|p| (p.ts_ms, p)).collect();

        writeln!(out, "{CSV_HEADER}")?;
        for (i, s) in self.samples.iter().enumerate() {
            let point = match self.resample {
                ResampleRule::Tick => eval.series.get(i),
                ResampleRule::Every(_) => by_label.get(&self.resample.label(s.ts_ms)).copied(),
            };

            write!(out, "{},{},{}", s.ts_ms, s.price_y, s.price_x)?;
            match point {
                Some(p) => writeln!(
                    out,
                    ",{},{},{},{},{},{}",
                    cell(p.correlation),
                    cell(p.beta),
                    cell(p.spread),
                    cell(p.spread_mean),
                    cell(p.spread_std),
                    p.z_score
                )?,
                None => writeln!(out, ",,,,,,")?,
            }
        }
        out.flush()
    }
}

fn cell(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}
