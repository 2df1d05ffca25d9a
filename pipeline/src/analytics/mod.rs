//! Online analytics engines.
//!
//! - [`OnlineStats`]: running mean / std / z-score for one series (queue path).
//! - [`PairAnalytics`]: rolling hedge ratio, spread and spread z-score for
//!   two series (direct-poll path).

pub mod online_stats;
pub mod pairs;
pub mod resample;

pub use online_stats::OnlineStats;
pub use pairs::{
    DEFAULT_WINDOW, PairAnalytics, PairEvaluation, PairPoint, PairSample, PairSignal,
    PairWindowMetrics,
};
pub use resample::ResampleRule;
