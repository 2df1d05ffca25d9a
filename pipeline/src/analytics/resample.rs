//! Time-bucket resampling for the pair series.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use super::pairs::PairSample;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown resample rule '{0}' (expected Tick, 10s, 1m or 5m style)")]
pub struct ResampleRuleError(pub String);

/// How raw samples are reduced before windowed statistics run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleRule {
    /// Every sample is used as-is.
    #[default]
    Tick,
    /// Fixed buckets; the last sample observed in a bucket represents it.
    Every(Duration),
}

impl ResampleRule {
    pub fn bucket_ms(&self) -> Option<i64> {
        match self {
            ResampleRule::Tick => None,
            ResampleRule::Every(d) => Some(d.as_millis() as i64),
        }
    }

    /// Bucket a timestamp falls into; the timestamp itself for `Tick`.
    pub fn label(&self, ts_ms: i64) -> i64 {
        match self.bucket_ms() {
            Some(b) => ts_ms.div_euclid(b) * b,
            None => ts_ms,
        }
    }

    /// Applies the rule to an ordered sample slice.
    ///
    /// Buckets are labelled by their start time. Buckets with no samples
    /// produce no output row.
    pub fn apply(&self, samples: &[PairSample]) -> Vec<PairSample> {
        if self.bucket_ms().is_none() {
            return samples.to_vec();
        }

        let mut buckets: BTreeMap<i64, PairSample> = BTreeMap::new();
        for s in samples {
            let label = self.label(s.ts_ms);
            buckets.insert(
                label,
                PairSample {
                    ts_ms: label,
                    price_y: s.price_y,
                    price_x: s.price_x,
                },
            );
        }

        buckets.into_values().collect()
    }
}

impl FromStr for ResampleRule {
    type Err = ResampleRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.eq_ignore_ascii_case("tick") || raw.is_empty() {
            return Ok(ResampleRule::Tick);
        }

        let lower = raw.to_ascii_lowercase();
        let split = lower
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ResampleRuleError(raw.to_string()))?;
        let (num, unit) = lower.split_at(split);

        let n: u64 = num.parse().map_err(|_| ResampleRuleError(raw.to_string()))?;
        if n == 0 {
            return Err(ResampleRuleError(raw.to_string()));
        }

        let unit_secs: u64 = match unit {
            "s" | "sec" => 1,
            "m" | "min" => 60,
            "h" => 3_600,
            _ => return Err(ResampleRuleError(raw.to_string())),
        };

        // Bucket labels are i64 milliseconds.
        let secs = n
            .checked_mul(unit_secs)
            .filter(|s| *s <= i64::MAX as u64 / 1_000)
            .ok_or_else(|| ResampleRuleError(raw.to_string()))?;

        Ok(ResampleRule::Every(Duration::from_secs(secs)))
    }
}

impl fmt::Display for ResampleRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResampleRule::Tick => write!(f, "Tick"),
            ResampleRule::Every(d) => {
                let secs = d.as_secs();
                if secs % 60 == 0 {
                    write!(f, "{}m", secs / 60)
                } else {
                    write!(f, "{}s", secs)
                }
            }
        }
    }
}
