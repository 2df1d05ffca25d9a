use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;

use crate::analytics::{DEFAULT_WINDOW, ResampleRule};
use crate::error::ConfigError;

/// Smallest rolling window accepted for the pair view.
pub const MIN_PAIR_WINDOW: usize = 10;

/// Which long-lived units this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Ingest,
    Analytics,
    Pairs,
    All,
}

impl Role {
    pub fn runs_ingest(&self) -> bool {
        matches!(self, Role::Ingest | Role::All)
    }

    pub fn runs_analytics(&self) -> bool {
        matches!(self, Role::Analytics | Role::All)
    }

    pub fn runs_pairs(&self) -> bool {
        matches!(self, Role::Pairs | Role::All)
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ingest" => Ok(Role::Ingest),
            "analytics" | "worker" => Ok(Role::Analytics),
            "pairs" => Ok(Role::Pairs),
            "all" | "" => Ok(Role::All),
            other => Err(ConfigError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub role: Role,

    /// Queue / hot-state endpoint. `memory://` keeps both in process.
    pub database_url: String,

    // =========================
    // Ingestion
    // =========================
    /// Lower-case exchange symbol, e.g. `btcusdt`.
    pub symbol: String,

    /// Fully-resolved trade stream URL for `symbol`.
    pub feed_url: Url,

    /// First reconnect delay after a dropped feed. Doubles per failed
    /// attempt up to `reconnect_max`, and resets once a connection holds.
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,

    /// A connection silent for this long is dropped and re-established.
    pub feed_idle_timeout: Duration,

    // =========================
    // Durable queue
    // =========================
    pub stream_key: String,

    /// Entries beyond this are trimmed oldest-first on append, so a dead
    /// consumer cannot grow the stream without bound.
    pub stream_maxlen: usize,

    // =========================
    // Analytics worker
    // =========================
    pub consumer_group: String,

    /// Must be stable across restarts: pending entries are recovered by
    /// consumer name.
    pub consumer_name: String,

    pub worker_batch: usize,
    pub worker_block: Duration,

    /// Entries pending on another consumer longer than this are claimed.
    /// `None` disables reclaiming.
    pub worker_claim_idle: Option<Duration>,

    // =========================
    // Pair view
    // =========================
    pub price_rest_url: Url,
    pub pair_y: String,
    pub pair_x: String,
    pub pair_window: usize,
    pub pair_resample: ResampleRule,
    pub pair_poll_every: Duration,
    pub pair_z_threshold: f64,

    /// Where the session CSV lands on pause. No export when unset.
    pub pair_export_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. `from_env` is the
    /// production entry point; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let role: Role = get("APP_ROLE", "all").parse()?;

        let symbol = get("SYMBOL", "btcusdt").trim().to_ascii_lowercase();
        if symbol.is_empty() {
            return Err(invalid("SYMBOL", &symbol, "must not be empty"));
        }

        let feed_base = get("FEED_WS_BASE", "wss://fstream.binance.com/ws");
        let feed_url = feed_url(&feed_base, &symbol)?;

        let reconnect_min = Duration::from_millis(parse_num(&lookup, "FEED_RECONNECT_MIN_MS", 1_000)?);
        let reconnect_max = Duration::from_millis(parse_num(&lookup, "FEED_RECONNECT_MAX_MS", 30_000)?);
        if reconnect_min.is_zero() || reconnect_max < reconnect_min {
            return Err(invalid(
                "FEED_RECONNECT_MAX_MS",
                &reconnect_max.as_millis().to_string(),
                "must be >= FEED_RECONNECT_MIN_MS, which must be > 0",
            ));
        }

        let feed_idle_timeout =
            Duration::from_millis(parse_num(&lookup, "FEED_IDLE_TIMEOUT_MS", 60_000)?);
        if feed_idle_timeout.is_zero() {
            return Err(invalid("FEED_IDLE_TIMEOUT_MS", "0", "must be > 0"));
        }

        let stream_maxlen: usize = parse_num(&lookup, "STREAM_MAXLEN", 10_000)?;
        if stream_maxlen == 0 {
            return Err(invalid("STREAM_MAXLEN", "0", "must be > 0"));
        }

        let worker_batch: usize = parse_num(&lookup, "WORKER_BATCH", 10)?;
        if worker_batch == 0 {
            return Err(invalid("WORKER_BATCH", "0", "must be > 0"));
        }

        let claim_idle_ms: u64 = parse_num(&lookup, "WORKER_CLAIM_IDLE_MS", 30_000)?;

        let price_rest_raw = get(
            "PRICE_REST_URL",
            "https://fapi.binance.com/fapi/v1/ticker/price",
        );
        let price_rest_url = Url::parse(&price_rest_raw)
            .map_err(|e| invalid("PRICE_REST_URL", &price_rest_raw, &e.to_string()))?;

        let pair_window: usize = parse_num(&lookup, "PAIR_WINDOW", DEFAULT_WINDOW)?;
        if pair_window < MIN_PAIR_WINDOW {
            return Err(invalid(
                "PAIR_WINDOW",
                &pair_window.to_string(),
                &format!("must be >= {MIN_PAIR_WINDOW}"),
            ));
        }

        let resample_raw = get("PAIR_RESAMPLE", "Tick");
        let pair_resample: ResampleRule = resample_raw
            .parse()
            .map_err(|e: crate::analytics::resample::ResampleRuleError| {
                invalid("PAIR_RESAMPLE", &resample_raw, &e.to_string())
            })?;

        let pair_z_threshold: f64 = parse_num(&lookup, "PAIR_Z_THRESHOLD", 2.0)?;

        let pair_poll_every = Duration::from_millis(parse_num(&lookup, "PAIR_POLL_MS", 1_000)?);
        if pair_poll_every.is_zero() {
            return Err(invalid("PAIR_POLL_MS", "0", "must be > 0"));
        }

        Ok(Self {
            role,
            database_url: get("DATABASE_URL", "sqlite://quant_stream.db?mode=rwc"),

            symbol,
            feed_url,
            reconnect_min,
            reconnect_max,
            feed_idle_timeout,

            stream_key: get("STREAM_KEY", "market_stream"),
            stream_maxlen,

            consumer_group: get("CONSUMER_GROUP", "analytics_workers"),
            consumer_name: get("CONSUMER_NAME", "worker_1"),
            worker_batch,
            worker_block: Duration::from_millis(parse_num(&lookup, "WORKER_BLOCK_MS", 1_000)?),
            worker_claim_idle: (claim_idle_ms > 0).then(|| Duration::from_millis(claim_idle_ms)),

            price_rest_url,
            pair_y: get("PAIR_Y", "ETHUSDT").trim().to_ascii_uppercase(),
            pair_x: get("PAIR_X", "BTCUSDT").trim().to_ascii_uppercase(),
            pair_window,
            pair_resample,
            pair_poll_every,
            pair_z_threshold,
            pair_export_dir: lookup("PAIR_EXPORT_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_url.starts_with("memory:")
    }
}

/// `<base>/<symbol>@trade`, validated up front so a bad target fails at
/// startup instead of inside the reconnect loop.
fn feed_url(base: &str, symbol: &str) -> Result<Url, ConfigError> {
    let raw = format!("{}/{}@trade", base.trim_end_matches('/'), symbol);
    let url = Url::parse(&raw).map_err(|e| ConfigError::InvalidFeedUrl {
        url: raw.clone(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidFeedUrl {
            url: raw,
            reason: format!("scheme '{other}' is not ws or wss"),
        }),
    }
}

fn parse_num<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| invalid(var, &raw, &e.to_string())),
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_describe_the_reference_deployment() {
        let c = cfg(&[]).unwrap();
        assert_eq!(c.role, Role::All);
        assert_eq!(c.symbol, "btcusdt");
        assert_eq!(c.feed_url.as_str(), "wss://fstream.binance.com/ws/btcusdt@trade");
        assert_eq!(c.stream_key, "market_stream");
        assert_eq!(c.stream_maxlen, 10_000);
        assert_eq!(c.consumer_group, "analytics_workers");
        assert_eq!(c.consumer_name, "worker_1");
        assert_eq!(c.worker_batch, 10);
        assert_eq!(c.worker_block, Duration::from_millis(1_000));
        assert_eq!(c.feed_idle_timeout, Duration::from_secs(60));
        assert_eq!(c.pair_window, 30);
        assert_eq!(c.pair_resample, ResampleRule::Tick);
        assert_eq!(c.pair_y, "ETHUSDT");
        assert_eq!(c.pair_x, "BTCUSDT");
        assert!(c.pair_export_dir.is_none());
    }

    #[test]
    fn symbol_is_normalized_into_feed_url() {
        let c = cfg(&[("SYMBOL", " ETHUSDT "), ("FEED_WS_BASE", "ws://localhost:9000/ws/")]).unwrap();
        assert_eq!(c.symbol, "ethusdt");
        assert_eq!(c.feed_url.as_str(), "ws://localhost:9000/ws/ethusdt@trade");
    }

    #[test]
    fn non_websocket_target_is_fatal() {
        let err = cfg(&[("FEED_WS_BASE", "https://fstream.binance.com/ws")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFeedUrl { .. }));

        let err = cfg(&[("FEED_WS_BASE", "not a url")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFeedUrl { .. }));
    }

    #[test]
    fn small_window_is_rejected() {
        let err = cfg(&[("PAIR_WINDOW", "5")]).unwrap_err();
        assert!(err.to_string().contains("PAIR_WINDOW"));
        assert!(cfg(&[("PAIR_WINDOW", "10")]).is_ok());
    }

    #[test]
    fn malformed_numbers_and_rules_are_rejected() {
        assert!(cfg(&[("STREAM_MAXLEN", "lots")]).is_err());
        assert!(cfg(&[("PAIR_RESAMPLE", "hourly")]).is_err());
        assert!(cfg(&[("APP_ROLE", "dashboard")]).is_err());
    }

    #[test]
    fn zero_poll_interval_is_fatal() {
        let err = cfg(&[("PAIR_POLL_MS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "PAIR_POLL_MS", .. }));
        assert_eq!(
            cfg(&[("PAIR_POLL_MS", "250")]).unwrap().pair_poll_every,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn oversized_resample_rule_is_fatal() {
        let err = cfg(&[("PAIR_RESAMPLE", "999999999999999999m")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "PAIR_RESAMPLE", .. }));
    }

    #[test]
    fn claim_idle_zero_disables_reclaim() {
        let c = cfg(&[("WORKER_CLAIM_IDLE_MS", "0")]).unwrap();
        assert!(c.worker_claim_idle.is_none());
    }
}
