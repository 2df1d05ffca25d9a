use thiserror::Error;

/// Startup configuration problems. These are the only fatal errors: every
/// runtime failure is retried, dropped or reported as "no signal".
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid feed url '{url}': {reason}")]
    InvalidFeedUrl { url: String, reason: String },

    #[error("unknown APP_ROLE '{0}' (expected ingest, analytics, pairs or all)")]
    UnknownRole(String),
}
