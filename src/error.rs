use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// OFREP error code for a flag that does not exist.
pub const ERROR_FLAG_NOT_FOUND: &str = "FLAG_NOT_FOUND";
/// OFREP error code for a flag payload that could not be parsed or validated.
pub const ERROR_PARSE: &str = "PARSE_ERROR";
/// OFREP error code for everything else.
pub const ERROR_GENERAL: &str = "GENERAL";

/// Errors produced by the flag server core.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The flag set payload parsed but is not a valid flag set.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The flag set payload is not valid JSON.
    #[error("failed to parse JSON flags: {0}")]
    Json(Arc<serde_json::Error>),

    /// The flag set payload is not valid YAML.
    #[error("failed to parse YAML flags: {0}")]
    Yaml(Arc<serde_yaml::Error>),

    /// Evaluation was requested for a key that is not in the current flag set.
    #[error("flag for key '{key}' does not exist")]
    FlagNotFound { key: String },

    /// A store has no record for the requested key.
    #[error("record not found for key '{key}'")]
    RecordNotFound { key: String },

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// A remote endpoint answered with a non-success status.
    #[error("received unexpected status code {0}")]
    UnexpectedStatus(reqwest::StatusCode),

    /// A configured URL cannot be parsed.
    #[error("invalid url configuration")]
    InvalidUrl(#[source] url::ParseError),

    /// An admin request is missing required data.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A configuration value is missing or not understood.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A background loop panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,
}

impl Error {
    /// OFREP error code describing this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::FlagNotFound { .. } | Error::RecordNotFound { .. } => ERROR_FLAG_NOT_FOUND,
            Error::Validation(_) | Error::Json(_) | Error::Yaml(_) => ERROR_PARSE,
            _ => ERROR_GENERAL,
        }
    }

    /// Returns `true` for the expected "no such flag" outcome, as opposed to a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::FlagNotFound { .. } | Error::RecordNotFound { .. }
        )
    }
}

/// A flag set payload that violates the flag model invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("flag missing key")]
    MissingKey,
    #[error("flag '{flag}' missing variants")]
    MissingVariants { flag: String },
    #[error("flag '{flag}' missing default variant")]
    MissingDefaultVariant { flag: String },
    #[error("flag '{flag}' has a rule missing name")]
    RuleMissingName { flag: String },
    #[error("rule '{rule}' of flag '{flag}' missing variant")]
    RuleMissingVariant { flag: String, rule: String },
    #[error("rule '{rule}' of flag '{flag}' includes unknown variant '{variant}'")]
    UnknownVariant {
        flag: String,
        rule: String,
        variant: String,
    },
    #[error("flag '{flag}' has multiple rules named '{rule}'")]
    DuplicateRuleName { flag: String, rule: String },
    #[error("flag '{flag}' variant '{variant}' has an unsupported value")]
    UnsupportedVariantValue { flag: String, variant: String },
    #[error("flag '{flag}' has variants with different types")]
    MixedVariantKinds { flag: String },
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Error::Yaml(Arc::new(value))
    }
}
