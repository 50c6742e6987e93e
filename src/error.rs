//! Error types for the aggregating profiler

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or driving the profiler
#[derive(Error, Debug)]
pub enum Error {
    /// Flat tag list with a dangling key
    #[error("Invalid tags array size: {size}. Expected even size.")]
    InvalidTags { size: usize },

    /// Percentile or bucket settings rejected
    #[error("Invalid percentile settings: {0}")]
    InvalidPercentileSettings(String),

    /// Reporting configuration rejected
    #[error("Invalid reporting configuration: {0}")]
    InvalidConfig(String),

    /// Reporting schedule pattern does not compile
    #[error("Invalid metric name pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration document could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ConfigParse(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::ConfigParse(e.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
