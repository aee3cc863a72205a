//! Error taxonomy for the metering middleware.
//!
//! Initialization failures (`Config`, `Provider`) are returned to the host.
//! Everything on the delivery path (`Network`, `Validation`, `Metering`) stays
//! inside the background task that produced it.

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed configuration. Never retried.
    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The underlying GenAI client could not be constructed.
    #[error("provider error: {message}")]
    Provider {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Transport failure talking to the metering backend. Retryable.
    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// 4xx from the metering backend. Not retried.
    #[error("validation error: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Generic or terminal metering failure.
    #[error("metering error: {message}")]
    Metering {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn provider(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Provider {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn network(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            source: None,
        }
    }

    pub fn metering(message: impl Into<String>) -> Self {
        Error::Metering {
            message: message.into(),
            source: None,
        }
    }

    pub fn metering_with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Metering {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Validation failures are permanent; retrying the same payload cannot help.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Whether the delivery engine should spend another attempt on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network { .. } | Error::Metering { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn classification() {
        assert!(Error::validation("bad field").is_validation());
        assert!(!Error::validation("bad field").is_retryable());
        assert!(Error::metering("status 503").is_retryable());
        assert!(Error::network("refused", std::io::Error::other("refused")).is_retryable());
        assert!(!Error::config("missing key").is_retryable());
    }

    #[test]
    fn terminal_error_keeps_last_cause() {
        let last = Error::metering("status 500: upstream down");
        let err = Error::metering_with_source("metering failed after 3 attempts", last);
        assert_eq!(
            err.to_string(),
            "metering error: metering failed after 3 attempts"
        );
        let source = err.source().expect("source");
        assert!(source.to_string().contains("upstream down"));
    }
}
