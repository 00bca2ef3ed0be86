//! Crate-level error type.
//!
//! Each component reports faults through its own `thiserror` enum:
//!
//! - **`TransportError`** (`connection`): connect / receive faults. Logged and
//!   recovered through reconnect backoff; never surfaced to callers.
//! - **`DiscardReason`** / **`Rejection`** (`codec`, `normalize`): unusable
//!   frames. Logged at debug level and dropped.
//! - **`ApiError`** (`api`): REST collaborator faults, stored in the dashboard
//!   snapshot as the last error.
//! - **`SessionError`** (`session`): startup faults such as a missing token.
//!
//! Only the faults that reach a caller are part of `TelemetryError`: loading
//! and validating configuration, logging setup, starting a session and the
//! binary's stdin/stdout handling. `#[from]` lets `?` convert them.

use thiserror::Error;

use crate::session::SessionError;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, TelemetryError>;

/// Umbrella error for the crate.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Session could not start.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Logging setup failed.
    #[error("Logging error: {0}")]
    Logging(String),

    /// Snapshot or frame could not be serialized for output.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O fault (stdin, stdout).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for TelemetryError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, Cursor};

    #[test]
    fn test_conversions_and_display() {
        let err: TelemetryError = SessionError::MissingToken.into();
        assert_eq!(
            err.to_string(),
            "Session error: no bearer token available, sign in first"
        );

        let err = TelemetryError::Configuration("bad".into());
        assert_eq!(err.to_string(), "Configuration validation error: bad");
    }

    fn load_broken() -> AppResult<()> {
        use figment::providers::{Format, Toml};
        let config: crate::config::LiveConfig = figment::Figment::new()
            .merge(Toml::string("[history]\nmax_history = \"lots\"\n"))
            .extract()?;
        config.validate().map_err(TelemetryError::Configuration)
    }

    #[test]
    fn test_figment_error_converts() {
        assert!(matches!(load_broken(), Err(TelemetryError::Config(_))));
    }

    fn first_line_as_json(input: &[u8]) -> AppResult<serde_json::Value> {
        let mut line = String::new();
        Cursor::new(input).read_line(&mut line)?;
        Ok(serde_json::from_str(&line)?)
    }

    #[test]
    fn test_serialization_and_io_convert() {
        assert!(first_line_as_json(b"{\"a\":1}\n").is_ok());
        assert!(matches!(
            first_line_as_json(b"{oops\n"),
            Err(TelemetryError::Serialization(_))
        ));
        assert!(matches!(
            first_line_as_json(&[0xff, 0xfe, b'\n']),
            Err(TelemetryError::Io(_))
        ));
    }
}
