//! Shared configuration-error type.
//!
//! Tunnel-plane errors proper live in `tunatap_core::error`; this crate only
//! needs an error type for the thing it owns, configuration loading.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {details}")]
    ParseError { details: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid value for {field}: {details}")]
    InvalidValue { field: String, details: String },
}
