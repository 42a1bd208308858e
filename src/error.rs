//! Custom error types for the scanning library.
//!
//! `ScanError` is the single error type surfaced by generators, slices, the
//! watchdog and the sequencer. Variants follow the life of a scan:
//!
//! - **`Validation`**: a model or slice failed a declared constraint. Raised
//!   before any position is produced and never retried.
//! - **`Generator`**: a failure while iterating (a filter returned an error, a
//!   composition is malformed). The current iteration ends; positions already
//!   yielded stay valid.
//! - **`Expression`**: the interlock expression could not be parsed or evaluated.
//! - **`Control`**: the controller refused a pause/resume/seek request.
//! - **`Config`** / **`Io`**: configuration loading problems.
//!
//! By using `#[from]`, lower level errors convert with the `?` operator.

use thiserror::Error;

use crate::watchdog::expression::ExpressionError;

/// Convenience alias for results using the library error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid model field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Generator error: {0}")]
    Generator(String),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Control error: {0}")]
    Control(String),

    #[error("Live value source '{name}': {message}")]
    Source { name: String, message: String },

    #[error("{message}. The expression '{expression}' is false and a scan may not be run!")]
    WatchdogRejected { message: String, expression: String },

    #[error("Positioner error: {0}")]
    Positioner(String),

    #[error("{what} exceeds limit of {limit}")]
    LimitExceeded { what: &'static str, limit: usize },

    #[error("Size overflow while computing {context}")]
    SizeOverflow { context: &'static str },

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Build a validation error for a named model field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ScanError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<figment::Error> for ScanError {
    fn from(err: figment::Error) -> Self {
        ScanError::Config(Box::new(err))
    }
}
