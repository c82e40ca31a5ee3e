use std::sync::Arc;

use thiserror::Error;

use crate::continuation::Continuation;

/// Box error types
#[derive(Error, Debug)]
pub enum BoxError {
    /// Bad flags, variables or a missing plan file
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A step or query needs a base image that doesn't exist yet
    #[error("Prerequisite step missing: {capability} requires a base image, `from` has not been called")]
    PrerequisiteError { capability: String },

    /// Container engine call failed
    #[error("Engine error: {0}")]
    EngineError(String),

    /// Statement needs more input (incremental evaluation only)
    #[error("Incomplete statement")]
    IncompleteStatement(Continuation),

    /// Named entity absent from queried container content
    #[error("Could not find {kind} {name:?}")]
    LookupNotFound { kind: String, name: String },

    /// Cancellation scope was cancelled
    #[error("Operation canceled")]
    Cancelled,

    /// Plan source could not be parsed
    #[error("Parse error on line {line}: {message}")]
    ParseError { line: usize, message: String },

    /// `${NAME}` with no binding
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),

    /// Step cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// One plan of a multi-build failed
    #[error("Build of {plan} failed: {source}")]
    PlanFailed {
        plan: String,
        #[source]
        source: Arc<BoxError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BoxError {
    /// Cancellation is not a bug and is never reported as one.
    pub fn is_cancelled(&self) -> bool {
        match self {
            BoxError::Cancelled => true,
            BoxError::PlanFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// True for the "prompt for more input" indication.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, BoxError::IncompleteStatement(_))
    }

    /// Shorthand for a `ParseError` on the given line.
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        BoxError::ParseError {
            line,
            message: message.into(),
        }
    }
}

/// I/O errors are not `Clone`; the copy keeps their kind and message.
impl Clone for BoxError {
    fn clone(&self) -> Self {
        match self {
            BoxError::ConfigError(s) => BoxError::ConfigError(s.clone()),
            BoxError::PrerequisiteError { capability } => BoxError::PrerequisiteError {
                capability: capability.clone(),
            },
            BoxError::EngineError(s) => BoxError::EngineError(s.clone()),
            BoxError::IncompleteStatement(c) => BoxError::IncompleteStatement(c.clone()),
            BoxError::LookupNotFound { kind, name } => BoxError::LookupNotFound {
                kind: kind.clone(),
                name: name.clone(),
            },
            BoxError::Cancelled => BoxError::Cancelled,
            BoxError::ParseError { line, message } => BoxError::ParseError {
                line: *line,
                message: message.clone(),
            },
            BoxError::UndefinedVariable(s) => BoxError::UndefinedVariable(s.clone()),
            BoxError::CacheError(s) => BoxError::CacheError(s.clone()),
            BoxError::PlanFailed { plan, source } => BoxError::PlanFailed {
                plan: plan.clone(),
                source: source.clone(),
            },
            BoxError::IoError(e) => BoxError::IoError(std::io::Error::new(e.kind(), e.to_string())),
            BoxError::SerializationError(s) => BoxError::SerializationError(s.clone()),
            BoxError::Other(s) => BoxError::Other(s.clone()),
        }
    }
}

impl From<serde_json::Error> for BoxError {
    fn from(err: serde_json::Error) -> Self {
        BoxError::SerializationError(err.to_string())
    }
}

/// Result type alias for box operations
pub type Result<T> = std::result::Result<T, BoxError>;
