//! Build orchestration.
//!
//! A [`Builder`] owns one build: the image built so far, the step cache and
//! the engine adapter. It runs plans (or fragments of them) statement by
//! statement and produces a [`BuildResult`].

pub mod builder;
pub mod query;
pub mod vars;

use std::sync::Arc;

use box_core::error::BoxError;

pub use builder::Builder;
pub use query::lookup_id;
pub use vars::interpolate;

/// Outcome of a build or an evaluated statement.
#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    /// Final image reference, or the printable value of a statement
    pub value: String,
    pub error: Option<Arc<BoxError>>,
}

impl BuildResult {
    pub fn success(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            error: None,
        }
    }

    pub fn failure(value: impl Into<String>, error: BoxError) -> Self {
        Self {
            value: value.into(),
            error: Some(Arc::new(error)),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
