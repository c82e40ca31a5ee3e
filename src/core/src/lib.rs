//! Box Core - Foundational Types and Abstractions
//!
//! This crate provides the types shared by every part of box: the error
//! taxonomy, per-build configuration, the process-wide cancellation
//! coordinator, the incremental parse continuation and the build logger.

pub mod cancel;
pub mod config;
pub mod continuation;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use cancel::{
    CancelMode, CancelScope, CancellationCoordinator, Registration, RunnerGuard, RunnerHandle,
};
pub use config::BuildConfig;
pub use continuation::Continuation;
pub use error::{BoxError, Result};
pub use log::BuildLogger;

/// Box version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
