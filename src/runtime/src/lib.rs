//! Box Runtime - image build engine.
//!
//! This crate provides everything between a plan file and an image: the plan
//! language, engine adapters (docker CLI and in-memory), the step cache, the
//! build orchestrator, script evaluation and concurrent multi-builds.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod cache;
pub mod engine;
pub mod eval;
pub mod multi;
pub mod plan;

// Re-export common types
pub use build::{BuildResult, Builder};
pub use cache::{CacheKey, CacheStats, StepCache};
pub use engine::{ConfigChanges, ContainerHandle, DockerCli, Engine, ExecSpec, MemoryEngine};
pub use eval::{Evaluator, PlanEvaluator, EXECUTED};
pub use multi::{BuildJob, JobOutcome, MultiBuild};
pub use plan::{BuildPlan, Parsed, Query, Statement, Step, Verb, VerbSet};

/// Box Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
