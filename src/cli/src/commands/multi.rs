//! `box multi` - build several plans at once.

use std::io::IsTerminal;
use std::path::PathBuf;

use box_core::cancel::{CancelMode, CancellationCoordinator};
use box_core::error::BoxError;
use box_core::log::BuildLogger;
use box_runtime::{BuildJob, BuildPlan, Builder, DockerCli, Engine, MultiBuild};
use clap::Args;

use super::{strip_algorithm, BuildFlags};
use crate::signals;

#[derive(Args)]
pub struct MultiArgs {
    /// Plans to build
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

pub async fn execute(args: MultiArgs, flags: &BuildFlags) -> Result<(), Box<dyn std::error::Error>> {
    let is_terminal = std::io::stdout().is_terminal();
    if flags.tag.is_some() {
        tracing::warn!("--tag is ignored when building several plans");
    }

    let jobs = load_jobs(&args.files, flags, is_terminal, || {
        Box::new(DockerCli::from_env())
    })?;

    let coordinator = CancellationCoordinator::new(CancelMode::Terminate);
    let interrupt = signals::terminate_on_interrupt(coordinator.clone());

    let mut multi = MultiBuild::new(jobs, coordinator);
    multi.start();
    let outcome = multi.wait().await;
    interrupt.abort();

    for job in multi.outcomes() {
        if let (Some(builder), true) = (&job.builder, job.result.is_ok()) {
            builder.logger().finish(strip_algorithm(&job.result.value));
        }
    }

    outcome.map_err(Into::into)
}

/// Load and parse every plan before any build starts, so one bad plan fails
/// the run without touching the engine.
fn load_jobs(
    files: &[PathBuf],
    flags: &BuildFlags,
    is_terminal: bool,
    engine: impl Fn() -> Box<dyn Engine>,
) -> Result<Vec<BuildJob>, BoxError> {
    let mut jobs = Vec::with_capacity(files.len());
    for file in files {
        let mut config = flags.build_config(file, is_terminal)?;
        config.show_run = false;

        let builder = Builder::new(&config, engine())?
            .with_logger(BuildLogger::new(config.label(), &config).prefixed());
        let plan = BuildPlan::from_file(file, builder.verbs())?;
        jobs.push(BuildJob::new(builder, plan));
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use box_runtime::MemoryEngine;
    use tempfile::TempDir;

    fn flags() -> BuildFlags {
        BuildFlags {
            no_cache: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_load_jobs_names_each_plan() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.plan");
        let b = tmp.path().join("b.plan");
        std::fs::write(&a, "from alpine\nrun make\n").unwrap();
        std::fs::write(&b, "from debian\n").unwrap();

        let jobs = load_jobs(&[a, b], &flags(), false, || Box::new(MemoryEngine::new())).unwrap();
        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, ["a.plan", "b.plan"]);
        assert_eq!(jobs[0].plan.step_count(), 2);
    }

    #[test]
    fn test_bad_plan_fails_before_any_build() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.plan");
        let bad = tmp.path().join("bad.plan");
        std::fs::write(&good, "from alpine\n").unwrap();
        std::fs::write(&bad, "from alpine\nfrobnicate\n").unwrap();

        let engine = MemoryEngine::new();
        let shared = engine.clone();
        let err = load_jobs(&[good, bad], &flags(), false, move || Box::new(shared.clone()))
            .err()
            .unwrap();
        assert!(matches!(err, BoxError::ParseError { line: 2, .. }));
        assert_eq!(engine.mutating_calls(), 0);
    }

    #[test]
    fn test_missing_plan_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.plan");
        let err = load_jobs(&[missing], &flags(), false, || Box::new(MemoryEngine::new()))
            .err()
            .unwrap();
        assert!(matches!(err, BoxError::ConfigError(_)));
    }
}
