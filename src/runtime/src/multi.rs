//! Concurrent builds of independent plans.
//!
//! Each plan runs in its own task with its own cancellation scope and
//! runner handle; one plan failing neither cancels nor blocks the others.

use std::sync::Arc;

use box_core::cancel::{CancellationCoordinator, RunnerHandle};
use box_core::error::{BoxError, Result};
use tokio::task::JoinHandle;

use crate::build::{BuildResult, Builder};
use crate::plan::BuildPlan;

/// A plan and the builder that will run it.
#[derive(Debug)]
pub struct BuildJob {
    pub name: String,
    pub builder: Builder,
    pub plan: BuildPlan,
}

impl BuildJob {
    pub fn new(builder: Builder, plan: BuildPlan) -> Self {
        Self {
            name: builder.name().to_string(),
            builder,
            plan,
        }
    }
}

/// Terminal state of one job.
#[derive(Debug)]
pub struct JobOutcome {
    pub name: String,
    pub result: BuildResult,
    /// `None` if the task panicked
    pub builder: Option<Builder>,
}

/// Runs several builds at once.
pub struct MultiBuild {
    coordinator: CancellationCoordinator,
    pending: Vec<BuildJob>,
    running: Vec<(String, JoinHandle<(Builder, BuildResult)>)>,
    outcomes: Vec<JobOutcome>,
}

impl MultiBuild {
    pub fn new(jobs: Vec<BuildJob>, coordinator: CancellationCoordinator) -> Self {
        Self {
            coordinator,
            pending: jobs,
            running: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    /// Launch every job. Calling it again does nothing.
    pub fn start(&mut self) {
        for job in std::mem::take(&mut self.pending) {
            let BuildJob {
                name,
                mut builder,
                plan,
            } = job;

            let scope = self.coordinator.new_scope();
            let (runner, guard) = RunnerHandle::new(name.clone());
            self.coordinator.register_runner(runner.clone());
            let coordinator = self.coordinator.clone();

            tracing::debug!(plan = %name, "Starting build");
            let handle = tokio::spawn(async move {
                let _guard = guard;
                let result = builder.run(&plan, &scope).await;
                if let Err(e) = builder.close().await {
                    tracing::warn!(plan = %builder.name(), error = %e, "Failed to release engine");
                }
                coordinator.deregister_runner(&runner);
                (builder, result)
            });
            self.running.push((name, handle));
        }
    }

    /// Wait for every started job. Returns the first failure in plan order.
    pub async fn wait(&mut self) -> Result<()> {
        let running = std::mem::take(&mut self.running);
        let (names, handles): (Vec<_>, Vec<_>) = running.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;

        for (name, joined) in names.into_iter().zip(joined) {
            let outcome = match joined {
                Ok((builder, result)) => JobOutcome {
                    name,
                    result,
                    builder: Some(builder),
                },
                Err(e) => JobOutcome {
                    name,
                    result: BuildResult::failure(
                        String::new(),
                        BoxError::Other(format!("Build task failed: {e}")),
                    ),
                    builder: None,
                },
            };
            self.outcomes.push(outcome);
        }

        match self
            .outcomes
            .iter()
            .find_map(|o| o.result.error.clone().map(|e| (o.name.clone(), e)))
        {
            Some((plan, source)) => Err(BoxError::PlanFailed { plan, source }),
            None => Ok(()),
        }
    }

    /// Outcomes in plan order, available after [`wait`](Self::wait).
    pub fn outcomes(&self) -> &[JobOutcome] {
        &self.outcomes
    }

    pub fn result(&self, name: &str) -> Option<&BuildResult> {
        self.outcomes
            .iter()
            .find(|o| o.name == name)
            .map(|o| &o.result)
    }

    /// Failed plans and their errors.
    pub fn failures(&self) -> Vec<(&str, Arc<BoxError>)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.error.clone().map(|e| (o.name.as_str(), e)))
            .collect()
    }
}
