//! `box [FILE]` - build one plan.
//!
//! Runs the plan in terminate mode: an interrupt cancels the build, waits for
//! the engine to release its containers and exits.

use std::io::IsTerminal;
use std::path::PathBuf;

use box_core::cancel::{CancelMode, CancellationCoordinator, RunnerHandle};
use box_core::config::DEFAULT_PLAN_FILE;
use box_runtime::{Builder, DockerCli, Evaluator, PlanEvaluator};
use clap::CommandFactory;

use super::{strip_algorithm, BuildFlags, Cli};
use crate::signals;

pub async fn execute(
    file: Option<PathBuf>,
    flags: &BuildFlags,
) -> Result<(), Box<dyn std::error::Error>> {
    let file = match file {
        Some(file) => file,
        None => {
            let default = PathBuf::from(DEFAULT_PLAN_FILE);
            if !default.exists() {
                Cli::command().print_help()?;
                println!();
                return Ok(());
            }
            default
        }
    };

    let config = flags.build_config(&file, std::io::stdout().is_terminal())?;
    let builder = Builder::new(&config, Box::new(DockerCli::from_env()))?;
    let mut evaluator = PlanEvaluator::new(builder);

    let coordinator = CancellationCoordinator::new(CancelMode::Terminate);
    let scope = coordinator.new_scope();
    let (runner, guard) = RunnerHandle::new(config.label());
    coordinator.register_runner(runner.clone());
    let interrupt = signals::terminate_on_interrupt(coordinator.clone());

    let outcome = async {
        evaluator.run_script(&file, &scope).await?;

        let builder = evaluator.builder();
        let image = builder.last_result().value.clone();
        if !image.is_empty() {
            builder.logger().eval_response(&image);
        }

        if let Some(tag) = &flags.tag {
            builder
                .tag(tag, &scope)
                .await
                .map_err(|e| format!("Can't tag with tag \"{tag}\": {e}"))?;
        }

        builder.logger().finish(strip_algorithm(&image));
        Ok::<(), Box<dyn std::error::Error>>(())
    }
    .await;

    if let Err(e) = evaluator.close().await {
        tracing::warn!(error = %e, "Failed to release engine");
    }
    coordinator.deregister_runner(&runner);
    drop(guard);
    interrupt.abort();

    outcome
}
