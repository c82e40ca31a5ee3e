//! `box repl` (alias `shell`) - interactive session against the docker engine.

use std::io::IsTerminal;
use std::path::Path;

use box_core::cancel::{CancelMode, CancellationCoordinator};
use box_core::log::BuildLogger;
use box_runtime::{Builder, DockerCli, Evaluator, PlanEvaluator};

use super::{BuildFlags, InternalFault};
use crate::session::{EvaluatorFactory, Session, SessionExit};
use crate::signals;

pub async fn execute(flags: &BuildFlags) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = flags.build_config(Path::new("repl"), std::io::stdout().is_terminal())?;
    config.cache = false;
    config.cache_dir = None;

    let logger = BuildLogger::new("repl", &config);
    let factory: EvaluatorFactory = Box::new(move || {
        let builder = Builder::new(&config, Box::new(DockerCli::from_env()))?;
        Ok(Box::new(PlanEvaluator::new(builder)) as Box<dyn Evaluator>)
    });

    let coordinator = CancellationCoordinator::new(CancelMode::Interactive);
    let session = Session::new(
        factory,
        coordinator,
        logger,
        Box::new(std::io::stdout()),
        signals::forward_interrupts(),
    )?;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    match session.run(stdin).await? {
        SessionExit::Quit => Ok(()),
        SessionExit::Fault(message) => Err(Box::new(InternalFault(message))),
    }
}
