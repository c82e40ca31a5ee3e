//! Script evaluation: whole plans or one fragment at a time.
//!
//! Both modes share the same [`Builder`], so a statement entered at the
//! prompt advances the image exactly as the same text in a plan file would.

use std::path::Path;

use async_trait::async_trait;
use box_core::cancel::CancelScope;
use box_core::continuation::Continuation;
use box_core::error::{BoxError, Result};

use crate::build::{BuildResult, Builder};
use crate::plan::{parse_source, BuildPlan, Parsed};

/// Printable result of a statement that has no value of its own.
pub const EXECUTED: &str = "Executed!";

/// Evaluates plan source against a build.
#[async_trait]
pub trait Evaluator: Send {
    /// Load, parse and run a complete plan file.
    async fn run_script(&mut self, path: &Path, scope: &CancelScope) -> Result<()>;

    /// Evaluate `text` appended to whatever `continuation` holds.
    ///
    /// - complete statement: executed, returns [`Continuation::Baseline`];
    ///   the value is available from [`last_result`](Self::last_result)
    /// - incomplete statement: fails with
    ///   [`BoxError::IncompleteStatement`] carrying the pending buffer to
    ///   hand back with the next fragment
    /// - any other error: the buffer is discarded and the caller continues
    ///   from baseline
    async fn run_fragment(
        &mut self,
        text: &str,
        continuation: Continuation,
        scope: &CancelScope,
    ) -> Result<Continuation>;

    fn last_result(&self) -> &BuildResult;

    async fn close(&mut self) -> Result<()>;
}

/// [`Evaluator`] for the plan language.
#[derive(Debug)]
pub struct PlanEvaluator {
    builder: Builder,
}

impl PlanEvaluator {
    pub fn new(builder: Builder) -> Self {
        Self { builder }
    }

    pub fn builder(&self) -> &Builder {
        &self.builder
    }

    fn fail(&mut self, error: BoxError) -> BoxError {
        self.builder
            .set_result(BuildResult::failure(String::new(), error.clone()));
        error
    }
}

#[async_trait]
impl Evaluator for PlanEvaluator {
    async fn run_script(&mut self, path: &Path, scope: &CancelScope) -> Result<()> {
        let plan = match BuildPlan::from_file(path, self.builder.verbs()) {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail(e)),
        };

        tracing::debug!(plan = %path.display(), statements = plan.statements().len(), "Running plan");
        let result = self.builder.run(&plan, scope).await;
        match result.error {
            Some(error) => Err(error.as_ref().clone()),
            None => Ok(()),
        }
    }

    async fn run_fragment(
        &mut self,
        text: &str,
        continuation: Continuation,
        scope: &CancelScope,
    ) -> Result<Continuation> {
        let source = continuation.append(text);

        let plan = match parse_source(&source, self.builder.verbs()) {
            Ok(Parsed::Complete(plan)) => plan,
            Ok(Parsed::Incomplete) => {
                return Err(BoxError::IncompleteStatement(Continuation::Pending(source)))
            }
            Err(e) => return Err(self.fail(e)),
        };

        match self.builder.evaluate(&plan, scope).await {
            Ok(value) => {
                let value = value.unwrap_or_else(|| EXECUTED.to_string());
                self.builder.set_result(BuildResult::success(value));
                Ok(Continuation::Baseline)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn last_result(&self) -> &BuildResult {
        self.builder.last_result()
    }

    async fn close(&mut self) -> Result<()> {
        self.builder.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use box_core::config::BuildConfig;
    use box_core::log::BuildLogger;
    use tempfile::TempDir;

    fn evaluator(engine: &MemoryEngine) -> PlanEvaluator {
        let config = BuildConfig {
            cache: false,
            ..Default::default()
        };
        let (logger, _buf) = BuildLogger::buffered("repl", &config);
        let builder = Builder::new(&config, Box::new(engine.clone()))
            .unwrap()
            .with_logger(logger);
        PlanEvaluator::new(builder)
    }

    #[tokio::test]
    async fn test_incomplete_then_complete() {
        let engine = MemoryEngine::new();
        let mut eval = evaluator(&engine);
        let scope = CancelScope::new();

        let cont = eval
            .run_fragment("from alpine", Continuation::Baseline, &scope)
            .await
            .unwrap();
        assert!(cont.is_baseline());

        let err = eval
            .run_fragment("run echo \\", Continuation::Baseline, &scope)
            .await
            .unwrap_err();
        let pending = match err {
            BoxError::IncompleteStatement(c) => c,
            other => panic!("expected incomplete, got {other:?}"),
        };
        assert!(!pending.is_baseline());

        let cont = eval.run_fragment("hello", pending, &scope).await.unwrap();
        assert!(cont.is_baseline());
        assert!(eval.last_result().is_ok());
        assert_eq!(eval.last_result().value, EXECUTED);
        assert_eq!(engine.mutating_calls(), 2);
    }

    #[tokio::test]
    async fn test_block_spans_fragments() {
        let engine = MemoryEngine::new();
        let mut eval = evaluator(&engine);
        let scope = CancelScope::new();

        eval.run_fragment("from alpine", Continuation::Baseline, &scope)
            .await
            .unwrap();

        let mut cont = Continuation::Baseline;
        for line in ["inside /srv {", "run ls"] {
            match eval.run_fragment(line, cont, &scope).await {
                Err(BoxError::IncompleteStatement(next)) => cont = next,
                other => panic!("expected incomplete, got {other:?}"),
            }
        }
        assert_eq!(engine.mutating_calls(), 0);

        let cont = eval.run_fragment("}", cont, &scope).await.unwrap();
        assert!(cont.is_baseline());
        assert_eq!(engine.mutating_calls(), 2);
    }

    #[tokio::test]
    async fn test_syntax_error_is_terminal_not_incomplete() {
        let engine = MemoryEngine::new();
        let mut eval = evaluator(&engine);
        let err = eval
            .run_fragment("frobnicate now", Continuation::Baseline, &CancelScope::new())
            .await
            .unwrap_err();
        assert!(!err.is_incomplete());
        assert!(matches!(err, BoxError::ParseError { .. }));
        assert!(eval.last_result().error.is_some());
    }

    #[tokio::test]
    async fn test_error_discards_pending_buffer() {
        let engine = MemoryEngine::new();
        let mut eval = evaluator(&engine);
        let scope = CancelScope::new();

        let pending = match eval
            .run_fragment("inside /tmp {", Continuation::Baseline, &scope)
            .await
        {
            Err(BoxError::IncompleteStatement(c)) => c,
            other => panic!("expected incomplete, got {other:?}"),
        };
        let err = eval.run_fragment("bogus", pending, &scope).await.unwrap_err();
        assert!(matches!(err, BoxError::ParseError { .. }));

        // The caller restarts from baseline; the old block is gone.
        let cont = eval
            .run_fragment("getenv BOX_EVAL_TEST_UNSET", Continuation::Baseline, &scope)
            .await
            .unwrap();
        assert!(cont.is_baseline());
        assert_eq!(eval.last_result().value, "");
    }

    #[tokio::test]
    async fn test_query_value_is_result() {
        let engine = MemoryEngine::new();
        engine.seed_image("base", &[("/etc/passwd", "alice:x:1000:1000::/:/bin/sh\n")]);
        let mut eval = evaluator(&engine);
        let scope = CancelScope::new();

        eval.run_fragment("from base", Continuation::Baseline, &scope)
            .await
            .unwrap();
        eval.run_fragment("getuid alice", Continuation::Baseline, &scope)
            .await
            .unwrap();
        assert_eq!(eval.last_result().value, "1000");
    }

    #[tokio::test]
    async fn test_fragments_match_whole_script() {
        let tmp = TempDir::new().unwrap();
        let source = "from alpine\nrun make\nenv MODE=prod\ncmd [\"/app\"]\n";
        let path = tmp.path().join("box.plan");
        std::fs::write(&path, source).unwrap();
        let scope = CancelScope::new();

        let whole_engine = MemoryEngine::new();
        let mut whole = evaluator(&whole_engine);
        whole.run_script(&path, &scope).await.unwrap();

        let frag_engine = MemoryEngine::new();
        let mut frag = evaluator(&frag_engine);
        for line in source.lines() {
            frag.run_fragment(line, Continuation::Baseline, &scope)
                .await
                .unwrap();
        }

        assert!(!whole.builder().image_reference().is_empty());
        assert_eq!(
            whole.builder().image_reference(),
            frag.builder().image_reference()
        );
    }

    #[tokio::test]
    async fn test_run_script_missing_file() {
        let engine = MemoryEngine::new();
        let mut eval = evaluator(&engine);
        let err = eval
            .run_script(Path::new("/nonexistent/box.plan"), &CancelScope::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BoxError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_run_script_reports_build_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("box.plan");
        std::fs::write(&path, "getgid staff\n").unwrap();

        let engine = MemoryEngine::new();
        let mut eval = evaluator(&engine);
        let err = eval.run_script(&path, &CancelScope::new()).await.unwrap_err();
        assert!(matches!(err, BoxError::PrerequisiteError { .. }));
        assert!(eval.last_result().error.is_some());

        eval.close().await.unwrap();
        assert!(engine.is_closed());
    }
}
