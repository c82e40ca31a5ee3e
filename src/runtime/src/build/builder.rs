//! Build orchestrator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use box_core::cancel::CancelScope;
use box_core::config::BuildConfig;
use box_core::error::{BoxError, Result};
use box_core::log::BuildLogger;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;

use super::query;
use super::vars::interpolate;
use super::BuildResult;
use crate::cache::{sha256_path, CacheKey, CacheStats, StepCache};
use crate::engine::{ConfigChanges, Engine, ExecSpec};
use crate::plan::{BuildPlan, Expr, Query, Statement, Step, VerbSet};

/// Overrides active inside `inside` / `with_user` blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
struct ExecContext {
    workdir: Option<String>,
    user: Option<String>,
}

/// Per-run state.
///
/// `lookup` starts as the builder's cache and is dropped at the first miss:
/// everything after a miss is built on a new parent, so later steps of the
/// same run never consult the cache.
struct Cursor {
    lookup: Option<Arc<StepCache>>,
    index: usize,
    total: usize,
    numbered: bool,
    ctx: ExecContext,
}

impl Cursor {
    fn new(lookup: Option<Arc<StepCache>>, total: usize, numbered: bool) -> Self {
        Self {
            lookup,
            index: 0,
            total,
            numbered,
            ctx: ExecContext::default(),
        }
    }
}

/// Owns one build: the image built so far, its step cache and its engine
/// adapter. Statements run strictly in order.
pub struct Builder {
    name: String,
    engine: Box<dyn Engine>,
    cache: Option<Arc<StepCache>>,
    /// Image built so far; empty until `from` runs
    image: String,
    vars: HashMap<String, String>,
    verbs: VerbSet,
    context_dir: PathBuf,
    logger: BuildLogger,
    result: BuildResult,
    closed: bool,
}

impl Builder {
    pub fn new(config: &BuildConfig, engine: Box<dyn Engine>) -> Result<Self> {
        let verbs = VerbSet::omitting(&config.omit)?;
        let cache = if config.cache {
            let cache = match &config.cache_dir {
                Some(dir) => StepCache::open(dir)?,
                None => StepCache::in_memory(),
            };
            Some(Arc::new(cache))
        } else {
            None
        };

        Ok(Self {
            name: config.label(),
            engine,
            cache,
            image: String::new(),
            vars: config.vars.clone(),
            verbs,
            context_dir: config.context_dir(),
            logger: BuildLogger::new(config.label(), config),
            result: BuildResult::default(),
            closed: false,
        })
    }

    /// Replace the step cache (`None` disables caching).
    pub fn with_cache(mut self, cache: Option<Arc<StepCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_logger(mut self, logger: BuildLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn verbs(&self) -> &VerbSet {
        &self.verbs
    }

    /// `--var` values plus everything bound with `set`.
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn logger(&self) -> &BuildLogger {
        &self.logger
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    /// Current image, empty if no base image has been established.
    pub fn image_reference(&self) -> &str {
        &self.image
    }

    pub fn last_result(&self) -> &BuildResult {
        &self.result
    }

    pub(crate) fn set_result(&mut self, result: BuildResult) {
        self.result = result;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run a whole plan. The result is also kept as [`last_result`](Self::last_result).
    pub async fn run(&mut self, plan: &BuildPlan, scope: &CancelScope) -> BuildResult {
        let mut cursor = Cursor::new(self.cache.clone(), plan.step_count(), true);
        let outcome = self.exec_all(plan.statements(), &mut cursor, scope).await;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.flush() {
                tracing::warn!(build = %self.name, error = %e, "Failed to persist step cache");
            }
        }

        self.result = match outcome {
            Ok(_) => BuildResult::success(self.image.clone()),
            Err(e) => {
                tracing::debug!(build = %self.name, error = %e, "Build failed");
                BuildResult::failure(self.image.clone(), e)
            }
        };
        self.result.clone()
    }

    /// Evaluate statements as one interactive unit. Returns the printable
    /// value of the last statement that has one (`set`, queries).
    pub async fn evaluate(
        &mut self,
        plan: &BuildPlan,
        scope: &CancelScope,
    ) -> Result<Option<String>> {
        let mut cursor = Cursor::new(self.cache.clone(), plan.step_count(), false);
        self.exec_all(plan.statements(), &mut cursor, scope).await
    }

    /// Tag the current image.
    pub async fn tag(&self, name: &str, scope: &CancelScope) -> Result<()> {
        if self.image.is_empty() {
            return Err(BoxError::PrerequisiteError {
                capability: "tag".to_string(),
            });
        }
        self.engine.tag(&self.image, name, scope).await?;
        self.logger.tag(name);
        Ok(())
    }

    /// Release the engine adapter. Only the first call does anything.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.flush() {
                tracing::warn!(build = %self.name, error = %e, "Failed to persist step cache");
            }
        }
        self.engine.close().await
    }

    async fn exec_all(
        &mut self,
        statements: &[Statement],
        cursor: &mut Cursor,
        scope: &CancelScope,
    ) -> Result<Option<String>> {
        let mut value = None;
        for statement in statements {
            if let Some(v) = self.exec_statement(statement, cursor, scope).await? {
                value = Some(v);
            }
        }
        Ok(value)
    }

    fn exec_statement<'a>(
        &'a mut self,
        statement: &'a Statement,
        cursor: &'a mut Cursor,
        scope: &'a CancelScope,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        async move {
            scope.check()?;
            match &statement.step {
                Step::Inside { dir, body } => {
                    let dir = interpolate(dir, &self.vars)?;
                    let saved = cursor.ctx.clone();
                    cursor.ctx.workdir = Some(dir);
                    let out = self.exec_all(body, cursor, scope).await;
                    cursor.ctx = saved;
                    out
                }
                Step::WithUser { user, body } => {
                    let user = interpolate(user, &self.vars)?;
                    let saved = cursor.ctx.clone();
                    cursor.ctx.user = Some(user);
                    let out = self.exec_all(body, cursor, scope).await;
                    cursor.ctx = saved;
                    out
                }
                step => self.exec_leaf(step, cursor, scope).await,
            }
        }
        .boxed()
    }

    async fn exec_leaf(
        &mut self,
        step: &Step,
        cursor: &mut Cursor,
        scope: &CancelScope,
    ) -> Result<Option<String>> {
        let step = self.resolve_step(step)?;

        cursor.index += 1;
        let description = step.to_string();
        if cursor.numbered {
            self.logger.step(cursor.index, cursor.total, &description);
        } else {
            self.logger.exec(&description);
        }

        match &step {
            Step::From { image } => {
                let id = self.engine.resolve_base(image, scope).await?;
                tracing::debug!(build = %self.name, image = %image, id = %id, "Base image");
                self.set_image(id);
                Ok(None)
            }
            Step::Tag { name } => {
                self.tag(name, scope).await?;
                Ok(None)
            }
            Step::Set { name, value } => {
                let value = match value {
                    Expr::Literal(v) => v.clone(),
                    Expr::Query(q) => self.query(q, scope).await?,
                };
                self.vars.insert(name.clone(), value.clone());
                Ok(Some(value))
            }
            Step::Query(q) => Ok(Some(self.query(q, scope).await?)),
            step if step.is_cacheable() => {
                self.commit_step(step, cursor, scope).await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn query(&self, query: &Query, scope: &CancelScope) -> Result<String> {
        query::evaluate(query, &self.image, self.engine.as_ref(), scope).await
    }

    /// Apply an image-producing step, going through the step cache.
    async fn commit_step(
        &mut self,
        step: &Step,
        cursor: &mut Cursor,
        scope: &CancelScope,
    ) -> Result<()> {
        if self.image.is_empty() {
            return Err(BoxError::PrerequisiteError {
                capability: step.verb().name().to_string(),
            });
        }

        let file_digests = match step {
            Step::Copy { src, .. } => vec![sha256_path(&self.context_dir.join(src))?],
            _ => Vec::new(),
        };
        let material = serde_json::json!({ "step": step, "context": cursor.ctx });
        let key = CacheKey::compute(&self.image, step.verb(), &material, &file_digests)?;

        if let Some(cache) = cursor.lookup.clone() {
            if let Some(hit) = cache.lookup(&key) {
                if self.engine.image_exists(&hit, scope).await? {
                    tracing::debug!(key = %key, image = %hit, "Cache hit");
                    self.logger.cached(&hit);
                    self.set_image(hit);
                    return Ok(());
                }
                tracing::debug!(key = %key, image = %hit, "Cached image is gone, rebuilding");
                cache.invalidate(&key);
            }
            cursor.lookup = None;
        }

        let image = self.apply(step, &cursor.ctx, scope).await?;
        if let Some(cache) = &self.cache {
            cache.store(&key, &image);
        }
        self.logger.committed(&image);
        self.set_image(image);
        Ok(())
    }

    /// Working container, optional copy, commit.
    async fn apply(&self, step: &Step, ctx: &ExecContext, scope: &CancelScope) -> Result<String> {
        let exec = ExecSpec {
            cmd: match step {
                Step::Run { exec } => Some(exec.clone()),
                _ => None,
            },
            user: ctx.user.clone(),
            workdir: ctx.workdir.clone(),
        };

        let logger = self.logger.clone();
        let output = move |line: &str| logger.run_output(line);
        let container = self
            .engine
            .run_command(&self.image, &exec, &output, scope)
            .await?;

        if let Step::Copy { src, dst } = step {
            self.engine
                .copy_into(&container, &self.context_dir.join(src), dst, scope)
                .await?;
        }

        self.engine
            .commit(container, &config_changes(step), scope)
            .await
    }

    fn set_image(&mut self, image: String) {
        self.engine.use_image(&image);
        self.image = image;
    }

    /// Substitute `${NAME}` references in a step's arguments.
    fn resolve_step(&self, step: &Step) -> Result<Step> {
        let vars = &self.vars;
        let one = |s: &String| interpolate(s, vars);
        let list = |xs: &Vec<String>| {
            xs.iter()
                .map(|x| interpolate(x, vars))
                .collect::<Result<Vec<_>>>()
        };

        Ok(match step {
            Step::From { image } => Step::From { image: one(image)? },
            Step::Run { exec } => Step::Run { exec: list(exec)? },
            Step::Copy { src, dst } => Step::Copy {
                src: one(src)?,
                dst: one(dst)?,
            },
            Step::Workdir { path } => Step::Workdir { path: one(path)? },
            Step::User { user } => Step::User { user: one(user)? },
            Step::Env { key, value } => Step::Env {
                key: one(key)?,
                value: one(value)?,
            },
            Step::Entrypoint { exec } => Step::Entrypoint { exec: list(exec)? },
            Step::Cmd { exec } => Step::Cmd { exec: list(exec)? },
            Step::Expose { port } => Step::Expose { port: one(port)? },
            Step::Label { key, value } => Step::Label {
                key: one(key)?,
                value: one(value)?,
            },
            Step::Tag { name } => Step::Tag { name: one(name)? },
            Step::Set { name, value } => Step::Set {
                name: name.clone(),
                value: match value {
                    Expr::Literal(v) => Expr::Literal(one(v)?),
                    Expr::Query(q) => Expr::Query(resolve_query(q, vars)?),
                },
            },
            Step::Query(q) => Step::Query(resolve_query(q, vars)?),
            Step::Inside { .. } | Step::WithUser { .. } => step.clone(),
        })
    }
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("engine", &self.engine.name())
            .field("image", &self.image)
            .field("cache", &self.cache.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

fn resolve_query(query: &Query, vars: &HashMap<String, String>) -> Result<Query> {
    Ok(match query {
        Query::GetUid { user } => Query::GetUid {
            user: interpolate(user, vars)?,
        },
        Query::GetGid { group } => Query::GetGid {
            group: interpolate(group, vars)?,
        },
        Query::Read { path } => Query::Read {
            path: interpolate(path, vars)?,
        },
        Query::GetEnv { name } => Query::GetEnv {
            name: interpolate(name, vars)?,
        },
    })
}

/// Image configuration a step changes.
fn config_changes(step: &Step) -> ConfigChanges {
    let mut changes = ConfigChanges::default();
    match step {
        Step::Workdir { path } => changes.workdir = Some(path.clone()),
        Step::User { user } => changes.user = Some(user.clone()),
        Step::Env { key, value } => changes.env.push((key.clone(), value.clone())),
        Step::Entrypoint { exec } => changes.entrypoint = Some(exec.clone()),
        Step::Cmd { exec } => changes.cmd = Some(exec.clone()),
        Step::Expose { port } => changes.expose.push(port.clone()),
        Step::Label { key, value } => changes.labels.push((key.clone(), value.clone())),
        _ => {}
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{EngineCall, MemoryEngine};
    use tempfile::TempDir;

    const PASSWD: &str = "alice:x:1000:1000::/home/alice:/bin/bash\n";

    fn quiet_config() -> BuildConfig {
        BuildConfig {
            show_run: false,
            ..Default::default()
        }
    }

    fn builder(engine: &MemoryEngine, config: &BuildConfig) -> Builder {
        let (logger, _buf) = BuildLogger::buffered("test", config);
        Builder::new(config, Box::new(engine.clone()))
            .unwrap()
            .with_logger(logger)
    }

    fn plan(source: &str) -> BuildPlan {
        BuildPlan::parse(source, &VerbSet::all()).unwrap()
    }

    fn run_commands(engine: &MemoryEngine) -> Vec<ExecSpec> {
        engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::RunCommand { exec, .. } => Some(exec),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_query_before_from_is_prerequisite_error() {
        let engine = MemoryEngine::new();
        let mut b = builder(&engine, &quiet_config());
        let result = b.run(&plan("getuid alice"), &CancelScope::new()).await;

        let err = result.error.unwrap();
        assert!(matches!(
            err.as_ref(),
            BoxError::PrerequisiteError { capability } if capability == "getuid"
        ));
        assert!(engine.calls().is_empty());
        assert_eq!(b.image_reference(), "");
    }

    #[tokio::test]
    async fn test_step_before_from_is_prerequisite_error() {
        let engine = MemoryEngine::new();
        let mut b = builder(&engine, &quiet_config());
        let result = b.run(&plan("run true"), &CancelScope::new()).await;
        assert!(matches!(
            result.error.as_deref(),
            Some(BoxError::PrerequisiteError { .. })
        ));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_produces_image() {
        let engine = MemoryEngine::new();
        let mut b = builder(&engine, &quiet_config());
        let result = b
            .run(
                &plan("from alpine\nrun echo hi\nworkdir /app\nenv A=1"),
                &CancelScope::new(),
            )
            .await;

        assert!(result.is_ok(), "{:?}", result.error);
        assert!(result.value.starts_with("sha256:"));
        assert_eq!(result.value, b.image_reference());
        assert_eq!(engine.current_image_ref(), result.value);
        assert_eq!(b.last_result().value, result.value);

        let config = engine.config(&result.value).unwrap();
        assert_eq!(config.workdir.as_deref(), Some("/app"));
        assert_eq!(config.env, vec![("A".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn test_only_image_steps_reach_the_cache() {
        let engine = MemoryEngine::new();
        let cache = Arc::new(StepCache::in_memory());
        let mut b = builder(&engine, &quiet_config()).with_cache(Some(cache.clone()));
        let result = b
            .run(
                &plan("from alpine\nset X = 1\ntag web:latest\nrun make\nenv A=1"),
                &CancelScope::new(),
            )
            .await;

        assert!(result.is_ok(), "{:?}", result.error);
        let stats = cache.stats();
        assert_eq!(stats.lookups, 1);
        assert_eq!(stats.stores, 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_second_identical_run_is_all_cache_hits() {
        let engine = MemoryEngine::new();
        let cache = Arc::new(StepCache::in_memory());
        let source = "from alpine\nrun apt-get update\nenv A=1\ncmd [\"sh\"]";
        let scope = CancelScope::new();

        let mut first = builder(&engine, &quiet_config()).with_cache(Some(cache.clone()));
        let one = first.run(&plan(source), &scope).await;
        assert!(one.is_ok());
        assert!(engine.mutating_calls() > 0);

        engine.clear_calls();
        let mut second = builder(&engine, &quiet_config()).with_cache(Some(cache.clone()));
        let two = second.run(&plan(source), &scope).await;

        assert!(two.is_ok());
        assert_eq!(one.value, two.value);
        assert_eq!(engine.mutating_calls(), 0);
        assert_eq!(cache.stats().hits, 3);
    }

    #[tokio::test]
    async fn test_cache_miss_stops_later_lookups() {
        let engine = MemoryEngine::new();
        let cache = Arc::new(StepCache::in_memory());
        let scope = CancelScope::new();

        let mut first = builder(&engine, &quiet_config()).with_cache(Some(cache.clone()));
        first
            .run(&plan("from alpine\nrun one\nrun two\nrun three"), &scope)
            .await;
        let before = cache.stats();

        let mut second = builder(&engine, &quiet_config()).with_cache(Some(cache.clone()));
        let result = second
            .run(&plan("from alpine\nrun one\nrun CHANGED\nrun three"), &scope)
            .await;
        assert!(result.is_ok());

        let after = cache.stats();
        // Step 1 hits, step 2 misses, step 3 is never looked up.
        assert_eq!(after.lookups - before.lookups, 2);
        assert_eq!(after.hits - before.hits, 1);
        assert_eq!(after.misses - before.misses, 1);
    }

    #[tokio::test]
    async fn test_stale_cache_entry_is_rebuilt() {
        let engine = MemoryEngine::new();
        let cache = Arc::new(StepCache::in_memory());
        let scope = CancelScope::new();
        let source = "from alpine\nrun make";

        let mut first = builder(&engine, &quiet_config()).with_cache(Some(cache.clone()));
        let built = first.run(&plan(source), &scope).await.value;
        engine.remove_image(&built);
        engine.clear_calls();

        let mut second = builder(&engine, &quiet_config()).with_cache(Some(cache.clone()));
        let rebuilt = second.run(&plan(source), &scope).await;
        assert!(rebuilt.is_ok());
        assert_eq!(rebuilt.value, built);
        assert_eq!(engine.mutating_calls(), 2);
        assert_eq!(cache.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_cache_disabled_rebuilds() {
        let engine = MemoryEngine::new();
        let config = BuildConfig {
            cache: false,
            ..quiet_config()
        };
        let scope = CancelScope::new();

        let mut first = builder(&engine, &config);
        assert!(first.cache_stats().is_none());
        first.run(&plan("from alpine\nrun make"), &scope).await;
        engine.clear_calls();

        let mut second = builder(&engine, &config);
        second.run(&plan("from alpine\nrun make"), &scope).await;
        assert_eq!(engine.mutating_calls(), 2);
    }

    #[tokio::test]
    async fn test_persisted_cache_survives_builders() {
        let tmp = TempDir::new().unwrap();
        let engine = MemoryEngine::new();
        let config = BuildConfig {
            cache_dir: Some(tmp.path().to_path_buf()),
            ..quiet_config()
        };
        let scope = CancelScope::new();

        let mut first = builder(&engine, &config);
        first.run(&plan("from alpine\nrun make"), &scope).await;
        first.close().await.unwrap();
        engine.clear_calls();

        let mut second = builder(&engine, &config);
        second.run(&plan("from alpine\nrun make"), &scope).await;
        assert_eq!(engine.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_set_query_and_interpolation() {
        let engine = MemoryEngine::new();
        engine.seed_image("base", &[("/etc/passwd", PASSWD)]);
        let mut b = builder(&engine, &quiet_config());

        let result = b
            .run(
                &plan("from base\nset uid = getuid alice\nrun chown ${uid} /srv"),
                &CancelScope::new(),
            )
            .await;
        assert!(result.is_ok(), "{:?}", result.error);
        assert_eq!(b.vars().get("uid").map(String::as_str), Some("1000"));

        let runs = run_commands(&engine);
        assert_eq!(
            runs[0].cmd.as_ref().unwrap()[2],
            "chown 1000 /srv".to_string()
        );
    }

    #[tokio::test]
    async fn test_lookup_not_found_fails_build() {
        let engine = MemoryEngine::new();
        engine.seed_image("base", &[("/etc/passwd", PASSWD)]);
        let mut b = builder(&engine, &quiet_config());
        let result = b
            .run(&plan("from base\ngetuid bob"), &CancelScope::new())
            .await;
        let err = result.error.unwrap();
        assert!(err.to_string().contains("bob"));
    }

    #[tokio::test]
    async fn test_injected_vars_and_undefined_variable() {
        let engine = MemoryEngine::new();
        let config = BuildConfig {
            vars: HashMap::from([("VERSION".to_string(), "1.2".to_string())]),
            ..quiet_config()
        };
        let mut b = builder(&engine, &config);
        let ok = b
            .run(&plan("from alpine\nlabel version=${VERSION}"), &CancelScope::new())
            .await;
        assert!(ok.is_ok());

        let mut b = builder(&engine, &config);
        let failed = b
            .run(&plan("from alpine\nrun echo ${MISSING}"), &CancelScope::new())
            .await;
        assert!(matches!(
            failed.error.as_deref(),
            Some(BoxError::UndefinedVariable(name)) if name == "MISSING"
        ));
    }

    #[tokio::test]
    async fn test_blocks_override_context_and_key() {
        let engine = MemoryEngine::new();
        let mut b = builder(&engine, &quiet_config());
        let result = b
            .run(
                &plan(
                    "from alpine\nrun ls\ninside /tmp {\nwith_user nobody {\nrun ls\n}\n}\nrun ls",
                ),
                &CancelScope::new(),
            )
            .await;
        assert!(result.is_ok());

        let runs = run_commands(&engine);
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].workdir, None);
        assert_eq!(runs[1].workdir.as_deref(), Some("/tmp"));
        assert_eq!(runs[1].user.as_deref(), Some("nobody"));
        assert_eq!(runs[2].workdir, None);
        assert_eq!(runs[2].user, None);
    }

    #[tokio::test]
    async fn test_copy_digest_joins_cache_key() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("motd"), "v1").unwrap();
        let config = BuildConfig {
            file_name: tmp.path().join("box.plan"),
            ..quiet_config()
        };
        let engine = MemoryEngine::new();
        let cache = Arc::new(StepCache::in_memory());
        let scope = CancelScope::new();
        let source = "from alpine\ncopy motd /etc/motd";

        let mut first = builder(&engine, &config).with_cache(Some(cache.clone()));
        let v1 = first.run(&plan(source), &scope).await;
        assert!(v1.is_ok(), "{:?}", v1.error);
        assert_eq!(engine.file(&v1.value, "/etc/motd").unwrap(), b"v1");

        std::fs::write(tmp.path().join("motd"), "v2").unwrap();
        let mut second = builder(&engine, &config).with_cache(Some(cache.clone()));
        let v2 = second.run(&plan(source), &scope).await;
        assert_ne!(v1.value, v2.value);
        assert_eq!(engine.file(&v2.value, "/etc/motd").unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_tag_requires_image() {
        let engine = MemoryEngine::new();
        let b = builder(&engine, &quiet_config());
        let err = b.tag("web:latest", &CancelScope::new()).await.unwrap_err();
        assert!(matches!(err, BoxError::PrerequisiteError { .. }));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tag_step_and_api() {
        let engine = MemoryEngine::new();
        let mut b = builder(&engine, &quiet_config());
        let scope = CancelScope::new();
        let result = b.run(&plan("from alpine\nrun make\ntag web:dev"), &scope).await;
        assert!(result.is_ok());
        assert_eq!(engine.tag_target("web:dev"), Some(result.value.clone()));

        b.tag("web:latest", &scope).await.unwrap();
        assert_eq!(engine.tag_target("web:latest"), Some(result.value));
    }

    #[tokio::test]
    async fn test_engine_error_fails_build() {
        let engine = MemoryEngine::new();
        engine.fail_on("false");
        let mut b = builder(&engine, &quiet_config());
        let result = b
            .run(&plan("from alpine\nrun false\nrun never"), &CancelScope::new())
            .await;
        assert!(matches!(
            result.error.as_deref(),
            Some(BoxError::EngineError(_))
        ));
        assert_eq!(run_commands(&engine).len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_scope_stops_build() {
        let engine = MemoryEngine::new();
        let mut b = builder(&engine, &quiet_config());
        let scope = CancelScope::new();
        scope.cancel();
        let result = b.run(&plan("from alpine\nrun make"), &scope).await;
        assert!(result.error.unwrap().is_cancelled());
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_evaluate_returns_last_value() {
        let engine = MemoryEngine::new();
        engine.seed_image("base", &[("/etc/passwd", PASSWD)]);
        let mut b = builder(&engine, &quiet_config());
        let scope = CancelScope::new();

        assert_eq!(b.evaluate(&plan("from base"), &scope).await.unwrap(), None);
        assert_eq!(
            b.evaluate(&plan("getuid alice"), &scope).await.unwrap(),
            Some("1000".to_string())
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let engine = MemoryEngine::new();
        let mut b = builder(&engine, &quiet_config());
        b.close().await.unwrap();
        b.close().await.unwrap();
        assert!(b.is_closed());
        let closes = engine
            .calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::Close))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_config_changes_for_steps() {
        let changes = config_changes(&Step::Expose {
            port: "80".to_string(),
        });
        assert_eq!(changes.expose, vec!["80".to_string()]);
        assert!(config_changes(&Step::Run {
            exec: vec!["true".to_string()]
        })
        .is_empty());
    }
}
