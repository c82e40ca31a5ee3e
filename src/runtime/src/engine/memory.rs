//! In-process engine adapter.
//!
//! Keeps images as in-memory file maps with content-addressed ids, so builds
//! are deterministic and need no daemon. Every call is recorded; tests use
//! the call log to assert which engine operations a build performed.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use box_core::cancel::CancelScope;
use box_core::error::{BoxError, Result};
use parking_lot::Mutex;

use super::{ConfigChanges, ContainerHandle, Engine, ExecSpec, OutputFn};
use crate::cache::{sha256_bytes, sha256_path};

/// One recorded adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    ResolveBase { image: String },
    ImageExists { image: String },
    RunCommand { image: String, exec: ExecSpec },
    CopyInto { container: String, dst: String },
    Commit { container: String },
    Tag { image: String, name: String },
    ReadFile { image: String, path: String },
    Close,
}

impl EngineCall {
    /// Calls that change engine state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            EngineCall::RunCommand { .. }
                | EngineCall::CopyInto { .. }
                | EngineCall::Commit { .. }
                | EngineCall::Tag { .. }
        )
    }
}

#[derive(Debug, Clone, Default)]
struct MemImage {
    files: BTreeMap<String, Vec<u8>>,
    config: ConfigChanges,
}

#[derive(Debug)]
struct MemContainer {
    image: String,
    files: BTreeMap<String, Vec<u8>>,
    ops: Vec<String>,
}

#[derive(Default)]
struct State {
    images: HashMap<String, MemImage>,
    tags: HashMap<String, String>,
    containers: HashMap<String, MemContainer>,
    calls: Vec<EngineCall>,
    failures: Vec<String>,
    delay: Option<Duration>,
    current: String,
    next_container: u64,
    removed_containers: usize,
    closed: bool,
}

impl State {
    fn resolve(&self, image: &str) -> Option<String> {
        if self.images.contains_key(image) {
            Some(image.to_string())
        } else {
            self.tags.get(image).cloned()
        }
    }
}

/// Deterministic in-memory engine. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<State>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, observing cancellation while waiting.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state.lock().delay = Some(delay);
        self
    }

    /// Make `run` fail for commands containing `pattern`.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.state.lock().failures.push(pattern.into());
    }

    /// Add a base image with the given files, tagged as `name`.
    pub fn seed_image(&self, name: &str, files: &[(&str, &str)]) -> String {
        let mut material = format!("seed:{name}\n");
        for (path, content) in files {
            material.push_str(&format!("{path}={}\n", sha256_bytes(content.as_bytes())));
        }
        let id = format!("sha256:{}", sha256_bytes(material.as_bytes()));

        let image = MemImage {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
                .collect(),
            config: ConfigChanges::default(),
        };

        let mut state = self.state.lock();
        state.images.insert(id.clone(), image);
        state.tags.insert(name.to_string(), id.clone());
        id
    }

    /// Forget an image, as if pruned behind our back.
    pub fn remove_image(&self, image: &str) {
        let mut state = self.state.lock();
        state.images.remove(image);
        state.tags.retain(|_, id| id != image);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    pub fn mutating_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.is_mutating())
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Image a tag points at.
    pub fn tag_target(&self, name: &str) -> Option<String> {
        self.state.lock().tags.get(name).cloned()
    }

    pub fn file(&self, image: &str, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let id = state.resolve(image)?;
        state.images.get(&id)?.files.get(path).cloned()
    }

    /// Accumulated configuration of an image.
    pub fn config(&self, image: &str) -> Option<ConfigChanges> {
        let state = self.state.lock();
        let id = state.resolve(image)?;
        state.images.get(&id).map(|i| i.config.clone())
    }

    /// Working containers not yet committed or removed.
    pub fn open_containers(&self) -> usize {
        self.state.lock().containers.len()
    }

    /// Containers discarded by `close`.
    pub fn removed_containers(&self) -> usize {
        self.state.lock().removed_containers
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn record(&self, call: EngineCall) {
        self.state.lock().calls.push(call);
    }

    async fn pause(&self, scope: &CancelScope) -> Result<()> {
        let delay = self.state.lock().delay;
        match delay {
            Some(delay) => {
                scope
                    .run(async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await
            }
            None => scope.check(),
        }
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn resolve_base(&self, image: &str, scope: &CancelScope) -> Result<String> {
        self.record(EngineCall::ResolveBase {
            image: image.to_string(),
        });
        self.pause(scope).await?;

        let mut state = self.state.lock();
        if let Some(id) = state.resolve(image) {
            return Ok(id);
        }

        // Unknown names "pull" as empty images.
        let id = format!("sha256:{}", sha256_bytes(format!("pull:{image}").as_bytes()));
        state.images.insert(id.clone(), MemImage::default());
        state.tags.insert(image.to_string(), id.clone());
        tracing::debug!(image, id = %id, "Pulled image");
        Ok(id)
    }

    async fn image_exists(&self, image: &str, scope: &CancelScope) -> Result<bool> {
        self.record(EngineCall::ImageExists {
            image: image.to_string(),
        });
        self.pause(scope).await?;
        Ok(self.state.lock().resolve(image).is_some())
    }

    async fn run_command(
        &self,
        image: &str,
        exec: &ExecSpec,
        _output: &OutputFn,
        scope: &CancelScope,
    ) -> Result<ContainerHandle> {
        self.record(EngineCall::RunCommand {
            image: image.to_string(),
            exec: exec.clone(),
        });
        self.pause(scope).await?;

        let mut state = self.state.lock();
        let id = state
            .resolve(image)
            .ok_or_else(|| BoxError::EngineError(format!("No such image: {image}")))?;

        if let Some(cmd) = &exec.cmd {
            let line = cmd.join(" ");
            if state.failures.iter().any(|p| line.contains(p.as_str())) {
                return Err(BoxError::EngineError(format!(
                    "Command {cmd:?} exited with status 1"
                )));
            }
        }

        let files = state
            .images
            .get(&id)
            .map(|i| i.files.clone())
            .unwrap_or_default();
        let ops = vec![serde_json::to_string(exec)?];

        state.next_container += 1;
        let container = format!("mem-{}", state.next_container);
        state.containers.insert(
            container.clone(),
            MemContainer {
                image: id.clone(),
                files,
                ops,
            },
        );

        Ok(ContainerHandle {
            id: container,
            image: id,
        })
    }

    async fn copy_into(
        &self,
        container: &ContainerHandle,
        src: &Path,
        dst: &str,
        scope: &CancelScope,
    ) -> Result<()> {
        self.record(EngineCall::CopyInto {
            container: container.id.clone(),
            dst: dst.to_string(),
        });
        self.pause(scope).await?;

        let digest = sha256_path(src)?;
        let files = collect_host_files(src, dst)?;

        let mut state = self.state.lock();
        let ctr = state.containers.get_mut(&container.id).ok_or_else(|| {
            BoxError::EngineError(format!("No such container: {}", container.id))
        })?;
        ctr.files.extend(files);
        ctr.ops.push(format!("copy:{dst}:{digest}"));
        Ok(())
    }

    async fn commit(
        &self,
        container: ContainerHandle,
        changes: &ConfigChanges,
        scope: &CancelScope,
    ) -> Result<String> {
        self.record(EngineCall::Commit {
            container: container.id.clone(),
        });
        self.pause(scope).await?;

        let mut state = self.state.lock();
        let ctr = state.containers.remove(&container.id).ok_or_else(|| {
            BoxError::EngineError(format!("No such container: {}", container.id))
        })?;

        let mut config = state
            .images
            .get(&ctr.image)
            .map(|i| i.config.clone())
            .unwrap_or_default();
        config.merge(changes);

        let mut material = format!("{}\n", ctr.image);
        for op in &ctr.ops {
            material.push_str(op);
            material.push('\n');
        }
        material.push_str(&serde_json::to_string(changes)?);
        let id = format!("sha256:{}", sha256_bytes(material.as_bytes()));

        state.images.insert(
            id.clone(),
            MemImage {
                files: ctr.files,
                config,
            },
        );
        state.current = id.clone();
        Ok(id)
    }

    async fn tag(&self, image: &str, name: &str, scope: &CancelScope) -> Result<()> {
        self.record(EngineCall::Tag {
            image: image.to_string(),
            name: name.to_string(),
        });
        self.pause(scope).await?;

        let mut state = self.state.lock();
        let id = state
            .resolve(image)
            .ok_or_else(|| BoxError::EngineError(format!("No such image: {image}")))?;
        state.tags.insert(name.to_string(), id);
        Ok(())
    }

    async fn read_file(&self, image: &str, path: &str, scope: &CancelScope) -> Result<Vec<u8>> {
        self.record(EngineCall::ReadFile {
            image: image.to_string(),
            path: path.to_string(),
        });
        self.pause(scope).await?;

        let state = self.state.lock();
        let id = state
            .resolve(image)
            .ok_or_else(|| BoxError::EngineError(format!("No such image: {image}")))?;
        state
            .images
            .get(&id)
            .and_then(|i| i.files.get(path))
            .cloned()
            .ok_or_else(|| {
                BoxError::EngineError(format!("Could not find the file {path} in image {image}"))
            })
    }

    fn current_image_ref(&self) -> String {
        self.state.lock().current.clone()
    }

    fn use_image(&self, image: &str) {
        self.state.lock().current = image.to_string();
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::Close);
        if state.closed {
            return Ok(());
        }
        let open = state.containers.len();
        state.containers.clear();
        state.removed_containers += open;
        state.closed = true;
        Ok(())
    }
}

/// Map a host file or tree onto image paths under `dst`.
fn collect_host_files(src: &Path, dst: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let meta = std::fs::metadata(src).map_err(|e| {
        BoxError::EngineError(format!("Failed to stat {}: {}", src.display(), e))
    })?;

    if meta.is_file() {
        let target = if dst.ends_with('/') {
            let name = src
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            format!("{dst}{name}")
        } else {
            dst.to_string()
        };
        return Ok(vec![(target, std::fs::read(src)?)]);
    }

    let mut out = Vec::new();
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let child_dst = format!("{}/{}", dst.trim_end_matches('/'), name);
        out.extend(collect_host_files(&entry.path(), &child_dst)?);
    }
    Ok(out)
}
