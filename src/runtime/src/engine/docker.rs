//! Docker CLI engine adapter.
//!
//! Drives the `docker` executable. Each invocation races the caller's
//! cancellation scope; a cancelled invocation drops (and kills) the child
//! process. Working containers are tracked and removed on [`Engine::close`].

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use box_core::cancel::CancelScope;
use box_core::error::{BoxError, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{ConfigChanges, ContainerHandle, Engine, ExecSpec, OutputFn};

/// Overrides the docker executable.
pub const DOCKER_ENV: &str = "BOX_DOCKER";

/// Parts of an image config a working container may override and commit
/// must restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageConfig {
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    user: Option<String>,
    working_dir: Option<String>,
}

/// Engine adapter for a local docker daemon.
pub struct DockerCli {
    docker: String,
    containers: Mutex<HashMap<String, ImageConfig>>,
    current: Mutex<String>,
    closed: AtomicBool,
}

impl DockerCli {
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
            containers: Mutex::new(HashMap::new()),
            current: Mutex::new(String::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Adapter using `BOX_DOCKER`, or `docker` from `PATH`.
    pub fn from_env() -> Self {
        let docker = std::env::var(DOCKER_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "docker".to_string());
        Self::new(docker)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run docker to completion and return stdout.
    async fn exec(&self, args: &[&str], scope: &CancelScope) -> Result<Vec<u8>> {
        scope.check()?;
        tracing::debug!(docker = %self.docker, args = ?args, "Running docker");

        let child = self.command(args).spawn().map_err(|e| {
            BoxError::EngineError(format!("Failed to spawn {}: {}", self.docker, e))
        })?;

        let output = scope
            .run(async { child.wait_with_output().await.map_err(BoxError::from) })
            .await?;

        if !output.status.success() {
            return Err(BoxError::EngineError(format!(
                "docker {} failed ({}): {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Run docker, streaming stdout and stderr lines to `output`.
    async fn exec_streaming(
        &self,
        args: &[&str],
        output: &OutputFn,
        scope: &CancelScope,
    ) -> Result<()> {
        scope.check()?;
        tracing::debug!(docker = %self.docker, args = ?args, "Running docker (streaming)");

        let mut child = self.command(args).spawn().map_err(|e| {
            BoxError::EngineError(format!("Failed to spawn {}: {}", self.docker, e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BoxError::EngineError("docker stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BoxError::EngineError("docker stderr not captured".to_string()))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let status = scope
            .run(async {
                let mut stdout_done = false;
                let mut stderr_done = false;
                while !(stdout_done && stderr_done) {
                    tokio::select! {
                        line = stdout_reader.next_line(), if !stdout_done => match line {
                            Ok(Some(line)) => output(&line),
                            Ok(None) => stdout_done = true,
                            Err(e) => {
                                tracing::warn!("Error reading stdout: {}", e);
                                stdout_done = true;
                            }
                        },
                        line = stderr_reader.next_line(), if !stderr_done => match line {
                            Ok(Some(line)) => output(&line),
                            Ok(None) => stderr_done = true,
                            Err(e) => {
                                tracing::warn!("Error reading stderr: {}", e);
                                stderr_done = true;
                            }
                        },
                    }
                }
                child.wait().await.map_err(BoxError::from)
            })
            .await?;

        if !status.success() {
            return Err(BoxError::EngineError(format!(
                "docker {} failed ({})",
                args.first().copied().unwrap_or_default(),
                status
            )));
        }
        Ok(())
    }

    async fn inspect_config(&self, image: &str, scope: &CancelScope) -> Result<ImageConfig> {
        let out = self
            .exec(
                &["image", "inspect", "--format", "{{json .Config}}", image],
                scope,
            )
            .await?;
        let text = String::from_utf8_lossy(&out);
        let text = text.trim();
        if text.is_empty() || text == "null" {
            return Ok(ImageConfig::default());
        }
        Ok(serde_json::from_str(text)?)
    }

    /// `docker create` with the image's entrypoint cleared.
    async fn create(&self, image: &str, exec: &ExecSpec, scope: &CancelScope) -> Result<String> {
        let mut args = vec!["create", "--entrypoint", ""];
        if let Some(user) = &exec.user {
            args.extend(["--user", user.as_str()]);
        }
        if let Some(workdir) = &exec.workdir {
            args.extend(["--workdir", workdir.as_str()]);
        }
        args.push(image);
        match &exec.cmd {
            Some(cmd) => args.extend(cmd.iter().map(String::as_str)),
            // Never started; docker only needs something to record.
            None => args.push("true"),
        }

        let out = self.exec(&args, scope).await?;
        let id = String::from_utf8_lossy(&out).trim().to_string();
        if id.is_empty() {
            return Err(BoxError::EngineError(
                "docker create returned no container id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn remove_container(&self, id: &str) {
        self.containers.lock().remove(id);
        // Removal must still happen after the build's scope was cancelled.
        let scope = CancelScope::new();
        if let Err(e) = self.exec(&["rm", "-f", id], &scope).await {
            tracing::warn!(container = %id, error = %e, "Failed to remove container");
        }
    }
}

impl std::fmt::Debug for DockerCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerCli")
            .field("docker", &self.docker)
            .field("containers", &self.containers.lock().len())
            .finish()
    }
}

#[async_trait]
impl Engine for DockerCli {
    fn name(&self) -> &str {
        "docker"
    }

    async fn resolve_base(&self, image: &str, scope: &CancelScope) -> Result<String> {
        if !self.image_exists(image, scope).await? {
            tracing::info!(image, "Pulling base image");
            self.exec(&["pull", image], scope).await?;
        }
        let out = self
            .exec(&["image", "inspect", "--format", "{{.Id}}", image], scope)
            .await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    async fn image_exists(&self, image: &str, scope: &CancelScope) -> Result<bool> {
        scope.check()?;
        let child = self.command(&["image", "inspect", image]).spawn().map_err(|e| {
            BoxError::EngineError(format!("Failed to spawn {}: {}", self.docker, e))
        })?;
        let output = scope
            .run(async { child.wait_with_output().await.map_err(BoxError::from) })
            .await?;
        Ok(output.status.success())
    }

    async fn run_command(
        &self,
        image: &str,
        exec: &ExecSpec,
        output: &OutputFn,
        scope: &CancelScope,
    ) -> Result<ContainerHandle> {
        let config = self.inspect_config(image, scope).await?;
        let id = self.create(image, exec, scope).await?;
        self.containers.lock().insert(id.clone(), config);

        if exec.cmd.is_some() {
            if let Err(e) = self.exec_streaming(&["start", "-a", &id], output, scope).await {
                self.remove_container(&id).await;
                return Err(e);
            }
        }

        Ok(ContainerHandle {
            id,
            image: image.to_string(),
        })
    }

    async fn copy_into(
        &self,
        container: &ContainerHandle,
        src: &Path,
        dst: &str,
        scope: &CancelScope,
    ) -> Result<()> {
        let src = src.to_string_lossy().to_string();
        let target = format!("{}:{}", container.id, dst);
        self.exec(&["cp", src.as_str(), target.as_str()], scope)
            .await?;
        Ok(())
    }

    async fn commit(
        &self,
        container: ContainerHandle,
        changes: &ConfigChanges,
        scope: &CancelScope,
    ) -> Result<String> {
        let base = self
            .containers
            .lock()
            .get(&container.id)
            .cloned()
            .unwrap_or_default();

        let lines = change_lines(&base, changes)?;
        let mut args = vec!["commit"];
        for line in &lines {
            args.extend(["--change", line.as_str()]);
        }
        args.push(container.id.as_str());

        let result = self.exec(&args, scope).await;
        self.remove_container(&container.id).await;

        let image = String::from_utf8_lossy(&result?).trim().to_string();
        *self.current.lock() = image.clone();
        Ok(image)
    }

    async fn tag(&self, image: &str, name: &str, scope: &CancelScope) -> Result<()> {
        self.exec(&["tag", image, name], scope).await?;
        Ok(())
    }

    async fn read_file(&self, image: &str, path: &str, scope: &CancelScope) -> Result<Vec<u8>> {
        let id = self.create(image, &ExecSpec::default(), scope).await?;
        self.containers.lock().insert(id.clone(), ImageConfig::default());

        let source = format!("{id}:{path}");
        let archive = self.exec(&["cp", source.as_str(), "-"], scope).await;
        self.remove_container(&id).await;

        first_file_in_tar(&archive?, path)
    }

    fn current_image_ref(&self) -> String {
        self.current.lock().clone()
    }

    fn use_image(&self, image: &str) {
        *self.current.lock() = image.to_string();
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let ids: Vec<String> = self.containers.lock().keys().cloned().collect();
        for id in ids {
            tracing::debug!(container = %id, "Removing working container");
            self.remove_container(&id).await;
        }
        Ok(())
    }
}

/// `docker commit --change` lines: restore what the working container
/// overrode, then apply the step's changes.
fn change_lines(base: &ImageConfig, changes: &ConfigChanges) -> Result<Vec<String>> {
    let mut lines = Vec::new();

    let cmd = changes.cmd.as_ref().or(base.cmd.as_ref());
    lines.push(format!(
        "CMD {}",
        serde_json::to_string(&cmd.cloned().unwrap_or_default())?
    ));

    let entrypoint = changes.entrypoint.as_ref().or(base.entrypoint.as_ref());
    lines.push(format!(
        "ENTRYPOINT {}",
        serde_json::to_string(&entrypoint.cloned().unwrap_or_default())?
    ));

    let user = changes
        .user
        .as_deref()
        .or(base.user.as_deref())
        .unwrap_or_default();
    if !user.is_empty() {
        lines.push(format!("USER {user}"));
    }

    let workdir = changes
        .workdir
        .as_deref()
        .or(base.working_dir.as_deref())
        .unwrap_or("/");
    lines.push(format!(
        "WORKDIR {}",
        if workdir.is_empty() { "/" } else { workdir }
    ));

    for (key, value) in &changes.env {
        lines.push(format!("ENV {}={}", key, serde_json::to_string(value)?));
    }
    for port in &changes.expose {
        lines.push(format!("EXPOSE {port}"));
    }
    for (key, value) in &changes.labels {
        lines.push(format!(
            "LABEL {}={}",
            serde_json::to_string(key)?,
            serde_json::to_string(value)?
        ));
    }
    Ok(lines)
}

/// Extract the first regular file from a `docker cp ... -` archive.
fn first_file_in_tar(archive: &[u8], path: &str) -> Result<Vec<u8>> {
    let mut ar = tar::Archive::new(archive);
    let entries = ar
        .entries()
        .map_err(|e| BoxError::EngineError(format!("Invalid archive for {path}: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| BoxError::EngineError(format!("Invalid archive for {path}: {e}")))?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }

    Err(BoxError::EngineError(format!(
        "{path} is not a regular file"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_lines_restore_base() {
        let base = ImageConfig {
            cmd: Some(vec!["nginx".into()]),
            entrypoint: None,
            user: Some("www".into()),
            working_dir: Some("/srv".into()),
        };
        let lines = change_lines(&base, &ConfigChanges::default()).unwrap();
        assert_eq!(
            lines,
            vec![
                r#"CMD ["nginx"]"#.to_string(),
                "ENTRYPOINT []".to_string(),
                "USER www".to_string(),
                "WORKDIR /srv".to_string(),
            ]
        );
    }

    #[test]
    fn test_change_lines_apply_changes() {
        let changes = ConfigChanges {
            env: vec![("GREETING".into(), "hello world".into())],
            workdir: Some("/app".into()),
            expose: vec!["8080/tcp".into()],
            labels: vec![("maintainer".into(), "ops".into())],
            ..Default::default()
        };
        let lines = change_lines(&ImageConfig::default(), &changes).unwrap();
        assert!(lines.contains(&"WORKDIR /app".to_string()));
        assert!(lines.contains(&r#"ENV GREETING="hello world""#.to_string()));
        assert!(lines.contains(&"EXPOSE 8080/tcp".to_string()));
        assert!(lines.contains(&r#"LABEL "maintainer"="ops""#.to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("USER")));
    }

    #[test]
    fn test_image_config_from_inspect_json() {
        let json = r#"{"Cmd":["/bin/sh"],"Entrypoint":null,"User":"","WorkingDir":"","Env":["PATH=/bin"]}"#;
        let config: ImageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cmd, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(config.entrypoint, None);
        assert_eq!(config.working_dir.as_deref(), Some(""));
    }

    #[test]
    fn test_first_file_in_tar() {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"root:x:0:0:root:/root:/bin/sh\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "passwd", &data[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        let content = first_file_in_tar(&archive, "/etc/passwd").unwrap();
        assert_eq!(content, data);
    }

    #[test]
    fn test_first_file_in_empty_tar() {
        let archive = tar::Builder::new(Vec::new()).into_inner().unwrap();
        assert!(first_file_in_tar(&archive, "/etc").is_err());
    }

    #[tokio::test]
    async fn test_missing_docker_binary_is_engine_error() {
        let engine = DockerCli::new("/nonexistent/box-docker");
        let scope = CancelScope::new();
        let err = engine.tag("a", "b", &scope).await.unwrap_err();
        assert!(matches!(err, BoxError::EngineError(_)));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_scope_spawns_nothing() {
        let engine = DockerCli::new("/nonexistent/box-docker");
        let scope = CancelScope::new();
        scope.cancel();
        let err = engine.read_file("alpine", "/etc/passwd", &scope).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
