//! Engine adapters.
//!
//! An [`Engine`] performs the image-building primitives: run a command in a
//! working container, copy files into it, commit it as a new image, tag and
//! read images. Every call takes the [`CancelScope`] of the build or
//! statement it belongs to and must return promptly once that scope is
//! cancelled.

pub mod docker;
pub mod memory;

use std::path::Path;

use async_trait::async_trait;
use box_core::cancel::CancelScope;
use box_core::error::Result;
use serde::{Deserialize, Serialize};

pub use docker::DockerCli;
pub use memory::MemoryEngine;

/// Receives `run` output one line at a time.
pub type OutputFn = dyn Fn(&str) + Send + Sync;

/// How to start a working container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecSpec {
    /// Command to run; `None` only creates the container
    pub cmd: Option<Vec<String>>,
    /// User override (`with_user` blocks)
    pub user: Option<String>,
    /// Working directory override (`inside` blocks)
    pub workdir: Option<String>,
}

/// A working container created from an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    /// Image the container was created from
    pub image: String,
}

/// Image configuration changes applied at commit time, on top of the
/// parent image's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChanges {
    pub env: Vec<(String, String)>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub expose: Vec<String>,
    pub labels: Vec<(String, String)>,
}

impl ConfigChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Layer `other` over `self`: scalars are replaced, lists extended.
    pub fn merge(&mut self, other: &ConfigChanges) {
        for (key, value) in &other.env {
            self.env.retain(|(k, _)| k != key);
            self.env.push((key.clone(), value.clone()));
        }
        if other.user.is_some() {
            self.user.clone_from(&other.user);
        }
        if other.workdir.is_some() {
            self.workdir.clone_from(&other.workdir);
        }
        if other.cmd.is_some() {
            self.cmd.clone_from(&other.cmd);
        }
        if other.entrypoint.is_some() {
            self.entrypoint.clone_from(&other.entrypoint);
        }
        for port in &other.expose {
            if !self.expose.contains(port) {
                self.expose.push(port.clone());
            }
        }
        for (key, value) in &other.labels {
            self.labels.retain(|(k, _)| k != key);
            self.labels.push((key.clone(), value.clone()));
        }
    }
}

/// Boundary to a container engine.
///
/// `run_command`, `copy_into`, `commit` and `tag` change engine state;
/// everything else only reads it.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Short adapter name for logs.
    fn name(&self) -> &str;

    /// Resolve (pulling if needed) a base image to an image reference.
    async fn resolve_base(&self, image: &str, scope: &CancelScope) -> Result<String>;

    /// Whether an image is still present.
    async fn image_exists(&self, image: &str, scope: &CancelScope) -> Result<bool>;

    /// Create a working container from `image` and, if given, run a command
    /// in it. A non-zero exit is an engine error.
    async fn run_command(
        &self,
        image: &str,
        exec: &ExecSpec,
        output: &OutputFn,
        scope: &CancelScope,
    ) -> Result<ContainerHandle>;

    /// Copy a host file or directory into a working container.
    async fn copy_into(
        &self,
        container: &ContainerHandle,
        src: &Path,
        dst: &str,
        scope: &CancelScope,
    ) -> Result<()>;

    /// Commit a working container as a new image and dispose of it.
    async fn commit(
        &self,
        container: ContainerHandle,
        changes: &ConfigChanges,
        scope: &CancelScope,
    ) -> Result<String>;

    async fn tag(&self, image: &str, name: &str, scope: &CancelScope) -> Result<()>;

    /// Read a file from an image's filesystem.
    async fn read_file(&self, image: &str, path: &str, scope: &CancelScope) -> Result<Vec<u8>>;

    /// Image most recently produced or selected through this adapter.
    fn current_image_ref(&self) -> String;

    /// Record `image` as the current image (cache hits go through here).
    fn use_image(&self, image: &str);

    /// Release everything this adapter created. Idempotent.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_changes_empty() {
        assert!(ConfigChanges::default().is_empty());
        let changes = ConfigChanges {
            workdir: Some("/app".to_string()),
            ..Default::default()
        };
        assert!(!changes.is_empty());
    }

    #[test]
    fn test_config_changes_merge() {
        let mut base = ConfigChanges {
            env: vec![("PATH".into(), "/bin".into()), ("A".into(), "1".into())],
            user: Some("root".into()),
            expose: vec!["80".into()],
            ..Default::default()
        };
        base.merge(&ConfigChanges {
            env: vec![("A".into(), "2".into())],
            workdir: Some("/srv".into()),
            expose: vec!["80".into(), "443".into()],
            ..Default::default()
        });

        assert_eq!(
            base.env,
            vec![("PATH".into(), "/bin".into()), ("A".into(), "2".into())]
        );
        assert_eq!(base.user.as_deref(), Some("root"));
        assert_eq!(base.workdir.as_deref(), Some("/srv"));
        assert_eq!(base.expose, vec!["80".to_string(), "443".to_string()]);
    }
}
