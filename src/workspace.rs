//! Per-unit isolated workspace.
//!
//! A workspace is a scratch directory tree owned by exactly one execution
//! unit, plus bookkeeping of the layered mounts a real sandbox backend would
//! set up (read-only lower layers, a writable upper layer, a work dir and a
//! merge point). No kernel mounts are performed; the descriptors are recorded
//! so they can be inspected and replaced by a real backend later.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{VexecError, VexecResult};

/// Role of a recorded mount layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountRole {
    Lower,
    Upper,
    Work,
    Merged,
}

/// One recorded mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountDescriptor {
    pub role: MountRole,
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

/// Scratch directory tree plus mount bookkeeping for one unit.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    mounts: Vec<MountDescriptor>,
    cleaned: bool,
}

impl Workspace {
    /// Create the workspace directory (and its `tmp`, `upper`, `work`,
    /// `merged` subdirectories) under `parent`.
    pub async fn create(parent: &Path, name: &str) -> VexecResult<Self> {
        let root = parent.join(name);
        for sub in ["tmp", "upper", "work", "merged"] {
            tokio::fs::create_dir_all(root.join(sub)).await.map_err(|e| {
                VexecError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create workspace directory {}: {}", root.display(), e),
                ))
            })?;
        }

        debug!("Created workspace {}", root.display());
        Ok(Self {
            root,
            mounts: Vec::new(),
            cleaned: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn upper_dir(&self) -> PathBuf {
        self.root.join("upper")
    }

    pub fn merged_dir(&self) -> PathBuf {
        self.root.join("merged")
    }

    /// Record a mount descriptor.
    pub fn record_mount(&mut self, descriptor: MountDescriptor) {
        debug!(
            "Recording {:?} mount {} -> {}",
            descriptor.role,
            descriptor.source.display(),
            descriptor.target.display()
        );
        self.mounts.push(descriptor);
    }

    /// Record an overlay: each of `lower_layers` read-only, then the
    /// workspace's upper, work and merged directories.
    pub fn prepare_overlay(&mut self, lower_layers: &[PathBuf]) {
        let merged = self.merged_dir();
        for layer in lower_layers {
            self.record_mount(MountDescriptor {
                role: MountRole::Lower,
                source: layer.clone(),
                target: merged.clone(),
                read_only: true,
            });
        }
        self.record_mount(MountDescriptor {
            role: MountRole::Upper,
            source: self.upper_dir(),
            target: merged.clone(),
            read_only: false,
        });
        self.record_mount(MountDescriptor {
            role: MountRole::Work,
            source: self.root.join("work"),
            target: merged.clone(),
            read_only: false,
        });
        self.record_mount(MountDescriptor {
            role: MountRole::Merged,
            source: merged.clone(),
            target: merged,
            read_only: false,
        });
    }

    pub fn mounts(&self) -> &[MountDescriptor] {
        &self.mounts
    }

    pub fn mounts_with_role(&self, role: MountRole) -> impl Iterator<Item = &MountDescriptor> {
        self.mounts.iter().filter(move |m| m.role == role)
    }

    /// Resolve a user-supplied path.
    ///
    /// Relative paths are joined onto the workspace root and may not climb
    /// out of it. Absolute paths are passed through unchanged.
    pub fn resolve(&self, requested: &str) -> VexecResult<PathBuf> {
        let requested_path = Path::new(requested);
        if requested_path.is_absolute() {
            return Ok(requested_path.to_path_buf());
        }

        let mut depth: usize = 0;
        for component in requested_path.components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::ParentDir => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| VexecError::PathEscape(requested.to_string()))?;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(VexecError::PathEscape(requested.to_string()));
                }
            }
        }

        Ok(self.root.join(requested_path))
    }

    /// Like [`Workspace::resolve`], but absolute paths are rejected too.
    /// Used for paths the executor writes to.
    pub fn confine(&self, requested: &str) -> VexecResult<PathBuf> {
        if Path::new(requested).is_absolute() {
            return Err(VexecError::PathEscape(requested.to_string()));
        }
        self.resolve(requested)
    }

    /// Remove the workspace tree and forget its mounts. Best-effort and
    /// idempotent: failures are logged, never returned.
    pub async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.mounts.clear();

        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!("Removed workspace {}", self.root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", self.root.display(), e),
        }
        self.cleaned = true;
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::create(dir.path(), "unit-0").await.unwrap();

        assert!(workspace.root().is_dir());
        assert!(workspace.tmp_dir().is_dir());

        workspace.cleanup().await;
        assert!(!workspace.root().exists());
        assert!(workspace.is_cleaned());

        // Second cleanup is a no-op.
        workspace.cleanup().await;
    }

    #[tokio::test]
    async fn test_overlay_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::create(dir.path(), "unit-1").await.unwrap();

        workspace.prepare_overlay(&[PathBuf::from("/opt/base"), PathBuf::from("/opt/tools")]);

        assert_eq!(workspace.mounts().len(), 5);
        assert_eq!(workspace.mounts_with_role(MountRole::Lower).count(), 2);
        assert!(workspace.mounts_with_role(MountRole::Lower).all(|m| m.read_only));

        let upper = workspace.mounts_with_role(MountRole::Upper).next().unwrap();
        assert_eq!(upper.source, workspace.upper_dir());
        assert_eq!(upper.target, workspace.merged_dir());

        workspace.cleanup().await;
        assert!(workspace.mounts().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_confines_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path(), "unit-2").await.unwrap();

        assert_eq!(
            workspace.resolve("repo/src/main.rs").unwrap(),
            workspace.root().join("repo/src/main.rs")
        );
        assert!(workspace.resolve("repo/../file.txt").is_ok());
        assert!(matches!(
            workspace.resolve("../outside"),
            Err(VexecError::PathEscape(_))
        ));
        assert!(matches!(
            workspace.resolve("a/../../outside"),
            Err(VexecError::PathEscape(_))
        ));
        assert_eq!(
            workspace.resolve("/etc/hosts").unwrap(),
            PathBuf::from("/etc/hosts")
        );
        assert!(matches!(
            workspace.confine("/etc/hosts"),
            Err(VexecError::PathEscape(_))
        ));
        assert!(workspace.confine("checkout/repo").is_ok());
    }
}
