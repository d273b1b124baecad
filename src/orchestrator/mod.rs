//! Top-level facade: parse a manifest, schedule its instructions and fold
//! the outcome into a [`RunSummary`].
//!
//! This is the only layer that turns errors into a response object instead
//! of propagating them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use crate::config::ExecutorConfig;
use crate::core::{Scheduler, SchedulerRun};
use crate::error::VexecResult;
use crate::handlers::{Context, HandlerTable};
use crate::manifest::{Manifest, ManifestHeader, ManifestParser, sample_instructions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

/// Outcome of [`Orchestrator::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub execution_time: Duration,
    pub instruction_count: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    fn from_run(run: &SchedulerRun, execution_time: Duration) -> Self {
        Self {
            status: RunStatus::Success,
            execution_time,
            instruction_count: run.total,
            completed: run.completed,
            failed: run.failed,
            error: None,
        }
    }

    fn from_error(message: String, execution_time: Duration) -> Self {
        Self {
            status: RunStatus::Error,
            execution_time,
            instruction_count: 0,
            completed: 0,
            failed: 0,
            error: Some(message),
        }
    }

    /// The manifest ran and every instruction succeeded.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success && self.failed == 0
    }
}

pub struct Orchestrator {
    config: Arc<ExecutorConfig>,
    scheduler: Scheduler,
}

impl Orchestrator {
    pub fn new(config: ExecutorConfig) -> VexecResult<Self> {
        Self::with_handlers(config, HandlerTable::with_defaults())
    }

    pub fn with_handlers(config: ExecutorConfig, handlers: HandlerTable) -> VexecResult<Self> {
        let config = Arc::new(config);
        Ok(Self {
            scheduler: Scheduler::with_handlers(config.clone(), handlers)?,
            config,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Parse and run the manifest at `path`.
    pub async fn run(&self, path: &Path) -> RunSummary {
        let started = Instant::now();

        let manifest = match ManifestParser::parse(path).await {
            Ok(manifest) => manifest,
            Err(e) => {
                error!("Failed to load manifest {}: {}", path.display(), e);
                return RunSummary::from_error(e.to_string(), started.elapsed());
            }
        };

        let context = match Self::shared_context(&manifest.header) {
            Ok(context) => context,
            Err(e) => return RunSummary::from_error(e.to_string(), started.elapsed()),
        };

        info!(
            "Running manifest {} ({} instructions)",
            path.display(),
            manifest.len()
        );
        let run = self.scheduler.schedule(manifest.body, context).await;
        RunSummary::from_run(&run, started.elapsed())
    }

    /// Read-only context shared by every instruction of one manifest.
    fn shared_context(header: &ManifestHeader) -> VexecResult<Context> {
        let mut context = Context::new();
        context.insert("header".to_string(), serde_json::to_value(header)?);
        context.insert("executor".to_string(), json!({ "version": env!("CARGO_PKG_VERSION") }));
        Ok(context)
    }

    /// Parse `path` without running it.
    pub async fn validate(&self, path: &Path) -> VexecResult<Manifest> {
        ManifestParser::parse(path).await
    }

    /// Write a content-addressed artifact into `output_dir`.
    ///
    /// With a `source` manifest its header and instructions are reused;
    /// otherwise the built-in sample body is emitted.
    pub async fn generate(&self, output_dir: &Path, source: Option<&Path>) -> VexecResult<PathBuf> {
        match source {
            Some(source) => {
                let manifest = ManifestParser::parse(source).await?;
                ManifestParser::generate_with_header(output_dir, manifest.header, &manifest.body).await
            }
            None => ManifestParser::generate(output_dir, &sample_instructions()).await,
        }
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator(root: &Path) -> Orchestrator {
        Orchestrator::new(ExecutorConfig {
            max_units: 4,
            workspace_root: root.join("ws").display().to_string(),
            boot_delay_ms: 0,
            backoff_ms: 1,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_missing_manifest_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        let summary = orchestrator.run(&dir.path().join("absent.json")).await;
        assert_eq!(summary.status, RunStatus::Error);
        assert!(summary.error.unwrap().contains("not found"));
        assert_eq!(summary.instruction_count, 0);
    }

    #[tokio::test]
    async fn test_run_mixed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let path = dir.path().join("mixed.json");
        std::fs::write(
            &path,
            r#"{"header": {}, "body": [
                {"type": "NOP"},
                {"type": "VERIFY_HASH", "file": "missing.bin", "hash": "deadbeef"}
            ]}"#,
        )
        .unwrap();

        let summary = orchestrator.run(&path).await;
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.instruction_count, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.is_success());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_generate_then_run_sample() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        let artifact = orchestrator.generate(&dir.path().join("out"), None).await.unwrap();
        let manifest = orchestrator.validate(&artifact).await.unwrap();
        assert_eq!(manifest.body, sample_instructions());

        let regenerated = orchestrator
            .generate(&dir.path().join("again"), Some(&artifact))
            .await
            .unwrap();
        assert_eq!(artifact.file_name(), regenerated.file_name());

        let summary = orchestrator.run(&artifact).await;
        assert!(summary.is_success());
        assert_eq!(summary.completed, sample_instructions().len());

        orchestrator.shutdown().await;
    }
}
