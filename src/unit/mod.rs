//! Execution units: the workers that actually run instructions.
//!
//! A unit owns one [`Workspace`] and one [`RegisterStore`] for its whole
//! life. It boots lazily on its first instruction, runs instructions one at a
//! time behind its own lock, and is torn down by [`ExecutionUnit::shutdown`].
//!
//! ```text
//! Idle -> Booting -> Ready -> Busy -> Ready -> ... -> ShuttingDown -> Shutdown
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{VexecError, VexecResult};
use crate::handlers::{Context, HandlerContext, HandlerTable};
use crate::integrity::IntegrityService;
use crate::manifest::{Instruction, InstructionKind};
use crate::memory::{LoadOutcome, RegisterStore};
use crate::types::UnitLabel;
use crate::utils::{fingerprint, merge_json_objects};
use crate::workspace::Workspace;

/// Timestamp format used at the start of every result log line.
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum UnitState {
    Idle,
    Booting,
    Ready,
    Busy,
    ShuttingDown,
    Shutdown,
}

impl UnitState {
    fn from_repr(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Booting,
            2 => Self::Ready,
            3 => Self::Busy,
            4 => Self::ShuttingDown,
            _ => Self::Shutdown,
        }
    }

    fn is_final(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Shutdown)
    }
}

/// Current state, readable without the unit lock. Only written while the
/// unit lock is held.
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: UnitState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> UnitState {
        UnitState::from_repr(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: UnitState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error { code: String, reason: String },
}

impl ExecutionStatus {
    fn from_error(error: &VexecError) -> Self {
        Self::Error {
            code: error.code().to_string(),
            reason: error.to_string(),
        }
    }
}

/// Outcome of one attempt at one instruction.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub unit_id: usize,
    pub label: UnitLabel,
    pub kind: InstructionKind,
    pub status: ExecutionStatus,
    /// 1-based attempt number; 0 when the unit refused the instruction.
    pub attempt: u32,
    pub duration: Duration,
    /// Truncated digest of the instruction and shared context.
    pub fingerprint: String,
    pub finished_at: DateTime<Utc>,
    pub output: Option<String>,
}

impl ExecutionResult {
    /// Result for an instruction that never reached a unit, e.g. because the
    /// unit could not be created.
    pub fn rejected(unit_id: usize, instruction: &Instruction, error: &VexecError) -> Self {
        Self {
            unit_id,
            label: UnitLabel::for_unit(unit_id),
            kind: instruction.kind.clone(),
            status: ExecutionStatus::from_error(error),
            attempt: 0,
            duration: Duration::ZERO,
            fingerprint: fingerprint(instruction),
            finished_at: Utc::now(),
            output: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Single-line structured summary of this attempt.
    pub fn log_line(&self) -> String {
        let status = match &self.status {
            ExecutionStatus::Success => "ok".to_string(),
            ExecutionStatus::Error { code, .. } => format!("error:{code}"),
        };
        format!(
            "{} unit={} type={} status={} fingerprint={} duration_ms={}",
            self.finished_at.format(LOG_TIMESTAMP_FORMAT),
            self.label,
            self.kind,
            status,
            self.fingerprint,
            self.duration.as_millis()
        )
    }
}

struct UnitInner {
    workspace: Workspace,
    store: RegisterStore,
    /// Process environment built at boot.
    env: BTreeMap<String, String>,
    /// Unit-local context: base environment plus rc settings.
    context: Value,
    history: Vec<ExecutionResult>,
}

pub struct ExecutionUnit {
    id: usize,
    label: UnitLabel,
    state: StateCell,
    inner: Mutex<UnitInner>,
    handlers: Arc<HandlerTable>,
    config: Arc<ExecutorConfig>,
    integrity: Arc<IntegrityService>,
}

impl ExecutionUnit {
    /// Create a unit whose workspace lives under `parent`.
    pub async fn new(
        id: usize,
        parent: &Path,
        handlers: Arc<HandlerTable>,
        config: Arc<ExecutorConfig>,
        integrity: Arc<IntegrityService>,
    ) -> VexecResult<Self> {
        let label = UnitLabel::for_unit(id);
        let workspace = Workspace::create(parent, label.as_str()).await?;
        let store = RegisterStore::new(config.compress_snapshots);

        debug!("Created {} at {}", label, workspace.root().display());
        Ok(Self {
            id,
            label,
            state: StateCell::new(UnitState::Idle),
            inner: Mutex::new(UnitInner {
                workspace,
                store,
                env: BTreeMap::new(),
                context: Value::Null,
                history: Vec::new(),
            }),
            handlers,
            config,
            integrity,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn label(&self) -> &UnitLabel {
        &self.label
    }

    pub fn state(&self) -> UnitState {
        self.state.get()
    }

    /// Every attempt this unit has made, oldest first.
    pub async fn history(&self) -> Vec<ExecutionResult> {
        self.inner.lock().await.history.clone()
    }

    /// The unit-local context assembled during boot.
    pub async fn local_context(&self) -> Value {
        self.inner.lock().await.context.clone()
    }

    pub async fn workspace_root(&self) -> PathBuf {
        self.inner.lock().await.workspace.root().to_path_buf()
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.config
            .snapshot_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", self.label)))
    }

    /// Run `instruction`, retrying transient failures, and return the final
    /// attempt's result.
    pub async fn execute_instruction(
        &self,
        instruction: &Instruction,
        context: Arc<Context>,
    ) -> ExecutionResult {
        let mut inner = self.inner.lock().await;
        let fingerprint = fingerprint(&(instruction, context.as_ref()));

        if self.state.get().is_final() {
            let result = self.result(
                instruction,
                Err(&VexecError::UnitShutdown(self.id)),
                0,
                Duration::ZERO,
                &fingerprint,
            );
            warn!("{}", result.log_line());
            return result;
        }

        if self.state.get() == UnitState::Idle {
            self.boot(&mut inner).await;
        }
        self.state.set(UnitState::Busy);

        let handler = self.handlers.resolve(&instruction.kind);
        debug!("{} dispatching {} to {}", self.label, instruction.kind, handler.name());

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let started = Instant::now();

            let outcome = {
                let ctx = HandlerContext {
                    unit_id: self.id,
                    workspace: &inner.workspace,
                    store: &inner.store,
                    env: &inner.env,
                    context: context.as_ref(),
                    config: self.config.as_ref(),
                    integrity: self.integrity.as_ref(),
                };
                handler.execute(instruction, &ctx).await
            };

            let result = self.result(
                instruction,
                outcome.as_ref().map(|out| out.detail.clone()),
                attempt,
                started.elapsed(),
                &fingerprint,
            );
            inner.history.push(result.clone());

            match outcome {
                Ok(_) => {
                    info!("{}", result.log_line());
                    break result;
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!("{}", result.log_line());
                    let backoff = self.config.backoff(attempt);
                    warn!(
                        "{} attempt {}/{} of {} failed ({}), retrying in {:?}",
                        self.label, attempt, max_attempts, instruction.kind, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(_) => {
                    warn!("{}", result.log_line());
                    break result;
                }
            }
        };

        self.state.set(UnitState::Ready);
        result
    }

    fn result(
        &self,
        instruction: &Instruction,
        outcome: Result<Option<String>, &VexecError>,
        attempt: u32,
        duration: Duration,
        fingerprint: &str,
    ) -> ExecutionResult {
        let (status, output) = match outcome {
            Ok(output) => (ExecutionStatus::Success, output),
            Err(e) => (ExecutionStatus::from_error(e), None),
        };
        ExecutionResult {
            unit_id: self.id,
            label: self.label.clone(),
            kind: instruction.kind.clone(),
            status,
            attempt,
            duration,
            fingerprint: fingerprint.to_string(),
            finished_at: Utc::now(),
            output,
        }
    }

    /// Boot sequence. Problems are logged and the unit comes up anyway.
    async fn boot(&self, inner: &mut UnitInner) {
        self.state.set(UnitState::Booting);
        info!("Booting {}", self.label);

        // Power-on self-test.
        tokio::time::sleep(self.config.boot_delay()).await;

        if let Err(e) = self.load_environment(inner) {
            warn!("{} environment setup failed: {}", self.label, e);
        }

        inner.workspace.prepare_overlay(&self.config.lower_layers);

        if let Some(path) = self.snapshot_path() {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                if let LoadOutcome::Loaded(cells) = inner.store.load(&path).await {
                    info!("{} restored {} memory cells", self.label, cells);
                }
            }
        }

        self.state.set(UnitState::Ready);
        debug!("{} ready", self.label);
    }

    /// Build the process environment and the unit-local context from the
    /// base layer and the rc layer.
    fn load_environment(&self, inner: &mut UnitInner) -> VexecResult<()> {
        let workspace = &inner.workspace;
        let rc = &self.config.rc;

        let env = BTreeMap::from([
            ("PATH".to_string(), self.config.base_path.clone()),
            ("HOME".to_string(), workspace.root().display().to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("TMPDIR".to_string(), workspace.tmp_dir().display().to_string()),
            ("VEXEC_UNIT".to_string(), self.label.to_string()),
            ("VEXEC_MAX_THREADS".to_string(), rc.max_threads.to_string()),
            ("VEXEC_MEMORY_LIMIT_MB".to_string(), rc.memory_limit_mb.to_string()),
            ("VEXEC_SECURITY_LEVEL".to_string(), rc.security_level.clone()),
        ]);

        let base = json!({
            "unit": self.label,
            "env": env,
        });
        let rc_layer = json!({ "rc": serde_json::to_value(rc)? });

        inner.context = merge_json_objects(base, rc_layer);
        inner.env = env;
        Ok(())
    }

    /// Persist the register store if configured, then remove the workspace.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if self.state.get().is_final() {
            return;
        }
        self.state.set(UnitState::ShuttingDown);

        if let Some(path) = self.snapshot_path() {
            if let Err(e) = inner.store.save(&path).await {
                warn!("{} failed to save snapshot {}: {}", self.label, path.display(), e);
            }
        }

        inner.workspace.cleanup().await;
        self.state.set(UnitState::Shutdown);
        info!("{} shut down after {} attempts", self.label, inner.history.len());
    }
}
