use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, fs, path::PathBuf, time::Duration};

use crate::manifest::InstructionKind;

/// Default upper bound on the number of execution units.
pub const DEFAULT_MAX_UNITS: usize = 963;

/// Immutable executor configuration shared by the scheduler and every unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on the number of execution units.
    pub max_units: usize,
    /// Worker pool size; defaults to `max_units`.
    pub max_workers: Option<usize>,
    /// Attempts per instruction, including the first.
    pub max_attempts: u32,
    /// Base backoff; attempt `n` waits `n * backoff_ms` before retrying.
    pub backoff_ms: u64,
    /// Simulated power-on self-test delay during boot.
    pub boot_delay_ms: u64,
    /// Parent directory for unit workspaces. `${VAR}` references are expanded.
    pub workspace_root: String,
    /// Where units persist their register store snapshots, if anywhere.
    pub snapshot_dir: Option<PathBuf>,
    pub compress_snapshots: bool,
    /// Read-only layers recorded under each unit workspace.
    pub lower_layers: Vec<PathBuf>,
    /// `PATH` handed to external processes.
    pub base_path: String,
    pub timeouts: TimeoutConfig,
    pub priorities: PriorityTable,
    pub rc: RcConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_units: DEFAULT_MAX_UNITS,
            max_workers: None,
            max_attempts: 3,
            backoff_ms: 100,
            boot_delay_ms: 50,
            workspace_root: env::temp_dir().join("vexec").to_string_lossy().into_owned(),
            snapshot_dir: None,
            compress_snapshots: false,
            lower_layers: Vec::new(),
            base_path: "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            timeouts: TimeoutConfig::default(),
            priorities: PriorityTable::default(),
            rc: RcConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Load configuration.
    ///
    /// Resolution order: `explicit`, then `VEXEC_CONFIG`, then `./vexec.json`.
    /// Falls back to defaults when none of them exists.
    pub fn load(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        let Some(path) = resolve_config_path(explicit)? else {
            tracing::debug!("No vexec config found, using defaults");
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(&path)?;
        let mut config: ExecutorConfig = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
        config.workspace_root = expand_env_vars(&config.workspace_root);
        config.validate()?;

        tracing::info!("Loaded executor config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_units == 0 {
            return Err(anyhow::anyhow!("max_units must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("max_attempts must be at least 1"));
        }
        if self.max_workers == Some(0) {
            return Err(anyhow::anyhow!("max_workers must be at least 1"));
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.max_workers.unwrap_or(self.max_units).max(1)
    }

    pub fn workspace_root(&self) -> PathBuf {
        PathBuf::from(&self.workspace_root)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }

    pub fn timeout_for(&self, kind: &InstructionKind) -> Duration {
        self.timeouts.for_kind(kind)
    }
}

/// Per-instruction-type time budgets, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub fetch_repo_ms: u64,
    pub checkout_ms: u64,
    pub execute_ms: u64,
    pub install_ms: u64,
    pub compile_ms: u64,
    pub verify_hash_ms: u64,
    pub store_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch_repo_ms: 3_000,
            checkout_ms: 1_000,
            execute_ms: 2_000,
            install_ms: 10_000,
            compile_ms: 10_000,
            verify_hash_ms: 1_000,
            store_ms: 500,
        }
    }
}

impl TimeoutConfig {
    pub fn for_kind(&self, kind: &InstructionKind) -> Duration {
        let ms = match kind {
            InstructionKind::FetchRepo => self.fetch_repo_ms,
            InstructionKind::Checkout => self.checkout_ms,
            InstructionKind::Execute => self.execute_ms,
            InstructionKind::Install => self.install_ms,
            InstructionKind::Compile => self.compile_ms,
            InstructionKind::VerifyHash => self.verify_hash_ms,
            InstructionKind::Store
            | InstructionKind::Load
            | InstructionKind::Move
            | InstructionKind::Nop
            | InstructionKind::Unknown(_) => self.store_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Instruction type to priority; lower numbers run first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityTable {
    pub priorities: BTreeMap<String, u32>,
    /// Priority for types missing from the table. Must be the largest value.
    pub unknown_priority: u32,
}

impl Default for PriorityTable {
    fn default() -> Self {
        let priorities = [
            (InstructionKind::FetchRepo, 0),
            (InstructionKind::Checkout, 1),
            (InstructionKind::Install, 2),
            (InstructionKind::Compile, 3),
            (InstructionKind::Execute, 4),
            (InstructionKind::VerifyHash, 5),
            (InstructionKind::Store, 6),
            (InstructionKind::Load, 6),
            (InstructionKind::Move, 6),
            (InstructionKind::Nop, 9),
        ]
        .into_iter()
        .map(|(kind, priority)| (kind.as_str().to_string(), priority))
        .collect();

        Self {
            priorities,
            unknown_priority: u32::MAX,
        }
    }
}

impl PriorityTable {
    pub fn priority(&self, kind: &InstructionKind) -> u32 {
        match kind {
            InstructionKind::Unknown(_) => self.unknown_priority,
            known => self
                .priorities
                .get(known.as_str())
                .copied()
                .unwrap_or(self.unknown_priority),
        }
    }
}

/// rc-style settings merged into each unit's context during boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RcConfig {
    pub max_threads: u32,
    pub memory_limit_mb: u64,
    pub security_level: String,
}

impl Default for RcConfig {
    fn default() -> Self {
        Self {
            max_threads: 4,
            memory_limit_mb: 512,
            security_level: "standard".to_string(),
        }
    }
}

fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(p) = explicit {
        if !p.exists() {
            return Err(anyhow::anyhow!("Config file {} does not exist", p.display()));
        }
        return Ok(Some(p));
    }

    if let Ok(p) = env::var("VEXEC_CONFIG") {
        return Ok(Some(PathBuf::from(p)));
    }

    let candidate = PathBuf::from("vexec.json");
    if candidate.exists() {
        return Ok(Some(candidate));
    }

    Ok(None)
}

/// Expand `${NAME}` references from the process environment.
///
/// Unknown variables are left in place.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}
