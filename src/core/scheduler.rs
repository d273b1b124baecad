// Instruction scheduling and bounded concurrent execution

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ExecutorConfig, PriorityTable};
use crate::error::VexecResult;
use crate::handlers::{Context, HandlerTable};
use crate::integrity::IntegrityService;
use crate::manifest::Instruction;
use crate::unit::{ExecutionResult, ExecutionUnit};

/// Aggregate outcome of one [`Scheduler::schedule`] call.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerRun {
    pub id: Uuid,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub duration: Duration,
    /// Final result per instruction, in completion order.
    pub results: Vec<ExecutionResult>,
}

impl SchedulerRun {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Stable sort by priority; lower values run first.
pub fn sort_by_priority(instructions: &mut [Instruction], priorities: &PriorityTable) {
    instructions.sort_by_key(|instruction| priorities.priority(&instruction.kind));
}

/// Pair the i-th instruction with unit `i % max_units`.
pub fn assign_round_robin(instructions: Vec<Instruction>, max_units: usize) -> Vec<(usize, Instruction)> {
    let max_units = max_units.max(1);
    instructions
        .into_iter()
        .enumerate()
        .map(|(index, instruction)| (index % max_units, instruction))
        .collect()
}

/// Runs batches of instructions across a lazily built pool of execution
/// units, with at most `worker_count` instructions in flight.
pub struct Scheduler {
    config: Arc<ExecutorConfig>,
    handlers: Arc<HandlerTable>,
    integrity: Arc<IntegrityService>,
    units: Mutex<HashMap<usize, Arc<ExecutionUnit>>>,
    permits: Arc<Semaphore>,
    workers: usize,
    /// Parent directory of this scheduler's unit workspaces.
    workspace_parent: PathBuf,
}

impl Scheduler {
    pub fn new(config: Arc<ExecutorConfig>) -> VexecResult<Self> {
        Self::with_handlers(config, HandlerTable::with_defaults())
    }

    pub fn with_handlers(config: Arc<ExecutorConfig>, handlers: HandlerTable) -> VexecResult<Self> {
        let integrity = Arc::new(IntegrityService::new()?);
        let workers = config.worker_count();
        let workspace_parent = config.workspace_root().join(Uuid::new_v4().simple().to_string());
        info!(
            "Scheduler ready: max_units={}, workers={}, workspaces under {}",
            config.max_units,
            workers,
            workspace_parent.display()
        );

        Ok(Self {
            config,
            handlers: Arc::new(handlers),
            integrity,
            units: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            workspace_parent,
        })
    }

    pub fn integrity(&self) -> &IntegrityService {
        &self.integrity
    }

    /// Number of units constructed so far.
    pub async fn unit_count(&self) -> usize {
        self.units.lock().await.len()
    }

    /// Fetch or lazily construct unit `id`.
    async fn unit(&self, id: usize) -> VexecResult<Arc<ExecutionUnit>> {
        let mut units = self.units.lock().await;
        if let Some(unit) = units.get(&id) {
            return Ok(unit.clone());
        }

        let unit = Arc::new(
            ExecutionUnit::new(
                id,
                &self.workspace_parent,
                self.handlers.clone(),
                self.config.clone(),
                self.integrity.clone(),
            )
            .await?,
        );
        units.insert(id, unit.clone());
        Ok(unit)
    }

    /// Run every instruction and wait for all of them. Failures are counted,
    /// never short-circuit the batch.
    pub async fn schedule(&self, mut instructions: Vec<Instruction>, context: Context) -> SchedulerRun {
        let id = Uuid::new_v4();
        let started = Instant::now();
        let total = instructions.len();
        let context = Arc::new(context);

        sort_by_priority(&mut instructions, &self.config.priorities);
        info!("Run {} scheduling {} instructions", id, total);

        let mut results = Vec::with_capacity(total);
        let mut tasks = JoinSet::new();

        for (unit_id, instruction) in assign_round_robin(instructions, self.config.max_units) {
            let unit = match self.unit(unit_id).await {
                Ok(unit) => unit,
                Err(e) => {
                    warn!("Could not create unit {}: {}", unit_id, e);
                    results.push(ExecutionResult::rejected(unit_id, &instruction, &e));
                    continue;
                }
            };

            let permits = self.permits.clone();
            let context = context.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                unit.execute_instruction(&instruction, context).await
            });
        }

        let mut lost = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    debug!("Run {}: {}", id, result.log_line());
                    results.push(result);
                }
                Err(e) => {
                    warn!("Run {} lost a worker task: {}", id, e);
                    lost += 1;
                }
            }
        }

        let completed = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - completed + lost;
        let duration = started.elapsed();

        info!(
            "Run {} finished: {} completed, {} failed in {:?}",
            id, completed, failed, duration
        );

        SchedulerRun {
            id,
            total,
            completed,
            failed,
            duration,
            results,
        }
    }

    /// Wait for in-flight work, then shut every unit down. Idempotent.
    pub async fn shutdown(&self) {
        let drained = self
            .permits
            .acquire_many(u32::try_from(self.workers).unwrap_or(u32::MAX))
            .await;
        if drained.is_err() {
            warn!("Worker pool closed before shutdown");
        }

        let units: Vec<Arc<ExecutionUnit>> = self.units.lock().await.drain().map(|(_, unit)| unit).collect();
        if units.is_empty() {
            return;
        }

        for unit in &units {
            unit.shutdown().await;
        }

        match tokio::fs::remove_dir_all(&self.workspace_parent).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove workspace parent {}: {}",
                self.workspace_parent.display(),
                e
            ),
        }
        info!("Scheduler shut down {} units", units.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::InstructionKind;
    use crate::unit::ExecutionStatus;

    fn test_config(root: &std::path::Path, max_units: usize) -> Arc<ExecutorConfig> {
        Arc::new(ExecutorConfig {
            max_units,
            workspace_root: root.display().to_string(),
            boot_delay_ms: 0,
            backoff_ms: 1,
            ..Default::default()
        })
    }

    fn nops(count: usize) -> Vec<Instruction> {
        (0..count).map(|_| Instruction::new(InstructionKind::Nop)).collect()
    }

    #[test]
    fn test_round_robin_coverage() {
        for (count, max_units) in [(10, 4), (3, 8), (963, 963), (1000, 7)] {
            let assigned = assign_round_robin(nops(count), max_units);
            let mut per_unit: HashMap<usize, usize> = HashMap::new();
            for (unit, _) in &assigned {
                *per_unit.entry(*unit).or_default() += 1;
            }

            assert_eq!(per_unit.len(), count.min(max_units));
            let ceil = count.div_ceil(max_units);
            assert!(per_unit.values().all(|n| *n == ceil || *n == ceil - 1));
            assert!(per_unit.keys().all(|unit| *unit < max_units));
        }
    }

    #[test]
    fn test_priority_sort_is_stable() {
        let mut instructions = vec![
            Instruction::new(InstructionKind::Nop).with_field("n", 1),
            Instruction::new(InstructionKind::from_tag("WARP")),
            Instruction::new(InstructionKind::Execute),
            Instruction::new(InstructionKind::Nop).with_field("n", 2),
            Instruction::new(InstructionKind::FetchRepo),
        ];
        sort_by_priority(&mut instructions, &PriorityTable::default());

        let kinds: Vec<&str> = instructions.iter().map(|i| i.kind.as_str()).collect();
        assert_eq!(kinds, ["FETCH_REPO", "EXECUTE", "NOP", "NOP", "WARP"]);
        assert_eq!(instructions[2].field("n"), Some(&serde_json::json!(1)));
        assert_eq!(instructions[3].field("n"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_all_nop_batch() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(test_config(dir.path(), 4)).unwrap();

        let run = scheduler.schedule(nops(25), Context::new()).await;
        assert_eq!(run.total, 25);
        assert_eq!(run.completed, 25);
        assert_eq!(run.failed, 0);
        assert_eq!(run.results.len(), 25);
        assert_eq!(scheduler.unit_count().await, 4);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_subset_fails_once_each() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(test_config(dir.path(), 3)).unwrap();

        let mut instructions = nops(6);
        instructions.extend((0..3).map(|i| Instruction::new(InstructionKind::from_tag(&format!("BOGUS_{i}")))));

        let run = scheduler.schedule(instructions, Context::new()).await;
        assert_eq!(run.completed, 6);
        assert_eq!(run.failed, 3);

        let failures: Vec<_> = run.results.iter().filter(|r| !r.is_success()).collect();
        assert!(failures.iter().all(|r| r.attempt == 1));
        assert!(failures.iter().all(|r| matches!(
            &r.status,
            ExecutionStatus::Error { code, .. } if code == "not_implemented"
        )));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_nop_and_missing_file_verification() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(test_config(dir.path(), 963)).unwrap();

        let instructions = vec![
            Instruction::new(InstructionKind::Nop),
            Instruction::new(InstructionKind::VerifyHash)
                .with_field("file", "missing.bin")
                .with_field("hash", "deadbeef"),
        ];
        let run = scheduler.schedule(instructions, Context::new()).await;

        assert_eq!(run.completed, 1);
        assert_eq!(run.failed, 1);
        assert!(!run.is_success());

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_removes_units() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(test_config(dir.path(), 2)).unwrap();

        scheduler.schedule(nops(2), Context::new()).await;
        assert_eq!(scheduler.unit_count().await, 2);

        scheduler.shutdown().await;
        scheduler.shutdown().await;
        assert_eq!(scheduler.unit_count().await, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_bounded_workers() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ExecutorConfig {
            max_workers: Some(1),
            ..(*test_config(dir.path(), 4)).clone()
        });
        let scheduler = Scheduler::new(config).unwrap();

        let run = scheduler.schedule(nops(8), Context::new()).await;
        assert_eq!(run.completed, 8);

        scheduler.shutdown().await;
    }
}
