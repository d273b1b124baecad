//! Declarative-instruction virtual executor.
//!
//! A manifest lists typed instructions. The [`Orchestrator`] parses it, the
//! [`Scheduler`] spreads the instructions over a bounded pool of
//! [`ExecutionUnit`]s, and each unit runs its share inside an isolated
//! workspace with per-type time limits.

// Core modules
pub mod config;
pub mod core;
pub mod error;
pub mod integrity;
pub mod memory;
pub mod types;
pub mod utils;
pub mod workspace;

// Instruction pipeline
pub mod handlers;
pub mod manifest;
pub mod orchestrator;
pub mod unit;

// Re-export key types
pub use config::ExecutorConfig;
pub use crate::core::{Scheduler, SchedulerRun};
pub use error::{VexecError, VexecResult};
pub use handlers::{Context, HandlerTable, InstructionHandler};
pub use integrity::IntegrityService;
pub use manifest::{Instruction, InstructionKind, Manifest, ManifestHeader, ManifestParser};
pub use orchestrator::{Orchestrator, RunStatus, RunSummary};
pub use unit::{ExecutionResult, ExecutionStatus, ExecutionUnit, UnitState};
