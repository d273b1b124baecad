//! Instruction handler trait and the dispatch table that maps each
//! [`InstructionKind`] to its handler.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::ExecutorConfig;
use crate::error::{VexecError, VexecResult};
use crate::integrity::IntegrityService;
use crate::manifest::{Instruction, InstructionKind};
use crate::memory::RegisterStore;
use crate::workspace::Workspace;

use super::git::{CheckoutHandler, FetchRepoHandler};
use super::install::InstallHandler;
use super::registers::{LoadHandler, MoveHandler, StoreHandler};
use super::toolchain::{CompileHandler, ExecuteHandler};
use super::verify::VerifyHashHandler;

/// Shared, read-only data passed along with every instruction.
pub type Context = Map<String, Value>;

/// Everything a handler may touch while running one instruction.
pub struct HandlerContext<'a> {
    pub unit_id: usize,
    pub workspace: &'a Workspace,
    pub store: &'a RegisterStore,
    /// Environment for spawned processes, built during boot.
    pub env: &'a BTreeMap<String, String>,
    pub context: &'a Context,
    pub config: &'a ExecutorConfig,
    pub integrity: &'a IntegrityService,
}

/// What a successful handler reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    pub detail: Option<String>,
}

impl HandlerOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
        }
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = VexecResult<HandlerOutput>> + Send + 'a>>;

/// One implementation per instruction type.
pub trait InstructionHandler: Send + Sync {
    /// Handler name used in debug logs.
    fn name(&self) -> &'static str;

    /// Run one attempt of `instruction`.
    fn execute<'a>(
        &'a self,
        instruction: &'a Instruction,
        ctx: &'a HandlerContext<'a>,
    ) -> HandlerFuture<'a>;
}

/// `NOP`: succeeds without doing anything.
pub struct NopHandler;

impl InstructionHandler for NopHandler {
    fn name(&self) -> &'static str {
        "nop"
    }

    fn execute<'a>(&'a self, _: &'a Instruction, _: &'a HandlerContext<'a>) -> HandlerFuture<'a> {
        Box::pin(async { Ok(HandlerOutput::empty()) })
    }
}

/// Fallback for instruction types without a handler.
pub struct NotImplementedHandler;

impl InstructionHandler for NotImplementedHandler {
    fn name(&self) -> &'static str {
        "not_implemented"
    }

    fn execute<'a>(
        &'a self,
        instruction: &'a Instruction,
        _: &'a HandlerContext<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            Err(VexecError::HandlerNotImplemented(instruction.kind.to_string()))
        })
    }
}

/// Built-in handler for `kind`. Adding an [`InstructionKind`] variant fails
/// to compile until it is mapped here.
pub fn builtin_handler(kind: &InstructionKind) -> Arc<dyn InstructionHandler> {
    match kind {
        InstructionKind::FetchRepo => Arc::new(FetchRepoHandler),
        InstructionKind::Checkout => Arc::new(CheckoutHandler),
        InstructionKind::Execute => Arc::new(ExecuteHandler),
        InstructionKind::Install => Arc::new(InstallHandler),
        InstructionKind::VerifyHash => Arc::new(VerifyHashHandler),
        InstructionKind::Store => Arc::new(StoreHandler),
        InstructionKind::Load => Arc::new(LoadHandler),
        InstructionKind::Move => Arc::new(MoveHandler),
        InstructionKind::Compile => Arc::new(CompileHandler),
        InstructionKind::Nop => Arc::new(NopHandler),
        InstructionKind::Unknown(_) => Arc::new(NotImplementedHandler),
    }
}

/// Dispatch table from instruction kind to handler.
#[derive(Clone)]
pub struct HandlerTable {
    handlers: HashMap<InstructionKind, Arc<dyn InstructionHandler>>,
    fallback: Arc<dyn InstructionHandler>,
}

impl HandlerTable {
    /// Create an empty table; every kind resolves to the fallback.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(NotImplementedHandler),
        }
    }

    /// Table with the built-in handler for every known kind.
    pub fn with_defaults() -> Self {
        InstructionKind::KNOWN
            .iter()
            .fold(Self::new(), |table, kind| {
                table.register(kind.clone(), builtin_handler(kind))
            })
    }

    /// Register (or replace) the handler for `kind`.
    ///
    /// `Unknown` kinds cannot be registered; they always hit the fallback.
    pub fn register(mut self, kind: InstructionKind, handler: Arc<dyn InstructionHandler>) -> Self {
        if kind.is_known() {
            self.handlers.insert(kind, handler);
        } else {
            tracing::warn!("Refusing to register handler for unknown kind {}", kind);
        }
        self
    }

    pub fn register_handler<T: InstructionHandler + 'static>(self, kind: InstructionKind, handler: T) -> Self {
        self.register(kind, Arc::new(handler))
    }

    /// Handler for `kind`, or the not-implemented fallback.
    pub fn resolve(&self, kind: &InstructionKind) -> Arc<dyn InstructionHandler> {
        self.handlers
            .get(kind)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn contains(&self, kind: &InstructionKind) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}
