//! `STORE`, `LOAD` and `MOVE`: operations on the unit's register store.

use serde_json::Value;
use tracing::debug;

use super::registry::{HandlerContext, HandlerFuture, HandlerOutput, InstructionHandler};
use crate::error::{VexecError, VexecResult};
use crate::manifest::Instruction;

/// A register name or memory address. Numbers are accepted and used in
/// their decimal form.
fn location(instruction: &Instruction, key: &'static str) -> VexecResult<String> {
    match instruction.field(key) {
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => instruction.require_str(key).map(str::to_string),
    }
}

pub struct StoreHandler;

impl StoreHandler {
    async fn store(instruction: &Instruction, ctx: &HandlerContext<'_>) -> VexecResult<HandlerOutput> {
        let address = location(instruction, "address")?;
        let value = match (instruction.field("value"), instruction.str_field("register")) {
            (Some(value), _) => value.clone(),
            (None, Some(register)) => ctx.store.register(register).await,
            (None, None) => return Err(VexecError::MissingField("value")),
        };

        debug!("Unit {} storing {} at {}", ctx.unit_id, value, address);
        ctx.store.write_memory(&address, value).await;

        if let Some(snapshot) = instruction.str_field("snapshot") {
            let path = ctx.workspace.confine(snapshot)?;
            let limit = ctx.config.timeout_for(&instruction.kind);
            tokio::time::timeout(limit, ctx.store.save(&path))
                .await
                .map_err(|_| VexecError::Timeout {
                    program: format!("snapshot {}", path.display()),
                    limit,
                })??;
            return Ok(HandlerOutput::detail(path.display().to_string()));
        }
        Ok(HandlerOutput::detail(address))
    }
}

impl InstructionHandler for StoreHandler {
    fn name(&self) -> &'static str {
        "store"
    }

    fn execute<'a>(
        &'a self,
        instruction: &'a Instruction,
        ctx: &'a HandlerContext<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(Self::store(instruction, ctx))
    }
}

pub struct LoadHandler;

impl InstructionHandler for LoadHandler {
    fn name(&self) -> &'static str {
        "load"
    }

    fn execute<'a>(
        &'a self,
        instruction: &'a Instruction,
        ctx: &'a HandlerContext<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let address = location(instruction, "address")?;
            let register = location(instruction, "register")?;
            let value = ctx.store.load_addr(&address, &register).await;
            Ok(HandlerOutput::detail(format!("{register}={value}")))
        })
    }
}

pub struct MoveHandler;

impl InstructionHandler for MoveHandler {
    fn name(&self) -> &'static str {
        "move"
    }

    fn execute<'a>(
        &'a self,
        instruction: &'a Instruction,
        ctx: &'a HandlerContext<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let src = location(instruction, "src")?;
            let dst = location(instruction, "dst")?;
            let value = ctx.store.move_register(&src, &dst).await;
            Ok(HandlerOutput::detail(format!("{dst}={value}")))
        })
    }
}
