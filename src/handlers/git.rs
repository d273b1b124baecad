//! `FETCH_REPO` and `CHECKOUT`: thin wrappers around the host `git` binary.

use tracing::info;
use url::Url;

use super::process::run_command;
use super::registry::{HandlerContext, HandlerFuture, HandlerOutput, InstructionHandler};
use crate::error::{VexecError, VexecResult};
use crate::manifest::Instruction;

const GIT: &str = "git";
const DEFAULT_DEPTH: u64 = 1;

/// Directory name a clone of `url` lands in when no target is given.
///
/// Uses the last path segment with any `.git` suffix removed. Scp-style
/// remotes (`git@host:org/repo.git`) and plain paths are handled by splitting
/// on `/` and `:`.
pub fn default_target(url: &str) -> String {
    let last_segment = match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string),
        Err(_) => url
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .map(str::to_string),
    };

    last_segment
        .map(|s| s.trim_end_matches(".git").to_string())
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .unwrap_or_else(|| "repo".to_string())
}

pub struct FetchRepoHandler;

impl FetchRepoHandler {
    async fn fetch(instruction: &Instruction, ctx: &HandlerContext<'_>) -> VexecResult<HandlerOutput> {
        let url = instruction.require_str("url")?;
        let target_name = instruction
            .str_field("target")
            .map(str::to_string)
            .unwrap_or_else(|| default_target(url));
        let target = ctx.workspace.confine(&target_name)?;

        let depth = match instruction.field("depth") {
            None => DEFAULT_DEPTH,
            Some(value) => value.as_u64().filter(|d| *d > 0).ok_or_else(|| {
                VexecError::InvalidField {
                    field: "depth",
                    reason: format!("expected a positive integer, found {value}"),
                }
            })?,
        };

        let mut args = vec!["clone".to_string(), "--depth".to_string(), depth.to_string()];
        if let Some(branch) = instruction.str_field("branch") {
            args.push("--branch".to_string());
            args.push(branch.to_string());
        }
        args.push("--".to_string());
        args.push(url.to_string());
        args.push(target.display().to_string());

        run_command(
            GIT,
            &args,
            ctx.workspace.root(),
            ctx.env,
            ctx.config.timeout_for(&instruction.kind),
        )
        .await?;

        info!("Unit {} fetched {} into {}", ctx.unit_id, url, target.display());
        Ok(HandlerOutput::detail(target.display().to_string()))
    }
}

impl InstructionHandler for FetchRepoHandler {
    fn name(&self) -> &'static str {
        "fetch_repo"
    }

    fn execute<'a>(
        &'a self,
        instruction: &'a Instruction,
        ctx: &'a HandlerContext<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(Self::fetch(instruction, ctx))
    }
}

pub struct CheckoutHandler;

impl CheckoutHandler {
    async fn checkout(instruction: &Instruction, ctx: &HandlerContext<'_>) -> VexecResult<HandlerOutput> {
        let target = ctx.workspace.resolve(instruction.require_str("target")?)?;
        let reference = match instruction.str_field("ref") {
            Some(reference) => reference,
            None => instruction.require_str("branch")?,
        };

        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(VexecError::NotFound(target));
        }

        let args = vec![
            "-C".to_string(),
            target.display().to_string(),
            "checkout".to_string(),
            "--quiet".to_string(),
            reference.to_string(),
        ];
        run_command(
            GIT,
            &args,
            ctx.workspace.root(),
            ctx.env,
            ctx.config.timeout_for(&instruction.kind),
        )
        .await?;

        Ok(HandlerOutput::detail(format!("{} @ {}", target.display(), reference)))
    }
}

impl InstructionHandler for CheckoutHandler {
    fn name(&self) -> &'static str {
        "checkout"
    }

    fn execute<'a>(
        &'a self,
        instruction: &'a Instruction,
        ctx: &'a HandlerContext<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(Self::checkout(instruction, ctx))
    }
}
