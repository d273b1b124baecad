//! `VERIFY_HASH`: compare a file's SHA-256 digest with an expected value.

use super::registry::{HandlerContext, HandlerFuture, HandlerOutput, InstructionHandler};
use crate::error::{VexecError, VexecResult};
use crate::manifest::Instruction;

pub struct VerifyHashHandler;

impl VerifyHashHandler {
    async fn verify(instruction: &Instruction, ctx: &HandlerContext<'_>) -> VexecResult<HandlerOutput> {
        let file = instruction.require_str("file")?;
        let expected = instruction.require_str("hash")?;
        let path = ctx.workspace.resolve(file)?;
        let limit = ctx.config.timeout_for(&instruction.kind);

        let verified = tokio::time::timeout(limit, ctx.integrity.verify_file(&path, expected))
            .await
            .map_err(|_| VexecError::Timeout {
                program: format!("verify {}", path.display()),
                limit,
            })?;

        if verified {
            return Ok(HandlerOutput::detail(expected.to_string()));
        }

        let reason = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            format!("{} does not match {}", path.display(), expected)
        } else {
            format!("{} is unreadable", path.display())
        };
        Err(VexecError::VerificationFailure(reason))
    }
}

impl InstructionHandler for VerifyHashHandler {
    fn name(&self) -> &'static str {
        "verify_hash"
    }

    fn execute<'a>(
        &'a self,
        instruction: &'a Instruction,
        ctx: &'a HandlerContext<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(Self::verify(instruction, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::Fixture;
    use crate::integrity::sha256_hex;
    use crate::manifest::InstructionKind;

    fn verify(file: &str, hash: &str) -> Instruction {
        Instruction::new(InstructionKind::VerifyHash)
            .with_field("file", file)
            .with_field("hash", hash)
    }

    #[tokio::test]
    async fn test_matching_digest() {
        let fixture = Fixture::new().await;
        std::fs::write(fixture.workspace.root().join("payload.bin"), b"payload").unwrap();
        let digest = sha256_hex(b"payload");

        let ctx = fixture.ctx();
        assert!(VerifyHashHandler.execute(&verify("payload.bin", &digest), &ctx).await.is_ok());

        let prefixed = format!("sha256:{}", digest.to_uppercase());
        assert!(VerifyHashHandler.execute(&verify("payload.bin", &prefixed), &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_mismatch_and_missing_file() {
        let fixture = Fixture::new().await;
        std::fs::write(fixture.workspace.root().join("payload.bin"), b"payload").unwrap();
        let ctx = fixture.ctx();

        let err = VerifyHashHandler
            .execute(&verify("payload.bin", "deadbeef"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(&err, VexecError::VerificationFailure(reason) if reason.contains("does not match")));
        assert!(!err.is_transient());

        let err = VerifyHashHandler
            .execute(&verify("missing.bin", "deadbeef"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(&err, VexecError::VerificationFailure(reason) if reason.contains("unreadable")));
    }

    #[tokio::test]
    async fn test_requires_both_fields() {
        let fixture = Fixture::new().await;
        let instruction = Instruction::new(InstructionKind::VerifyHash).with_field("file", "a.bin");

        let err = VerifyHashHandler.execute(&instruction, &fixture.ctx()).await.unwrap_err();
        assert!(matches!(err, VexecError::MissingField("hash")));
    }
}
