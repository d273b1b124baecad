//! `INSTALL`: invoke one of a small fixed set of package managers.
//!
//! Packages land inside the unit workspace wherever the manager allows it.
//! `apt` has no per-directory mode and installs system-wide.

use std::path::Path;

use tracing::info;

use super::process::run_command;
use super::registry::{HandlerContext, HandlerFuture, HandlerOutput, InstructionHandler};
use crate::error::{VexecError, VexecResult};
use crate::manifest::Instruction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pip,
    Npm,
    Apt,
    Cargo,
}

impl PackageManager {
    pub fn from_name(name: &str) -> VexecResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pip" | "pip3" => Ok(Self::Pip),
            "npm" => Ok(Self::Npm),
            "apt" | "apt-get" => Ok(Self::Apt),
            "cargo" => Ok(Self::Cargo),
            _ => Err(VexecError::UnsupportedPackageManager(name.to_string())),
        }
    }

    /// Program and arguments that install `packages` for a unit rooted at
    /// `root`.
    pub fn command(&self, root: &Path, packages: &[String]) -> (&'static str, Vec<String>) {
        let (program, mut args) = match self {
            Self::Pip => (
                "pip3",
                vec![
                    "install".to_string(),
                    "--disable-pip-version-check".to_string(),
                    "--target".to_string(),
                    root.join("pip").display().to_string(),
                ],
            ),
            Self::Npm => (
                "npm",
                vec![
                    "install".to_string(),
                    "--prefix".to_string(),
                    root.display().to_string(),
                ],
            ),
            Self::Apt => ("apt-get", vec!["install".to_string(), "-y".to_string()]),
            Self::Cargo => (
                "cargo",
                vec![
                    "install".to_string(),
                    "--root".to_string(),
                    root.join("cargo").display().to_string(),
                ],
            ),
        };
        args.extend(packages.iter().cloned());
        (program, args)
    }
}

pub struct InstallHandler;

impl InstallHandler {
    async fn install(instruction: &Instruction, ctx: &HandlerContext<'_>) -> VexecResult<HandlerOutput> {
        let manager = PackageManager::from_name(instruction.require_str("manager")?)?;
        let packages = instruction.string_list("packages")?;
        if packages.is_empty() {
            return Err(VexecError::MissingField("packages"));
        }

        let (program, args) = manager.command(ctx.workspace.root(), &packages);
        run_command(
            program,
            &args,
            ctx.workspace.root(),
            ctx.env,
            ctx.config.timeout_for(&instruction.kind),
        )
        .await?;

        info!("Unit {} installed {} via {:?}", ctx.unit_id, packages.join(" "), manager);
        Ok(HandlerOutput::detail(packages.join(" ")))
    }
}

impl InstructionHandler for InstallHandler {
    fn name(&self) -> &'static str {
        "install"
    }

    fn execute<'a>(
        &'a self,
        instruction: &'a Instruction,
        ctx: &'a HandlerContext<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(Self::install(instruction, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::Fixture;
    use crate::manifest::InstructionKind;

    #[test]
    fn test_manager_commands() {
        let root = Path::new("/ws/unit-3");
        let packages = vec!["requests".to_string(), "rich".to_string()];

        let (program, args) = PackageManager::from_name("pip").unwrap().command(root, &packages);
        assert_eq!(program, "pip3");
        assert!(args.contains(&"/ws/unit-3/pip".to_string()));
        assert_eq!(&args[args.len() - 2..], &packages[..]);

        let (program, args) = PackageManager::from_name("APT-GET").unwrap().command(root, &packages);
        assert_eq!(program, "apt-get");
        assert_eq!(args[..2], ["install".to_string(), "-y".to_string()]);
    }

    #[tokio::test]
    async fn test_unsupported_manager() {
        let fixture = Fixture::new().await;
        let instruction = Instruction::new(InstructionKind::Install)
            .with_field("manager", "brew")
            .with_field("packages", "wget");

        let err = InstallHandler.execute(&instruction, &fixture.ctx()).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(matches!(err, VexecError::UnsupportedPackageManager(name) if name == "brew"));
    }

    #[tokio::test]
    async fn test_install_runs_manager_in_workspace() {
        let mut fixture = Fixture::new().await;
        fixture.install_tools(&[("npm", r#"echo "$*" > "$3/npm-args""#)], "/usr/bin:/bin");
        let instruction = Instruction::new(InstructionKind::Install)
            .with_field("manager", "npm")
            .with_field("packages", serde_json::json!(["left-pad", "chalk"]));

        let output = InstallHandler.execute(&instruction, &fixture.ctx()).await.unwrap();
        assert_eq!(output.detail.as_deref(), Some("left-pad chalk"));

        let root = fixture.workspace.root();
        assert_eq!(
            std::fs::read_to_string(root.join("npm-args")).unwrap().trim(),
            format!("install --prefix {} left-pad chalk", root.display())
        );
    }

    #[tokio::test]
    async fn test_install_failure_and_timeout() {
        let mut fixture = Fixture::new().await;
        fixture.install_tools(
            &[("pip3", "echo 'No matching distribution found' >&2\nexit 1")],
            "/usr/bin:/bin",
        );
        let instruction = Instruction::new(InstructionKind::Install)
            .with_field("manager", "pip")
            .with_field("packages", serde_json::json!(["nonexistent-pkg"]));

        let err = InstallHandler.execute(&instruction, &fixture.ctx()).await.unwrap_err();
        assert!(matches!(
            &err,
            VexecError::ExternalProcessFailure { exit_code: Some(1), stderr }
                if stderr == "No matching distribution found"
        ));

        fixture.install_tools(&[("pip3", "sleep 5")], "/usr/bin:/bin");
        fixture.config.timeouts.install_ms = 200;
        let err = InstallHandler.execute(&instruction, &fixture.ctx()).await.unwrap_err();
        assert!(matches!(err, VexecError::Timeout { ref program, .. } if program == "pip3"));
    }

    #[tokio::test]
    async fn test_empty_package_list() {
        let fixture = Fixture::new().await;
        let instruction = Instruction::new(InstructionKind::Install)
            .with_field("manager", "npm")
            .with_field("packages", serde_json::json!([]));

        let err = InstallHandler.execute(&instruction, &fixture.ctx()).await.unwrap_err();
        assert!(matches!(err, VexecError::MissingField("packages")));
    }
}
