//! `EXECUTE` and `COMPILE`: pick a toolchain from the source file extension
//! and run it in the unit workspace.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::process::{ProcessOutput, run_command};
use super::registry::{HandlerContext, HandlerFuture, HandlerOutput, InstructionHandler};
use crate::error::{VexecError, VexecResult};
use crate::manifest::{Instruction, InstructionKind};

/// Portable bytecode runtimes, tried in order.
const WASM_RUNTIMES: [(&str, &[&str]); 3] = [
    ("wasmtime", &["run"]),
    ("wasmer", &["run"]),
    ("wasm3", &[]),
];

/// How a source file is turned into a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolchain {
    /// Run the file directly with an interpreter.
    Interpreter(&'static str),
    /// Compile to a native binary first.
    Native(&'static str),
    /// Run with the first available wasm runtime.
    Wasm,
}

impl Toolchain {
    pub fn for_extension(extension: &str) -> Option<Self> {
        let toolchain = match extension.to_ascii_lowercase().as_str() {
            "py" => Self::Interpreter("python3"),
            "js" | "mjs" => Self::Interpreter("node"),
            "rb" => Self::Interpreter("ruby"),
            "pl" => Self::Interpreter("perl"),
            "sh" => Self::Interpreter("sh"),
            "bash" => Self::Interpreter("bash"),
            "c" => Self::Native("cc"),
            "cpp" | "cc" | "cxx" => Self::Native("c++"),
            "rs" => Self::Native("rustc"),
            "wasm" => Self::Wasm,
            _ => return None,
        };
        Some(toolchain)
    }

    pub fn for_path(path: &Path) -> VexecResult<Self> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::for_extension(&extension).ok_or_else(|| {
            VexecError::UnsupportedExtension(if extension.is_empty() {
                path.display().to_string()
            } else {
                extension
            })
        })
    }
}

/// Resolve the `file` field to an existing source file.
async fn source_file(instruction: &Instruction, ctx: &HandlerContext<'_>) -> VexecResult<PathBuf> {
    let path = ctx.workspace.resolve(instruction.require_str("file")?)?;
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(VexecError::NotFound(path));
    }
    Ok(path)
}

/// Default binary location for a compiled source: `build/<stem>`.
fn default_output(source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "a.out".to_string());
    format!("build/{stem}")
}

/// Compile `source` with `compiler` into `output`. Compiler errors become
/// [`VexecError::CompileFailure`]; timeouts stay timeouts.
async fn compile(
    compiler: &str,
    source: &Path,
    output: &Path,
    ctx: &HandlerContext<'_>,
) -> VexecResult<ProcessOutput> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let args = vec![
        source.display().to_string(),
        "-o".to_string(),
        output.display().to_string(),
    ];
    let limit = ctx.config.timeout_for(&InstructionKind::Compile);

    debug!("Compiling {} with {}", source.display(), compiler);
    run_command(compiler, &args, ctx.workspace.root(), ctx.env, limit)
        .await
        .map_err(|e| match e {
            VexecError::ExternalProcessFailure { stderr, .. } => VexecError::CompileFailure(stderr),
            other => other,
        })
}

/// Run `source` under the first wasm runtime found on the unit `PATH`.
async fn run_wasm(
    source: &Path,
    args: &[String],
    ctx: &HandlerContext<'_>,
    limit: Duration,
) -> VexecResult<ProcessOutput> {
    let search_path = ctx.env.get("PATH").map(OsString::from);

    for (runtime, prefix) in WASM_RUNTIMES {
        let Ok(binary) = which::which_in(runtime, search_path.as_ref(), ctx.workspace.root()) else {
            debug!("wasm runtime {} not available", runtime);
            continue;
        };

        let mut full_args: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        full_args.push(source.display().to_string());
        full_args.extend_from_slice(args);

        match run_command(&binary, &full_args, ctx.workspace.root(), ctx.env, limit).await {
            Err(VexecError::RuntimeNotFound(_)) => continue,
            result => return result,
        }
    }

    let tried: Vec<&str> = WASM_RUNTIMES.iter().map(|(name, _)| *name).collect();
    Err(VexecError::RuntimeNotFound(tried.join(", ")))
}

pub struct ExecuteHandler;

impl ExecuteHandler {
    async fn run(instruction: &Instruction, ctx: &HandlerContext<'_>) -> VexecResult<HandlerOutput> {
        let source = source_file(instruction, ctx).await?;
        let toolchain = Toolchain::for_path(&source)?;
        let args = instruction.string_list("args")?;
        let limit = ctx.config.timeout_for(&instruction.kind);

        let output = match toolchain {
            Toolchain::Interpreter(interpreter) => {
                let mut full_args = vec![source.display().to_string()];
                full_args.extend(args);
                run_command(interpreter, &full_args, ctx.workspace.root(), ctx.env, limit).await?
            }
            Toolchain::Native(compiler) => {
                let binary = ctx.workspace.confine(&default_output(&source))?;
                compile(compiler, &source, &binary, ctx).await?;
                run_command(&binary, &args, ctx.workspace.root(), ctx.env, limit).await?
            }
            Toolchain::Wasm => run_wasm(&source, &args, ctx, limit).await?,
        };

        Ok(HandlerOutput::detail(output.summary()))
    }
}

impl InstructionHandler for ExecuteHandler {
    fn name(&self) -> &'static str {
        "execute"
    }

    fn execute<'a>(
        &'a self,
        instruction: &'a Instruction,
        ctx: &'a HandlerContext<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(Self::run(instruction, ctx))
    }
}

pub struct CompileHandler;

impl CompileHandler {
    async fn build(instruction: &Instruction, ctx: &HandlerContext<'_>) -> VexecResult<HandlerOutput> {
        let source = source_file(instruction, ctx).await?;
        let Toolchain::Native(compiler) = Toolchain::for_path(&source)? else {
            return Err(VexecError::UnsupportedExtension(format!(
                "{} is not a compiled language",
                source.display()
            )));
        };

        let output = match instruction.str_field("output") {
            Some(output) => ctx.workspace.confine(output)?,
            None => ctx.workspace.confine(&default_output(&source))?,
        };
        compile(compiler, &source, &output, ctx).await?;

        Ok(HandlerOutput::detail(output.display().to_string()))
    }
}

impl InstructionHandler for CompileHandler {
    fn name(&self) -> &'static str {
        "compile"
    }

    fn execute<'a>(
        &'a self,
        instruction: &'a Instruction,
        ctx: &'a HandlerContext<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(Self::build(instruction, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::Fixture;

    fn execute(file: &str) -> Instruction {
        Instruction::new(InstructionKind::Execute).with_field("file", file)
    }

    #[test]
    fn test_toolchain_selection() {
        assert_eq!(Toolchain::for_extension("py"), Some(Toolchain::Interpreter("python3")));
        assert_eq!(Toolchain::for_extension("SH"), Some(Toolchain::Interpreter("sh")));
        assert_eq!(Toolchain::for_extension("cpp"), Some(Toolchain::Native("c++")));
        assert_eq!(Toolchain::for_extension("rs"), Some(Toolchain::Native("rustc")));
        assert_eq!(Toolchain::for_extension("wasm"), Some(Toolchain::Wasm));
        assert_eq!(Toolchain::for_extension("xyz"), None);
        assert!(matches!(
            Toolchain::for_path(Path::new("Makefile")),
            Err(VexecError::UnsupportedExtension(_))
        ));
    }

    #[tokio::test]
    async fn test_shell_script_runs_in_workspace() {
        let fixture = Fixture::new().await;
        std::fs::write(
            fixture.workspace.root().join("hello.sh"),
            "echo \"hello $1 from $(basename \"$(pwd)\")\"\n",
        )
        .unwrap();

        let instruction = execute("hello.sh").with_field("args", serde_json::json!(["world"]));
        let output = ExecuteHandler.execute(&instruction, &fixture.ctx()).await.unwrap();
        assert_eq!(output.detail.as_deref(), Some("hello world from unit-0"));
    }

    #[tokio::test]
    async fn test_failing_script_reports_exit_code() {
        let fixture = Fixture::new().await;
        std::fs::write(fixture.workspace.root().join("fail.sh"), "echo nope >&2\nexit 1\n").unwrap();

        let err = ExecuteHandler
            .execute(&execute("fail.sh"), &fixture.ctx())
            .await
            .unwrap_err();
        match err {
            VexecError::ExternalProcessFailure { exit_code, stderr } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_script_timeout() {
        let mut fixture = Fixture::new().await;
        fixture.config.timeouts.execute_ms = 200;
        std::fs::write(fixture.workspace.root().join("slow.sh"), "sleep 5\n").unwrap();

        let err = ExecuteHandler
            .execute(&execute("slow.sh"), &fixture.ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, VexecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_input_errors() {
        let fixture = Fixture::new().await;
        let ctx = fixture.ctx();

        let err = ExecuteHandler
            .execute(&Instruction::new(InstructionKind::Execute), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, VexecError::MissingField("file")));

        let err = ExecuteHandler.execute(&execute("absent.py"), &ctx).await.unwrap_err();
        assert!(matches!(err, VexecError::NotFound(_)));

        std::fs::write(fixture.workspace.root().join("notes.xyz"), "").unwrap();
        let err = ExecuteHandler.execute(&execute("notes.xyz"), &ctx).await.unwrap_err();
        assert!(matches!(err, VexecError::UnsupportedExtension(ext) if ext == "xyz"));
    }

    #[tokio::test]
    async fn test_wasm_uses_first_available_runtime() {
        let mut fixture = Fixture::new().await;
        fixture.install_tools(&[("wasmer", r#"echo "wasmer:$*""#), ("wasm3", "echo wasm3")], "");
        std::fs::write(fixture.workspace.root().join("m.wasm"), b"\0asm").unwrap();

        let instruction = execute("m.wasm").with_field("args", serde_json::json!(["7"]));
        let output = ExecuteHandler.execute(&instruction, &fixture.ctx()).await.unwrap();

        let module = fixture.workspace.root().join("m.wasm");
        assert_eq!(output.detail, Some(format!("wasmer:run {} 7", module.display())));
    }

    #[tokio::test]
    async fn test_wasm_without_runtime() {
        let mut fixture = Fixture::new().await;
        fixture.install_tools(&[], "");
        std::fs::write(fixture.workspace.root().join("m.wasm"), b"\0asm").unwrap();

        let err = ExecuteHandler.execute(&execute("m.wasm"), &fixture.ctx()).await.unwrap_err();
        assert!(matches!(&err, VexecError::RuntimeNotFound(tried) if tried == "wasmtime, wasmer, wasm3"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_compiler_error_is_compile_failure() {
        let mut fixture = Fixture::new().await;
        fixture.install_tools(&[("cc", "echo \"main.c:1: error: expected ';'\" >&2\nexit 1")], "/usr/bin:/bin");
        std::fs::write(fixture.workspace.root().join("main.c"), "int main() { return 0 }\n").unwrap();

        let instruction = Instruction::new(InstructionKind::Compile).with_field("file", "main.c");
        let err = CompileHandler.execute(&instruction, &fixture.ctx()).await.unwrap_err();
        assert!(matches!(&err, VexecError::CompileFailure(reason) if reason.contains("expected ';'")));
        assert!(!err.is_transient());

        let err = ExecuteHandler.execute(&execute("main.c"), &fixture.ctx()).await.unwrap_err();
        assert!(matches!(err, VexecError::CompileFailure(_)));
    }

    #[tokio::test]
    async fn test_compile_writes_requested_output() {
        let mut fixture = Fixture::new().await;
        fixture.install_tools(&[("cc", r#"echo built > "$3""#)], "/usr/bin:/bin");
        std::fs::write(fixture.workspace.root().join("main.c"), "int main() { return 0; }\n").unwrap();

        let instruction = Instruction::new(InstructionKind::Compile)
            .with_field("file", "main.c")
            .with_field("output", "out/tool");
        let output = CompileHandler.execute(&instruction, &fixture.ctx()).await.unwrap();

        let binary = fixture.workspace.root().join("out/tool");
        assert_eq!(output.detail, Some(binary.display().to_string()));
        assert_eq!(std::fs::read_to_string(binary).unwrap(), "built\n");
    }

    #[tokio::test]
    async fn test_compile_rejects_interpreted_sources() {
        let fixture = Fixture::new().await;
        std::fs::write(fixture.workspace.root().join("tool.py"), "print(1)\n").unwrap();

        let instruction = Instruction::new(InstructionKind::Compile).with_field("file", "tool.py");
        let err = CompileHandler.execute(&instruction, &fixture.ctx()).await.unwrap_err();
        assert!(matches!(err, VexecError::UnsupportedExtension(_)));
    }
}
