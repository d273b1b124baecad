use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vexec::{ExecutorConfig, Orchestrator};

#[derive(Parser)]
#[command(name = "vexec")]
#[command(about = "Declarative-instruction virtual executor")]
struct Cli {
    /// Path to a JSON executor config
    #[arg(long, global = true, env = "VEXEC_CONFIG")]
    config: Option<PathBuf>,
    /// Override the number of execution units
    #[arg(long, global = true)]
    max_units: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a manifest and execute every instruction in it
    Run { manifest: PathBuf },
    /// Write a content-addressed manifest artifact
    Generate {
        /// Directory the artifact is written to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Manifest whose instructions are re-emitted (defaults to a sample body)
        manifest: Option<PathBuf>,
    },
    /// Check that a manifest parses and its checksum matches
    Validate { manifest: PathBuf },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vexec=info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut config = ExecutorConfig::load(cli.config)?;
    if let Some(max_units) = cli.max_units {
        config.max_units = max_units;
        config.validate()?;
    }
    let orchestrator = Orchestrator::new(config)?;

    let code = match cli.command {
        Commands::Run { manifest } => {
            info!("Running {}", manifest.display());
            let summary = orchestrator.run(&manifest).await;
            orchestrator.shutdown().await;

            println!("Execution time: {:.3}s", summary.execution_time.as_secs_f64());
            println!("Instructions:   {}", summary.instruction_count);
            println!("Completed:      {}", summary.completed);
            println!("Failed:         {}", summary.failed);
            if let Some(message) = &summary.error {
                println!("Error:          {}", message);
            }

            if summary.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Generate { output, manifest } => {
            match orchestrator.generate(&output, manifest.as_deref()).await {
                Ok(path) => {
                    println!("{}", path.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Failed to generate manifest: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Validate { manifest } => match orchestrator.validate(&manifest).await {
            Ok(parsed) => {
                println!(
                    "{} is valid ({} instructions)",
                    manifest.display(),
                    parsed.len()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                println!("{} is invalid: {}", manifest.display(), e);
                ExitCode::FAILURE
            }
        },
    };

    Ok(code)
}
