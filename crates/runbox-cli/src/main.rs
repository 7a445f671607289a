#![warn(missing_docs)]

//! Runbox: run JavaScript files in a capability sandbox and record every run.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runbox_config::RunboxConfig;
use runbox_core::{ExecutionResult, ScriptService, ServiceOptions};
use runbox_error::CoreError;
use runbox_sandbox::audit::TracingAuditLogger;
use runbox_sandbox::SandboxExecutor;
use runbox_store::{EntityStore, ExecutionStatus, Script};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runbox")]
#[command(about = "Run JavaScript files in a capability sandbox")]
#[command(version)]
struct Cli {
    /// Path to a runbox.toml (defaults to $RUNBOX_CONFIG, then ./runbox.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import and execute scripts, printing one JSON result per run
    Run {
        /// Script files (.js)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Execute each script this many times
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Print the execution history after all runs
        #[arg(long)]
        history: bool,
    },

    /// Check that files would be accepted as scripts, without running them
    Check {
        /// Script files (.js)
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Locate the config file.
///
/// Search order:
/// 1. `--config` flag
/// 2. `RUNBOX_CONFIG` environment variable
/// 3. `./runbox.toml` in the current directory
/// 4. None (defaults apply)
fn find_config_file(flag: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("RUNBOX_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("runbox.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config(flag: Option<&Path>) -> Result<RunboxConfig> {
    match find_config_file(flag) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            RunboxConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(RunboxConfig::default())
        }
    }
}

fn build_service(config: &RunboxConfig) -> Result<ScriptService> {
    let options = ServiceOptions::from_config(config).context("invalid sandbox settings")?;
    let executor =
        SandboxExecutor::with_audit_logger(options.sandbox, Arc::new(TracingAuditLogger));
    let service = ScriptService::new(Arc::new(EntityStore::new()), Arc::new(executor))
        .with_context_builder(options.contexts);
    Ok(if options.serialize_per_script {
        service.with_serialized_runs()
    } else {
        service
    })
}

/// Import a file, reusing the existing script when the same name was
/// already imported in this invocation.
fn import_file(service: &ScriptService, path: &Path) -> Result<Script> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path.to_string_lossy();
    match service.import_script(&file_name, &bytes) {
        Ok(script) => Ok(script),
        Err(CoreError::DuplicateName(name)) => service
            .get_script_by_name(&name)
            .with_context(|| format!("script '{name}' vanished during import")),
        Err(e) => Err(e).with_context(|| format!("rejected {}", path.display())),
    }
}

async fn run(service: &ScriptService, files: &[PathBuf], repeat: u32, history: bool) -> Result<bool> {
    let scripts = files
        .iter()
        .map(|path| import_file(service, path))
        .collect::<Result<Vec<_>>>()?;

    let mut all_succeeded = true;
    for script in &scripts {
        for _ in 0..repeat {
            let result: ExecutionResult = service.execute_script(script.id).await?;
            all_succeeded &= result.status == ExecutionStatus::Success;
            println!("{}", serde_json::to_string(&result)?);
        }
    }

    if history {
        for execution in service.list_executions() {
            let row = serde_json::json!({
                "id": execution.id,
                "scriptName": service.script_name_for(&execution),
                "status": execution.status,
                "durationMs": execution.duration_ms,
                "executedAt": execution.executed_at,
            });
            println!("{row}");
        }
    }

    Ok(all_succeeded)
}

fn check(service: &ScriptService, files: &[PathBuf]) -> bool {
    let mut all_ok = true;
    for path in files {
        match import_file(service, path) {
            Ok(script) => println!("ok      {} ({} bytes)", script.name, script.content.len()),
            Err(e) => {
                all_ok = false;
                println!("invalid {}: {e:#}", path.display());
            }
        }
    }
    all_ok
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let service = build_service(&config)?;

    let ok = match &cli.command {
        Commands::Run {
            files,
            repeat,
            history,
        } => run(&service, files, *repeat, *history).await?,
        Commands::Check { files } => check(&service, files),
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
