//! Run one script locally and print its log to the console.
//!
//! The task goes through the same orchestrator as network submissions, with
//! client id `0`. Exits with status 0 when the task result is `true`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use script_runner::backend::{Backends, Language, PythonBackend};
use script_runner::pool::WorkerPool;
use script_runner::task::registry::TaskEntry;
use script_runner::task::reporter::{ConsoleReporter, MemoryReporter, TaskReporter};
use script_runner::task::{Orchestrator, TaskSpec};
use script_runner::transport::protocol::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "script-runner-local")]
#[command(about = "Run a Lua, Python or JavaScript task locally")]
struct Args {
    /// Script language: lua, py or js
    #[arg(short, long, default_value = "lua")]
    language: Language,

    /// Passport handed to setTaskPassport
    #[arg(short, long, default_value = "")]
    passport: String,

    /// Comma-separated functions to call after setTaskPassport
    #[arg(short, long, default_value = "main")]
    calls: String,

    /// Python executable for Python scripts
    #[arg(long, default_value = "python3")]
    python: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Script file to run
    script: PathBuf,
}

/// Prints events and keeps them so the result can be read back.
#[derive(Default)]
struct LocalReporter {
    console: ConsoleReporter,
    recorded: MemoryReporter,
}

impl TaskReporter for LocalReporter {
    fn log(&self, task: &TaskEntry, level: LogLevel, message: &str) {
        self.console.log(task, level, message);
        self.recorded.log(task, level, message);
    }

    fn result(&self, task: &TaskEntry, result: bool) {
        self.console.result(task, result);
        self.recorded.result(task, result);
    }
}

fn run(args: Args) -> Result<bool> {
    let script = std::fs::read(&args.script)
        .with_context(|| format!("Failed to read script {}", args.script.display()))?;
    let name = args
        .script
        .file_stem()
        .map_or_else(|| "script".to_string(), |stem| stem.to_string_lossy().into_owned());

    let reporter = Arc::new(LocalReporter::default());
    let pool = Arc::new(WorkerPool::new(1));
    let backends = Backends::standard(PythonBackend::new(args.python, Duration::from_secs(10)));
    let orchestrator = Orchestrator::new(pool.clone(), backends, reporter.clone());

    let runner = orchestrator.run(TaskSpec {
        client_id: 0,
        user_id: 0,
        task_id: 0,
        language: args.language,
        name,
        script,
        passport: args.passport.into_bytes(),
        call_methods: args.calls,
    });
    anyhow::ensure!(!runner.is_none(), "Failed to create {} sandbox", args.language);

    orchestrator.join(Duration::from_millis(10));
    pool.shutdown();
    Ok(reporter
        .recorded
        .wait_for_result(runner, Duration::ZERO)
        .unwrap_or(false))
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {e:#}", LogLevel::Failed.marker());
            ExitCode::FAILURE
        }
    }
}
