//! Purpose: `tandem` CLI entry point: parse args, run commands, emit JSON on stdout.
//! Role: Binary crate root; worker pools and pinned tasks run shell commands here.
//! Invariants: Commands emit one JSON document on stdout (pretty on a terminal).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Logging goes to stderr via `tracing`, filtered by `RUST_LOG` (default `warn`).
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::os::unix::process::CommandExt;
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use tandem::api::{
    CoreAllocator, Error, ErrorKind, PinnedTask, PoolOptions, PoolState, WorkerPool,
    allowed_cores, cpu_count, to_exit_code,
};

/// Exit status of a worker whose command could not be executed.
const EXEC_FAILED_CODE: i32 = 127;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `tandem --help`."));
            }
        },
    };

    command_dispatch::dispatch_command(cli.command)
        .map_err(add_timeout_hint)
        .map_err(add_internal_hint)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "tandem",
    version,
    about = "Run commands across worker processes and pinned cores",
    long_about = None,
    before_help = r#"Every command prints one JSON document on stdout.

Mental model:
  - `run` starts N identical workers and waits for them
  - `pin` starts N copies, each pinned to its own core
  - `cores` shows which cores are available
"#,
    after_help = r#"EXAMPLES
  $ tandem run --workers 4 -- sh -c 'echo hello from $$'
  $ tandem run --workers 2 --restart-failed 3 -- ./flaky-job
  $ tandem pin --tasks 2 --timeout 30s -- ./bench
  $ tandem cores

  $ tandem <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Run a command in a pool of worker processes",
        long_about = r#"Run one command in N worker processes and report each worker's exit code.

Workers are held at a start barrier until all of them exist, unless --async-start is given."#,
        after_help = r#"EXAMPLES
  $ tandem run --workers 4 -- sh -c 'exit 0'
  $ tandem run --workers 3 --timeout 10s -- ./job --fast
  $ tandem run --workers 2 --restart-failed 2 -- ./flaky-job

NOTES
  - Exit code is 0 only when every worker exits 0
  - --restart-failed re-runs only workers with a positive exit code
  - On --timeout, remaining workers are killed and a TimedOut error is reported"#
    )]
    Run {
        #[arg(long, default_value_t = 1, help = "Number of worker processes")]
        workers: usize,
        #[arg(long, help = "Let each worker start as soon as it is forked")]
        async_start: bool,
        #[arg(long, help = "Kill workers if tandem itself dies")]
        daemon: bool,
        #[arg(long, help = "Give up waiting after this long per round (e.g. 500ms, 10s, 1m)")]
        timeout: Option<String>,
        #[arg(long, default_value_t = 0, help = "Rounds of restarting failed workers")]
        restart_failed: usize,
        #[arg(
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            help = "Command and arguments to run"
        )]
        command: Vec<String>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Run copies of a command, each pinned to one core",
        long_about = r#"Start N copies of a command, assigning cores round-robin from the allowed set."#,
        after_help = r#"EXAMPLES
  $ tandem pin --tasks 4 -- ./bench
  $ tandem pin --tasks 2 --timeout 1m -- ./bench --size large

NOTES
  - Core pinning is Linux-only; elsewhere `pin` fails with NotSupported"#
    )]
    Pin {
        #[arg(long, default_value_t = 1, help = "Number of pinned copies")]
        tasks: usize,
        #[arg(long, help = "Give up waiting after this long (e.g. 500ms, 10s, 1m)")]
        timeout: Option<String>,
        #[arg(
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            help = "Command and arguments to run"
        )]
        command: Vec<String>,
    },
    #[command(
        about = "List the cores this process may run on",
        after_help = r#"EXAMPLES
  $ tandem cores"#
    )]
    Cores,
    #[command(
        about = "Print version info as JSON",
        long_about = r#"Emit version info as JSON (stable, machine-readable)."#,
        after_help = r#"EXAMPLES
  $ tandem version"#
    )]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        long_about = r#"Generate shell completion scripts.

Prints a completion script for the given shell to stdout."#,
        after_help = r#"EXAMPLES
  $ tandem completion bash > ~/.local/share/bash-completion/completions/tandem
  $ tandem completion zsh > ~/.zfunc/_tandem"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

/// Replaces the current (worker) process image with `command`.
fn exec_command(command: &[String]) -> i32 {
    let Some((program, args)) = command.split_first() else {
        return EXEC_FAILED_CODE;
    };
    let err = std::process::Command::new(program).args(args).exec();
    eprintln!("tandem: failed to exec {program}: {err}");
    EXEC_FAILED_CODE
}

fn parse_timeout(timeout: Option<&str>) -> Result<Option<Duration>, Error> {
    timeout.map(parse_duration).transpose()
}

fn parse_duration(input: &str) -> Result<Duration, Error> {
    let trimmed = input.trim();
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message("invalid duration")
            .with_hint("Use a number plus ms|s|m|h (e.g. 10s).")
    };
    let split = trimmed.char_indices().find(|(_, ch)| !ch.is_ascii_digit());
    let (num_str, unit) = match split {
        Some((idx, _)) => trimmed.split_at(idx),
        None => ("", ""),
    };
    if num_str.is_empty() || unit.is_empty() {
        return Err(invalid());
    }
    let value: u64 = num_str.parse().map_err(|_| invalid())?;
    let millis = match unit {
        "ms" => value,
        "s" => value.saturating_mul(1_000),
        "m" => value.saturating_mul(60_000),
        "h" => value.saturating_mul(3_600_000),
        _ => return Err(invalid()),
    };
    Ok(Duration::from_millis(millis))
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

fn add_timeout_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::TimedOut || err.hint().is_some() {
        return err;
    }
    err.with_hint("Workers were killed at the deadline. Raise --timeout or drop it to wait indefinitely.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share command/context if it persists.",
    )
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("tandem {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "tandem",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::AlreadyFulfilled => "future already fulfilled",
        ErrorKind::AlreadyHandled => "response already handled",
        ErrorKind::WrongContext => "operation not allowed from this context",
        ErrorKind::NotReady => "response not ready",
        ErrorKind::TimedOut => "timed out",
        ErrorKind::NotAcquired => "lock not acquired",
        ErrorKind::Overrelease => "semaphore released too many times",
        ErrorKind::NotSupported => "not supported",
        ErrorKind::AlreadyRunning => "already running",
        ErrorKind::Task => "task failed",
        ErrorKind::Corrupt => "corrupt data",
        ErrorKind::Io => "i/o error",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(pid) = err.pid() {
        inner.insert("pid".to_string(), json!(pid));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(pid) = err.pid() {
        lines.push(format!("pid: {pid}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
