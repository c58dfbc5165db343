//! Purpose: Hold top-level CLI command dispatch for `tandem`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: `run` and `pin` always reap or kill every child before returning.
//! Invariants: A non-zero worker exit maps to the `Task` exit code, not to an error envelope.

use super::*;

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "tandem", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Cores => {
            emit_json(json!({
                "cpu_count": cpu_count(),
                "cores": allowed_cores(),
            }));
            Ok(RunOutcome::ok())
        }
        Command::Run {
            workers,
            async_start,
            daemon,
            timeout,
            restart_failed,
            command,
        } => {
            let timeout = parse_timeout(timeout.as_deref())?;
            let options = PoolOptions::new(workers)
                .with_synchronous_start(!async_start)
                .with_daemon(daemon);
            run_pool(options, timeout, restart_failed, command)
        }
        Command::Pin {
            tasks,
            timeout,
            command,
        } => {
            if tasks == 0 {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("pin needs at least one task")
                    .with_hint("Pass --tasks 1 or more."));
            }
            let timeout = parse_timeout(timeout.as_deref())?;
            run_pinned(tasks, timeout, command)
        }
    }
}

fn run_pool(
    options: PoolOptions,
    timeout: Option<Duration>,
    restart_rounds: usize,
    command: Vec<String>,
) -> Result<RunOutcome, Error> {
    let mut pool = WorkerPool::new(|command: Vec<String>| exec_command(&command), options)?;
    pool.start(command.clone())?;

    let mut restarts = 0;
    let mut round = 0;
    loop {
        if !pool.wait(timeout) {
            let stuck = pool.active_count();
            pool.kill()?;
            pool.wait(None);
            return Err(Error::new(ErrorKind::TimedOut)
                .with_message(format!("{stuck} worker(s) still running at the deadline")));
        }
        if round >= restart_rounds {
            break;
        }
        let restarted = pool.restart_failed(command.clone())?;
        if restarted == 0 {
            break;
        }
        restarts += restarted;
        round += 1;
    }

    let exit_codes = pool.exit_codes();
    let workers: Vec<Value> = pool
        .pids()
        .into_iter()
        .zip(&exit_codes)
        .enumerate()
        .map(|(index, (pid, exit_code))| {
            json!({
                "index": index,
                "pid": pid,
                "exit_code": exit_code,
            })
        })
        .collect();
    emit_json(json!({ "workers": workers, "restarts": restarts }));

    let all_clean = exit_codes.iter().all(|code| *code == Some(0));
    if all_clean && pool.state() == PoolState::Idle {
        Ok(RunOutcome::ok())
    } else {
        Ok(RunOutcome::with_code(to_exit_code(ErrorKind::Task)))
    }
}

fn run_pinned(tasks: usize, timeout: Option<Duration>, command: Vec<String>) -> Result<RunOutcome, Error> {
    let allocator = CoreAllocator::new();
    let mut pinned: Vec<_> = (0..tasks)
        .map(|_| {
            let command = command.clone();
            PinnedTask::new(&allocator, move || exec_command(&command))
        })
        .collect();

    let mut pids = Vec::with_capacity(tasks);
    for task in &mut pinned {
        pids.push(task.start(true)?);
    }

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let mut exit_codes = Vec::with_capacity(tasks);
    for task in &mut pinned {
        match task.join(remaining(deadline)) {
            Some(code) => exit_codes.push(code),
            None => break,
        }
    }
    if exit_codes.len() < tasks {
        for task in &mut pinned {
            task.signal(libc::SIGKILL)?;
            task.join(None);
        }
        return Err(Error::new(ErrorKind::TimedOut)
            .with_message(format!("{} pinned task(s) still running at the deadline", tasks - exit_codes.len())));
    }

    let entries: Vec<Value> = pinned
        .iter()
        .zip(pids)
        .zip(&exit_codes)
        .map(|((task, pid), exit_code)| {
            json!({
                "core": task.core(),
                "pid": pid,
                "exit_code": exit_code,
            })
        })
        .collect();
    emit_json(json!({ "tasks": entries }));

    if exit_codes.iter().all(|code| *code == 0) {
        Ok(RunOutcome::ok())
    } else {
        Ok(RunOutcome::with_code(to_exit_code(ErrorKind::Task)))
    }
}
