//! Purpose: Fork-based child processes with signal control, exit-status tracking, and CPU pinning.
//! Exports: `spawn`, `ChildProcess`, `SpawnOptions`, `cpu_count`, `allowed_cores`, `set_affinity`.
//! Role: The only place that calls fork/waitpid/kill; everything process-backed builds on it.
//! Invariants: A child never returns into the caller's stack; it leaves through `_exit`.
//! Invariants: Exit codes follow the usual convention: `>= 0` exit status, `< 0` killed by signal `-code`.
//! Invariants: A pid is only signalled while its status is unknown, so reaped pids are never reused by mistake.
//! Invariants: Dropping a handle reaps an exited child; a live non-daemon child is left running.
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Exit code used when the entry closure panics.
pub const PANIC_EXIT_CODE: i32 = 101;

#[derive(Clone, Copy, Debug, Default)]
pub struct SpawnOptions {
    /// Child stops itself with `SIGSTOP` before running the entry closure.
    pub suspended: bool,
    /// Child is killed when its handle is dropped or the parent dies.
    pub daemon: bool,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    pub fn with_daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }
}

#[derive(Debug)]
pub struct ChildProcess {
    pid: libc::pid_t,
    status: Option<i32>,
    daemon: bool,
}

/// Forks and runs `entry` in the child; its return value becomes the exit status.
///
/// With `suspended`, this returns once the child has stopped itself, so a
/// later `resume` releases it from a known point.
pub fn spawn<F>(options: SpawnOptions, entry: F) -> Result<ChildProcess, Error>
where
    F: FnOnce() -> i32,
{
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::io(io::Error::last_os_error()).with_message("fork failed"));
    }
    if pid == 0 {
        run_child(options, entry);
    }

    tracing::debug!(pid, suspended = options.suspended, "spawned child process");
    let mut child = ChildProcess {
        pid,
        status: None,
        daemon: options.daemon,
    };
    if options.suspended {
        child.wait_stopped()?;
    }
    Ok(child)
}

fn run_child<F>(options: SpawnOptions, entry: F) -> !
where
    F: FnOnce() -> i32,
{
    #[cfg(target_os = "linux")]
    if options.daemon {
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
        }
    }
    if options.suspended {
        unsafe {
            libc::raise(libc::SIGSTOP);
        }
    }
    let code = panic::catch_unwind(AssertUnwindSafe(entry)).unwrap_or(PANIC_EXIT_CODE);
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    unsafe { libc::_exit(code) }
}

impl ChildProcess {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Cached or freshly reaped exit code; `None` while running.
    pub fn exit_code(&mut self) -> Option<i32> {
        self.poll_status();
        self.status
    }

    pub fn is_alive(&mut self) -> bool {
        self.exit_code().is_none()
    }

    /// Waits for exit; returns `None` if the child is still running after `timeout`.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Option<i32> {
        if timeout.is_none() {
            return self.wait_blocking();
        }
        let start = Instant::now();
        loop {
            if let Some(code) = self.exit_code() {
                return Some(code);
            }
            if let Some(timeout) = timeout {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    return None;
                }
                std::thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
            }
        }
    }

    pub fn signal(&mut self, sig: libc::c_int) -> Result<(), Error> {
        if !self.is_alive() {
            return Ok(());
        }
        let rc = unsafe { libc::kill(self.pid, sig) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(Error::io(err)
                .with_message(format!("failed to send signal {sig}"))
                .with_pid(self.pid));
        }
        tracing::debug!(pid = self.pid, sig, "signalled child process");
        Ok(())
    }

    pub fn suspend(&mut self) -> Result<(), Error> {
        self.signal(libc::SIGSTOP)
    }

    pub fn resume(&mut self) -> Result<(), Error> {
        self.signal(libc::SIGCONT)
    }

    pub fn interrupt(&mut self) -> Result<(), Error> {
        self.signal(libc::SIGINT)
    }

    pub fn terminate(&mut self) -> Result<(), Error> {
        self.signal(libc::SIGTERM)
    }

    pub fn kill(&mut self) -> Result<(), Error> {
        self.signal(libc::SIGKILL)
    }

    fn poll_status(&mut self) {
        if self.status.is_some() {
            return;
        }
        let mut raw = 0;
        let rc = unsafe { libc::waitpid(self.pid, &mut raw, libc::WNOHANG) };
        if rc == self.pid {
            self.status = decode_status(raw);
        } else if rc < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ECHILD) {
            // Reaped elsewhere; the real status is gone.
            self.status = Some(-1);
        }
    }

    fn wait_blocking(&mut self) -> Option<i32> {
        while self.status.is_none() {
            let mut raw = 0;
            let rc = unsafe { libc::waitpid(self.pid, &mut raw, 0) };
            if rc == self.pid {
                self.status = decode_status(raw);
            } else if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    self.status = Some(-1);
                }
            }
        }
        self.status
    }

    fn wait_stopped(&mut self) -> Result<(), Error> {
        loop {
            let mut raw = 0;
            let rc = unsafe { libc::waitpid(self.pid, &mut raw, libc::WUNTRACED) };
            if rc == self.pid {
                if libc::WIFSTOPPED(raw) {
                    return Ok(());
                }
                self.status = decode_status(raw);
                return Err(Error::new(ErrorKind::Internal)
                    .with_message("child exited before reaching its start barrier")
                    .with_pid(self.pid));
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(Error::io(err)
                    .with_message("waitpid failed")
                    .with_pid(self.pid));
            }
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        // `is_alive` reaps a child that already exited, daemon or not.
        if self.is_alive() && self.daemon {
            let _ = self.kill();
            self.wait_blocking();
        }
    }
}

fn decode_status(raw: libc::c_int) -> Option<i32> {
    if libc::WIFEXITED(raw) {
        return Some(libc::WEXITSTATUS(raw));
    }
    if libc::WIFSIGNALED(raw) {
        return Some(-libc::WTERMSIG(raw));
    }
    None
}

pub fn cpu_count() -> usize {
    num_cpus::get().max(1)
}

/// Cores this process may be scheduled on, in ascending order.
#[cfg(target_os = "linux")]
pub fn allowed_cores() -> Vec<usize> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) };
    if rc == 0 {
        let cores: Vec<usize> = (0..libc::CPU_SETSIZE as usize)
            .filter(|core| unsafe { libc::CPU_ISSET(*core, &set) })
            .collect();
        if !cores.is_empty() {
            return cores;
        }
    }
    (0..cpu_count()).collect()
}

#[cfg(not(target_os = "linux"))]
pub fn allowed_cores() -> Vec<usize> {
    (0..cpu_count()).collect()
}

#[cfg(target_os = "linux")]
pub fn set_affinity(pid: i32, core: usize) -> Result<(), Error> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(Error::new(ErrorKind::Usage).with_message(format!("core {core} out of range")));
    }
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe { libc::CPU_SET(core, &mut set) };
    let rc = unsafe { libc::sched_setaffinity(pid, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc != 0 {
        return Err(Error::io(io::Error::last_os_error())
            .with_message(format!("failed to pin to core {core}"))
            .with_pid(pid));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_affinity(pid: i32, _core: usize) -> Result<(), Error> {
    Err(Error::new(ErrorKind::NotSupported)
        .with_message("cpu affinity is not supported on this platform")
        .with_pid(pid))
}

#[cfg(test)]
mod tests {
    use super::{SpawnOptions, allowed_cores, cpu_count, spawn};
    use std::time::Duration;

    #[test]
    fn exit_status_is_reported() {
        let mut child = spawn(SpawnOptions::new(), || 7).expect("spawn");
        assert_eq!(child.wait(Some(Duration::from_secs(5))), Some(7));
        assert!(!child.is_alive());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dropping_an_exited_child_reaps_it() {
        let child = spawn(SpawnOptions::new(), || 0).expect("spawn");
        let pid = child.pid();
        // Block until the child has exited but leave it waitable.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(libc::P_PID, pid as libc::id_t, &mut info, libc::WEXITED | libc::WNOWAIT)
        };
        assert_eq!(rc, 0);

        drop(child);
        let rc = unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
        assert_eq!(rc, -1);
        assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::ECHILD));
    }

    #[test]
    fn panics_exit_with_panic_code() {
        let mut child = spawn(SpawnOptions::new(), || panic!("child panic")).expect("spawn");
        assert_eq!(child.wait(None), Some(super::PANIC_EXIT_CODE));
    }

    #[test]
    fn kill_reports_negative_signal() {
        let mut child = spawn(SpawnOptions::new(), || {
            std::thread::sleep(Duration::from_secs(30));
            0
        })
        .expect("spawn");
        assert!(child.is_alive());
        child.kill().expect("kill");
        assert_eq!(child.wait(Some(Duration::from_secs(5))), Some(-libc::SIGKILL));
    }

    #[test]
    fn suspended_child_waits_for_resume() {
        let mut child = spawn(SpawnOptions::new().with_suspended(true), || 3).expect("spawn");
        assert_eq!(child.wait(Some(Duration::from_millis(50))), None);
        child.resume().expect("resume");
        assert_eq!(child.wait(Some(Duration::from_secs(5))), Some(3));
    }

    #[test]
    fn cores_are_reported() {
        assert!(cpu_count() >= 1);
        assert!(!allowed_cores().is_empty());
    }
}
