// CLI integration tests for run/pin/cores flows and the error envelope.
use std::process::Command;

use serde_json::Value;
use tandem::api::{ErrorKind, to_exit_code};

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_tandem");
    Command::new(exe)
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).expect("valid json")
}

fn parse_json_line(output: &[u8]) -> Value {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().next().expect("json line");
    parse_json(line)
}

fn workers(value: &Value) -> &Vec<Value> {
    value
        .get("workers")
        .and_then(|workers| workers.as_array())
        .expect("workers array")
}

#[test]
fn run_reports_every_worker() {
    let output = cmd()
        .args(["run", "--workers", "3", "--", "true"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let report = parse_json_line(&output.stdout);
    let workers = workers(&report);
    assert_eq!(workers.len(), 3);
    for (index, worker) in workers.iter().enumerate() {
        assert_eq!(worker["index"], index);
        assert_eq!(worker["exit_code"], 0);
        assert!(worker["pid"].as_i64().unwrap() > 0);
    }
    assert_eq!(report["restarts"], 0);
}

#[test]
fn failing_workers_map_to_task_exit_code() {
    let output = cmd()
        .args(["run", "--workers", "2", "--async-start", "--", "sh", "-c", "exit 3"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(to_exit_code(ErrorKind::Task)));
    let report = parse_json_line(&output.stdout);
    assert!(workers(&report).iter().all(|worker| worker["exit_code"] == 3));
}

#[test]
fn restart_failed_reruns_only_the_failed_worker() {
    let temp = tempfile::tempdir().expect("tempdir");
    let claim = temp.path().join("claim");
    // The first worker to create the claim directory fails; reruns succeed.
    let script = format!("if mkdir '{}' 2>/dev/null; then exit 1; else exit 0; fi", claim.display());
    let output = cmd()
        .args(["run", "--workers", "3", "--restart-failed", "2", "--", "sh", "-c", &script])
        .output()
        .expect("run");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report = parse_json_line(&output.stdout);
    assert_eq!(report["restarts"], 1);
    assert!(workers(&report).iter().all(|worker| worker["exit_code"] == 0));
}

#[test]
fn run_timeout_kills_workers_and_reports_error() {
    let output = cmd()
        .args(["run", "--workers", "2", "--timeout", "100ms", "--", "sleep", "5"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(to_exit_code(ErrorKind::TimedOut)));
    assert!(output.stdout.is_empty());
    let err = parse_json_line(&output.stderr);
    assert_eq!(err["error"]["kind"], "TimedOut");
    assert!(err["error"]["message"].as_str().unwrap().contains("2 worker(s)"));
    assert!(err["error"].get("hint").is_some());
}

#[test]
fn missing_command_exits_127() {
    let output = cmd()
        .args(["run", "--", "/nonexistent/tandem-test-binary"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(to_exit_code(ErrorKind::Task)));
    let report = parse_json_line(&output.stdout);
    assert_eq!(workers(&report)[0]["exit_code"], 127);
}

#[test]
fn invalid_duration_is_a_usage_error() {
    let output = cmd()
        .args(["run", "--timeout", "soon", "--", "true"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(to_exit_code(ErrorKind::Usage)));
    let err = parse_json_line(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert_eq!(err["error"]["message"], "invalid duration");
}

#[test]
fn zero_workers_is_a_usage_error() {
    let output = cmd()
        .args(["run", "--workers", "0", "--", "true"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(to_exit_code(ErrorKind::Usage)));
    let err = parse_json_line(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
}

#[test]
fn cores_lists_allowed_cores() {
    let output = cmd().arg("cores").output().expect("cores");
    assert!(output.status.success());
    let report = parse_json_line(&output.stdout);
    let cores = report["cores"].as_array().expect("cores array");
    assert!(!cores.is_empty());
    assert!(report["cpu_count"].as_u64().unwrap() >= 1);
}

#[cfg(target_os = "linux")]
#[test]
fn pin_runs_tasks_round_robin() {
    let cores = parse_json_line(&cmd().arg("cores").output().expect("cores").stdout)["cores"]
        .as_array()
        .expect("cores array")
        .clone();

    let output = cmd()
        .args(["pin", "--tasks", "2", "--timeout", "10s", "--", "true"])
        .output()
        .expect("pin");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report = parse_json_line(&output.stdout);
    let tasks = report["tasks"].as_array().expect("tasks array");
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["core"], cores[0]);
    assert_eq!(tasks[1]["core"], cores[1 % cores.len()]);
    assert!(tasks.iter().all(|task| task["exit_code"] == 0));
}

#[test]
fn version_emits_json() {
    let output = cmd().arg("version").output().expect("version");
    assert!(output.status.success());
    let version = parse_json_line(&output.stdout);
    assert_eq!(version["name"], "tandem");
    assert_eq!(version["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn completion_prints_a_script() {
    let output = cmd().args(["completion", "bash"]).output().expect("completion");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("tandem"));
}
