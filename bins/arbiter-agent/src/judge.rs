/// Verdict engine.
///
/// **Core Responsibility:**
/// Run one compiled binary against one test case and decide pass/fail.
///
/// **Failure semantics:**
/// - Non-zero exit code: FAIL
/// - Terminated by a signal: FAIL, regardless of stdout
/// - Non-empty stderr: FAIL only when the configured policy says so
/// - Time limit exceeded: FAIL, process killed, partial output discarded
/// - Otherwise the externally supplied output checker decides
///
/// No side effects beyond process execution and its cleanup.
use crate::compiler::ExecSpec;
use anyhow::{Context, Result};
use arbiter_common::types::{RunResult, TestCase, Verdict};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Output-correctness predicate. Exact/tolerant semantics are the caller's
/// contract; the judge only consumes the boolean.
pub trait OutputChecker: Send + Sync {
    fn check(&self, actual: &str, expected: &str) -> bool;
}

/// Default checker: line-wise comparison with trailing whitespace and
/// trailing blank lines ignored.
pub struct LineChecker;

impl OutputChecker for LineChecker {
    fn check(&self, actual: &str, expected: &str) -> bool {
        normalize(actual) == normalize(expected)
    }
}

fn normalize(output: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = output.lines().map(|l| l.trim_end()).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

#[cfg(unix)]
fn terminating_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn terminating_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Run `exec` against one test case and derive the verdict.
pub async fn evaluate(
    exec: &ExecSpec,
    test: &TestCase,
    time_limit: Duration,
    stderr_fails: bool,
    checker: &dyn OutputChecker,
) -> Result<RunResult> {
    let started = Instant::now();

    let mut child = Command::new(&exec.program)
        .args(&exec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn solution process: {}", exec.program))?;

    if let Some(mut stdin) = child.stdin.take() {
        // A solution that reads nothing may close its end early; that is
        // not a judging error.
        if let Err(e) = stdin.write_all(test.input.as_bytes()).await {
            debug!(test_id = %test.id, error = %e, "stdin closed before input was fully written");
        }
    }

    let output = match tokio::time::timeout(time_limit, child.wait_with_output()).await {
        Ok(output) => output.context("Failed to collect solution output")?,
        Err(_) => {
            // Dropping the in-flight future kills the child via kill_on_drop.
            warn!(
                test_id = %test.id,
                limit_ms = time_limit.as_millis() as u64,
                "time limit exceeded"
            );
            return Ok(RunResult {
                test_id: test.id,
                verdict: Verdict::Fail,
                exit_code: None,
                signal: None,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: true,
            });
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let exit_code = output.status.code();
    let signal = terminating_signal(&output.status);
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    let verdict = if !output.status.success() || signal.is_some() {
        Verdict::Fail
    } else if stderr_fails && !stderr.is_empty() {
        Verdict::Fail
    } else if checker.check(&stdout, &test.expected_output) {
        Verdict::Pass
    } else {
        Verdict::Fail
    };

    debug!(
        test_id = %test.id,
        verdict = ?verdict,
        exit_code = ?exit_code,
        signal = ?signal,
        duration_ms = duration_ms,
        "test evaluated"
    );

    Ok(RunResult {
        test_id: test.id,
        verdict,
        exit_code,
        signal,
        stdout,
        stderr,
        duration_ms,
        timed_out: false,
    })
}
