//! Sandboxed child execution for uploaded code-based tests.
//!
//! Submitted code never runs in-process: the stored source is executed in
//! a child interpreter with its own browser. The child reports its result
//! as a single stdout line prefixed `E2E_RESULT_JSON=`; everything else on
//! stdout/stderr is treated as log noise.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

/// Marker the child must print before its JSON result.
pub const RESULT_PREFIX: &str = "E2E_RESULT_JSON=";

/// The child's structured result.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxResult {
    pub status: String,
    #[serde(default)]
    pub elapsed_ms: Option<f64>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub browser_infra_error: bool,
}

/// What happened to the child process.
#[derive(Debug)]
pub enum SandboxOutcome {
    /// The child finished and produced a parseable result line.
    Finished(SandboxResult),
    /// The child finished without a result line (protocol violation).
    ProtocolError { exit_code: Option<i32>, tail: String },
    /// The hard timeout fired and the child was killed.
    TimedOut,
    /// The child could not be spawned.
    SpawnFailed(String),
}

/// Scan captured stdout for the last result line.
#[must_use]
pub fn parse_result_output(stdout: &str) -> Option<SandboxResult> {
    for line in stdout.lines().rev() {
        let line = line.trim();
        if let Some(payload) = line.strip_prefix(RESULT_PREFIX) {
            if let Ok(result) = serde_json::from_str::<SandboxResult>(payload) {
                return Some(result);
            }
        }
    }
    None
}

/// Run one source file in a child interpreter with a hard timeout.
///
/// The child receives the job parameters as arguments and environment;
/// on timeout it is killed and the run is reported as infra-degraded by
/// the caller.
pub async fn run_in_sandbox(
    interpreter: &str,
    source_path: &Path,
    base_url: &str,
    artifacts_dir: &Path,
    timeout: Duration,
    trace_on_failure: bool,
) -> SandboxOutcome {
    let mut command = Command::new(interpreter);
    command
        .arg(source_path)
        .arg("--base-url")
        .arg(base_url)
        .arg("--artifacts-dir")
        .arg(artifacts_dir)
        .arg("--timeout-seconds")
        .arg(timeout.as_secs().to_string())
        .env("E2E_BASE_URL", base_url)
        .env("E2E_ARTIFACTS_DIR", artifacts_dir)
        .env("E2E_TRACE_ON_FAILURE", if trace_on_failure { "1" } else { "0" })
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return SandboxOutcome::SpawnFailed(e.to_string()),
    };

    let mut stdout_pipe = child.stdout.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    // The grace margin covers interpreter startup and teardown; the child
    // enforces its own budget on browser operations.
    let hard_timeout = timeout + Duration::from_secs(15);
    let exit = match tokio::time::timeout(hard_timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            warn!(error = %e, "child wait failed");
            let _ = child.kill().await;
            return SandboxOutcome::ProtocolError {
                exit_code: None,
                tail: e.to_string(),
            };
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            return SandboxOutcome::TimedOut;
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    match parse_result_output(&stdout) {
        Some(result) => SandboxOutcome::Finished(result),
        None => {
            let tail: String = stdout.chars().rev().take(2_000).collect::<String>();
            SandboxOutcome::ProtocolError {
                exit_code: exit.code(),
                tail: tail.chars().rev().collect(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_last_result_line() {
        let stdout = [
            "booting browser...",
            r#"E2E_RESULT_JSON={"status": "fail", "error_kind": "assertion_failed"}"#,
            "retrying once",
            r#"E2E_RESULT_JSON={"status": "pass", "elapsed_ms": 420.5, "artifacts": {"run_log": "run.log"}}"#,
            "done",
        ]
        .join("\n");
        let result = parse_result_output(&stdout).unwrap();
        assert_eq!(result.status, "pass");
        assert_eq!(result.elapsed_ms, Some(420.5));
        assert_eq!(result.artifacts.get("run_log").map(String::as_str), Some("run.log"));
    }

    #[test]
    fn missing_or_malformed_result_is_none() {
        assert!(parse_result_output("no marker here").is_none());
        assert!(parse_result_output("E2E_RESULT_JSON=not json").is_none());
    }

    #[tokio::test]
    async fn child_result_round_trip() {
        // A stand-in child that speaks the protocol via /bin/sh.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_test.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho log line\necho 'E2E_RESULT_JSON={\"status\": \"pass\", \"elapsed_ms\": 5}'\n",
        )
        .unwrap();

        let outcome = run_in_sandbox(
            "sh",
            &script,
            "https://app.internal.dev",
            dir.path(),
            Duration::from_secs(10),
            false,
        )
        .await;
        match outcome {
            SandboxOutcome::Finished(result) => assert_eq!(result.status, "pass"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hard_timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("sleepy.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 60\n").unwrap();

        let started = std::time::Instant::now();
        let outcome = run_in_sandbox(
            "sh",
            &script,
            "https://app.internal.dev",
            dir.path(),
            Duration::from_millis(100),
            false,
        )
        .await;
        assert!(matches!(outcome, SandboxOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn protocol_violation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("silent.sh");
        std::fs::write(&script, "#!/bin/sh\necho just logs\n").unwrap();

        let outcome = run_in_sandbox(
            "sh",
            &script,
            "https://app.internal.dev",
            dir.path(),
            Duration::from_secs(10),
            false,
        )
        .await;
        match outcome {
            SandboxOutcome::ProtocolError { tail, .. } => assert!(tail.contains("just logs")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
