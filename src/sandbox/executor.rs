//! Constrained execution of rendered tool invocations
//!
//! Subprocesses run with a scrubbed environment and a fixed `PATH`, under a
//! hard wall-clock timeout, with both output streams captured up to a byte
//! cap. Output past the cap is drained and discarded so a runaway tool can
//! neither exhaust memory nor deadlock on a full pipe. On timeout the whole
//! process group is killed, children included.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;

use crate::{Error, Result};

/// The only `PATH` tool subprocesses ever see
pub const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Default captured-output cap per stream
pub const DEFAULT_OUTPUT_CAP: usize = 256 * 1024;

/// Execution constraints for one invocation
#[derive(Debug, Clone)]
pub struct ExecLimits {
    /// Hard wall-clock timeout
    pub timeout: Duration,
    /// Captured-output byte cap per stream
    pub output_cap: usize,
}

/// Captured result of a script invocation
#[derive(Debug)]
pub struct ScriptOutput {
    /// Exit code; `None` when the process was killed on timeout
    pub exit_code: Option<i32>,
    /// Captured stdout, at most `output_cap` bytes
    pub stdout: Vec<u8>,
    /// Whether stdout exceeded the cap
    pub stdout_truncated: bool,
    /// Captured stderr, at most `output_cap` bytes
    pub stderr: Vec<u8>,
    /// Whether stderr exceeded the cap
    pub stderr_truncated: bool,
    /// Whether the timeout fired
    pub timed_out: bool,
    /// Wall-clock duration
    pub duration: Duration,
}

/// Captured result of an HTTP invocation
#[derive(Debug)]
pub struct HttpOutput {
    /// Response status code
    pub status: u16,
    /// Response body, at most `output_cap` bytes
    pub body: Vec<u8>,
    /// Whether the body exceeded the cap
    pub truncated: bool,
    /// Wall-clock duration
    pub duration: Duration,
}

/// Run a rendered argv under the sandbox constraints
///
/// # Errors
///
/// Returns [`Error::Execution`] if the program cannot be resolved or spawned;
/// a started process always produces a `ScriptOutput`, timeout included
pub async fn run_script(argv: &[String], limits: &ExecLimits) -> Result<ScriptOutput> {
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| Error::Validation("empty argv".to_string()))?;

    // Resolve against the sandbox PATH only; the caller's PATH is irrelevant
    let cwd = std::env::current_dir()?;
    let program = which::which_in(program, Some(SAFE_PATH), cwd)
        .map_err(|e| Error::Execution(format!("program {program} not found: {e}")))?;

    let mut cmd = std::process::Command::new(program);
    cmd.args(rest);
    cmd.env_clear();
    cmd.env("PATH", SAFE_PATH);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so a timeout kill reaches any children
        cmd.process_group(0);
    }

    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Execution(format!("failed to spawn tool process: {e}")))?;

    let cap = limits.output_cap;
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move { read_capped(stdout_pipe, cap).await });
    let stderr_task = tokio::spawn(async move { read_capped(stderr_pipe, cap).await });

    let (exit_code, timed_out) = match tokio::time::timeout(limits.timeout, child.wait()).await {
        Ok(status) => {
            let status =
                status.map_err(|e| Error::Execution(format!("tool process failed: {e}")))?;
            (status.code(), false)
        }
        Err(_) => {
            kill_group(&mut child);
            let _ = child.wait().await;
            (None, true)
        }
    };

    let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
    let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();

    Ok(ScriptOutput {
        exit_code,
        stdout,
        stdout_truncated,
        stderr,
        stderr_truncated,
        timed_out,
        duration: start.elapsed(),
    })
}

/// Run a rendered HTTP invocation under the sandbox constraints
///
/// # Errors
///
/// Returns [`Error::Timeout`] when the call exceeds its budget and
/// [`Error::Execution`] on transport failure; a received response always
/// produces an `HttpOutput`, whatever its status
pub async fn run_http(
    url: &str,
    method: &str,
    headers: &HashMap<String, String>,
    body: Option<Vec<u8>>,
    limits: &ExecLimits,
) -> Result<HttpOutput> {
    let client = reqwest::Client::builder()
        .timeout(limits.timeout)
        .build()
        .map_err(|e| Error::Execution(format!("failed to build http client: {e}")))?;

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| Error::Validation(format!("invalid http method {method}")))?;

    let mut request = client.request(method, url);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    if let Some(body) = body {
        request = request.body(body);
    }

    let start = Instant::now();
    let mut response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            Error::Timeout(format!("http tool exceeded {:?}", limits.timeout))
        } else {
            Error::Execution(format!("http tool failed: {e}"))
        }
    })?;

    let status = response.status().as_u16();

    // Stream the body so an oversized response never fully buffers
    let mut body = Vec::new();
    let mut truncated = false;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if body.len() < limits.output_cap {
                    let take = (limits.output_cap - body.len()).min(chunk.len());
                    body.extend_from_slice(&chunk[..take]);
                    if take < chunk.len() {
                        truncated = true;
                        break;
                    }
                } else {
                    truncated = true;
                    break;
                }
            }
            Ok(None) => break,
            Err(e) if e.is_timeout() => {
                return Err(Error::Timeout(format!(
                    "http tool exceeded {:?}",
                    limits.timeout
                )));
            }
            Err(e) => return Err(Error::Execution(format!("http body read failed: {e}"))),
        }
    }

    Ok(HttpOutput {
        status,
        body,
        truncated,
        duration: start.elapsed(),
    })
}

/// Read a pipe to EOF, keeping at most `cap` bytes
///
/// Bytes past the cap are read and dropped: the child must never block on a
/// full pipe just because we stopped caring about its output.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> (Vec<u8>, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };

    let mut captured = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if captured.len() < cap {
                    let take = (cap - captured.len()).min(n);
                    captured.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
        }
    }

    (captured, truncated)
}

#[cfg(unix)]
fn kill_group(child: &mut tokio::process::Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            tracing::warn!(pid, error = %e, "failed to kill tool process group");
        }
    } else {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut tokio::process::Child) {
    // Best effort without process groups
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(timeout_ms: u64, cap: usize) -> ExecLimits {
        ExecLimits {
            timeout: Duration::from_millis(timeout_ms),
            output_cap: cap,
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_script(&argv(&["echo", "hello"]), &limits(5_000, 1024))
            .await
            .unwrap();

        assert_eq!(out.exit_code, Some(0));
        assert!(!out.timed_out);
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let out = run_script(&argv(&["false"]), &limits(5_000, 1024))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(1));
    }

    #[tokio::test]
    async fn unknown_program_is_an_execution_error() {
        let err = run_script(&argv(&["definitely-not-a-program-xyz"]), &limits(1_000, 1024))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let start = Instant::now();
        let out = run_script(&argv(&["sleep", "30"]), &limits(300, 1024))
            .await
            .unwrap();

        assert!(out.timed_out);
        assert!(out.exit_code.is_none());
        // The 30s sleep must not have run to completion
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn output_is_capped_not_buffered() {
        // A megabyte of zeroes against a 4 KiB cap: the capture stops at the
        // cap and the child still runs to completion
        let cap = 4096;
        let out = run_script(&argv(&["head", "-c", "1000000", "/dev/zero"]), &limits(10_000, cap))
            .await
            .unwrap();

        assert!(out.stdout_truncated);
        assert!(out.stdout.len() <= cap);
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn environment_is_scrubbed() {
        let out = run_script(&argv(&["env"]), &limits(5_000, 65_536)).await.unwrap();

        // The child sees the sandbox PATH and nothing inherited
        let stdout = String::from_utf8_lossy(&out.stdout);
        let lines: Vec<&str> = stdout.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(lines, vec![format!("PATH={SAFE_PATH}")]);
    }
}
