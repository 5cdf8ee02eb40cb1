//! One-shot shell command execution for `exec` control messages.

use std::process::Stdio;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

pub const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Captured result of a shell invocation. A non-zero exit code is a value,
/// not an error; spawn failures and timeouts surface as exit code -1 with
/// the reason on stderr.
#[derive(Debug)]
pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
}

impl ExecOutcome {
    /// Combined output for the wire reply.
    pub fn combined(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        out
    }
}

fn shell_command(script: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/c").arg(script);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }
}

/// Run `script` through the system shell with a bounded timeout, capturing
/// stdout and stderr.
pub async fn run(script: &str) -> ExecOutcome {
    let started_at = OffsetDateTime::now_utc();
    let mut cmd = shell_command(script);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecOutcome {
                stdout: Vec::new(),
                stderr: format!("failed to start shell: {e}").into_bytes(),
                exit_code: -1,
                started_at,
                finished_at: OffsetDateTime::now_utc(),
            };
        }
    };

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let drain = |mut pipe: Option<tokio::process::ChildStdout>| async move {
        let mut buf = Vec::new();
        if let Some(p) = pipe.as_mut() {
            let _ = p.read_to_end(&mut buf).await;
        }
        buf
    };
    let drain_err = |mut pipe: Option<tokio::process::ChildStderr>| async move {
        let mut buf = Vec::new();
        if let Some(p) = pipe.as_mut() {
            let _ = p.read_to_end(&mut buf).await;
        }
        buf
    };

    let (status, stdout, stderr) = tokio::select! {
        result = async {
            // Drain both pipes concurrently so a full stderr buffer cannot
            // stall a child still writing to stdout.
            let (out, err) =
                tokio::join!(drain(stdout_pipe.take()), drain_err(stderr_pipe.take()));
            let status = child.wait().await;
            (status, out, err)
        } => result,
        _ = tokio::time::sleep(EXEC_TIMEOUT) => {
            warn!("exec timed out after {EXEC_TIMEOUT:?}, killing child");
            let _ = child.kill().await;
            let _ = child.wait().await;
            return ExecOutcome {
                stdout: Vec::new(),
                stderr: format!("command timed out after {}s", EXEC_TIMEOUT.as_secs())
                    .into_bytes(),
                exit_code: -1,
                started_at,
                finished_at: OffsetDateTime::now_utc(),
            };
        }
    };

    let exit_code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    };
    ExecOutcome {
        stdout,
        stderr,
        exit_code,
        started_at,
        finished_at: OffsetDateTime::now_utc(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_zero_exit() {
        let outcome = run("echo hostbeat").await;
        assert_eq!(outcome.exit_code, 0);
        assert!(String::from_utf8_lossy(&outcome.stdout).contains("hostbeat"));
        assert!(outcome.finished_at >= outcome.started_at);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_a_value() {
        let outcome = run("exit 3").await;
        assert_eq!(outcome.exit_code, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_captured_separately() {
        let outcome = run("echo out; echo err 1>&2").await;
        assert!(String::from_utf8_lossy(&outcome.stdout).contains("out"));
        assert!(String::from_utf8_lossy(&outcome.stderr).contains("err"));
        let combined = outcome.combined();
        assert!(combined.contains("out") && combined.contains("err"));
    }
}
