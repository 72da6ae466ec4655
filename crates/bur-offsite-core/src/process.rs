//! Helper for invoking external processes (`ssh`, `rsync`, `tar`, `gpg`, `gzip`, `du`, `find`)
//! with a captured stdout/stderr and an enforced timeout (spec §9).

use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

/// Output of a finished external process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status_success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Error raised when spawning or waiting on an external process fails.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("command '{command}' timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run `program` with `args`, capturing stdout/stderr, aborting after `timeout_duration`.
///
/// A timed-out child is killed (best-effort) before returning `ProcessError::Timeout`. The
/// caller decides how to translate a non-zero exit status; this helper only reports it.
pub async fn run(
    program: &str,
    args: &[&str],
    timeout_duration: Duration,
) -> Result<ProcessOutput, ProcessError> {
    let command_line = format!("{program} {}", args.join(" "));
    let span = tracing::debug_span!("external_process", command = %command_line);
    let _enter = span.enter();

    let mut child = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: command_line.clone(),
            source,
        })?;

    let wait = child.wait_with_output();
    match timeout(timeout_duration, wait).await {
        Ok(Ok(output)) => Ok(ProcessOutput {
            status_success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(source)) => Err(ProcessError::Spawn {
            command: command_line,
            source,
        }),
        Err(_elapsed) => Err(ProcessError::Timeout {
            command: command_line,
            timeout_secs: timeout_duration.as_secs(),
        }),
    }
}

/// Run an SSH command on `host`, piping `command` to `ssh host bash` over stdin, exactly as
/// the source's `run_ssh_command` does (`ssh -o LogLevel=ERROR host bash`).
pub async fn run_ssh(
    host: &str,
    command: &str,
    timeout_duration: Duration,
) -> Result<ProcessOutput, ProcessError> {
    if host.trim().is_empty() || command.trim().is_empty() {
        return Ok(ProcessOutput {
            status_success: true,
            stdout: String::new(),
            stderr: String::new(),
        });
    }

    let command_line = format!("ssh {host} bash <<< <command>");
    let mut child = Command::new("ssh")
        .args(["-o", "LogLevel=ERROR", host, "bash"])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: command_line.clone(),
            source,
        })?;

    {
        use tokio::io::AsyncWriteExt;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let command = command.to_owned();
        let write = async move {
            stdin.write_all(command.as_bytes()).await?;
            stdin.shutdown().await
        };
        if let Err(source) = write.await {
            let _ = child.kill().await;
            return Err(ProcessError::Spawn {
                command: command_line,
                source,
            });
        }
    }

    let wait = child.wait_with_output();
    match timeout(timeout_duration, wait).await {
        Ok(Ok(output)) => Ok(ProcessOutput {
            status_success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(source)) => Err(ProcessError::Spawn {
            command: command_line,
            source,
        }),
        Err(_elapsed) => Err(ProcessError::Timeout {
            command: command_line,
            timeout_secs: timeout_duration.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_a_trivial_command() {
        let out = run("true", &[], Duration::from_secs(5)).await.unwrap();
        assert!(out.status_success);
    }

    #[tokio::test]
    async fn captures_stderr_on_failure() {
        let out = run("sh", &["-c", "echo boom >&2; exit 1"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!out.status_success);
        assert!(out.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn times_out_long_running_commands() {
        let err = run("sleep", &["5"], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
    }
}
