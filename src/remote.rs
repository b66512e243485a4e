//! Remote execution channel.

use crate::core::command::ssh_args;
use crate::core::error::RemoteError;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Exit status ssh reserves for its own failures.
const SSH_FAILURE_STATUS: i32 = 255;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a shell script on a remote host.
///
/// Implementations must report transport failures (timeout, refused connection, rejected
/// credentials) as [`RemoteError`]; a script that ran and exited non-zero is still `Ok`.
pub trait RemoteExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        host: &str,
        script: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<RemoteOutput, RemoteError>> + Send;
}

/// Executes scripts through the system `ssh` client in batch mode.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    connect_timeout_secs: u64,
}

impl SshExecutor {
    pub fn new(connect_timeout_secs: u64) -> Self {
        Self {
            connect_timeout_secs,
        }
    }
}

impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        host: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<RemoteOutput, RemoteError> {
        tracing::debug!("ssh {host}: {script}");

        let child = Command::new("ssh")
            .args(ssh_args(host, self.connect_timeout_secs))
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout(timeout))??;

        let output = RemoteOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        classify(output)
    }
}

fn classify(output: RemoteOutput) -> Result<RemoteOutput, RemoteError> {
    if output.status != Some(SSH_FAILURE_STATUS) {
        return Ok(output);
    }
    let reason = output
        .stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("ssh exited with status 255")
        .trim()
        .to_string();
    if reason.contains("Permission denied") || reason.contains("Host key verification failed") {
        Err(RemoteError::Authentication(reason))
    } else {
        Err(RemoteError::Connection(reason))
    }
}
