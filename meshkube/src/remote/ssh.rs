//! [`RemoteExecutor`] backed by the system OpenSSH client.
//!
//! The script is streamed to `bash -s` on stdin so nothing is written to the
//! remote disk and no argument quoting is involved. Exit status 255 is how
//! `ssh` reports its own connection failures; that is the only outcome
//! retried under the dial policy.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use meshkube_shared::constants::ssh::DIAL_FAILURE_EXIT_CODE;
use meshkube_shared::errors::RemoteError;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{ExecOutput, ProxyHop, RemoteExecutor, RemoteScript, RemoteTarget, tail};
use crate::retry::BackoffPolicy;

/// Runs scripts over `ssh`, optionally through a bastion.
#[derive(Clone, Debug)]
pub struct SshExecutor {
    identity: PathBuf,
    connect_timeout: Duration,
    dial: BackoffPolicy,
    program: PathBuf,
}

impl SshExecutor {
    pub fn new(identity: impl Into<PathBuf>, connect_timeout: Duration, dial: BackoffPolicy) -> Self {
        Self {
            identity: identity.into(),
            connect_timeout,
            dial,
            program: PathBuf::from("ssh"),
        }
    }

    /// Use a different ssh binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-i".into(),
            self.identity.display().to_string(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".into(),
            "ServerAliveInterval=15".into(),
            "-o".into(),
            "ServerAliveCountMax=4".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
        ]
    }

    fn proxy_command(&self, proxy: &ProxyHop) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.common_options());
        parts.extend([
            "-p".into(),
            proxy.port.to_string(),
            "-W".into(),
            "%h:%p".into(),
            format!("{}@{}", proxy.user, proxy.host),
        ]);
        parts.join(" ")
    }

    /// Arguments for one connection attempt.
    pub fn args(&self, target: &RemoteTarget) -> Vec<String> {
        let mut args = self.common_options();
        args.extend(["-p".into(), target.port.to_string()]);
        if let Some(proxy) = &target.proxy {
            args.extend(["-o".into(), format!("ProxyCommand={}", self.proxy_command(proxy))]);
        }
        args.extend([
            format!("{}@{}", target.user, target.host),
            "bash".into(),
            "-s".into(),
        ]);
        args
    }

    async fn attempt(
        &self,
        target: &RemoteTarget,
        script: &RemoteScript,
        timeout: Duration,
        attempt: u32,
    ) -> Result<ExecOutput, RemoteError> {
        tracing::debug!(
            node = %target.node,
            target = %target,
            step = script.step(),
            attempt,
            "Running remote script"
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(target))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| RemoteError::Spawn {
            node: target.node.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // ssh exits early when the dial fails; the exit status says why
            if let Err(e) = stdin.write_all(script.text().as_bytes()).await {
                tracing::debug!(node = %target.node, error = %e, "Failed to stream script");
            }
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout {
                node: target.node.clone(),
                host: target.host.clone(),
                step: script.step().to_string(),
                after: timeout,
            })?
            .map_err(|source| RemoteError::Spawn {
                node: target.node.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        match output.status.code() {
            Some(0) => Ok(ExecOutput { stdout, stderr }),
            Some(DIAL_FAILURE_EXIT_CODE) => Err(RemoteError::DialTimeout {
                node: target.node.clone(),
                host: target.host.clone(),
                attempts: attempt,
                last: tail(stderr.trim(), 5),
            }),
            code => Err(RemoteError::ScriptFailed {
                node: target.node.clone(),
                host: target.host.clone(),
                step: script.step().to_string(),
                exit_code: code.unwrap_or(-1),
                stdout: tail(&stdout, 40),
                stderr: tail(&stderr, 40),
            }),
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        target: &RemoteTarget,
        script: &RemoteScript,
        timeout: Duration,
    ) -> Result<ExecOutput, RemoteError> {
        let operation = format!("ssh {}", target.node);
        self.dial
            .retry_if(&operation, RemoteError::is_transient, |attempt| {
                self.attempt(target, script, timeout, attempt)
            })
            .await
            .inspect_err(|e| {
                if e.is_dial_failure() {
                    tracing::error!(node = %target.node, target = %target, error = %e, "Node unreachable over ssh");
                }
            })
    }
}
