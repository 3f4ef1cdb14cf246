//! The INTERNAL bastion type's child-process path: rather than
//! managing an SSH client in-process, this shells out to the system `ssh`
//! binary with a nested `ProxyCommand` through the jumpbox, and treats the
//! child process's exit as tunnel termination.
//!
//! Process-group handling and graceful-then-forceful termination follow
//! the same shape the workspace's other process-managing code uses: spawn
//! into a fresh process group, SIGTERM, wait, SIGKILL on timeout.

use crate::endpoint::Endpoint;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL when tearing down the child.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait on ssh child process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Everything [`InternalTunnelProcess::spawn`] needs to build the `ssh -J`
/// invocation for an INTERNAL-type bastion.
pub struct InternalDialSpec {
    /// Path to the `ssh` binary; overridable in tests, `"ssh"` in
    /// production.
    pub ssh_binary: String,
    /// Jumpbox host the `ProxyCommand` hops through.
    pub jumpbox_ip: String,
    /// SSH user for both the jumpbox hop and the final bastion proxy host.
    pub user: String,
    /// Private key file, if any; falls back to agent/default identity
    /// resolution in `ssh` itself when absent.
    pub identity_file: Option<std::path::PathBuf>,
    /// Local bind port (the tunnel's `localhost:P`).
    pub local_port: u16,
    /// `(private-ip, port)` this tunnel forwards to, reached via the
    /// internal bastion proxy host.
    pub target: Endpoint,
    /// The `ztb-internal.bastion.<region>...` proxy host (see
    /// [`crate::realm::internal_bastion_proxy_address`]).
    pub proxy_host: String,
}

impl InternalDialSpec {
    /// Builds the `ssh` argument vector implementing the nested
    /// `ProxyCommand` convention: hop through the jumpbox to reach the
    /// internal bastion proxy host, then `-L` forward to the target.
    fn build_args(&self) -> Vec<String> {
        let proxy_command = format!(
            "ssh -W %h:%p {identity}{user}@{jumpbox}",
            identity = self
                .identity_file
                .as_ref()
                .map(|p| format!("-i {} ", p.display()))
                .unwrap_or_default(),
            user = self.user,
            jumpbox = self.jumpbox_ip,
        );

        let mut args = vec![
            "-N".to_string(),
            "-o".to_string(),
            format!("ProxyCommand={proxy_command}"),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-L".to_string(),
            format!(
                "{}:{}:{}",
                self.local_port,
                self.target.host(),
                self.target.port()
            ),
        ];

        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }

        args.push(format!("{}@{}", self.user, self.proxy_host));
        args
    }
}

/// A running `ssh -J`-equivalent child process, standing in for an
/// in-process SSH client for INTERNAL-type bastions.
pub struct InternalTunnelProcess {
    child: Child,
    command_line: String,
}

impl InternalTunnelProcess {
    /// Launches the child process. The command line is logged at `info`
    /// (without the private key's contents, only its path) so operators
    /// can reproduce it manually when debugging.
    pub fn spawn(spec: &InternalDialSpec) -> Result<Self, ProcessError> {
        let args = spec.build_args();
        let command_line = format!("{} {}", spec.ssh_binary, args.join(" "));
        info!(command = %command_line, "launching internal-bastion ssh child process");

        let mut command = Command::new(&spec.ssh_binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        Ok(Self { child, command_line })
    }

    /// Waits for the child to exit, the way the supervisor's retry loop
    /// treats a STANDARD tunnel's `ForwardingEngine` termination: the
    /// process exiting, with any status, ends this tunnel attempt.
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        self.child.wait().await.map_err(ProcessError::Wait)
    }

    /// SIGTERM, then SIGKILL after [`TERMINATE_GRACE`] if still alive.
    /// Idempotent: a child that already exited is a no-op.
    pub async fn terminate(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };

        #[cfg(unix)]
        {
            let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if result != 0 {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() != Some(libc::ESRCH) {
                    warn!(pid, error = %errno, "SIGTERM to ssh child process failed");
                }
            }
        }

        let graceful = tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await;
        if graceful.is_ok() {
            debug!(pid, "ssh child process exited after SIGTERM");
            return;
        }

        warn!(pid, "ssh child process did not exit within grace period, sending SIGKILL");
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> InternalDialSpec {
        InternalDialSpec {
            ssh_binary: "ssh".to_string(),
            jumpbox_ip: "203.0.113.10".to_string(),
            user: "opc".to_string(),
            identity_file: None,
            local_port: 6443,
            target: Endpoint::new("10.0.0.5", 6443),
            proxy_host: "ztb-internal.bastion.us-ashburn-1.oci.oracleiaas.com".to_string(),
        }
    }

    #[test]
    fn build_args_includes_proxy_command_and_local_forward() {
        let spec = sample_spec();
        let args = spec.build_args();
        let joined = args.join(" ");
        assert!(joined.contains("ProxyCommand=ssh -W %h:%p opc@203.0.113.10"));
        assert!(joined.contains("-L 6443:10.0.0.5:6443"));
        assert!(joined.contains("ztb-internal.bastion.us-ashburn-1.oci.oracleiaas.com"));
    }

    #[test]
    fn build_args_includes_identity_file_when_configured() {
        let mut spec = sample_spec();
        spec.identity_file = Some(std::path::PathBuf::from("/home/user/.ssh/id_ed25519"));
        let args = spec.build_args();
        let joined = args.join(" ");
        assert!(joined.contains("-i /home/user/.ssh/id_ed25519"));
        assert!(joined.contains("ProxyCommand=ssh -W %h:%p -i /home/user/.ssh/id_ed25519 opc@203.0.113.10"));
    }

    #[tokio::test]
    async fn spawn_true_exits_cleanly() {
        let mut spec = sample_spec();
        spec.ssh_binary = "true".to_string();
        let mut process = InternalTunnelProcess::spawn(&spec).unwrap();
        let status = process.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn terminate_on_long_running_process_is_idempotent() {
        let mut spec = sample_spec();
        spec.ssh_binary = "sleep".to_string();
        let mut process = InternalTunnelProcess::spawn(&spec).unwrap();
        process.terminate().await;
        process.terminate().await;
    }
}
