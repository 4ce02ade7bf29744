// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote execution and file transfer on slave hosts.
//!
//! ssh does not forward signals to remote processes and rsync offers no
//! handle beyond its local child, so the two escape hatches the engine
//! needs — terminating an in-flight copy, and signalling a remote pid —
//! both go through here rather than through the transport itself.

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Errors from remote execution and file transfer.
#[derive(Debug, Error)]
pub enum RemoteExecError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("remote command on {host} failed: {detail}")]
    CommandFailed { host: String, detail: String },
    #[error("file copy exited with {status}")]
    CopyFailed { status: std::process::ExitStatus },
    #[error("file copy terminated")]
    CopyTerminated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An in-flight recursive copy to a remote host.
///
/// The owning worker consumes the process with [`CopyProcess::wait`];
/// the kill path holds a [`CopyAborter`] taken beforehand, so a copy can
/// be torn down from another task while the worker is blocked on it.
pub struct CopyProcess {
    kind: CopyKind,
}

enum CopyKind {
    /// A spawned rsync child.
    Child(Child),
    /// Scripted copy used by fake remotes in tests.
    Scripted {
        done: oneshot::Receiver<Result<(), RemoteExecError>>,
        cancel: CancellationToken,
    },
}

impl CopyProcess {
    pub fn from_child(child: Child) -> Self {
        Self { kind: CopyKind::Child(child) }
    }

    /// A copy whose outcome is decided by the returned sender; the
    /// returned token aborts it. Used by fake remotes.
    pub fn scripted(
    ) -> (Self, oneshot::Sender<Result<(), RemoteExecError>>, CancellationToken) {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        (Self { kind: CopyKind::Scripted { done: rx, cancel: cancel.clone() } }, tx, cancel)
    }

    /// Handle for terminating this copy from another task.
    pub fn aborter(&self) -> CopyAborter {
        match &self.kind {
            CopyKind::Child(child) => CopyAborter(AbortKind::Pid(child.id().map(|p| p as i32))),
            CopyKind::Scripted { cancel, .. } => CopyAborter(AbortKind::Token(cancel.clone())),
        }
    }

    /// Wait for the copy to finish. A copy torn down via its aborter
    /// reports failure (signal death or [`RemoteExecError::CopyTerminated`]).
    pub async fn wait(self) -> Result<(), RemoteExecError> {
        match self.kind {
            CopyKind::Child(mut child) => {
                let status = child.wait().await?;
                if status.success() {
                    Ok(())
                } else {
                    Err(RemoteExecError::CopyFailed { status })
                }
            }
            CopyKind::Scripted { done, cancel } => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(RemoteExecError::CopyTerminated),
                    result = done => result.unwrap_or(Err(RemoteExecError::CopyTerminated)),
                }
            }
        }
    }
}

/// Terminates an in-flight [`CopyProcess`] from outside the waiting task.
#[derive(Clone, Debug)]
pub struct CopyAborter(AbortKind);

#[derive(Clone, Debug)]
enum AbortKind {
    Pid(Option<i32>),
    Token(CancellationToken),
}

impl CopyAborter {
    /// Deliver SIGTERM to the copy child (or cancel a scripted copy).
    pub fn terminate(&self) {
        match &self.0 {
            AbortKind::Pid(Some(pid)) => {
                if let Err(e) = signal::kill(Pid::from_raw(*pid), Signal::SIGTERM) {
                    tracing::warn!(pid, error = %e, "failed to signal copy process");
                }
            }
            AbortKind::Pid(None) => {}
            AbortKind::Token(token) => token.cancel(),
        }
    }
}

/// Remote shell and file transfer operations on slave hosts.
///
/// Hosts are `user@ip` strings throughout.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Create the given directories on the remote host (like `mkdir -p`).
    async fn ensure_remote_dirs(&self, host: &str, dirs: &[PathBuf])
        -> Result<(), RemoteExecError>;

    /// Start a recursive copy of `src` (on `src_host`) into `dst_dir` on
    /// `dst_host`, returning the in-flight process.
    async fn copy_tree_process(
        &self,
        src: &Path,
        src_host: &str,
        dst_dir: &Path,
        dst_host: &str,
    ) -> Result<CopyProcess, RemoteExecError>;

    /// Wrap a local argv so it executes on `host` instead. With
    /// `agent_forwarding`, the remote session can reach further hosts
    /// with the submitting user's keys.
    fn command_args_on(&self, host: &str, args: &[String], agent_forwarding: bool)
        -> Vec<String>;

    /// Run a command on the remote host and wait for it.
    async fn run_command_on(&self, host: &str, args: &[String]) -> Result<(), RemoteExecError>;
}

/// Production [`RemoteExec`] over the system `ssh` and `rsync` binaries.
///
/// Authentication is the caller's problem: the intended usage is an
/// ssh-agent loaded with the instances' keypair in the environment the
/// dispatcher starts from.
#[derive(Clone, Copy, Debug, Default)]
pub struct SshRemote;

/// ssh joins its remote argv with spaces and hands the result to the
/// remote shell, so arguments carrying whitespace must be quoted or
/// they get re-split on the far side.
fn shell_quoted(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            if arg.chars().any(char::is_whitespace) {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.clone()
            }
        })
        .collect()
}

impl SshRemote {
    pub fn new() -> Self {
        Self
    }

    fn ssh_command(host: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-q").arg(host).stdin(Stdio::null());
        cmd
    }

    async fn run_checked(
        mut cmd: Command,
        host: &str,
        tool: &'static str,
    ) -> Result<(), RemoteExecError> {
        let output =
            cmd.output().await.map_err(|source| RemoteExecError::Spawn { tool, source })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteExecError::CommandFailed {
                host: host.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl RemoteExec for SshRemote {
    async fn ensure_remote_dirs(
        &self,
        host: &str,
        dirs: &[PathBuf],
    ) -> Result<(), RemoteExecError> {
        if dirs.is_empty() {
            return Ok(());
        }
        let mut cmd = Self::ssh_command(host);
        cmd.arg("mkdir").arg("-p");
        for dir in dirs {
            cmd.arg(dir);
        }
        Self::run_checked(cmd, host, "ssh").await
    }

    async fn copy_tree_process(
        &self,
        src: &Path,
        src_host: &str,
        dst_dir: &Path,
        dst_host: &str,
    ) -> Result<CopyProcess, RemoteExecError> {
        let source = if src_host == "localhost" {
            src.display().to_string()
        } else {
            format!("{}:{}", src_host, src.display())
        };
        let target = format!("{}:{}/", dst_host, dst_dir.display());
        let mut cmd = Command::new("rsync");
        cmd.arg("-az")
            .arg(&source)
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = cmd.spawn().map_err(|source| RemoteExecError::Spawn { tool: "rsync", source })?;
        tracing::debug!(%source, %target, "copy started");
        Ok(CopyProcess::from_child(child))
    }

    fn command_args_on(
        &self,
        host: &str,
        args: &[String],
        agent_forwarding: bool,
    ) -> Vec<String> {
        let mut out = vec!["ssh".to_string(), "-q".to_string()];
        if agent_forwarding {
            out.push("-A".to_string());
        }
        out.push(host.to_string());
        out.extend(shell_quoted(args));
        out
    }

    async fn run_command_on(&self, host: &str, args: &[String]) -> Result<(), RemoteExecError> {
        let mut cmd = Self::ssh_command(host);
        cmd.args(shell_quoted(args));
        Self::run_checked(cmd, host, "ssh").await
    }
}

#[cfg(test)]
#[path = "remote_tests.rs"]
mod tests;
