//! Remote execution on the build VM.
//!
//! A [`RemoteSession`] holds only the target. Connecting performs the single
//! transport acquisition for the build and yields a [`ConnectedSession`],
//! which owns the shell until [`ConnectedSession::close`]. Every command takes
//! `&mut self`, so at most one command is in flight per session.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_REMOTE_WORKSPACE;
use crate::storage::{ObjectRef, ObjectStore};
use crate::wait::{PollSchedule, WaitError, poll_until};

pub mod commands;
mod types;
pub mod winrm;

pub use commands::local_file_name;
pub use types::{
    Connector, OutputMode, RemoteCommandOutput, RemoteShell, RemoteTarget, SessionError,
    TransportError, TransportFuture,
};

const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Runs `work` unless `cancel` has fired or fires first. A token that is
/// already cancelled wins even when `work` would complete immediately.
async fn unless_cancelled<T, F>(cancel: &CancellationToken, work: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    if cancel.is_cancelled() {
        return Err(TransportError::Cancelled);
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(TransportError::Cancelled),
        outcome = work => outcome,
    }
}

/// Unconnected session: the target plus session options.
#[derive(Clone, Debug)]
pub struct RemoteSession {
    target: RemoteTarget,
    workspace: String,
    cancel: CancellationToken,
}

impl RemoteSession {
    /// Creates a session for `target` using the default remote workspace.
    #[must_use]
    pub fn new(target: RemoteTarget) -> Self {
        Self {
            target,
            workspace: DEFAULT_REMOTE_WORKSPACE.to_owned(),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the remote workspace directory.
    #[must_use]
    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Races every command against `cancel`.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Target of this session.
    #[must_use]
    pub const fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Waits until the remote-management port accepts connections.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::TimedOut`] or [`WaitError::Cancelled`]; probe
    /// failures are treated as "not ready yet".
    pub async fn wait_until_reachable<C: Connector>(
        &self,
        connector: &C,
        timeout: Duration,
    ) -> Result<(), WaitError<TransportError>> {
        let schedule = PollSchedule::new(READY_POLL_INTERVAL, timeout);
        poll_until(&self.cancel, schedule, || async {
            match connector.probe(&self.target).await {
                Ok(true) => Ok(Some(())),
                Ok(false) => Ok(None),
                Err(err) => {
                    tracing::debug!(host = %self.target.hostname, error = %err, "remote management port not ready");
                    Ok(None)
                }
            }
        })
        .await
    }

    /// Opens the session's shell.
    ///
    /// # Errors
    ///
    /// Returns the connector's [`TransportError`], or
    /// [`TransportError::Cancelled`] when the token fires first.
    pub async fn connect<C: Connector>(
        self,
        connector: &C,
    ) -> Result<ConnectedSession<C::Shell>, TransportError> {
        tracing::info!(
            host = %self.target.hostname,
            port = self.target.port,
            account = %self.target.account,
            "opening remote session"
        );
        let shell = unless_cancelled(&self.cancel, connector.connect(&self.target)).await?;
        Ok(ConnectedSession {
            target: self.target,
            workspace: self.workspace,
            cancel: self.cancel,
            shell,
        })
    }
}

/// Session with an open shell.
#[derive(Debug)]
pub struct ConnectedSession<S> {
    target: RemoteTarget,
    workspace: String,
    cancel: CancellationToken,
    shell: S,
}

impl<S: RemoteShell> ConnectedSession<S> {
    /// Target of this session.
    #[must_use]
    pub const fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Runs `command` and captures its output.
    ///
    /// A non-zero exit is logged and returned, not raised.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the command cannot be delivered or
    /// the build is cancelled.
    pub async fn run(&mut self, command: &str) -> Result<RemoteCommandOutput, TransportError> {
        self.run_with(command, OutputMode::Capture).await
    }

    /// Runs `command` with the given output handling.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the command cannot be delivered or
    /// the build is cancelled.
    pub async fn run_with(
        &mut self,
        command: &str,
        mode: OutputMode,
    ) -> Result<RemoteCommandOutput, TransportError> {
        tracing::debug!(host = %self.target.hostname, command, "running remote command");
        let output = unless_cancelled(&self.cancel, self.shell.execute(command, mode)).await?;
        if !output.is_success() {
            tracing::warn!(
                host = %self.target.hostname,
                command,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "remote command exited with non-zero status"
            );
        }
        Ok(output)
    }

    /// Runs a command that must succeed for the build to continue.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Command`] with the command's stderr when it
    /// exits non-zero, or [`SessionError::Transport`] when it cannot run.
    pub async fn run_checked(
        &mut self,
        step: &'static str,
        command: &str,
    ) -> Result<RemoteCommandOutput, SessionError> {
        let output = self.run(command).await?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(SessionError::Command {
                step,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_owned(),
            })
        }
    }

    /// Authorises Docker and pulls `image`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] from the first command that fails to run or
    /// exits non-zero; the pull is skipped when authorisation fails.
    pub async fn pull_image(&mut self, image: &str) -> Result<(), SessionError> {
        tracing::info!(image, "pulling build image");
        self.run_checked("configure docker", commands::CONFIGURE_DOCKER)
            .await?;
        self.run_checked("pull image", &commands::docker_pull(image))
            .await?;
        Ok(())
    }

    /// Runs `image` against the remote workspace, streaming its output.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the command cannot be run.
    pub async fn run_image(&mut self, image: &str, args: &str) -> Result<i32, TransportError> {
        tracing::info!(image, args, "running build step");
        let command = commands::docker_run(&self.workspace, image, args);
        let output = self.run_with(&command, OutputMode::Stream).await?;
        Ok(output.exit_code)
    }

    /// Copies `contents` to `remote_path` on the host.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Copy`] when the copy fails, or
    /// [`TransportError::Cancelled`].
    pub async fn copy_to(&mut self, contents: &[u8], remote_path: &str) -> Result<(), TransportError> {
        tracing::debug!(host = %self.target.hostname, path = remote_path, bytes = contents.len(), "copying file to remote host");
        unless_cancelled(&self.cancel, self.shell.copy_to(contents, remote_path)).await
    }

    /// Reads `remote_path` from the host.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Copy`] when the copy fails, or
    /// [`TransportError::Cancelled`].
    pub async fn copy_from(&mut self, remote_path: &str) -> Result<Vec<u8>, TransportError> {
        tracing::debug!(host = %self.target.hostname, path = remote_path, "copying file from remote host");
        unless_cancelled(&self.cancel, self.shell.copy_from(remote_path)).await
    }

    /// Copies the archive at `object` onto the host and unpacks it into a
    /// freshly emptied workspace.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] when the archive cannot be read,
    /// [`SessionError::Transport`] when the copy fails, or
    /// [`SessionError::Command`] when extraction exits non-zero.
    pub async fn transfer_in<St: ObjectStore>(
        &mut self,
        store: &St,
        object: &ObjectRef,
    ) -> Result<(), SessionError> {
        tracing::info!(object = %object.uri(), "transferring workspace to remote host");
        let bytes = store.read_object(&object.bucket, &object.key).await?;
        let archive = commands::staging_path(&object.key);
        self.copy_to(&bytes, &archive).await?;
        let command = commands::expand_archive(&archive, &self.workspace);
        self.run_checked("extract workspace", &command).await?;
        Ok(())
    }

    /// Zips the workspace, copies the archive back, and stores it at
    /// `object`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Command`] when archiving exits non-zero,
    /// [`SessionError::Transport`] when the copy fails, or
    /// [`SessionError::Storage`] when the archive cannot be stored.
    pub async fn transfer_out<St: ObjectStore>(
        &mut self,
        store: &St,
        object: &ObjectRef,
    ) -> Result<(), SessionError> {
        tracing::info!(object = %object.uri(), "transferring results from remote host");
        let archive = commands::staging_path(&object.key);
        let command = commands::compress_directory(&self.workspace, &archive);
        self.run_checked("archive workspace", &command).await?;
        let bytes = self.copy_from(&archive).await?;
        store.write_object(&object.bucket, &object.key, bytes).await?;
        Ok(())
    }

    /// Releases the remote shell.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the shell cannot be deleted.
    pub async fn close(mut self) -> Result<(), TransportError> {
        tracing::debug!(host = %self.target.hostname, "closing remote session");
        self.shell.close().await
    }
}
