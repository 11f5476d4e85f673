//! Orchestrates one remote Windows build end to end.
//!
//! The flow provisions (or reuses) a Windows host, obtains credentials for it,
//! stages the workspace in object storage and copies it onto the host over
//! WinRM, runs the build image, brings the results back the same way, and
//! deletes the VM. Teardown runs on every path once this orchestrator has
//! created an instance, and never touches an instance it did not create.

use std::fmt::Display;
use std::mem;

use camino::Utf8PathBuf;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::compute::ComputeApi;
use crate::config::{BuilderConfig, ConfigError};
use crate::handshake::{CredentialExchange, DEFAULT_KEY_BITS, HandshakeError};
use crate::lifecycle::{InstanceManager, LifecycleError};
use crate::remote::{
    ConnectedSession, Connector, RemoteSession, RemoteTarget, SessionError, TransportError,
};
use crate::secret::Secret;
use crate::storage::ObjectStore;
use crate::transfer::{ArchiveLocation, TransferError, WorkspaceTransfer};
use crate::wait::WaitError;

/// Errors surfaced while performing a build.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Raised when configuration is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when the VM cannot be created, booted, or exposed.
    #[error("build VM lifecycle failed: {message}")]
    Lifecycle {
        /// Human-readable description, including any teardown failure.
        message: String,
        /// Underlying lifecycle error.
        #[source]
        source: LifecycleError,
    },
    /// Raised when no credentials could be obtained from the guest.
    #[error("credential handshake failed: {message}")]
    Handshake {
        /// Human-readable description, including any teardown failure.
        message: String,
        /// Underlying handshake error.
        #[source]
        source: HandshakeError,
    },
    /// Raised when the remote host cannot be reached or a command cannot be
    /// delivered.
    #[error("remote execution failed: {message}")]
    Transport {
        /// Human-readable description, including any teardown failure.
        message: String,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// Raised when a preparation or collection command on the host exits
    /// non-zero.
    #[error("remote step failed: {message}")]
    RemoteStep {
        /// Human-readable description with the command's stderr, including
        /// any teardown failure.
        message: String,
        /// Underlying session error.
        #[source]
        source: SessionError,
    },
    /// Raised when the workspace cannot be archived, uploaded, or restored.
    #[error("workspace transfer failed: {message}")]
    Transfer {
        /// Human-readable description, including any teardown failure.
        message: String,
        /// Underlying transfer error.
        #[source]
        source: TransferError,
    },
    /// Raised when teardown fails after the build itself succeeded.
    #[error("failed to delete build VM: {0}")]
    Teardown(#[source] LifecycleError),
}

impl BuildError {
    fn lifecycle(source: LifecycleError) -> Self {
        Self::Lifecycle {
            message: source.to_string(),
            source,
        }
    }

    fn handshake(source: HandshakeError) -> Self {
        Self::Handshake {
            message: source.to_string(),
            source,
        }
    }

    fn transport(source: TransportError) -> Self {
        Self::Transport {
            message: source.to_string(),
            source,
        }
    }

    fn transfer(source: TransferError) -> Self {
        Self::Transfer {
            message: source.to_string(),
            source,
        }
    }

    fn session(source: SessionError) -> Self {
        match source {
            SessionError::Transport(err) => Self::transport(err),
            SessionError::Storage(err) => Self::transfer(TransferError::Storage(err)),
            command @ SessionError::Command { .. } => Self::RemoteStep {
                message: command.to_string(),
                source: command,
            },
        }
    }

    fn with_teardown_note(mut self, teardown: &LifecycleError) -> Self {
        match &mut self {
            Self::Lifecycle { message, .. }
            | Self::Handshake { message, .. }
            | Self::Transport { message, .. }
            | Self::RemoteStep { message, .. }
            | Self::Transfer { message, .. } => {
                *message = append_teardown_note(mem::take(message), Some(teardown));
            }
            Self::Config(_) | Self::Teardown(_) => {}
        }
        self
    }
}

fn append_teardown_note<E: Display>(message: String, teardown_error: Option<&E>) -> String {
    if let Some(teardown) = teardown_error {
        format!("{message} (teardown also failed: {teardown})")
    } else {
        message
    }
}

/// Inputs for a single build.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    /// Cloud project hosting the VM and the bucket.
    pub project: String,
    /// Container image run as the build step.
    pub image: String,
    /// Arguments appended to the build step.
    pub args: String,
    /// Local workspace archived before and restored after the build.
    pub workspace: Utf8PathBuf,
    /// Existing host to build on instead of provisioning one.
    pub host: Option<String>,
    /// Account on the host; defaults to the configured account.
    pub username: Option<String>,
    /// Password for `username` on an existing host.
    pub password: Option<Secret>,
}

impl BuildRequest {
    /// Returns the target when host, username, and password were all
    /// supplied, in which case no VM is provisioned.
    #[must_use]
    pub fn existing_target(&self, port: u16) -> Option<RemoteTarget> {
        let (Some(hostname), Some(account), Some(password)) =
            (&self.host, &self.username, &self.password)
        else {
            return None;
        };
        Some(RemoteTarget {
            hostname: hostname.clone(),
            port,
            account: account.clone(),
            password: password.clone(),
        })
    }
}

/// Executes the build flow against the supplied collaborators.
#[derive(Debug)]
pub struct BuildOrchestrator<C, S, K> {
    compute: C,
    store: S,
    connector: K,
    config: BuilderConfig,
    key_bits: usize,
}

impl<C, S, K> BuildOrchestrator<C, S, K>
where
    C: ComputeApi + Clone,
    S: ObjectStore + Clone,
    K: Connector,
{
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(compute: C, store: S, connector: K, config: BuilderConfig) -> Self {
        Self {
            compute,
            store,
            connector,
            config,
            key_bits: DEFAULT_KEY_BITS,
        }
    }

    /// Overrides the handshake key size.
    ///
    /// This is primarily used by tests to keep key generation fast.
    #[must_use]
    pub const fn with_key_bits(mut self, bits: usize) -> Self {
        self.key_bits = bits;
        self
    }

    /// Runs the build and returns the exit code of the build step.
    ///
    /// A non-zero exit code is returned, not raised. The VM is deleted
    /// before returning whenever this call created it; a teardown failure
    /// after an otherwise successful build is reported as
    /// [`BuildError::Teardown`], and after a failed build is appended to
    /// the original error message.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] when any phase of the build fails.
    pub async fn execute(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<i32, BuildError> {
        let mut manager = InstanceManager::new(self.compute.clone(), &self.config, &request.project);
        let outcome = self.run_build(&mut manager, request, cancel).await;
        Self::finish(&mut manager, outcome).await
    }

    async fn finish(
        manager: &mut InstanceManager<C>,
        outcome: Result<i32, BuildError>,
    ) -> Result<i32, BuildError> {
        if !manager.created() {
            return outcome;
        }
        match (outcome, manager.delete().await) {
            (Ok(code), Ok(())) => Ok(code),
            (Ok(_), Err(err)) => Err(BuildError::Teardown(err)),
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(err)) => {
                tracing::error!(error = %err, "failed to delete build VM after a failed build");
                Err(primary.with_teardown_note(&err))
            }
        }
    }

    async fn run_build(
        &self,
        manager: &mut InstanceManager<C>,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<i32, BuildError> {
        let target = self.ensure_host(manager, request, cancel).await?;
        let session = RemoteSession::new(target)
            .with_workspace(self.config.remote_workspace.clone())
            .with_cancellation(cancel.clone());
        self.wait_for_winrm(&session).await?;

        let location =
            ArchiveLocation::for_build(&self.config.bucket_prefix, &request.project, Utc::now());
        let transfer = WorkspaceTransfer::new(self.store.clone(), location);
        transfer
            .upload(&request.workspace)
            .await
            .map_err(BuildError::transfer)?;

        let mut connected = session
            .connect(&self.connector)
            .await
            .map_err(BuildError::transport)?;
        let remote = self
            .run_remote(&mut connected, request, transfer.location())
            .await;
        if let Err(err) = connected.close().await {
            tracing::warn!(error = %err, "failed to close remote session");
        }
        let exit_code = remote?;

        transfer
            .download(&request.workspace)
            .await
            .map_err(BuildError::transfer)?;
        tracing::info!(exit_code, image = %request.image, "build finished");
        Ok(exit_code)
    }

    async fn ensure_host(
        &self,
        manager: &mut InstanceManager<C>,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<RemoteTarget, BuildError> {
        if let Some(target) = request.existing_target(self.config.winrm_port) {
            tracing::info!(host = %target.hostname, account = %target.account, "using existing build host");
            return Ok(target);
        }

        manager.create(cancel).await.map_err(BuildError::lifecycle)?;
        let address = manager
            .wait_until_running(cancel)
            .await
            .map_err(BuildError::lifecycle)?;
        manager
            .ensure_firewall(cancel)
            .await
            .map_err(BuildError::lifecycle)?;

        let account = request
            .username
            .clone()
            .unwrap_or_else(|| self.config.default_account.clone());
        let password = self.reset_password(manager, &account, cancel).await?;
        Ok(RemoteTarget {
            hostname: address.to_string(),
            port: self.config.winrm_port,
            account,
            password,
        })
    }

    /// Runs handshake attempts, each with a fresh key and fingerprint, until
    /// one succeeds or a non-timeout error occurs.
    async fn reset_password(
        &self,
        manager: &mut InstanceManager<C>,
        account: &str,
        cancel: &CancellationToken,
    ) -> Result<Secret, BuildError> {
        let attempts = self.config.handshake_attempts.max(1);
        let mut attempt = 1;
        loop {
            manager.refresh().await.map_err(BuildError::lifecycle)?;
            let exchange = CredentialExchange::new(manager, self.config.handshake_timeout())
                .with_key_bits(self.key_bits);
            match exchange.reset_password(account, cancel).await {
                Ok(secret) => return Ok(secret),
                Err(err) if err.is_timeout() && attempt < attempts => {
                    tracing::warn!(attempt, attempts, error = %err, "credential handshake timed out; retrying with a fresh key");
                    attempt += 1;
                }
                Err(err) => return Err(BuildError::handshake(err)),
            }
        }
    }

    async fn wait_for_winrm(&self, session: &RemoteSession) -> Result<(), BuildError> {
        let timeout = self.config.winrm_ready_timeout();
        tracing::info!(host = %session.target().hostname, port = session.target().port, "waiting for WinRM");
        session
            .wait_until_reachable(&self.connector, timeout)
            .await
            .map_err(|err| {
                let source = match err {
                    WaitError::Cancelled => TransportError::Cancelled,
                    WaitError::TimedOut { timeout: elapsed } => TransportError::Connect {
                        endpoint: format!("{}:{}", session.target().hostname, session.target().port),
                        message: format!("not accepting connections after {}s", elapsed.as_secs()),
                    },
                    WaitError::Probe(probe) => probe,
                };
                BuildError::transport(source)
            })
    }

    async fn run_remote(
        &self,
        connected: &mut ConnectedSession<K::Shell>,
        request: &BuildRequest,
        location: &ArchiveLocation,
    ) -> Result<i32, BuildError> {
        connected
            .pull_image(&request.image)
            .await
            .map_err(BuildError::session)?;
        connected
            .transfer_in(&self.store, &location.input)
            .await
            .map_err(BuildError::session)?;
        let exit_code = connected
            .run_image(&request.image, &request.args)
            .await
            .map_err(BuildError::transport)?;
        if exit_code != 0 {
            tracing::warn!(exit_code, image = %request.image, "build step exited with non-zero status");
        }
        connected
            .transfer_out(&self.store, &location.results)
            .await
            .map_err(BuildError::session)?;
        Ok(exit_code)
    }
}

#[cfg(test)]
mod tests;
