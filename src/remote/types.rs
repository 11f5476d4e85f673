//! Transport-neutral session types.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::secret::Secret;
use crate::storage::StorageError;

/// Address and credentials of the remote Windows host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTarget {
    /// Hostname or IP address.
    pub hostname: String,
    /// Remote-management port.
    pub port: u16,
    /// Account to authenticate as.
    pub account: String,
    /// Account password.
    pub password: Secret,
}

/// How a command's output is handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputMode {
    /// Buffer stdout and stderr into the returned output.
    Capture,
    /// Forward output to the local console as it arrives.
    Stream,
}

/// Result of one remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteCommandOutput {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured stdout; empty in [`OutputMode::Stream`].
    pub stdout: String,
    /// Captured stderr; empty in [`OutputMode::Stream`].
    pub stderr: String,
}

impl RemoteCommandOutput {
    /// Returns `true` for a zero exit code.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Failures of the remote-management transport.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// The endpoint could not be reached.
    #[error("failed to reach {endpoint}: {message}")]
    Connect {
        /// Endpoint URL or address.
        endpoint: String,
        /// Underlying error.
        message: String,
    },
    /// The credentials were refused.
    #[error("remote host refused credentials for {account}")]
    Unauthorized {
        /// Account used.
        account: String,
    },
    /// The service answered with a SOAP fault.
    #[error("remote management fault {code}: {message}")]
    Fault {
        /// Fault code reported by the service.
        code: String,
        /// Fault text.
        message: String,
    },
    /// The service answered with something unparsable.
    #[error("unexpected remote management response: {0}")]
    Protocol(String),
    /// A file could not be copied to or from the host.
    #[error("failed to copy {path}: {message}")]
    Copy {
        /// Remote path.
        path: String,
        /// What went wrong.
        message: String,
    },
    /// Writing streamed output locally failed.
    #[error("failed to forward remote output: {0}")]
    Output(String),
    /// The build was cancelled while a command ran.
    #[error("remote command cancelled")]
    Cancelled,
}

/// Failures of a session step that must succeed for the build to continue.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// The transport failed or the build was cancelled.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A preparation or collection command ran but exited non-zero.
    #[error("{step} exited with status {exit_code}: {stderr}")]
    Command {
        /// Step being performed.
        step: &'static str,
        /// Remote exit code.
        exit_code: i32,
        /// Trimmed stderr of the failed command.
        stderr: String,
    },
    /// The archive could not be read from or written to object storage.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// One open remote shell.
pub trait RemoteShell: Send {
    /// Runs `command` to completion.
    fn execute<'a>(
        &'a mut self,
        command: &'a str,
        mode: OutputMode,
    ) -> TransportFuture<'a, RemoteCommandOutput>;

    /// Writes `contents` to `remote_path`, replacing any existing file.
    fn copy_to<'a>(
        &'a mut self,
        contents: &'a [u8],
        remote_path: &'a str,
    ) -> TransportFuture<'a, ()>;

    /// Reads the whole of `remote_path`.
    fn copy_from<'a>(&'a mut self, remote_path: &'a str) -> TransportFuture<'a, Vec<u8>>;

    /// Releases the shell on the remote host.
    fn close(&mut self) -> TransportFuture<'_, ()>;
}

/// Opens shells on a remote host.
pub trait Connector: Send + Sync {
    /// Shell type produced by this connector.
    type Shell: RemoteShell;

    /// Returns `true` once the remote-management port accepts connections.
    fn probe<'a>(&'a self, target: &'a RemoteTarget) -> TransportFuture<'a, bool>;

    /// Authenticates and opens a shell.
    fn connect<'a>(&'a self, target: &'a RemoteTarget) -> TransportFuture<'a, Self::Shell>;
}
