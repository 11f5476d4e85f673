//! Core library for the winbuilder remote Windows build worker.
//!
//! The crate provisions a short-lived Windows VM on Compute Engine, obtains
//! an admin password through the guest agent's RSA key exchange, ships the
//! workspace through Cloud Storage, runs a container build step over WinRM,
//! and deletes the VM again (create → handshake → build → destroy).

pub mod auth;
pub mod compute;
pub mod config;
pub mod handshake;
pub mod lifecycle;
pub mod orchestrator;
pub mod remote;
pub mod secret;
pub mod storage;
pub mod test_support;
pub mod transfer;
pub mod wait;

pub use auth::TokenSource;
pub use compute::{ComputeApi, ComputeError, ComputeScope, GceClient};
pub use config::{BuilderConfig, ConfigError};
pub use handshake::{CredentialExchange, HandshakeError, KeyExchangeRequest, KeyExchangeResponse};
pub use lifecycle::{InstanceDescriptor, InstanceManager, InstanceState, LifecycleError};
pub use orchestrator::{BuildError, BuildOrchestrator, BuildRequest};
pub use remote::winrm::WinrmConnector;
pub use remote::{
    ConnectedSession, Connector, OutputMode, RemoteCommandOutput, RemoteSession, RemoteShell,
    RemoteTarget, SessionError, TransportError,
};
pub use secret::Secret;
pub use storage::{GcsClient, ObjectRef, ObjectStore, StorageError};
pub use transfer::{ArchiveLocation, TransferError, WorkspaceArchive, WorkspaceTransfer};
pub use wait::{PollSchedule, WaitError, poll_until};
