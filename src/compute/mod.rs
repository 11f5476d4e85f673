//! Narrow contract over the Compute Engine API.
//!
//! The lifecycle manager and the credential handshake only need a handful of
//! calls. They are expressed as the [`ComputeApi`] trait so the build flow can
//! be exercised against in-process fakes, with [`GceClient`] as the production
//! implementation.

use std::future::Future;
use std::pin::Pin;

mod error;
mod gce;
mod types;

pub use error::ComputeError;
pub use gce::{COMPUTE_API_BASE, GceClient};
pub(crate) use gce::provider_message;
pub use types::{
    AccessConfig, AttachedDisk, DiskInitializeParams, FirewallAllowed, FirewallRule, Instance,
    InstanceSpec, Metadata, MetadataItem, NetworkInterface, OPERATION_DONE, Operation,
    OperationErrorDetail, OperationErrors, SerialPortOutput, ServiceAccount,
};

/// Future returned by compute operations.
pub type ComputeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ComputeError>> + Send + 'a>>;

/// Project and zone scope shared by every call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ComputeScope {
    /// Cloud project identifier.
    pub project: String,
    /// Zone hosting the instance.
    pub zone: String,
}

impl ComputeScope {
    /// Creates a scope for `project` in `zone`.
    #[must_use]
    pub fn new(project: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
        }
    }
}

/// Minimal interface over the compute provider.
pub trait ComputeApi: Send + Sync {
    /// Submits an instance creation request.
    fn insert_instance<'a>(
        &'a self,
        scope: &'a ComputeScope,
        spec: &'a InstanceSpec,
    ) -> ComputeFuture<'a, Operation>;

    /// Reads the current state of an instance.
    fn get_instance<'a>(&'a self, scope: &'a ComputeScope, name: &'a str)
    -> ComputeFuture<'a, Instance>;

    /// Submits an instance deletion.
    fn delete_instance<'a>(
        &'a self,
        scope: &'a ComputeScope,
        name: &'a str,
    ) -> ComputeFuture<'a, Operation>;

    /// Reads the status of a zone operation.
    fn get_zone_operation<'a>(
        &'a self,
        scope: &'a ComputeScope,
        operation: &'a str,
    ) -> ComputeFuture<'a, Operation>;

    /// Reads the status of a global operation.
    fn get_global_operation<'a>(
        &'a self,
        scope: &'a ComputeScope,
        operation: &'a str,
    ) -> ComputeFuture<'a, Operation>;

    /// Inserts a project-wide firewall rule; the returned operation is
    /// global.
    fn insert_firewall<'a>(
        &'a self,
        scope: &'a ComputeScope,
        rule: &'a FirewallRule,
    ) -> ComputeFuture<'a, Operation>;

    /// Replaces instance metadata; `metadata.fingerprint` must match the
    /// provider's current value.
    fn set_metadata<'a>(
        &'a self,
        scope: &'a ComputeScope,
        name: &'a str,
        metadata: &'a Metadata,
    ) -> ComputeFuture<'a, Operation>;

    /// Reads the accumulated output of a serial port.
    fn serial_port_output<'a>(
        &'a self,
        scope: &'a ComputeScope,
        name: &'a str,
        port: u8,
    ) -> ComputeFuture<'a, String>;
}
