//! Lifecycle of the ephemeral build VM.
//!
//! [`InstanceManager`] owns the [`InstanceDescriptor`] for a single build and
//! is the only place that mutates it. Creation waits for the insert operation
//! but not for the guest to boot; [`InstanceManager::wait_until_running`] does
//! that separately so the caller decides when to block.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::compute::{
    ComputeApi, ComputeError, ComputeScope, FirewallRule, Instance, InstanceSpec, Metadata,
    Operation,
};
use crate::config::BuilderConfig;
use crate::wait::{PollSchedule, WaitError, poll_until};

mod template;

pub use template::{
    BOOT_DISK_NAME, STARTUP_SCRIPT_KEY, WINRM_STARTUP_SCRIPT, firewall_rule, instance_spec,
};

const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(1);
const REFRESH_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Coarse instance state derived from the provider status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// No instance exists, or it has been deleted.
    Absent,
    /// Accepted by the provider but not yet running.
    Pending,
    /// The guest is running.
    Running,
    /// Shutting down or stopped.
    Stopping,
    /// Any status the builder does not recognise.
    Unknown,
}

impl InstanceState {
    /// Maps a Compute Engine status string.
    #[must_use]
    pub fn from_provider_status(status: &str) -> Self {
        match status {
            "PROVISIONING" | "STAGING" => Self::Pending,
            "RUNNING" => Self::Running,
            "STOPPING" | "SUSPENDING" | "SUSPENDED" | "TERMINATED" => Self::Stopping,
            _ => Self::Unknown,
        }
    }
}

/// Last known view of the build VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceDescriptor {
    /// Instance name.
    pub name: String,
    /// Zone hosting the instance.
    pub zone: String,
    /// Current state.
    pub state: InstanceState,
    /// External NAT address once assigned.
    pub endpoint: Option<IpAddr>,
    /// Metadata as last read, including its fingerprint.
    pub metadata: Metadata,
}

impl InstanceDescriptor {
    fn absent(name: &str, zone: &str) -> Self {
        Self {
            name: name.to_owned(),
            zone: zone.to_owned(),
            state: InstanceState::Absent,
            endpoint: None,
            metadata: Metadata::default(),
        }
    }

    fn apply(&mut self, instance: &Instance) {
        self.state = InstanceState::from_provider_status(&instance.status);
        self.endpoint = instance.external_ip().and_then(|ip| match IpAddr::from_str(ip) {
            Ok(addr) => Some(addr),
            Err(err) => {
                tracing::warn!(instance = %self.name, address = ip, error = %err, "ignoring unparsable external address");
                None
            }
        });
        self.metadata = instance.metadata.clone();
    }
}

/// Errors raised while managing the build VM.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// The instance insert was rejected.
    #[error("failed to create instance {instance}: {message}")]
    Provisioning {
        /// Instance name.
        instance: String,
        /// Provider message.
        message: String,
    },
    /// A read of the instance or an operation failed.
    #[error("failed to look up {resource}: {message}")]
    Lookup {
        /// Resource being read.
        resource: String,
        /// Provider message.
        message: String,
    },
    /// The instance could not be deleted.
    #[error("failed to delete instance {instance}: {message}")]
    Deletion {
        /// Instance name.
        instance: String,
        /// Provider message.
        message: String,
    },
    /// The ingress rule could not be created.
    #[error("failed to create firewall rule {rule}: {message}")]
    Firewall {
        /// Rule name.
        rule: String,
        /// Provider message.
        message: String,
    },
    /// An operation did not reach `DONE` in time.
    #[error("compute operation {operation} timed out after {}s", timeout.as_secs())]
    OperationTimeout {
        /// Operation name.
        operation: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// An operation finished with errors.
    #[error("compute operation {operation} failed: {message}")]
    OperationFailed {
        /// Operation name.
        operation: String,
        /// Joined provider error messages.
        message: String,
    },
    /// The instance never became reachable.
    #[error("instance {instance} not running with an external address after {}s", timeout.as_secs())]
    BootTimeout {
        /// Instance name.
        instance: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The build was cancelled while waiting.
    #[error("cancelled while waiting for {action}")]
    Cancelled {
        /// Wait being performed.
        action: String,
    },
}

/// Creates, observes, and deletes the build VM.
#[derive(Debug)]
pub struct InstanceManager<C> {
    compute: C,
    scope: ComputeScope,
    spec: InstanceSpec,
    firewall: FirewallRule,
    operation_schedule: PollSchedule,
    boot_schedule: PollSchedule,
    descriptor: InstanceDescriptor,
    created: bool,
}

impl<C: ComputeApi> InstanceManager<C> {
    /// Creates a manager for the instance described by `config` in `project`.
    #[must_use]
    pub fn new(compute: C, config: &BuilderConfig, project: &str) -> Self {
        Self {
            compute,
            scope: ComputeScope::new(project, config.zone.clone()),
            spec: instance_spec(config, project),
            firewall: firewall_rule(config, project),
            operation_schedule: PollSchedule::new(
                OPERATION_POLL_INTERVAL,
                config.operation_timeout(),
            ),
            boot_schedule: PollSchedule::new(REFRESH_POLL_INTERVAL, config.boot_timeout()),
            descriptor: InstanceDescriptor::absent(&config.instance_name, &config.zone),
            created: false,
        }
    }

    /// Current view of the instance.
    #[must_use]
    pub const fn descriptor(&self) -> &InstanceDescriptor {
        &self.descriptor
    }

    /// Returns `true` once this manager's insert has been accepted, even if
    /// the instance never finished booting.
    #[must_use]
    pub const fn created(&self) -> bool {
        self.created
    }

    /// Compute client shared with the credential handshake.
    #[must_use]
    pub const fn compute(&self) -> &C {
        &self.compute
    }

    /// Project and zone the instance lives in.
    #[must_use]
    pub const fn scope(&self) -> &ComputeScope {
        &self.scope
    }

    /// Submits the instance and waits for the insert operation.
    ///
    /// The descriptor is `Pending` on return; the guest may still be booting.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provisioning`] when the insert is rejected,
    /// or any error from [`Self::await_operation`].
    pub async fn create(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<&InstanceDescriptor, LifecycleError> {
        tracing::info!(
            instance = %self.spec.name,
            zone = %self.scope.zone,
            project = %self.scope.project,
            "creating build instance"
        );
        let operation = self
            .compute
            .insert_instance(&self.scope, &self.spec)
            .await
            .map_err(|err| LifecycleError::Provisioning {
                instance: self.spec.name.clone(),
                message: err.to_string(),
            })?;
        self.created = true;
        self.descriptor.state = InstanceState::Pending;
        self.await_operation(&operation, cancel).await?;

        tracing::info!(instance = %self.descriptor.name, "instance accepted by provider");
        Ok(&self.descriptor)
    }

    /// Re-reads the instance and updates the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Lookup`] when the read fails.
    pub async fn refresh(&mut self) -> Result<&InstanceDescriptor, LifecycleError> {
        let instance = self
            .compute
            .get_instance(&self.scope, &self.descriptor.name)
            .await
            .map_err(|err| self.lookup_error(&err))?;
        self.descriptor.apply(&instance);
        Ok(&self.descriptor)
    }

    /// Refreshes until the instance is running with an external address.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::BootTimeout`] when the boot timeout elapses,
    /// [`LifecycleError::Cancelled`] on cancellation, or
    /// [`LifecycleError::Lookup`] when a refresh fails.
    pub async fn wait_until_running(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<IpAddr, LifecycleError> {
        let schedule = self.boot_schedule;
        // The probe only reads; the descriptor is updated from the last
        // snapshot so state and endpoint match the final observation.
        let last: Mutex<Option<Instance>> = Mutex::new(None);
        let result = poll_until(cancel, schedule, || {
            let compute = &self.compute;
            let scope = &self.scope;
            let name = &self.descriptor.name;
            let snapshot = &last;
            async move {
                let instance = compute.get_instance(scope, name).await?;
                let ready = InstanceState::from_provider_status(&instance.status)
                    == InstanceState::Running
                    && instance.external_ip().is_some();
                store_snapshot(snapshot, instance);
                Ok::<_, ComputeError>(ready.then_some(()))
            }
        })
        .await;

        if let Some(instance) = take_snapshot(last) {
            self.descriptor.apply(&instance);
        }
        match result {
            Ok(()) => self.descriptor.endpoint.ok_or_else(|| LifecycleError::BootTimeout {
                instance: self.descriptor.name.clone(),
                timeout: schedule.timeout,
            }),
            Err(WaitError::TimedOut { timeout }) => Err(LifecycleError::BootTimeout {
                instance: self.descriptor.name.clone(),
                timeout,
            }),
            Err(WaitError::Cancelled) => Err(LifecycleError::Cancelled {
                action: format!("instance {} to boot", self.descriptor.name),
            }),
            Err(WaitError::Probe(err)) => Err(self.lookup_error(&err)),
        }
    }

    /// Deletes the instance, treating "not found" as success.
    ///
    /// Runs under its own cancellation token so teardown completes even after
    /// the build token fires.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Deletion`] when the delete is rejected or
    /// its operation fails.
    pub async fn delete(&mut self) -> Result<(), LifecycleError> {
        let name = self.descriptor.name.clone();
        tracing::info!(instance = %name, "deleting build instance");
        self.descriptor.state = InstanceState::Stopping;

        let operation = match self.compute.delete_instance(&self.scope, &name).await {
            Ok(operation) => operation,
            Err(err) if err.is_not_found() => {
                tracing::debug!(instance = %name, "instance already absent");
                self.descriptor.state = InstanceState::Absent;
                return Ok(());
            }
            Err(err) => {
                return Err(LifecycleError::Deletion {
                    instance: name,
                    message: err.to_string(),
                });
            }
        };

        let teardown = CancellationToken::new();
        self.await_operation(&operation, &teardown)
            .await
            .map_err(|err| LifecycleError::Deletion {
                instance: name.clone(),
                message: err.to_string(),
            })?;
        self.descriptor.state = InstanceState::Absent;
        self.descriptor.endpoint = None;
        tracing::info!(instance = %name, "build instance deleted");
        Ok(())
    }

    /// Creates the WinRM ingress rule, treating "already exists" as success.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Firewall`] when the insert or its operation
    /// fails.
    pub async fn ensure_firewall(&self, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        let rule = &self.firewall.name;
        let operation = match self.compute.insert_firewall(&self.scope, &self.firewall).await {
            Ok(operation) => operation,
            Err(err) if err.is_already_exists() => {
                tracing::debug!(rule = %rule, "firewall rule already present");
                return Ok(());
            }
            Err(err) => {
                return Err(LifecycleError::Firewall {
                    rule: rule.clone(),
                    message: err.to_string(),
                });
            }
        };
        match self.await_operation(&operation, cancel).await {
            Ok(()) => {
                tracing::info!(rule = %rule, "created WinRM ingress rule");
                Ok(())
            }
            Err(err @ LifecycleError::Cancelled { .. }) => Err(err),
            Err(err) => Err(LifecycleError::Firewall {
                rule: rule.clone(),
                message: err.to_string(),
            }),
        }
    }

    /// Polls an operation until it reports `DONE`.
    ///
    /// Zonal operations are read from `zoneOperations`, anything without a
    /// zone from `globalOperations`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::OperationTimeout`] when `DONE` is not seen
    /// within the operation timeout, [`LifecycleError::OperationFailed`] when
    /// the finished operation carries errors, [`LifecycleError::Cancelled`]
    /// on cancellation, or [`LifecycleError::Lookup`] when polling fails.
    pub async fn await_operation(
        &self,
        operation: &Operation,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        let name = operation.name.as_str();
        tracing::debug!(operation = name, "waiting for compute operation");

        let finished = if operation.is_done() {
            operation.clone()
        } else {
            let zonal = operation.is_zonal();
            poll_until(cancel, self.operation_schedule, || async move {
                let current = if zonal {
                    self.compute.get_zone_operation(&self.scope, name).await?
                } else {
                    self.compute.get_global_operation(&self.scope, name).await?
                };
                Ok::<_, ComputeError>(current.is_done().then_some(current))
            })
            .await
            .map_err(|err| match err {
                WaitError::TimedOut { timeout } => LifecycleError::OperationTimeout {
                    operation: name.to_owned(),
                    timeout,
                },
                WaitError::Cancelled => LifecycleError::Cancelled {
                    action: format!("operation {name}"),
                },
                WaitError::Probe(err) => LifecycleError::Lookup {
                    resource: format!("operation {name}"),
                    message: err.to_string(),
                },
            })?
        };

        if let Some(message) = finished.error_message() {
            return Err(LifecycleError::OperationFailed {
                operation: name.to_owned(),
                message,
            });
        }
        Ok(())
    }

    fn lookup_error(&self, err: &ComputeError) -> LifecycleError {
        LifecycleError::Lookup {
            resource: format!("instance {}", self.descriptor.name),
            message: err.to_string(),
        }
    }
}

/// Records the latest observation. A poisoned slot is still written; the
/// value it guards is a plain `Option`.
fn store_snapshot(slot: &Mutex<Option<Instance>>, instance: Instance) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(instance);
}

fn take_snapshot(slot: Mutex<Option<Instance>>) -> Option<Instance> {
    slot.into_inner().unwrap_or_else(PoisonError::into_inner)
}
