//! Compute Engine wire types used by the lifecycle and handshake layers.
//!
//! Only the fields the builder reads or writes are modelled; unknown fields in
//! provider responses are ignored.

use serde::{Deserialize, Serialize};

/// Status string reported by a finished zone operation.
pub const OPERATION_DONE: &str = "DONE";

/// Instance resource as returned by `instances.get`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Instance name.
    pub name: String,
    /// Provider lifecycle status (`PROVISIONING`, `RUNNING`, ...).
    #[serde(default)]
    pub status: String,
    /// Attached network interfaces.
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    /// Instance metadata with its optimistic-concurrency fingerprint.
    #[serde(default)]
    pub metadata: Metadata,
}

impl Instance {
    /// Returns the first external NAT address, if one has been assigned.
    #[must_use]
    pub fn external_ip(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|nic| nic.access_configs.iter())
            .filter_map(|config| config.nat_ip.as_deref())
            .find(|ip| !ip.is_empty())
    }
}

/// Network interface on an instance.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Network resource link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// External access configurations.
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

/// External access configuration for a network interface.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    /// Access type, `ONE_TO_ONE_NAT` for ephemeral external addresses.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Display name of the access config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Assigned external address.
    #[serde(rename = "natIP", default, skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<String>,
}

/// Instance metadata block.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Fingerprint that must accompany `setMetadata`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Key/value entries.
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

impl Metadata {
    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .and_then(|item| item.value.as_deref())
    }
}

/// Single metadata entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct MetadataItem {
    /// Metadata key.
    pub key: String,
    /// Metadata value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl MetadataItem {
    /// Builds an item from a key and value.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// Asynchronous provider operation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation name used for polling.
    pub name: String,
    /// `PENDING`, `RUNNING`, or `DONE`.
    #[serde(default)]
    pub status: String,
    /// Zone URL for zonal operations; absent for global ones such as
    /// firewall inserts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Errors reported by a finished operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationErrors>,
}

impl Operation {
    /// Returns `true` once the provider reports the terminal status.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == OPERATION_DONE
    }

    /// Returns `true` when the operation lives in `zoneOperations` rather
    /// than `globalOperations`.
    #[must_use]
    pub const fn is_zonal(&self) -> bool {
        self.zone.is_some()
    }

    /// Joins the error messages of a failed operation.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        let errors = self.error.as_ref()?;
        if errors.errors.is_empty() {
            return None;
        }
        Some(
            errors
                .errors
                .iter()
                .map(|detail| match &detail.code {
                    Some(code) => format!("{code}: {}", detail.message),
                    None => detail.message.clone(),
                })
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Error block on an operation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct OperationErrors {
    /// Individual error entries.
    #[serde(default)]
    pub errors: Vec<OperationErrorDetail>,
}

/// One operation error entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct OperationErrorDetail {
    /// Machine-readable error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// Serial port output page.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SerialPortOutput {
    /// Console contents.
    #[serde(default)]
    pub contents: String,
}

/// Request body for `instances.insert`.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Instance name.
    pub name: String,
    /// Machine type resource link.
    pub machine_type: String,
    /// Attached disks.
    pub disks: Vec<AttachedDisk>,
    /// Initial metadata.
    pub metadata: Metadata,
    /// Network interfaces.
    pub network_interfaces: Vec<NetworkInterface>,
    /// Service accounts and scopes.
    pub service_accounts: Vec<ServiceAccount>,
}

/// Disk attached at creation.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    /// Delete the disk with the instance.
    pub auto_delete: bool,
    /// Boot disk flag.
    pub boot: bool,
    /// Disk type, `PERSISTENT`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Parameters for creating the disk.
    pub initialize_params: DiskInitializeParams,
}

/// Parameters for a newly created disk.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskInitializeParams {
    /// Disk name.
    pub disk_name: String,
    /// Source image link.
    pub source_image: String,
}

/// Service account attached to the instance.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct ServiceAccount {
    /// Account email, `default` for the project default.
    pub email: String,
    /// OAuth scopes granted to the instance.
    pub scopes: Vec<String>,
}

/// Request body for `firewalls.insert`.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    /// Rule name.
    pub name: String,
    /// Network resource link.
    pub network: String,
    /// `INGRESS` or `EGRESS`.
    pub direction: String,
    /// Allowed protocol/port pairs.
    pub allowed: Vec<FirewallAllowed>,
    /// Source CIDR ranges.
    pub source_ranges: Vec<String>,
}

/// Allowed protocol and ports for a firewall rule.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct FirewallAllowed {
    /// IP protocol name.
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    /// Port list.
    pub ports: Vec<String>,
}
