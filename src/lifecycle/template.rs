//! Request bodies for the build VM and its ingress rule.

use crate::compute::{
    AccessConfig, AttachedDisk, DiskInitializeParams, FirewallAllowed, FirewallRule, InstanceSpec,
    Metadata, MetadataItem, NetworkInterface, ServiceAccount,
};
use crate::config::{BuilderConfig, COMPUTE_RESOURCE_PREFIX};

/// Metadata key the Windows guest agent runs as a batch script at boot.
pub const STARTUP_SCRIPT_KEY: &str = "windows-startup-script-bat";

/// Enables Basic authentication for the WinRM listener.
pub const WINRM_STARTUP_SCRIPT: &str = r#"winrm set winrm/config/Service/Auth @{Basic="true"} & winrm set winrm/config/Service @{AllowUnencrypted="true"}"#;

/// Name of the auto-deleted boot disk.
pub const BOOT_DISK_NAME: &str = "windows-pd";

const NAT_ACCESS_TYPE: &str = "ONE_TO_ONE_NAT";
const NAT_ACCESS_NAME: &str = "External NAT";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";
const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/compute";
const ANY_SOURCE: &str = "0.0.0.0/0";

/// Builds the `instances.insert` body for the build VM.
#[must_use]
pub fn instance_spec(config: &BuilderConfig, project: &str) -> InstanceSpec {
    InstanceSpec {
        name: config.instance_name.clone(),
        machine_type: format!(
            "{COMPUTE_RESOURCE_PREFIX}{project}/zones/{}/machineTypes/{}",
            config.zone, config.machine_type
        ),
        disks: vec![AttachedDisk {
            auto_delete: true,
            boot: true,
            kind: String::from("PERSISTENT"),
            initialize_params: DiskInitializeParams {
                disk_name: String::from(BOOT_DISK_NAME),
                source_image: config.image_url.clone(),
            },
        }],
        metadata: Metadata {
            fingerprint: None,
            items: vec![MetadataItem::new(STARTUP_SCRIPT_KEY, WINRM_STARTUP_SCRIPT)],
        },
        network_interfaces: vec![NetworkInterface {
            network: Some(network_link(config, project)),
            access_configs: vec![AccessConfig {
                kind: Some(String::from(NAT_ACCESS_TYPE)),
                name: Some(String::from(NAT_ACCESS_NAME)),
                nat_ip: None,
            }],
        }],
        service_accounts: vec![ServiceAccount {
            email: String::from(DEFAULT_SERVICE_ACCOUNT),
            scopes: vec![String::from(STORAGE_SCOPE), String::from(COMPUTE_SCOPE)],
        }],
    }
}

/// Builds the ingress rule opening the WinRM port to any source.
#[must_use]
pub fn firewall_rule(config: &BuilderConfig, project: &str) -> FirewallRule {
    FirewallRule {
        name: config.firewall_name.clone(),
        network: network_link(config, project),
        direction: String::from("INGRESS"),
        allowed: vec![FirewallAllowed {
            ip_protocol: String::from("tcp"),
            ports: vec![config.winrm_port.to_string()],
        }],
        source_ranges: vec![String::from(ANY_SOURCE)],
    }
}

fn network_link(config: &BuilderConfig, project: &str) -> String {
    if config.network.starts_with("https://") {
        return config.network.clone();
    }
    format!(
        "{COMPUTE_RESOURCE_PREFIX}{project}/{}",
        config.network.trim_start_matches('/')
    )
}
