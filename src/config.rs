//! Configuration loading via `ortho-config`.
//!
//! [`BuilderConfig`] carries the fixed topology of a build (zone, instance
//! name, image, ports, bucket naming) and every timeout. It is loaded once and
//! handed to each component at construction, never read from globals.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Base URL prefix for Compute Engine resource links.
pub const COMPUTE_RESOURCE_PREFIX: &str = "https://www.googleapis.com/compute/v1/projects/";

/// Default boot image for the build VM.
pub const DEFAULT_IMAGE_URL: &str = "https://www.googleapis.com/compute/v1/projects/windows-cloud/global/images/family/windows-2019-core-for-containers";

/// Default remote workspace directory on the Windows host.
pub const DEFAULT_REMOTE_WORKSPACE: &str = r"C:\workspace";

/// Build topology and timeouts loaded from defaults, `winbuilder.toml`, and
/// `WINBUILDER_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "WINBUILDER",
    discovery(
        app_name = "winbuilder",
        env_var = "WINBUILDER_CONFIG_PATH",
        config_file_name = "winbuilder.toml",
        dotfile_name = ".winbuilder.toml",
        project_file_name = "winbuilder.toml"
    )
)]
pub struct BuilderConfig {
    /// Compute Engine zone hosting the build VM.
    #[ortho_config(default = "us-central1-f".to_owned())]
    pub zone: String,
    /// Name of the build VM.
    #[ortho_config(default = "windows-builder".to_owned())]
    pub instance_name: String,
    /// Machine type for the build VM.
    #[ortho_config(default = "n1-standard-1".to_owned())]
    pub machine_type: String,
    /// Source image URL for the boot disk.
    #[ortho_config(default = DEFAULT_IMAGE_URL.to_owned())]
    pub image_url: String,
    /// VPC network the VM and firewall rule attach to.
    #[ortho_config(default = "global/networks/default".to_owned())]
    pub network: String,
    /// Name of the ingress rule opening the WinRM port.
    #[ortho_config(default = "allow-winrm-ingress".to_owned())]
    pub firewall_name: String,
    /// HTTPS port of the remote-management service.
    #[ortho_config(default = 5986)]
    pub winrm_port: u16,
    /// Account created by the password reset when none is supplied.
    #[ortho_config(default = "builder".to_owned())]
    pub default_account: String,
    /// Local workspace directory archived before the build.
    #[ortho_config(default = "/workspace".to_owned())]
    pub workspace_dir: String,
    /// Workspace directory on the remote host.
    #[ortho_config(default = DEFAULT_REMOTE_WORKSPACE.to_owned())]
    pub remote_workspace: String,
    /// Prefix for both the bucket name and the per-build object keys.
    #[ortho_config(default = "cloudbuild-windows-".to_owned())]
    pub bucket_prefix: String,
    /// OAuth access token; when unset the metadata server is queried.
    pub access_token: Option<String>,
    /// Seconds to wait for a zone operation to reach `DONE`.
    #[ortho_config(default = 120)]
    pub operation_timeout_secs: u64,
    /// Seconds to wait for the VM to report `RUNNING` with an address.
    #[ortho_config(default = 600)]
    pub boot_timeout_secs: u64,
    /// Seconds to wait for one credential handshake attempt.
    #[ortho_config(default = 300)]
    pub handshake_timeout_secs: u64,
    /// Number of handshake attempts, each with a fresh keypair.
    #[ortho_config(default = 2)]
    pub handshake_attempts: u32,
    /// Seconds to wait for the WinRM port to accept connections.
    #[ortho_config(default = 300)]
    pub winrm_ready_timeout_secs: u64,
    /// Overall build deadline in seconds.
    #[ortho_config(default = 3600)]
    pub build_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl BuilderConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("winbuilder")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required string is blank
    /// and [`ConfigError::InvalidValue`] when a numeric bound is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.zone,
                FieldMetadata::new("Compute Engine zone", "WINBUILDER_ZONE", "zone"),
            ),
            (
                &self.instance_name,
                FieldMetadata::new("instance name", "WINBUILDER_INSTANCE_NAME", "instance_name"),
            ),
            (
                &self.machine_type,
                FieldMetadata::new("machine type", "WINBUILDER_MACHINE_TYPE", "machine_type"),
            ),
            (
                &self.image_url,
                FieldMetadata::new("boot image URL", "WINBUILDER_IMAGE_URL", "image_url"),
            ),
            (
                &self.network,
                FieldMetadata::new("VPC network", "WINBUILDER_NETWORK", "network"),
            ),
            (
                &self.firewall_name,
                FieldMetadata::new(
                    "firewall rule name",
                    "WINBUILDER_FIREWALL_NAME",
                    "firewall_name",
                ),
            ),
            (
                &self.default_account,
                FieldMetadata::new(
                    "default account name",
                    "WINBUILDER_DEFAULT_ACCOUNT",
                    "default_account",
                ),
            ),
            (
                &self.workspace_dir,
                FieldMetadata::new(
                    "local workspace directory",
                    "WINBUILDER_WORKSPACE_DIR",
                    "workspace_dir",
                ),
            ),
            (
                &self.remote_workspace,
                FieldMetadata::new(
                    "remote workspace directory",
                    "WINBUILDER_REMOTE_WORKSPACE",
                    "remote_workspace",
                ),
            ),
            (
                &self.bucket_prefix,
                FieldMetadata::new("bucket prefix", "WINBUILDER_BUCKET_PREFIX", "bucket_prefix"),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }

        if self.winrm_port == 0 {
            return Err(ConfigError::InvalidValue(String::from(
                "winrm_port must be a non-zero TCP port",
            )));
        }
        if self.handshake_attempts == 0 {
            return Err(ConfigError::InvalidValue(String::from(
                "handshake_attempts must be at least 1",
            )));
        }
        Ok(())
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to winbuilder.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Zone operation timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Boot (instance running) timeout.
    #[must_use]
    pub const fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    /// Per-attempt credential handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// WinRM port readiness timeout.
    #[must_use]
    pub const fn winrm_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.winrm_ready_timeout_secs)
    }

    /// Overall build deadline.
    #[must_use]
    pub const fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    /// Bucket holding workspace archives for `project_id`.
    ///
    /// The bucket must already exist; it is never created.
    #[must_use]
    pub fn bucket_name(&self, project_id: &str) -> String {
        format!("{}{project_id}", self.bucket_prefix)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value that is present but unusable.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
