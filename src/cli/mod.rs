//! Command-line interface definitions for the `winbuilder` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `winbuilder` binary.
///
/// Every flag falls back to the environment variable Cloud Build passes to
/// custom build steps.
#[derive(Debug, Parser)]
#[command(
    name = "winbuilder",
    about = "Run a containerised build step on an ephemeral Windows VM"
)]
pub(crate) struct Cli {
    /// Existing Windows host to build on instead of provisioning one.
    ///
    /// Provisioning is skipped only when host, username, and password are
    /// all supplied.
    #[arg(long, env = "HOST", value_name = "HOST")]
    pub(crate) host: Option<String>,
    /// Account on the build host.
    #[arg(long, env = "USERNAME", value_name = "USER")]
    pub(crate) username: Option<String>,
    /// Password for the account on an existing host.
    #[arg(long, env = "PASSWORD", hide_env_values = true, value_name = "PASSWORD")]
    pub(crate) password: Option<String>,
    /// Container image to run as the build step.
    #[arg(long, env = "NAME", value_name = "IMAGE")]
    pub(crate) name: String,
    /// Arguments passed to the build step.
    #[arg(long, env = "ARGS", default_value = "", allow_hyphen_values = true)]
    pub(crate) args: String,
    /// Cloud project hosting the VM and the workspace bucket.
    #[arg(long, env = "PROJECT_ID", value_name = "PROJECT")]
    pub(crate) project_id: String,
    /// Local workspace directory; overrides the configured default.
    #[arg(long, value_name = "PATH")]
    pub(crate) workspace: Option<String>,
}
