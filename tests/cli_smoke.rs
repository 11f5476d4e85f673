//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

#[test]
fn help_lists_build_step_flags() {
    let mut cmd = cargo_bin_cmd!("winbuilder");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(contains("--project-id"))
        .stdout(contains("--name"));
}

#[test]
fn missing_image_and_project_are_rejected() {
    let mut cmd = cargo_bin_cmd!("winbuilder");
    cmd.env_remove("NAME").env_remove("PROJECT_ID");

    cmd.assert().failure().stderr(contains("--name"));
}

#[test]
fn invalid_configuration_fails_before_any_cloud_call() {
    let mut cmd = cargo_bin_cmd!("winbuilder");
    cmd.env("NAME", "gcr.io/test/test")
        .env("PROJECT_ID", "demo-project")
        .env("WINBUILDER_WINRM_PORT", "0")
        .env("RUST_LOG", "error");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("winrm_port must be a non-zero TCP port"));
}
