//! Unit tests for the `winbuilder` CLI binary implementation.

use rstest::{fixture, rstest};
use winbuilder::test_support::sample_config;

use super::*;

#[fixture]
fn cli() -> Cli {
    Cli::parse_from([
        "winbuilder",
        "--name",
        "gcr.io/test/test",
        "--project-id",
        "demo-project",
        "--args",
        "--target release",
    ])
}

#[rstest]
fn request_uses_configured_workspace_by_default(cli: Cli) {
    let request = build_request(cli, &sample_config());

    assert_eq!(request.workspace, Utf8PathBuf::from("/workspace"));
    assert_eq!(request.image, "gcr.io/test/test");
    assert_eq!(request.args, "--target release");
    assert_eq!(request.project, "demo-project");
    assert_eq!(request.existing_target(5986), None);
}

#[rstest]
fn workspace_flag_overrides_config(mut cli: Cli) {
    cli.workspace = Some(String::from("/src/app"));

    let request = build_request(cli, &sample_config());

    assert_eq!(request.workspace, Utf8PathBuf::from("/src/app"));
}

#[rstest]
fn full_credentials_select_existing_host(mut cli: Cli) {
    cli.host = Some(String::from("198.51.100.4"));
    cli.username = Some(String::from("admin"));
    cli.password = Some(String::from("hunter2"));

    let request = build_request(cli, &sample_config());
    let target = request.existing_target(5986).expect("existing host");

    assert_eq!(target.hostname, "198.51.100.4");
    assert_eq!(target.account, "admin");
    assert_eq!(target.password.expose(), "hunter2");
}

#[rstest]
#[case("", "admin", "hunter2")]
#[case("198.51.100.4", " ", "hunter2")]
#[case("198.51.100.4", "admin", "")]
fn blank_credentials_are_treated_as_absent(
    mut cli: Cli,
    #[case] host: &str,
    #[case] user: &str,
    #[case] password: &str,
) {
    cli.host = Some(host.to_owned());
    cli.username = Some(user.to_owned());
    cli.password = Some(password.to_owned());

    let request = build_request(cli, &sample_config());

    assert_eq!(request.existing_target(5986), None);
}

#[rstest]
#[case(0, 0)]
#[case(3, 3)]
#[case(255, 255)]
#[case(256, 1)]
#[case(-1, 1)]
#[case(-1_073_741_819, 1)]
fn remote_exit_code_fits_process_status(#[case] remote: i32, #[case] expected: i32) {
    assert_eq!(process_exit_code(remote), expected);
}

#[test]
fn setup_error_names_component() {
    let err = CliError::Setup {
        component: "WinRM client",
        message: String::from("no TLS backend"),
    };
    assert_eq!(
        err.to_string(),
        "failed to initialise WinRM client: no TLS backend"
    );
}
