//! Tests for build configuration loading and validation.

use std::time::Duration;

use rstest::{fixture, rstest};
use winbuilder::config::{BuilderConfig, ConfigError, DEFAULT_IMAGE_URL};
use winbuilder::test_support::{EnvGuard, sample_config};

#[fixture]
fn valid_config() -> BuilderConfig {
    sample_config()
}

#[rstest]
fn sample_config_validates(valid_config: BuilderConfig) {
    assert!(valid_config.validate().is_ok());
}

#[rstest]
#[case::zone("WINBUILDER_ZONE", "zone", |cfg: &mut BuilderConfig| cfg.zone.clear())]
#[case::instance(
    "WINBUILDER_INSTANCE_NAME",
    "instance_name",
    |cfg: &mut BuilderConfig| cfg.instance_name.clear()
)]
#[case::machine(
    "WINBUILDER_MACHINE_TYPE",
    "machine_type",
    |cfg: &mut BuilderConfig| cfg.machine_type = String::from("   ")
)]
#[case::image("WINBUILDER_IMAGE_URL", "image_url", |cfg: &mut BuilderConfig| cfg.image_url.clear())]
#[case::bucket(
    "WINBUILDER_BUCKET_PREFIX",
    "bucket_prefix",
    |cfg: &mut BuilderConfig| cfg.bucket_prefix.clear()
)]
#[case::account(
    "WINBUILDER_DEFAULT_ACCOUNT",
    "default_account",
    |cfg: &mut BuilderConfig| cfg.default_account.clear()
)]
fn blank_fields_produce_actionable_errors(
    mut valid_config: BuilderConfig,
    #[case] env_var: &str,
    #[case] toml_key: &str,
    #[case] mutate: fn(&mut BuilderConfig),
) {
    mutate(&mut valid_config);

    let error = valid_config.validate().expect_err("validation should fail");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField, got {error:?}");
    };
    assert!(message.contains(env_var), "error should mention {env_var}: {message}");
    assert!(message.contains(toml_key), "error should mention {toml_key}: {message}");
    assert!(
        message.contains("winbuilder.toml"),
        "error should mention the config file: {message}"
    );
}

#[rstest]
fn zero_port_is_rejected(valid_config: BuilderConfig) {
    let cfg = BuilderConfig {
        winrm_port: 0,
        ..valid_config
    };
    assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue(_))));
}

#[rstest]
fn zero_handshake_attempts_are_rejected(valid_config: BuilderConfig) {
    let cfg = BuilderConfig {
        handshake_attempts: 0,
        ..valid_config
    };
    let err = cfg.validate().expect_err("attempts must be positive");
    assert!(err.to_string().contains("handshake_attempts"), "{err}");
}

#[rstest]
fn timeouts_and_bucket_derive_from_fields(valid_config: BuilderConfig) {
    assert_eq!(valid_config.operation_timeout(), Duration::from_secs(120));
    assert_eq!(valid_config.boot_timeout(), Duration::from_secs(600));
    assert_eq!(valid_config.handshake_timeout(), Duration::from_secs(300));
    assert_eq!(valid_config.build_timeout(), Duration::from_secs(3600));
    assert_eq!(
        valid_config.bucket_name("demo-project"),
        "cloudbuild-windows-demo-project"
    );
}

#[tokio::test]
async fn defaults_load_without_any_configuration() {
    let _guard = EnvGuard::set_vars(&[]).await;

    let config = BuilderConfig::load_without_cli_args().expect("defaults load");

    assert_eq!(config.zone, "us-central1-f");
    assert_eq!(config.image_url, DEFAULT_IMAGE_URL);
    assert_eq!(config.winrm_port, 5986);
    assert_eq!(config.handshake_attempts, 2);
    assert_eq!(config.access_token, None);
}

#[tokio::test]
async fn environment_overrides_defaults() {
    let _guard = EnvGuard::set_vars(&[
        ("WINBUILDER_ZONE", "europe-west1-b"),
        ("WINBUILDER_MACHINE_TYPE", "n1-standard-4"),
        ("WINBUILDER_HANDSHAKE_TIMEOUT_SECS", "45"),
    ])
    .await;

    let config = BuilderConfig::load_without_cli_args().expect("env overrides load");

    assert_eq!(config.zone, "europe-west1-b");
    assert_eq!(config.machine_type, "n1-standard-4");
    assert_eq!(config.handshake_timeout(), Duration::from_secs(45));
    assert_eq!(config.instance_name, "windows-builder");
}
