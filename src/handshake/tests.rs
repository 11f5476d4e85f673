//! Unit tests for the credential handshake.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{TimeZone, Utc};
use rsa::{BigUint, Oaep};
use rstest::{fixture, rstest};
use sha1::Sha1;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::test_support::{FAKE_PASSWORD, FakeCompute, GuestAgent, sample_config};

const TEST_KEY_BITS: usize = 512;

#[fixture]
fn keys() -> KeyPair {
    KeyPair::generate(TEST_KEY_BITS).expect("test keypair")
}

fn encrypted_for(keys: &KeyPair, password: &str) -> String {
    let ciphertext = keys
        .public_key()
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), password.as_bytes())
        .expect("encrypt");
    STANDARD.encode(ciphertext)
}

fn response_line(modulus: &str, encrypted: &str) -> String {
    serde_json::json!({
        "userName": "builder",
        "passwordFound": true,
        "encryptedPassword": encrypted,
        "modulus": modulus,
        "exponent": "AQAB",
    })
    .to_string()
}

#[rstest]
#[case(65_537_u32, "AQAB")]
#[case(3_u32, "AAAD")]
fn exponent_uses_low_three_bytes(#[case] exponent: u32, #[case] expected: &str) {
    let encoded = encode_exponent(&BigUint::from(exponent)).expect("fits");
    assert_eq!(encoded, expected);
}

#[rstest]
fn oversized_exponent_is_rejected() {
    let wide = BigUint::from(u64::MAX);
    assert!(matches!(
        encode_exponent(&wide),
        Err(HandshakeError::Encode(_))
    ));
}

#[rstest]
fn request_expires_five_minutes_after_creation(keys: KeyPair) {
    let now = Utc
        .with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp");
    let request = KeyExchangeRequest::new(&keys, "builder", now);

    assert_eq!(request.expire_on, "2024-03-01T12:05:00Z");
    assert_eq!(request.email, NOTIFICATION_EMAIL);
    assert_eq!(request.exponent, "AQAB");

    let json = request.to_json().expect("json");
    assert!(json.contains("\"userName\":\"builder\""));
    assert!(json.contains("\"expireOn\""));
    assert!(!json.contains('\n'));
}

#[rstest]
fn key_request_is_added_as_new_item() {
    let metadata = Metadata {
        fingerprint: Some(String::from("fp")),
        items: vec![MetadataItem::new("other", "kept")],
    };

    let updated = with_key_request(&metadata, "{\"a\":1}");

    assert_eq!(updated.fingerprint.as_deref(), Some("fp"));
    assert_eq!(updated.get("other"), Some("kept"));
    assert_eq!(updated.get(WINDOWS_KEYS_METADATA_KEY), Some("{\"a\":1}"));
}

#[rstest]
fn key_request_is_appended_on_new_line() {
    let metadata = Metadata {
        fingerprint: None,
        items: vec![MetadataItem::new(WINDOWS_KEYS_METADATA_KEY, "{\"old\":1}\n")],
    };

    let updated = with_key_request(&metadata, "{\"new\":2}");

    assert_eq!(
        updated.get(WINDOWS_KEYS_METADATA_KEY),
        Some("{\"old\":1}\n{\"new\":2}")
    );
    assert_eq!(updated.items.len(), 1);
}

#[rstest]
fn scan_decrypts_matching_response(keys: KeyPair) {
    let console = format!(
        "Windows boot log line\n{}\n",
        response_line(keys.modulus(), &encrypted_for(&keys, "s3cret!"))
    );

    let acceptance = scan(&console, &keys);

    assert_eq!(
        acceptance,
        Some(Acceptance::Password(Secret::from("s3cret!")))
    );
}

#[rstest]
fn scan_ignores_responses_for_other_keys(keys: KeyPair) {
    let other = KeyPair::generate(TEST_KEY_BITS).expect("second keypair");
    let console = response_line(other.modulus(), &encrypted_for(&other, "not-mine"));

    assert_eq!(scan(&console, &keys), None);
}

#[rstest]
fn scan_skips_undecodable_match_and_keeps_looking(keys: KeyPair) {
    let console = format!(
        "{}\n{}\n",
        response_line(keys.modulus(), "!!not base64!!"),
        response_line(keys.modulus(), &encrypted_for(&keys, "second"))
    );

    assert_eq!(
        scan(&console, &keys),
        Some(Acceptance::Password(Secret::from("second")))
    );
}

#[rstest]
fn error_message_is_a_rejection(keys: KeyPair) {
    let line = serde_json::json!({
        "modulus": keys.modulus(),
        "passwordFound": false,
        "errorMessage": "user is not allowed",
    })
    .to_string();

    assert_eq!(
        scan(&line, &keys),
        Some(Acceptance::Rejected(String::from("user is not allowed")))
    );
}

#[rstest]
#[case("")]
#[case("plain text")]
#[case("{not json")]
fn non_records_are_ignored(#[case] line: &str) {
    assert_eq!(parse_record(line), None);
}

#[rstest]
fn empty_modulus_never_correlates() {
    let response = KeyExchangeResponse::default();
    assert!(!correlate(&response, ""));
}

async fn running_manager(compute: &FakeCompute) -> InstanceManager<FakeCompute> {
    let mut manager = InstanceManager::new(compute.clone(), &sample_config(), "demo-project");
    let cancel = CancellationToken::new();
    manager.create(&cancel).await.expect("create");
    manager.wait_until_running(&cancel).await.expect("boot");
    manager
}

#[tokio::test(start_paused = true)]
async fn reset_password_returns_guest_password() {
    let compute = FakeCompute::new();
    let manager = running_manager(&compute).await;
    let exchange = CredentialExchange::new(&manager, Duration::from_secs(60))
        .with_key_bits(TEST_KEY_BITS);

    let secret = exchange
        .reset_password("builder", &CancellationToken::new())
        .await
        .expect("handshake");

    assert_eq!(secret.expose(), FAKE_PASSWORD);
    let published = compute.published_requests();
    assert_eq!(published.len(), 1);
    assert_eq!(published.first().map(|r| r.user_name.as_str()), Some("builder"));
}

#[tokio::test(start_paused = true)]
async fn silent_guest_times_out() {
    let compute = FakeCompute::new();
    compute.set_guest(GuestAgent::Silent);
    let manager = running_manager(&compute).await;
    let exchange = CredentialExchange::new(&manager, Duration::from_secs(30))
        .with_key_bits(TEST_KEY_BITS);

    let err = exchange
        .reset_password("builder", &CancellationToken::new())
        .await
        .expect_err("no response");

    assert!(err.is_timeout());
}

#[tokio::test(start_paused = true)]
async fn stale_response_from_earlier_request_is_ignored() {
    let compute = FakeCompute::new();
    compute.set_guest(GuestAgent::Silent);
    let stale = KeyPair::generate(TEST_KEY_BITS).expect("stale keypair");
    compute.push_serial_line(&response_line(
        stale.modulus(),
        &encrypted_for(&stale, "old-password"),
    ));
    let manager = running_manager(&compute).await;
    let exchange = CredentialExchange::new(&manager, Duration::from_secs(10))
        .with_key_bits(TEST_KEY_BITS);

    let err = exchange
        .reset_password("builder", &CancellationToken::new())
        .await
        .expect_err("stale response must not be accepted");

    assert!(err.is_timeout());
}

#[tokio::test(start_paused = true)]
async fn guest_rejection_surfaces_message() {
    let compute = FakeCompute::new();
    compute.set_guest(GuestAgent::Reject {
        message: String::from("account locked"),
    });
    let manager = running_manager(&compute).await;
    let exchange = CredentialExchange::new(&manager, Duration::from_secs(30))
        .with_key_bits(TEST_KEY_BITS);

    let err = exchange
        .reset_password("builder", &CancellationToken::new())
        .await
        .expect_err("rejected");

    assert_eq!(err, HandshakeError::Rejected(String::from("account locked")));
}

#[tokio::test(start_paused = true)]
async fn stale_fingerprint_fails_metadata_update() {
    let compute = FakeCompute::new();
    let mut manager = InstanceManager::new(compute.clone(), &sample_config(), "demo-project");
    manager
        .create(&CancellationToken::new())
        .await
        .expect("create");
    let exchange = CredentialExchange::new(&manager, Duration::from_secs(30))
        .with_key_bits(TEST_KEY_BITS);

    let err = exchange
        .reset_password("builder", &CancellationToken::new())
        .await
        .expect_err("descriptor was never refreshed");

    assert!(matches!(err, HandshakeError::Metadata(_)));
}

#[tokio::test(start_paused = true)]
async fn cancelled_handshake_stops_polling() {
    let compute = FakeCompute::new();
    compute.set_guest(GuestAgent::Silent);
    let manager = running_manager(&compute).await;
    let exchange = CredentialExchange::new(&manager, Duration::from_secs(300))
        .with_key_bits(TEST_KEY_BITS);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let err = exchange
        .reset_password("builder", &cancel)
        .await
        .expect_err("cancelled");

    assert_eq!(err, HandshakeError::Cancelled);
}
