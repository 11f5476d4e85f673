//! Unit tests for the build orchestrator.

use std::io::{Cursor, Write};

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::*;
use crate::compute::ComputeError;
use crate::remote::RemoteCommandOutput;
use crate::test_support::{
    ComputeCall, FAKE_EXTERNAL_IP, FAKE_PASSWORD, FakeCompute, FileCopy, GuestAgent, MemoryStore,
    ScriptedConnector, sample_config,
};

const TEST_KEY_BITS: usize = 512;

struct Harness {
    compute: FakeCompute,
    store: MemoryStore,
    connector: ScriptedConnector,
    _tmp: TempDir,
    workspace: Utf8PathBuf,
}

impl Harness {
    fn orchestrator(
        &self,
    ) -> BuildOrchestrator<FakeCompute, MemoryStore, ScriptedConnector> {
        let mut config = sample_config();
        config.handshake_timeout_secs = 30;
        BuildOrchestrator::new(
            self.compute.clone(),
            self.store.clone(),
            self.connector.clone(),
            config,
        )
        .with_key_bits(TEST_KEY_BITS)
    }

    fn request(&self) -> BuildRequest {
        BuildRequest {
            project: String::from("demo-project"),
            image: String::from("gcr.io/test/test"),
            args: String::from("build"),
            workspace: self.workspace.clone(),
            host: None,
            username: None,
            password: None,
        }
    }

    fn deleted(&self) -> bool {
        self.compute
            .calls()
            .iter()
            .any(|call| matches!(call, ComputeCall::DeleteInstance(_)))
    }
}

fn results_zip() -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("out/app.exe", SimpleFileOptions::default())
        .expect("start entry");
    writer.write_all(b"MZ").expect("write entry");
    writer.finish().expect("finish zip").into_inner()
}

#[fixture]
fn harness() -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let workspace = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    std::fs::write(workspace.join("build.bat"), "echo building").expect("seed workspace");
    let store = MemoryStore::new();
    let connector = ScriptedConnector::new();
    connector.put_file(r"C:\results.zip", results_zip());
    Harness {
        compute: FakeCompute::new(),
        store,
        connector,
        _tmp: tmp,
        workspace,
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn provisions_builds_and_tears_down(harness: Harness) {
    let code = harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect("build succeeds");

    assert_eq!(code, 0);
    assert!(!harness.compute.has_instance("windows-builder"));
    assert!(harness.compute.has_firewall("allow-winrm-ingress"));

    let targets = harness.connector.targets();
    let target = targets.first().expect("connected once");
    assert_eq!(target.hostname, FAKE_EXTERNAL_IP);
    assert_eq!(target.account, "builder");
    assert_eq!(target.password.expose(), FAKE_PASSWORD);
    assert_eq!(harness.connector.close_count(), 1);

    let restored = std::fs::read_to_string(harness.workspace.join("out/app.exe"))
        .expect("results extracted");
    assert_eq!(restored, "MZ");
    assert_eq!(harness.store.keys("cloudbuild-windows-demo-project").len(), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn remote_commands_run_in_order(harness: Harness) {
    harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect("build succeeds");

    let commands = harness.connector.commands();
    let order: Vec<&str> = commands
        .iter()
        .map(|cmd| match cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ").as_str() {
            "gcloud --quiet" => "configure",
            "docker pull" => "pull",
            "docker run" => "run",
            _ if cmd.contains("ExtractToDirectory") => "extract",
            _ if cmd.contains("CreateFromDirectory") => "archive",
            _ => "other",
        })
        .collect();
    assert_eq!(order, vec!["configure", "pull", "extract", "run", "archive"]);

    let copies = harness.connector.copies();
    assert!(matches!(
        copies.as_slice(),
        [
            FileCopy::ToRemote { path: staged, size },
            FileCopy::FromRemote(collected),
        ] if staged == r"C:\workspace.zip" && *size > 0 && collected == r"C:\results.zip"
    ));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn non_zero_build_step_is_returned(harness: Harness) {
    harness.connector.exit_code_for("docker run", 3);

    let code = harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect("non-zero exit is not an error");

    assert_eq!(code, 3);
    assert!(harness.deleted());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn existing_host_skips_provisioning(harness: Harness) {
    let mut request = harness.request();
    request.host = Some(String::from("198.51.100.4"));
    request.username = Some(String::from("admin"));
    request.password = Some(Secret::from("hunter2"));

    let code = harness
        .orchestrator()
        .execute(&request, &CancellationToken::new())
        .await
        .expect("build succeeds");

    assert_eq!(code, 0);
    assert!(harness.compute.calls().is_empty());
    let targets = harness.connector.targets();
    assert_eq!(targets.first().map(|t| t.account.as_str()), Some("admin"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn username_alone_still_provisions(harness: Harness) {
    let mut request = harness.request();
    request.username = Some(String::from("ci"));

    harness
        .orchestrator()
        .execute(&request, &CancellationToken::new())
        .await
        .expect("build succeeds");

    let published = harness.compute.published_requests();
    assert_eq!(published.first().map(|r| r.user_name.as_str()), Some("ci"));
    assert!(harness.deleted());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn handshake_timeout_is_retried_with_fresh_key(harness: Harness) {
    harness.compute.set_guest(GuestAgent::RespondAfter {
        ignored: 1,
        password: String::from("second-try"),
    });

    harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect("second attempt succeeds");

    let published = harness.compute.published_requests();
    assert_eq!(published.len(), 2);
    assert_ne!(
        published.first().map(|r| r.modulus.clone()),
        published.get(1).map(|r| r.modulus.clone())
    );
    let targets = harness.connector.targets();
    assert_eq!(
        targets.first().map(|t| t.password.expose().to_owned()),
        Some(String::from("second-try"))
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn exhausted_handshake_deletes_vm(harness: Harness) {
    harness.compute.set_guest(GuestAgent::Silent);

    let err = harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect_err("no credentials");

    assert!(matches!(
        err,
        BuildError::Handshake {
            source: HandshakeError::Timeout { .. },
            ..
        }
    ));
    assert_eq!(harness.compute.published_requests().len(), 2);
    assert!(!harness.compute.has_instance("windows-builder"));
    assert!(harness.connector.targets().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn rejected_insert_never_deletes(harness: Harness) {
    harness.compute.fail_insert(ComputeError::Api {
        status: 403,
        message: String::from("quota exceeded"),
    });

    let err = harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect_err("insert rejected");

    assert!(matches!(
        err,
        BuildError::Lifecycle {
            source: LifecycleError::Provisioning { .. },
            ..
        }
    ));
    assert!(!harness.deleted());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn pre_existing_instance_is_left_alone(harness: Harness) {
    harness.compute.add_running_instance("windows-builder");

    let err = harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect_err("name collision");

    assert!(matches!(err, BuildError::Lifecycle { .. }));
    assert!(harness.compute.has_instance("windows-builder"));
    assert!(!harness.deleted());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn teardown_failure_after_success_is_reported(harness: Harness) {
    harness.compute.fail_delete(ComputeError::Auth(String::from("denied")));

    let err = harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect_err("teardown failed");

    assert!(matches!(err, BuildError::Teardown(LifecycleError::Deletion { .. })));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn teardown_failure_is_appended_to_primary_error(harness: Harness) {
    harness.compute.set_guest(GuestAgent::Reject {
        message: String::from("no such user"),
    });
    harness.compute.fail_delete(ComputeError::Auth(String::from("denied")));

    let err = harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect_err("handshake rejected");

    let message = err.to_string();
    assert!(message.contains("no such user"), "{message}");
    assert!(message.contains("teardown also failed"), "{message}");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn transport_failure_closes_session_and_deletes_vm(harness: Harness) {
    harness.connector.fail_on(
        "docker pull",
        TransportError::Protocol(String::from("connection reset")),
    );

    let err = harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect_err("pull failed");

    assert!(matches!(err, BuildError::Transport { .. }));
    assert_eq!(harness.connector.close_count(), 1);
    assert!(harness.deleted());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_extraction_stops_build_and_deletes_vm(harness: Harness) {
    harness.connector.exit_code_for("powershell.exe", 1);

    let err = harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect_err("extraction failed");

    assert!(matches!(
        err,
        BuildError::RemoteStep {
            source: SessionError::Command {
                step: "extract workspace",
                exit_code: 1,
                ..
            },
            ..
        }
    ));
    assert!(
        !harness
            .connector
            .commands()
            .iter()
            .any(|cmd| cmd.starts_with("docker run"))
    );
    assert_eq!(harness.connector.close_count(), 1);
    assert!(harness.deleted());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_image_pull_carries_stderr(harness: Harness) {
    harness.connector.exit_code_for("docker pull", 1);
    harness.connector.push_output(RemoteCommandOutput::default());
    harness.connector.push_output(RemoteCommandOutput {
        exit_code: 0,
        stdout: String::new(),
        stderr: String::from("pull access denied"),
    });

    let err = harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect_err("pull failed");

    assert_eq!(
        err.to_string(),
        "remote step failed: pull image exited with status 1: pull access denied"
    );
    assert!(harness.connector.copies().is_empty());
    assert!(harness.deleted());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn missing_results_archive_fails_build(harness: Harness) {
    let connector = ScriptedConnector::new();
    let bare = Harness {
        connector: connector.clone(),
        ..harness
    };

    let err = bare
        .orchestrator()
        .execute(&bare.request(), &CancellationToken::new())
        .await
        .expect_err("nothing to copy back");

    assert!(matches!(
        err,
        BuildError::Transport {
            source: TransportError::Copy { .. },
            ..
        }
    ));
    assert!(bare.deleted());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unreachable_winrm_port_fails_and_deletes_vm(harness: Harness) {
    harness.connector.set_unreachable();

    let err = harness
        .orchestrator()
        .execute(&harness.request(), &CancellationToken::new())
        .await
        .expect_err("port never opens");

    assert!(matches!(
        err,
        BuildError::Transport {
            source: TransportError::Connect { .. },
            ..
        }
    ));
    assert!(harness.connector.targets().is_empty());
    assert!(harness.deleted());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cancelled_build_still_deletes_vm(harness: Harness) {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = harness
        .orchestrator()
        .execute(&harness.request(), &cancel)
        .await
        .expect_err("cancelled");

    assert!(matches!(
        err,
        BuildError::Lifecycle {
            source: LifecycleError::Cancelled { .. },
            ..
        }
    ));
    assert!(!harness.compute.has_instance("windows-builder"));
}

#[rstest]
fn partial_credentials_do_not_form_a_target(harness: Harness) {
    let mut request = harness.request();
    request.host = Some(String::from("198.51.100.4"));
    request.password = Some(Secret::from("pw"));

    assert_eq!(request.existing_target(5986), None);
}
