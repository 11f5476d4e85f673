//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeCompute`] models just enough of Compute Engine to drive the build
//! flow: operations that finish after a configurable number of polls, an
//! instance that boots after a few reads, and a guest agent that answers
//! credential requests on serial port 4. [`MemoryStore`] and
//! [`ScriptedConnector`] stand in for Cloud Storage and WinRM.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rsa::{BigUint, Oaep, RsaPublicKey};
use sha1::Sha1;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::compute::{
    AccessConfig, ComputeApi, ComputeError, ComputeFuture, ComputeScope, FirewallRule, Instance,
    InstanceSpec, Metadata, NetworkInterface, Operation, OperationErrorDetail, OperationErrors,
};
use crate::config::{BuilderConfig, DEFAULT_IMAGE_URL, DEFAULT_REMOTE_WORKSPACE};
use crate::handshake::{CREDENTIAL_SERIAL_PORT, KeyExchangeRequest, WINDOWS_KEYS_METADATA_KEY};
use crate::remote::{
    Connector, OutputMode, RemoteCommandOutput, RemoteShell, RemoteTarget, TransportError,
    TransportFuture,
};
use crate::storage::{ObjectStore, StorageError, StorageFuture};

/// Address the fake assigns once an instance is running.
pub const FAKE_EXTERNAL_IP: &str = "203.0.113.10";

/// Password the default fake guest agent hands out.
pub const FAKE_PASSWORD: &str = "Fake-P@ssw0rd";

/// Configuration with short timeouts suited to paused-clock tests.
#[must_use]
pub fn sample_config() -> BuilderConfig {
    BuilderConfig {
        zone: String::from("us-central1-f"),
        instance_name: String::from("windows-builder"),
        machine_type: String::from("n1-standard-1"),
        image_url: String::from(DEFAULT_IMAGE_URL),
        network: String::from("global/networks/default"),
        firewall_name: String::from("allow-winrm-ingress"),
        winrm_port: 5986,
        default_account: String::from("builder"),
        workspace_dir: String::from("/workspace"),
        remote_workspace: String::from(DEFAULT_REMOTE_WORKSPACE),
        bucket_prefix: String::from("cloudbuild-windows-"),
        access_token: None,
        operation_timeout_secs: 120,
        boot_timeout_secs: 600,
        handshake_timeout_secs: 300,
        handshake_attempts: 2,
        winrm_ready_timeout_secs: 300,
        build_timeout_secs: 3600,
    }
}

/// Behaviour of the simulated Windows guest agent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GuestAgent {
    /// Encrypts `password` to each new request key.
    Respond {
        /// Password to hand out.
        password: String,
    },
    /// Never answers.
    Silent,
    /// Answers every request with an error message.
    Reject {
        /// Message written to the console.
        message: String,
    },
    /// Answers only after this many requests have been ignored.
    RespondAfter {
        /// Requests to ignore first.
        ignored: u32,
        /// Password to hand out.
        password: String,
    },
}

impl Default for GuestAgent {
    fn default() -> Self {
        Self::Respond {
            password: String::from(FAKE_PASSWORD),
        }
    }
}

/// Call recorded by [`FakeCompute`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ComputeCall {
    /// `instances.insert`.
    InsertInstance(String),
    /// `instances.get`.
    GetInstance(String),
    /// `instances.delete`.
    DeleteInstance(String),
    /// `zoneOperations.get`.
    GetOperation(String),
    /// `globalOperations.get`.
    GetGlobalOperation(String),
    /// `firewalls.insert`.
    InsertFirewall(String),
    /// `instances.setMetadata`.
    SetMetadata(String),
    /// `instances.getSerialPortOutput`.
    SerialPort(u8),
}

#[derive(Debug)]
struct FakeOperation {
    remaining_polls: u32,
    error: Option<String>,
    zone: Option<String>,
}

#[derive(Debug, Default)]
struct ComputeState {
    instances: BTreeMap<String, Instance>,
    operations: HashMap<String, FakeOperation>,
    firewalls: BTreeSet<String>,
    serial: String,
    calls: Vec<ComputeCall>,
    next_id: u64,
    operation_polls: u32,
    boot_reads: u32,
    stall_operations: bool,
    operation_error: Option<String>,
    insert_error: Option<ComputeError>,
    delete_error: Option<ComputeError>,
    guest: GuestAgent,
    requests_seen: u32,
    published: Vec<KeyExchangeRequest>,
}

impl ComputeState {
    fn record(&mut self, call: ComputeCall) {
        self.calls.push(call);
    }

    /// Issues an operation; `zone` is `None` for global operations.
    fn operation(&mut self, zone: Option<String>) -> Operation {
        self.next_id += 1;
        let name = format!("operation-{}", self.next_id);
        self.operations.insert(
            name.clone(),
            FakeOperation {
                remaining_polls: self.operation_polls,
                error: self.operation_error.clone(),
                zone: zone.clone(),
            },
        );
        Operation {
            name,
            status: String::from("RUNNING"),
            zone,
            error: None,
        }
    }

    /// Advances the operation `name`, refusing lookups from the wrong table.
    fn poll_operation(&mut self, name: &str, zonal: bool) -> Result<Operation, ComputeError> {
        let stalled = self.stall_operations;
        let table = if zonal { "zone" } else { "global" };
        let tracked = self
            .operations
            .get_mut(name)
            .filter(|tracked| tracked.zone.is_some() == zonal)
            .ok_or_else(|| not_found(format!("{table} operation {name}")))?;
        if stalled || tracked.remaining_polls > 0 {
            tracked.remaining_polls = tracked.remaining_polls.saturating_sub(1);
            return Ok(Operation {
                name: name.to_owned(),
                status: String::from("RUNNING"),
                zone: tracked.zone.clone(),
                error: None,
            });
        }
        Ok(Operation {
            name: name.to_owned(),
            status: String::from("DONE"),
            zone: tracked.zone.clone(),
            error: tracked.error.clone().map(|message| OperationErrors {
                errors: vec![OperationErrorDetail {
                    code: Some(String::from("FAKE_FAILURE")),
                    message,
                }],
            }),
        })
    }

    fn fingerprint(&mut self) -> String {
        self.next_id += 1;
        format!("fingerprint-{}", self.next_id)
    }
}

/// In-memory [`ComputeApi`].
#[derive(Clone, Debug, Default)]
pub struct FakeCompute {
    state: Arc<Mutex<ComputeState>>,
}

impl FakeCompute {
    /// Creates a fake whose operations finish on the first poll and whose
    /// instance boots on the first read.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ComputeState> {
        self.state
            .lock()
            .unwrap_or_else(|err| panic!("fake compute lock poisoned: {err}"))
    }

    /// Makes each operation report `RUNNING` for `polls` polls first.
    pub fn set_operation_polls(&self, polls: u32) {
        self.state().operation_polls = polls;
    }

    /// Makes the instance report `STAGING` for `reads` reads first.
    pub fn set_boot_reads(&self, reads: u32) {
        self.state().boot_reads = reads;
    }

    /// Keeps every operation `RUNNING` forever.
    pub fn stall_operations(&self) {
        self.state().stall_operations = true;
    }

    /// Makes new operations finish with `message` as their error.
    pub fn fail_operations(&self, message: &str) {
        self.state().operation_error = Some(message.to_owned());
    }

    /// Rejects instance inserts with `error`.
    pub fn fail_insert(&self, error: ComputeError) {
        self.state().insert_error = Some(error);
    }

    /// Rejects instance deletes with `error`.
    pub fn fail_delete(&self, error: ComputeError) {
        self.state().delete_error = Some(error);
    }

    /// Replaces the guest agent behaviour.
    pub fn set_guest(&self, guest: GuestAgent) {
        self.state().guest = guest;
    }

    /// Appends raw text to serial port 4.
    pub fn push_serial_line(&self, line: &str) {
        let mut state = self.state();
        state.serial.push_str(line);
        state.serial.push('\n');
    }

    /// Seeds an existing firewall rule.
    pub fn add_firewall(&self, name: &str) {
        self.state().firewalls.insert(name.to_owned());
    }

    /// Seeds a running instance that this build did not create.
    pub fn add_running_instance(&self, name: &str) {
        let mut state = self.state();
        let fingerprint = state.fingerprint();
        state
            .instances
            .insert(name.to_owned(), running_instance(name, fingerprint));
    }

    /// Calls recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ComputeCall> {
        self.state().calls.clone()
    }

    /// Returns `true` when an instance called `name` exists.
    #[must_use]
    pub fn has_instance(&self, name: &str) -> bool {
        self.state().instances.contains_key(name)
    }

    /// Returns the stored instance called `name`.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.state().instances.get(name).cloned()
    }

    /// Returns `true` when the firewall rule `name` exists.
    #[must_use]
    pub fn has_firewall(&self, name: &str) -> bool {
        self.state().firewalls.contains(name)
    }

    /// Credential requests published through metadata, oldest first.
    #[must_use]
    pub fn published_requests(&self) -> Vec<KeyExchangeRequest> {
        self.state().published.clone()
    }

    /// Current serial port 4 contents.
    #[must_use]
    pub fn serial_output(&self) -> String {
        self.state().serial.clone()
    }
}

fn running_instance(name: &str, fingerprint: String) -> Instance {
    Instance {
        name: name.to_owned(),
        status: String::from("RUNNING"),
        network_interfaces: vec![NetworkInterface {
            network: None,
            access_configs: vec![AccessConfig {
                kind: Some(String::from("ONE_TO_ONE_NAT")),
                name: Some(String::from("External NAT")),
                nat_ip: Some(String::from(FAKE_EXTERNAL_IP)),
            }],
        }],
        metadata: Metadata {
            fingerprint: Some(fingerprint),
            items: Vec::new(),
        },
    }
}

fn zone_link(scope: &ComputeScope) -> String {
    format!(
        "https://www.googleapis.com/compute/v1/projects/{}/zones/{}",
        scope.project, scope.zone
    )
}

fn not_found(resource: String) -> ComputeError {
    ComputeError::NotFound { resource }
}

/// Encrypts `password` to the key in `request` the way the guest agent does.
///
/// # Errors
///
/// Returns a description of the failure when the request key is unusable.
pub fn encrypt_for_request(request: &KeyExchangeRequest, password: &str) -> Result<String, String> {
    let modulus = STANDARD
        .decode(&request.modulus)
        .map_err(|err| err.to_string())?;
    let exponent = STANDARD
        .decode(&request.exponent)
        .map_err(|err| err.to_string())?;
    let public = RsaPublicKey::new(
        BigUint::from_bytes_be(&modulus),
        BigUint::from_bytes_be(&exponent),
    )
    .map_err(|err| err.to_string())?;
    let ciphertext = public
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), password.as_bytes())
        .map_err(|err| err.to_string())?;
    Ok(STANDARD.encode(ciphertext))
}

fn guest_response(state: &mut ComputeState, request: &KeyExchangeRequest) -> Option<String> {
    state.requests_seen += 1;
    let password = match &state.guest {
        GuestAgent::Silent => return None,
        GuestAgent::Reject { message } => {
            return Some(
                serde_json::json!({
                    "userName": request.user_name,
                    "modulus": request.modulus,
                    "exponent": request.exponent,
                    "passwordFound": false,
                    "errorMessage": message,
                })
                .to_string(),
            );
        }
        GuestAgent::Respond { password } => password.clone(),
        GuestAgent::RespondAfter { ignored, password } => {
            if state.requests_seen <= *ignored {
                return None;
            }
            password.clone()
        }
    };
    let encrypted = encrypt_for_request(request, &password).ok()?;
    Some(
        serde_json::json!({
            "userName": request.user_name,
            "passwordFound": true,
            "encryptedPassword": encrypted,
            "modulus": request.modulus,
            "exponent": request.exponent,
        })
        .to_string(),
    )
}

impl ComputeApi for FakeCompute {
    fn insert_instance<'a>(
        &'a self,
        scope: &'a ComputeScope,
        spec: &'a InstanceSpec,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.state();
            state.record(ComputeCall::InsertInstance(spec.name.clone()));
            if let Some(err) = state.insert_error.clone() {
                return Err(err);
            }
            if state.instances.contains_key(&spec.name) {
                return Err(ComputeError::AlreadyExists {
                    resource: format!("instance {}", spec.name),
                });
            }
            let fingerprint = state.fingerprint();
            let mut instance = running_instance(&spec.name, fingerprint);
            instance.status = String::from("PROVISIONING");
            instance.metadata.items.clone_from(&spec.metadata.items);
            state.instances.insert(spec.name.clone(), instance);
            Ok(state.operation(Some(zone_link(scope))))
        })
    }

    fn get_instance<'a>(
        &'a self,
        _scope: &'a ComputeScope,
        name: &'a str,
    ) -> ComputeFuture<'a, Instance> {
        Box::pin(async move {
            let mut state = self.state();
            state.record(ComputeCall::GetInstance(name.to_owned()));
            let booting = state.boot_reads > 0;
            if booting {
                state.boot_reads -= 1;
            }
            let instance = state
                .instances
                .get_mut(name)
                .ok_or_else(|| not_found(format!("instance {name}")))?;
            if instance.status != "RUNNING" && !booting {
                instance.status = String::from("RUNNING");
            }
            let mut snapshot = instance.clone();
            if snapshot.status != "RUNNING" {
                snapshot.status = String::from("STAGING");
                for nic in &mut snapshot.network_interfaces {
                    for config in &mut nic.access_configs {
                        config.nat_ip = None;
                    }
                }
            }
            Ok(snapshot)
        })
    }

    fn delete_instance<'a>(
        &'a self,
        scope: &'a ComputeScope,
        name: &'a str,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.state();
            state.record(ComputeCall::DeleteInstance(name.to_owned()));
            if let Some(err) = state.delete_error.clone() {
                return Err(err);
            }
            if state.instances.remove(name).is_none() {
                return Err(not_found(format!("instance {name}")));
            }
            Ok(state.operation(Some(zone_link(scope))))
        })
    }

    fn get_zone_operation<'a>(
        &'a self,
        _scope: &'a ComputeScope,
        operation: &'a str,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.state();
            state.record(ComputeCall::GetOperation(operation.to_owned()));
            state.poll_operation(operation, true)
        })
    }

    fn get_global_operation<'a>(
        &'a self,
        _scope: &'a ComputeScope,
        operation: &'a str,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.state();
            state.record(ComputeCall::GetGlobalOperation(operation.to_owned()));
            state.poll_operation(operation, false)
        })
    }

    fn insert_firewall<'a>(
        &'a self,
        _scope: &'a ComputeScope,
        rule: &'a FirewallRule,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.state();
            state.record(ComputeCall::InsertFirewall(rule.name.clone()));
            if !state.firewalls.insert(rule.name.clone()) {
                return Err(ComputeError::AlreadyExists {
                    resource: format!("firewall {}", rule.name),
                });
            }
            Ok(state.operation(None))
        })
    }

    fn set_metadata<'a>(
        &'a self,
        scope: &'a ComputeScope,
        name: &'a str,
        metadata: &'a Metadata,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.state();
            state.record(ComputeCall::SetMetadata(name.to_owned()));
            let fingerprint = state.fingerprint();
            let instance = state
                .instances
                .get_mut(name)
                .ok_or_else(|| not_found(format!("instance {name}")))?;
            if instance.metadata.fingerprint != metadata.fingerprint {
                return Err(ComputeError::Api {
                    status: 412,
                    message: String::from("Supplied fingerprint does not match current metadata fingerprint."),
                });
            }
            instance.metadata = Metadata {
                fingerprint: Some(fingerprint),
                items: metadata.items.clone(),
            };

            let newest = metadata
                .get(WINDOWS_KEYS_METADATA_KEY)
                .and_then(|value| value.lines().last())
                .and_then(|line| serde_json::from_str::<KeyExchangeRequest>(line).ok());
            if let Some(request) = newest {
                state.published.push(request.clone());
                if let Some(line) = guest_response(&mut state, &request) {
                    state.serial.push_str(&line);
                    state.serial.push('\n');
                }
            }
            Ok(state.operation(Some(zone_link(scope))))
        })
    }

    fn serial_port_output<'a>(
        &'a self,
        _scope: &'a ComputeScope,
        _name: &'a str,
        port: u8,
    ) -> ComputeFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state();
            state.record(ComputeCall::SerialPort(port));
            if port == CREDENTIAL_SERIAL_PORT {
                Ok(state.serial.clone())
            } else {
                Ok(String::new())
            }
        })
    }
}

/// In-memory [`ObjectStore`].
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<BTreeMap<(String, String), Vec<u8>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<(String, String), Vec<u8>>> {
        self.objects
            .lock()
            .unwrap_or_else(|err| panic!("memory store lock poisoned: {err}"))
    }

    /// Stores `bytes` at `bucket/key`.
    pub fn insert(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.objects()
            .insert((bucket.to_owned(), key.to_owned()), bytes);
    }

    /// Returns the bytes at `bucket/key`.
    #[must_use]
    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects()
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }

    /// Keys stored in `bucket`.
    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects()
            .keys()
            .filter(|(stored_bucket, _)| stored_bucket == bucket)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

impl ObjectStore for MemoryStore {
    fn write_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        bytes: Vec<u8>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.insert(bucket, key, bytes);
            Ok(())
        })
    }

    fn read_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.get(bucket, key).ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            })
        })
    }
}

/// File copy recorded by [`ScriptedConnector`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FileCopy {
    /// Bytes written to the host.
    ToRemote {
        /// Remote path.
        path: String,
        /// Number of bytes written.
        size: usize,
    },
    /// File read back from the host.
    FromRemote(String),
}

#[derive(Debug, Default)]
struct ScriptState {
    commands: Vec<(String, OutputMode)>,
    exit_codes: Vec<(String, i32)>,
    failures: Vec<(String, TransportError)>,
    outputs: VecDeque<RemoteCommandOutput>,
    files: BTreeMap<String, Vec<u8>>,
    copies: Vec<FileCopy>,
    targets: Vec<RemoteTarget>,
    connect_error: Option<TransportError>,
    unreachable: bool,
    probes: u32,
    closes: u32,
}

/// [`Connector`] that records commands and replays scripted outcomes.
///
/// Commands succeed with exit code 0 unless a prefix registered through
/// [`ScriptedConnector::exit_code_for`] or [`ScriptedConnector::fail_on`]
/// matches.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedConnector {
    /// Creates a connector whose commands all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|err| panic!("scripted connector lock poisoned: {err}"))
    }

    /// Commands starting with `prefix` exit with `code`.
    pub fn exit_code_for(&self, prefix: &str, code: i32) {
        self.state().exit_codes.push((prefix.to_owned(), code));
    }

    /// Commands starting with `prefix` fail at the transport level.
    pub fn fail_on(&self, prefix: &str, error: TransportError) {
        self.state().failures.push((prefix.to_owned(), error));
    }

    /// Queues captured output for the next command.
    pub fn push_output(&self, output: RemoteCommandOutput) {
        self.state().outputs.push_back(output);
    }

    /// Places `contents` at `path` on the simulated host.
    pub fn put_file(&self, path: &str, contents: Vec<u8>) {
        self.state().files.insert(path.to_owned(), contents);
    }

    /// Contents of `path` on the simulated host.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    /// File copies performed so far, across all shells.
    #[must_use]
    pub fn copies(&self) -> Vec<FileCopy> {
        self.state().copies.clone()
    }

    /// Makes every connection attempt fail with `error`.
    pub fn refuse_connections(&self, error: TransportError) {
        self.state().connect_error = Some(error);
    }

    /// Makes the readiness probe report the port as closed.
    pub fn set_unreachable(&self) {
        self.state().unreachable = true;
    }

    /// Command lines issued so far, across all shells.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .map(|(command, _)| command.clone())
            .collect()
    }

    /// Output mode used for each command.
    #[must_use]
    pub fn modes(&self) -> Vec<OutputMode> {
        self.state().commands.iter().map(|(_, mode)| *mode).collect()
    }

    /// Targets passed to `connect`.
    #[must_use]
    pub fn targets(&self) -> Vec<RemoteTarget> {
        self.state().targets.clone()
    }

    /// Number of readiness probes.
    #[must_use]
    pub fn probe_count(&self) -> u32 {
        self.state().probes
    }

    /// Number of closed shells.
    #[must_use]
    pub fn close_count(&self) -> u32 {
        self.state().closes
    }
}

impl Connector for ScriptedConnector {
    type Shell = ScriptedShell;

    fn probe<'a>(&'a self, _target: &'a RemoteTarget) -> TransportFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state();
            state.probes += 1;
            Ok(!state.unreachable)
        })
    }

    fn connect<'a>(&'a self, target: &'a RemoteTarget) -> TransportFuture<'a, ScriptedShell> {
        Box::pin(async move {
            let mut state = self.state();
            state.targets.push(target.clone());
            if let Some(err) = state.connect_error.clone() {
                return Err(err);
            }
            Ok(ScriptedShell {
                connector: self.clone(),
            })
        })
    }
}

/// Shell produced by [`ScriptedConnector`].
#[derive(Debug)]
pub struct ScriptedShell {
    connector: ScriptedConnector,
}

impl RemoteShell for ScriptedShell {
    fn execute<'a>(
        &'a mut self,
        command: &'a str,
        mode: OutputMode,
    ) -> TransportFuture<'a, RemoteCommandOutput> {
        Box::pin(async move {
            let mut state = self.connector.state();
            state.commands.push((command.to_owned(), mode));
            if let Some((_, err)) = state
                .failures
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            {
                return Err(err.clone());
            }
            let mut output = state.outputs.pop_front().unwrap_or_default();
            if let Some((_, code)) = state
                .exit_codes
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            {
                output.exit_code = *code;
            }
            Ok(output)
        })
    }

    fn copy_to<'a>(
        &'a mut self,
        contents: &'a [u8],
        remote_path: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.connector.state();
            state.copies.push(FileCopy::ToRemote {
                path: remote_path.to_owned(),
                size: contents.len(),
            });
            state.files.insert(remote_path.to_owned(), contents.to_vec());
            Ok(())
        })
    }

    fn copy_from<'a>(&'a mut self, remote_path: &'a str) -> TransportFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let mut state = self.connector.state();
            state.copies.push(FileCopy::FromRemote(remote_path.to_owned()));
            state
                .files
                .get(remote_path)
                .cloned()
                .ok_or_else(|| TransportError::Copy {
                    path: remote_path.to_owned(),
                    message: String::from("file not found"),
                })
        })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.connector.state().closes += 1;
            Ok(())
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }
        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
