//! WinRM transport over HTTPS with Basic authentication.
//!
//! The guest's listener presents a self-signed certificate, so certificate
//! validation is disabled for this client only. The credentials come from the
//! handshake and the ingress rule is scoped to the WinRM port.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::secret::Secret;

use super::commands;
use super::types::{
    Connector, OutputMode, RemoteCommandOutput, RemoteShell, RemoteTarget, TransportError,
    TransportFuture,
};

pub mod soap;

use soap::EnvelopeContext;

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";
const OPERATION_TIMEOUT_SECS: u64 = 60;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
// Receive calls block server-side for up to the operation timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(OPERATION_TIMEOUT_SECS + 30);

/// Opens WinRM shells.
#[derive(Clone, Debug)]
pub struct WinrmConnector {
    http: reqwest::Client,
}

impl WinrmConnector {
    /// Builds a connector that accepts the guest's self-signed certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when the HTTP client cannot be
    /// constructed.
    pub fn new() -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Connect {
                endpoint: String::from("winrm client"),
                message: err.to_string(),
            })?;
        Ok(Self { http })
    }
}

/// `https://{host}:{port}/wsman` for `target`.
#[must_use]
pub fn endpoint(target: &RemoteTarget) -> String {
    let host = if target.hostname.contains(':') && !target.hostname.starts_with('[') {
        format!("[{}]", target.hostname)
    } else {
        target.hostname.clone()
    };
    format!("https://{host}:{}/wsman", target.port)
}

impl Connector for WinrmConnector {
    type Shell = WinrmShell;

    fn probe<'a>(&'a self, target: &'a RemoteTarget) -> TransportFuture<'a, bool> {
        Box::pin(async move {
            let address = (target.hostname.as_str(), target.port);
            let connect = tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(address)).await;
            Ok(matches!(connect, Ok(Ok(_))))
        })
    }

    fn connect<'a>(&'a self, target: &'a RemoteTarget) -> TransportFuture<'a, WinrmShell> {
        Box::pin(async move {
            let mut shell = WinrmShell {
                http: self.http.clone(),
                endpoint: endpoint(target),
                account: target.account.clone(),
                password: target.password.clone(),
                shell_id: String::new(),
            };
            let request = soap::create_shell(shell.context(&Uuid::new_v4().to_string()));
            let response = shell.post(request).await?;
            shell.shell_id = soap::parse_shell_id(&response)?;
            tracing::debug!(endpoint = %shell.endpoint, shell_id = %shell.shell_id, "opened WinRM shell");
            Ok(shell)
        })
    }
}

/// Open WinRM shell.
#[derive(Debug)]
pub struct WinrmShell {
    http: reqwest::Client,
    endpoint: String,
    account: String,
    password: Secret,
    shell_id: String,
}

impl WinrmShell {
    fn context<'a>(&'a self, message_id: &'a str) -> EnvelopeContext<'a> {
        EnvelopeContext {
            endpoint: &self.endpoint,
            message_id,
            operation_timeout_secs: OPERATION_TIMEOUT_SECS,
        }
    }

    async fn post(&self, body: String) -> Result<String, TransportError> {
        self.exchange(body).await?.map_err(TransportError::from)
    }

    /// Sends one envelope. The inner `Err` carries a SOAP fault the service
    /// answered with; the outer one covers everything else.
    async fn exchange(&self, body: String) -> Result<Result<String, soap::Fault>, TransportError> {
        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.account, Some(self.password.expose()))
            .header(reqwest::header::CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|err| TransportError::Connect {
                endpoint: self.endpoint.clone(),
                message: err.to_string(),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        match status {
            s if s.is_success() => Ok(Ok(text)),
            StatusCode::UNAUTHORIZED => Err(TransportError::Unauthorized {
                account: self.account.clone(),
            }),
            _ => Ok(Err(soap::parse_fault(&text))),
        }
    }

    /// Posts a Receive; `Ok(None)` means the server timed out without output.
    async fn receive(&self, command_id: &str) -> Result<Option<soap::ReceiveChunk>, TransportError> {
        let message_id = Uuid::new_v4().to_string();
        let request = soap::receive_output(self.context(&message_id), &self.shell_id, command_id);
        match self.exchange(request).await? {
            Ok(response) => soap::parse_receive(&response).map(Some),
            Err(fault) if fault.is_operation_timeout() => Ok(None),
            Err(fault) => Err(fault.into()),
        }
    }

    async fn run(
        &self,
        command: &str,
        mode: OutputMode,
    ) -> Result<RemoteCommandOutput, TransportError> {
        let message_id = Uuid::new_v4().to_string();
        let request = soap::run_command(self.context(&message_id), &self.shell_id, command);
        let command_id = soap::parse_command_id(&self.post(request).await?)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit_code = loop {
            let Some(chunk) = self.receive(&command_id).await? else {
                continue;
            };
            match mode {
                OutputMode::Capture => {
                    stdout.extend_from_slice(&chunk.stdout);
                    stderr.extend_from_slice(&chunk.stderr);
                }
                OutputMode::Stream => forward(&chunk).await?,
            }
            if chunk.done {
                break chunk.exit_code.unwrap_or_default();
            }
        };

        let signal_id = Uuid::new_v4().to_string();
        let signal = soap::signal_terminate(self.context(&signal_id), &self.shell_id, &command_id);
        if let Err(err) = self.post(signal).await {
            tracing::debug!(error = %err, "failed to release finished command");
        }

        Ok(RemoteCommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

async fn forward(chunk: &soap::ReceiveChunk) -> Result<(), TransportError> {
    if !chunk.stdout.is_empty() {
        let mut out = tokio::io::stdout();
        out.write_all(&chunk.stdout)
            .await
            .map_err(|err| TransportError::Output(err.to_string()))?;
        out.flush()
            .await
            .map_err(|err| TransportError::Output(err.to_string()))?;
    }
    if !chunk.stderr.is_empty() {
        let mut err_out = tokio::io::stderr();
        err_out
            .write_all(&chunk.stderr)
            .await
            .map_err(|err| TransportError::Output(err.to_string()))?;
    }
    Ok(())
}

fn copy_failure(remote_path: &str, output: &RemoteCommandOutput) -> TransportError {
    TransportError::Copy {
        path: remote_path.to_owned(),
        message: format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
    }
}

impl RemoteShell for WinrmShell {
    fn execute<'a>(
        &'a mut self,
        command: &'a str,
        mode: OutputMode,
    ) -> TransportFuture<'a, RemoteCommandOutput> {
        Box::pin(self.run(command, mode))
    }

    fn copy_to<'a>(
        &'a mut self,
        contents: &'a [u8],
        remote_path: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(path = remote_path, bytes = contents.len(), "copying file to remote host");
            for command in commands::copy_to_commands(contents, remote_path) {
                let output = self.run(&command, OutputMode::Capture).await?;
                if !output.is_success() {
                    return Err(copy_failure(remote_path, &output));
                }
            }
            Ok(())
        })
    }

    fn copy_from<'a>(&'a mut self, remote_path: &'a str) -> TransportFuture<'a, Vec<u8>> {
        Box::pin(async move {
            tracing::debug!(path = remote_path, "copying file from remote host");
            let command = commands::copy_from_command(remote_path);
            let output = self.run(&command, OutputMode::Capture).await?;
            if !output.is_success() {
                return Err(copy_failure(remote_path, &output));
            }
            commands::decode_copied(remote_path, &output.stdout)
        })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.shell_id.is_empty() {
                return Ok(());
            }
            let message_id = Uuid::new_v4().to_string();
            let request = soap::delete_shell(self.context(&message_id), &self.shell_id);
            self.post(request).await?;
            self.shell_id.clear();
            Ok(())
        })
    }
}
