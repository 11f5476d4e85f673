//! Binary entry point for the winbuilder CLI.

use std::future;
use std::process;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use winbuilder::{
    BuildError, BuildOrchestrator, BuildRequest, BuilderConfig, ConfigError, GceClient, GcsClient,
    Secret, TokenSource, WinrmConnector,
};

mod cli;

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to initialise {component}: {message}")]
    Setup {
        component: &'static str,
        message: String,
    },
    #[error(transparent)]
    Build(#[from] BuildError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "build failed");
            1
        }
    };

    process::exit(process_exit_code(exit_code));
}

/// Maps a remote exit code onto one the local process can report.
///
/// Only the low byte of an exit status survives on Unix, so a remote code
/// outside `1..=255` (an NTSTATUS such as `0xC0000005`, or `256`) would read
/// as another value or even as success. Those are reported as `1`.
const fn process_exit_code(code: i32) -> i32 {
    match code {
        0..=255 => code,
        _ => 1,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let config = BuilderConfig::load_without_cli_args()?;
    config.validate()?;
    let request = build_request(cli, &config);

    let http = reqwest::Client::builder()
        .build()
        .map_err(|err| CliError::Setup {
            component: "HTTP client",
            message: err.to_string(),
        })?;
    let tokens = TokenSource::from_config(config.access_token.as_deref(), http.clone());
    if tokens.is_static() {
        tracing::info!("using configured access token");
    } else {
        tracing::debug!("using metadata server access tokens");
    }
    let compute = GceClient::new(http.clone(), tokens.clone());
    let store = GcsClient::new(http, tokens);
    let connector = WinrmConnector::new().map_err(|err| CliError::Setup {
        component: "WinRM client",
        message: err.to_string(),
    })?;

    let cancel = CancellationToken::new();
    let watchdog = tokio::spawn(cancel_on_interrupt_or_deadline(
        cancel.clone(),
        config.build_timeout(),
    ));
    let orchestrator = BuildOrchestrator::new(compute, store, connector, config);
    let outcome = orchestrator.execute(&request, &cancel).await;
    watchdog.abort();

    outcome.map_err(CliError::Build)
}

async fn cancel_on_interrupt_or_deadline(cancel: CancellationToken, deadline: Duration) {
    let interrupted = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::warn!("interrupt received; cancelling build"),
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for interrupt");
                future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        () = interrupted => {}
        () = tokio::time::sleep(deadline) => {
            tracing::error!(timeout_secs = deadline.as_secs(), "build deadline exceeded; cancelling build");
        }
    }
    cancel.cancel();
}

fn build_request(cli: Cli, config: &BuilderConfig) -> BuildRequest {
    let workspace = cli
        .workspace
        .unwrap_or_else(|| config.workspace_dir.clone());
    BuildRequest {
        project: cli.project_id,
        image: cli.name,
        args: cli.args,
        workspace: Utf8PathBuf::from(workspace),
        host: cli.host.filter(|host| !host.trim().is_empty()),
        username: cli.username.filter(|user| !user.trim().is_empty()),
        password: cli
            .password
            .filter(|password| !password.is_empty())
            .map(Secret::from),
    }
}

#[cfg(test)]
mod main_tests;
