use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use drive_sync::config::{AuthSource, Cli, RemoteTarget, SyncConfig};
use drive_sync::credentials::{CredentialProvider, StaticToken, TokenProvider};
use drive_sync::logging;
use drive_sync::remote::DriveRemote;
use drive_sync::sync::backoff::retry;
use drive_sync::sync::orchestrator::{Orchestrator, PassReport};
use drive_sync::sync::state::StateStore;
use drive_sync::sync::transfer::TransferClient;
use tokio_util::sync::CancellationToken;

const EXIT_ABORTED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "sync aborted");
            ExitCode::from(EXIT_ABORTED)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = SyncConfig::from_cli(cli).context("invalid configuration")?;
    tracing::info!(
        local_root = %config.local_root.display(),
        remote = ?config.remote,
        policy = ?config.policy,
        direction = ?config.direction,
        dry_run = config.dry_run,
        state_db = %config.state_db.display(),
        "starting sync pass"
    );

    let credentials = credential_provider(&config.auth).await?;
    let remote = Arc::new(
        DriveRemote::new(credentials).with_transfer(TransferClient::from_config(config.transfer)),
    );
    let retry_policy = config.retry_policy();
    let root_id = match &config.remote {
        RemoteTarget::FolderId(id) => id.clone(),
        RemoteTarget::Path(path) => retry(&retry_policy, "resolve-folder", || {
            remote.resolve_folder_path(path)
        })
        .await
        .with_context(|| format!("failed to resolve remote folder {path}"))?,
    };

    let state = Arc::new(
        StateStore::open_or_recover(&config.state_db)
            .await
            .with_context(|| format!("failed to open state store at {:?}", config.state_db))?,
    );

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, finishing in-flight actions");
                cancel.cancel();
            }
        })
    };

    let mut orchestrator = Orchestrator::new(config.pass_options(), remote, state.clone(), root_id);
    let report = orchestrator.run_pass(&cancel).await;
    interrupt.abort();
    state.close().await;

    print_report(&report);
    Ok(u8::try_from(report.exit_code()).unwrap_or(EXIT_ABORTED))
}

async fn credential_provider(auth: &AuthSource) -> anyhow::Result<Arc<dyn CredentialProvider>> {
    let provider: Arc<dyn CredentialProvider> = match auth {
        AuthSource::AccessToken(token) => Arc::new(StaticToken::new(token.clone())),
        AuthSource::TokenFile {
            token_path,
            credentials_path,
        } => Arc::new(
            TokenProvider::load(token_path, Some(credentials_path.as_path()))
                .await
                .context("failed to load OAuth credentials")?,
        ),
    };
    Ok(provider)
}

fn print_report(report: &PassReport) {
    if report.dry_run {
        println!("=== Planned Actions (dry run) ===");
        if report.plan.is_empty() {
            println!("  nothing to do");
        }
        for planned in &report.plan {
            println!("  {} [{}]", planned.action, planned.classification);
        }
    }
    print!("{}", report.summary);
    println!("Result: {:?}", report.outcome);
}
