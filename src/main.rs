//! CLI entrypoint of the gateway.
//!
//! Subcommands:
//! - `dbinit` — apply the database schema.
//! - `ebics-setup` — generate keys, run INI/HIA/HPB, print bank digests.
//! - `fetch` — download and ingest bank documents (daemon or `--transient`).
//! - `submit` — submit pending initiated payments (daemon or `--transient`).
//! - `serve` — run the HTTP surface and the notification daemon.
//!
//! Exit codes: 0 success, 1 unexpected failure, 2 configuration trouble,
//! 3 the bank declined.

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ebics_nexus::config::{ConfigError, NexusConfig};
use ebics_nexus::ebics::{keymgmt, EbicsError, HttpBankConnection};
use ebics_nexus::fetch::{self, FetchContext, FetchError, FetchWindow, Watermarks};
use ebics_nexus::keys::{ClientKeys, KeysError};
use ebics_nexus::reconcile::{self, SubscriberLock};
use ebics_nexus::store::{PaymentStore, StoreError};
use ebics_nexus::{api, crypto, notifications};

#[derive(Parser, Debug)]
#[command(name = "ebics-nexus")]
#[command(about = "EBICS gateway: submit credit transfers, ingest bank reports")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, short, env = "CONFIG", default_value = "nexus.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply the database schema.
    Dbinit,
    /// Generate subscriber keys and run INI, HIA and HPB.
    EbicsSetup {
        /// Mark the downloaded bank keys as accepted after printing their
        /// digests. Without this flag acceptance stays manual.
        #[arg(long)]
        accept_keys: bool,
    },
    /// Download and ingest bank documents.
    Fetch {
        /// Run one pass and exit instead of looping.
        #[arg(long)]
        transient: bool,
    },
    /// Submit pending initiated payments.
    Submit {
        /// Run one pass and exit instead of looping.
        #[arg(long)]
        transient: bool,
    },
    /// Run the HTTP surface and the notification daemon.
    Serve,
}

#[derive(thiserror::Error, Debug)]
enum MainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Keys(#[from] KeysError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ebics(#[from] EbicsError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Setup(String),
}

impl MainError {
    fn exit_code(&self) -> ExitCode {
        match self {
            MainError::Config(_) | MainError::Keys(_) | MainError::Setup(_) => ExitCode::from(2),
            MainError::Ebics(EbicsError::KeyMgmtRejected(_))
            | MainError::Ebics(EbicsError::BankTechnical(_)) => ExitCode::from(3),
            _ => ExitCode::from(1),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "command failed");
            err.exit_code()
        }
    }
}

/// Cancellation token flipped by SIGTERM/SIGINT.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let inner = token.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::error!(%err, "cannot register SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown requested");
        inner.cancel();
    });
    token
}

async fn run(cli: Cli) -> Result<(), MainError> {
    let config = NexusConfig::load(&cli.config)?;
    match cli.command {
        Command::Dbinit => dbinit(&config).await,
        Command::EbicsSetup { accept_keys } => ebics_setup(&config, accept_keys).await,
        Command::Fetch { transient } => run_fetch(&config, transient).await,
        Command::Submit { transient } => run_submit(&config, transient).await,
        Command::Serve => serve(&config).await,
    }
}

async fn dbinit(_config: &NexusConfig) -> Result<(), MainError> {
    let store = PaymentStore::connect(&NexusConfig::database_url()?).await?;
    store.dbinit(include_str!("../db/schema.sql")).await?;
    tracing::info!("database schema applied");
    Ok(())
}

async fn ebics_setup(config: &NexusConfig, accept_keys: bool) -> Result<(), MainError> {
    let mut client_keys = match ClientKeys::load(&config.client_private_keys_file) {
        Ok(keys) => keys,
        Err(KeysError::Io { .. }) => {
            tracing::info!("no client keys yet, generating a fresh 2048-bit triple");
            let keys = ClientKeys::generate()?;
            keys.save(&config.client_private_keys_file)?;
            keys
        }
        Err(err) => return Err(err.into()),
    };
    let connection = HttpBankConnection::new(config.host_base_url.clone())?;
    let session = config.session(client_keys.clone(), None);

    if !client_keys.submitted_ini {
        keymgmt::submit_ini(&connection, &session).await?;
        client_keys.submitted_ini = true;
        client_keys.save(&config.client_private_keys_file)?;
    }
    if !client_keys.submitted_hia {
        keymgmt::submit_hia(&connection, &session).await?;
        client_keys.submitted_hia = true;
        client_keys.save(&config.client_private_keys_file)?;
    }

    let mut bank_keys = match config.load_bank_keys() {
        Ok(keys) => keys,
        Err(KeysError::Io { .. }) => {
            let keys = keymgmt::fetch_bank_keys(&connection, &session).await?;
            keys.save(&config.bank_public_keys_file)?;
            keys
        }
        Err(err) => return Err(err.into()),
    };

    println!(
        "bank authentication key digest: {}",
        hex::encode(crypto::public_key_digest(&bank_keys.authentication))
    );
    println!(
        "bank encryption key digest:     {}",
        hex::encode(crypto::public_key_digest(&bank_keys.encryption))
    );
    if accept_keys && !bank_keys.accepted {
        bank_keys.accepted = true;
        bank_keys.save(&config.bank_public_keys_file)?;
        println!("bank keys marked accepted");
    } else if !bank_keys.accepted {
        println!("compare the digests against the bank letter, then re-run with --accept-keys");
    }
    Ok(())
}

/// Loads key material, requiring a completed setup.
fn ready_session(config: &NexusConfig) -> Result<ebics_nexus::ebics::EbicsSession, MainError> {
    let client_keys = config.load_client_keys()?;
    if !client_keys.submitted_both() {
        return Err(MainError::Setup(
            "client keys were never submitted, run ebics-setup first".to_string(),
        ));
    }
    let bank_keys = config.load_bank_keys()?;
    if !bank_keys.accepted {
        return Err(MainError::Setup(
            "bank keys are not accepted yet, re-run ebics-setup --accept-keys".to_string(),
        ));
    }
    Ok(config.session(client_keys, Some(bank_keys)))
}

async fn run_fetch(config: &NexusConfig, transient: bool) -> Result<(), MainError> {
    let session = ready_session(config)?;
    let store = PaymentStore::connect(&NexusConfig::database_url()?).await?;
    let connection = HttpBankConnection::new(config.host_base_url.clone())?;
    let cancel = shutdown_token();
    let context = FetchContext {
        store,
        session,
        settings: config.ingest_settings(),
        lock: SubscriberLock::default(),
        documents: config.fetch.documents.clone(),
        ignore_before: config.fetch.ignore_transactions_before.and_then(|date| {
            date.and_hms_opt(0, 0, 0)
                .map(|naive| chrono::DateTime::from_naive_utc_and_offset(naive, chrono::Utc))
        }),
    };
    if transient {
        let mut watermarks = Watermarks::seed(&context.store).await?;
        fetch::fetch_once(
            &context,
            &connection,
            FetchWindow::SinceLast,
            &mut watermarks,
            &cancel,
        )
        .await;
        Ok(())
    } else {
        fetch::run_fetch_loop(context, &connection, config.fetch_frequency(), cancel).await?;
        Ok(())
    }
}

async fn run_submit(config: &NexusConfig, transient: bool) -> Result<(), MainError> {
    let session = ready_session(config)?;
    let store = PaymentStore::connect(&NexusConfig::database_url()?).await?;
    let connection = HttpBankConnection::new(config.host_base_url.clone())?;
    let cancel = shutdown_token();
    let account = config.owned_account();
    let settings = config.ingest_settings();
    let lock = SubscriberLock::default();

    loop {
        let submitted = reconcile::submit_pending(
            &store,
            &connection,
            &session,
            &account,
            &settings,
            &lock,
            &cancel,
        )
        .await?;
        if submitted > 0 {
            tracing::info!(submitted, "submission pass complete");
        }
        let cutoff = chrono::Utc::now() - config.reconciliation_window();
        let flipped = store.sweep_never_heard_back(cutoff).await?;
        if flipped > 0 {
            tracing::warn!(flipped, "submissions were never reconciled");
        }
        if transient || cancel.is_cancelled() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(config.submit_frequency()) => {}
        }
    }
}

async fn serve(config: &NexusConfig) -> Result<(), MainError> {
    let store = PaymentStore::connect(&NexusConfig::database_url()?).await?;
    let bus = notifications::NotificationBus::new();
    let cancel = shutdown_token();

    let listener_task = tokio::spawn(notifications::run_listener(
        bus.clone(),
        store.pool().clone(),
        cancel.clone(),
    ));

    let state = Arc::new(api::ApiState {
        store,
        bus,
        max_poll_ms: config.serve.max_poll_ms,
    });
    let addr = std::net::SocketAddr::new(config.serve.host, config.serve.port);
    tracing::info!(%addr, "starting HTTP surface");
    let tcp = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| MainError::Setup(format!("cannot bind {addr}: {err}")))?;
    let graceful = cancel.clone();
    axum::serve(tcp, api::routes(state))
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await
        .map_err(|err| MainError::Setup(format!("HTTP server failed: {err}")))?;

    cancel.cancel();
    listener_task.await.ok();
    Ok(())
}
