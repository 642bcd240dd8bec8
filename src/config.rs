//! Configuration of the gateway.
//!
//! A JSON file selected with `--config` (or the `CONFIG` environment
//! variable) carries the subscriber identity, the owned account metadata
//! and the loop timings; `DATABASE_URL` comes from the environment so
//! credentials stay out of the config file. Field defaults mirror what a
//! single-account deployment wants.

use chrono::NaiveDate;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::ebics::order::{Dialect, Document};
use crate::ebics::EbicsSession;
use crate::iso20022::OwnedAccount;
use crate::keys::{BankKeys, ClientKeys, KeysError};
use crate::primitives::Amount;
use crate::reconcile::IngestSettings;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("configuration {path} is malformed: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct NexusConfig {
    /// ISO 4217 code enforced on every amount passing through.
    pub currency: String,
    /// EBICS endpoint of the bank.
    pub host_base_url: Url,
    pub host_id: String,
    pub user_id: String,
    pub partner_id: String,
    pub bank_dialect: Dialect,
    /// Owned account metadata stamped into outgoing pain.001 documents.
    pub iban: String,
    pub bic: String,
    pub name: String,
    #[serde(default = "defaults::client_private_keys_file")]
    pub client_private_keys_file: PathBuf,
    #[serde(default = "defaults::bank_public_keys_file")]
    pub bank_public_keys_file: PathBuf,
    /// Fee withheld when bouncing a malformed incoming transfer.
    #[serde(default)]
    pub bounce_fee: Option<Amount>,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub submit: SubmitConfig,
    #[serde(default)]
    pub serve: ServeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Seconds between fetch ticks in daemon mode.
    #[serde(default = "defaults::fetch_frequency_secs")]
    pub frequency_secs: u64,
    /// Bookings before this date are ignored during ingest.
    #[serde(default)]
    pub ignore_transactions_before: Option<NaiveDate>,
    /// Document kinds to poll. Defaults to everything the dialect offers.
    #[serde(default = "defaults::documents")]
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitConfig {
    /// Seconds between submission ticks in daemon mode.
    #[serde(default = "defaults::submit_frequency_secs")]
    pub frequency_secs: u64,
    /// Hours after which an accepted but never-booked submission flips to
    /// `never_heard_back`.
    #[serde(default = "defaults::reconciliation_window_hours")]
    pub reconciliation_window_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServeConfig {
    #[serde(default = "defaults::host")]
    pub host: IpAddr,
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Upper bound on long-poll waits, milliseconds.
    #[serde(default = "defaults::max_poll_ms")]
    pub max_poll_ms: u64,
}

mod defaults {
    use super::*;

    pub fn client_private_keys_file() -> PathBuf {
        PathBuf::from("client_private_keys.json")
    }

    pub fn bank_public_keys_file() -> PathBuf {
        PathBuf::from("bank_public_keys.json")
    }

    pub fn fetch_frequency_secs() -> u64 {
        300
    }

    pub fn submit_frequency_secs() -> u64 {
        300
    }

    pub fn reconciliation_window_hours() -> u64 {
        72
    }

    pub fn documents() -> Vec<Document> {
        Document::ALL.to_vec()
    }

    pub fn host() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    pub fn port() -> u16 {
        8080
    }

    pub fn max_poll_ms() -> u64 {
        30_000
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            frequency_secs: defaults::fetch_frequency_secs(),
            ignore_transactions_before: None,
            documents: defaults::documents(),
        }
    }
}

impl Default for SubmitConfig {
    fn default() -> Self {
        SubmitConfig {
            frequency_secs: defaults::submit_frequency_secs(),
            reconciliation_window_hours: defaults::reconciliation_window_hours(),
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        ServeConfig {
            host: defaults::host(),
            port: defaults::port(),
            max_poll_ms: defaults::max_poll_ms(),
        }
    }
}

impl NexusConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn database_url() -> Result<String, ConfigError> {
        std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
    }

    pub fn owned_account(&self) -> OwnedAccount {
        OwnedAccount {
            iban: self.iban.clone(),
            bic: self.bic.clone(),
            name: self.name.clone(),
        }
    }

    /// The bounce fee defaults to zero in the configured currency.
    pub fn ingest_settings(&self) -> IngestSettings {
        let bounce_fee = self
            .bounce_fee
            .clone()
            .unwrap_or_else(|| zero_amount(&self.currency));
        IngestSettings {
            currency: self.currency.clone(),
            bounce_fee,
        }
    }

    pub fn fetch_frequency(&self) -> Duration {
        Duration::from_secs(self.fetch.frequency_secs)
    }

    pub fn submit_frequency(&self) -> Duration {
        Duration::from_secs(self.submit.frequency_secs)
    }

    pub fn reconciliation_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.submit.reconciliation_window_hours as i64)
    }

    /// Loads the client key file; a setup that never ran is an error the
    /// CLI maps to its configuration exit code.
    pub fn load_client_keys(&self) -> Result<ClientKeys, KeysError> {
        ClientKeys::load(&self.client_private_keys_file)
    }

    pub fn load_bank_keys(&self) -> Result<BankKeys, KeysError> {
        BankKeys::load(&self.bank_public_keys_file)
    }

    /// Assembles the EBICS session from configuration and key files.
    pub fn session(&self, client_keys: ClientKeys, bank_keys: Option<BankKeys>) -> EbicsSession {
        EbicsSession {
            host_id: self.host_id.clone(),
            partner_id: self.partner_id.clone(),
            user_id: self.user_id.clone(),
            dialect: self.bank_dialect,
            client_keys,
            bank_keys,
        }
    }
}

fn zero_amount(currency: &str) -> Amount {
    // The configured currency surfaces a validation error on first real
    // amount; for the implicit zero fee fall back silently.
    Amount::new(currency, 0, 0)
        .or_else(|_| Amount::new("EUR", 0, 0))
        .expect("static zero amount is valid")
}
