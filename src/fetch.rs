//! Periodic download scheduling and archive ingestion.
//!
//! Each tick walks the configured document kinds, resolves the concrete
//! EBICS order for the account's dialect, downloads, unpacks the ZIP
//! container where the order uses one, and feeds every parsed entry to the
//! reconciliation engine. A poisoned entry is logged with its bank
//! identifier and skipped; a failing document kind is logged and skipped;
//! neither stops the loop.
//!
//! Watermarks advance only after a fully successful pass over a document
//! kind, and are kept separately for reports, statements and notifications
//! because banks emit those on different cadences.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::ebics::order::Document;
use crate::ebics::transport::{self, DownloadResult};
use crate::ebics::{BankConnection, EbicsSession};
use crate::iso20022;
use crate::reconcile::{self, IngestError, IngestSettings, SubscriberLock};
use crate::store::{Direction, PaymentStore, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("container archive is corrupt: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("container member unreadable: {0}")]
    ArchiveIo(#[from] std::io::Error),
}

/// Which slice of bank history a fetch asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchWindow {
    /// Whatever the bank queued, no date bound.
    Latest,
    /// Everything the bank retains.
    All,
    /// An explicit closed date range.
    TimeRange(NaiveDate, NaiveDate),
    /// From the per-document watermark to today.
    SinceLast,
}

/// Per-document ingest cursors, seeded from the store on startup.
#[derive(Debug, Clone, Default)]
pub struct Watermarks {
    latest: HashMap<Document, DateTime<Utc>>,
}

impl Watermarks {
    /// Seeds every document cursor from the most recent booking the store
    /// has seen in the matching direction.
    pub async fn seed(store: &PaymentStore) -> Result<Self, StoreError> {
        let incoming = store.last_exec_time(Direction::Incoming).await?;
        let outgoing = store.last_exec_time(Direction::Outgoing).await?;
        let mut latest = HashMap::new();
        for document in Document::ALL {
            let seed = match document {
                Document::Notification => incoming,
                _ => incoming.max(outgoing),
            };
            if let Some(seed) = seed {
                latest.insert(document, seed);
            }
        }
        Ok(Watermarks { latest })
    }

    pub fn get(&self, document: Document) -> Option<DateTime<Utc>> {
        self.latest.get(&document).copied()
    }

    fn advance(&mut self, document: Document, seen: DateTime<Utc>) {
        let entry = self.latest.entry(document).or_insert(seen);
        if seen > *entry {
            *entry = seen;
        }
    }
}

/// Everything one fetch pass needs.
pub struct FetchContext {
    pub store: PaymentStore,
    pub session: EbicsSession,
    pub settings: IngestSettings,
    pub lock: SubscriberLock,
    pub documents: Vec<Document>,
    /// Entries booked before this instant are ignored entirely, so an
    /// account with old pre-gateway history is not bounced retroactively.
    pub ignore_before: Option<DateTime<Utc>>,
}

/// One pass over every configured document kind.
#[instrument(skip_all, fields(window = ?window))]
pub async fn fetch_once(
    context: &FetchContext,
    connection: &dyn BankConnection,
    window: FetchWindow,
    watermarks: &mut Watermarks,
    cancel: &CancellationToken,
) {
    for &document in &context.documents {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(err) =
            fetch_document(context, connection, document, window, watermarks, cancel).await
        {
            // One failing document kind must not poison the rest.
            tracing::warn!(%document, %err, "document fetch failed, continuing");
        }
    }
}

async fn fetch_document(
    context: &FetchContext,
    connection: &dyn BankConnection,
    document: Document,
    window: FetchWindow,
    watermarks: &mut Watermarks,
    cancel: &CancellationToken,
) -> Result<(), FetchError> {
    let dialect = context.session.dialect;
    let order = match dialect.download_order(document, dialect.download_version()) {
        Ok(order) => order,
        Err(err) => {
            tracing::debug!(%err, "document not available in this dialect");
            return Ok(());
        }
    };
    let date_range = resolve_window(window, watermarks.get(document));

    let outcome = {
        let _serialized = context.lock.lock().await;
        transport::download(connection, &context.session, &order, date_range, cancel).await
    };
    let payload = match outcome {
        Ok(DownloadResult::Empty) => {
            tracing::debug!(%document, "nothing to fetch");
            return Ok(());
        }
        Ok(DownloadResult::Data(payload)) => payload,
        Err(err) => {
            tracing::warn!(%document, %err, transient = err.is_transient(), "download failed");
            return Ok(());
        }
    };

    let members = if order.zip_container() {
        unpack_zip(&payload)?
    } else {
        vec![payload]
    };
    let mut newest: Option<DateTime<Utc>> = None;
    for member in &members {
        match document {
            Document::Acknowledgement => ingest_acknowledgement(context, member).await?,
            _ => {
                let seen = ingest_camt_member(context, member).await?;
                newest = newest.max(seen);
            }
        }
    }
    if let Some(seen) = newest {
        watermarks.advance(document, seen);
    }
    tracing::info!(%document, members = members.len(), "fetch pass complete");
    Ok(())
}

async fn ingest_acknowledgement(context: &FetchContext, member: &[u8]) -> Result<(), FetchError> {
    match iso20022::parse_pain002(member) {
        Ok(statuses) => {
            reconcile::ingest_statuses(&context.store, &statuses).await?;
        }
        Err(err) => tracing::warn!(%err, "unparseable pain.002 member skipped"),
    }
    Ok(())
}

/// Ingests one camt document. Returns the newest booking time that was
/// actually processed, for the watermark.
async fn ingest_camt_member(
    context: &FetchContext,
    member: &[u8],
) -> Result<Option<DateTime<Utc>>, FetchError> {
    let entries = match iso20022::parse_camt(member) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(%err, "unparseable camt member skipped");
            return Ok(None);
        }
    };
    let mut newest = None;
    for entry in &entries {
        if let Some(ignore_before) = context.ignore_before {
            if entry.execution_time < ignore_before {
                tracing::debug!(bank_id = %entry.bank_id, "entry predates the configured start");
                continue;
            }
        }
        match reconcile::ingest_entry(&context.store, &context.settings, entry).await {
            Ok(registration) => {
                newest = newest.max(Some(entry.execution_time));
                if !registration.is_new {
                    tracing::debug!(bank_id = %entry.bank_id, "duplicate delivery ignored");
                }
            }
            // Store trouble aborts the pass; a malformed entry only skips
            // itself.
            Err(IngestError::Store(err)) => return Err(err.into()),
            Err(err) => {
                tracing::warn!(bank_id = %entry.bank_id, %err, "entry skipped");
            }
        }
    }
    Ok(newest)
}

fn resolve_window(
    window: FetchWindow,
    watermark: Option<DateTime<Utc>>,
) -> Option<(NaiveDate, NaiveDate)> {
    let today = Utc::now().date_naive();
    match window {
        FetchWindow::Latest => None,
        FetchWindow::All => Some((NaiveDate::from_ymd_opt(1970, 1, 1)?, today)),
        FetchWindow::TimeRange(start, end) => Some((start, end)),
        FetchWindow::SinceLast => {
            let start = watermark.map(|ts| ts.date_naive())?;
            Some((start, today))
        }
    }
}

fn unpack_zip(bytes: &[u8]) -> Result<Vec<Vec<u8>>, FetchError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    let mut members = Vec::new();
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let mut content = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut content)?;
        members.push(content);
    }
    Ok(members)
}

/// Daemon mode: one pass per tick until cancelled. Holds a Postgres
/// advisory lock for the whole run so a second gateway instance on the
/// same account backs off instead of double-fetching.
pub async fn run_fetch_loop(
    context: FetchContext,
    connection: &dyn BankConnection,
    frequency: Duration,
    cancel: CancellationToken,
) -> Result<(), FetchError> {
    let mut guard_connection = context.store.pool().acquire().await.map_err(StoreError::from)?;
    let lock_key = advisory_lock_key(&context.session.host_id, &context.session.user_id);
    let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(lock_key)
        .fetch_one(&mut *guard_connection)
        .await
        .map_err(StoreError::from)?;
    if !locked {
        tracing::error!("another fetch instance holds the account lock, exiting");
        return Ok(());
    }

    let mut watermarks = Watermarks::seed(&context.store).await?;
    loop {
        fetch_once(&context, connection, FetchWindow::SinceLast, &mut watermarks, &cancel).await;
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(frequency) => {}
        }
    }
}

fn advisory_lock_key(host_id: &str, user_id: &str) -> i64 {
    // Stable 64-bit key from the subscriber identity.
    let digest = crate::crypto::sha256(format!("{host_id}/{user_id}").as_bytes());
    i64::from_be_bytes(digest[..8].try_into().unwrap_or([0u8; 8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn sample_zip(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in members {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn zip_unpacks_all_members_in_order() {
        let raw = sample_zip(&[
            ("camt.054_001.xml", b"<first/>"),
            ("camt.054_002.xml", b"<second/>"),
        ]);
        let members = unpack_zip(&raw).unwrap();
        assert_eq!(members, vec![b"<first/>".to_vec(), b"<second/>".to_vec()]);
    }

    #[test]
    fn corrupt_zip_is_an_error() {
        assert!(matches!(
            unpack_zip(b"not a zip archive"),
            Err(FetchError::Archive(_))
        ));
    }

    #[test]
    fn window_resolution() {
        let watermark = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(resolve_window(FetchWindow::Latest, None), None);

        let (start, _) = resolve_window(FetchWindow::All, None).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());

        let range = FetchWindow::TimeRange(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        );
        assert_eq!(
            resolve_window(range, Some(watermark)),
            Some((
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
            ))
        );

        let (start, _) = resolve_window(FetchWindow::SinceLast, Some(watermark)).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        // No watermark yet: fall back to an unbounded fetch.
        assert_eq!(resolve_window(FetchWindow::SinceLast, None), None);
    }

    #[test]
    fn watermarks_only_move_forward() {
        let mut watermarks = Watermarks::default();
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        watermarks.advance(Document::Statement, late);
        watermarks.advance(Document::Statement, early);
        assert_eq!(watermarks.get(Document::Statement), Some(late));
        // Separate cursors per document kind.
        assert_eq!(watermarks.get(Document::Notification), None);
        watermarks.advance(Document::Notification, early);
        assert_eq!(watermarks.get(Document::Notification), Some(early));
    }
}
