//! Reconciliation: classify bank events and drive submissions.
//!
//! Ingestion side: every booked camt entry is classified. Credits whose
//! subject carries a fresh reserve public key are *talerable*; any other
//! credit is *bounceable* and synthesizes a refund payment back to the
//! debtor, minus the configured fee. Debits reconcile against initiated
//! payments through the bank `MessageIdentification`.
//!
//! Submission side: a loop reads every submittable initiated payment,
//! renders a single-transfer pain.001 and uploads it, then maps the
//! outcome onto the submission-state machine. Transient trouble retries on
//! the next tick; Error-class bank codes park the payment for good.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::ebics::transport;
use crate::ebics::{BankConnection, EbicsError, EbicsSession};
use crate::iso20022::{self, CamtEntry, Direction, OwnedAccount, PaymentStatus};
use crate::primitives::{Amount, ReservePub};
use crate::store::{
    NewIncomingPayment, NewOutgoingPayment, PaymentStore, Registration, StoreError,
    SubmissionState, SubmittablePayment,
};

/// One open EBICS transaction per subscriber: the bank rejects a second
/// concurrent upload, so submission and fetch share this lock.
pub type SubscriberLock = Arc<tokio::sync::Mutex<()>>;

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("entry {bank_id} skipped: {detail}")]
    Skipped { bank_id: String, detail: String },
}

/// Ingestion parameters derived from the account configuration.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub currency: String,
    pub bounce_fee: Amount,
}

/// What a classified credit subject turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditClassification {
    Talerable(ReservePub),
    Bounceable,
}

/// Syntactic half of the classification: does the subject carry a decodable
/// reserve public key? Freshness is checked against the store afterwards.
pub fn classify_subject(subject: Option<&str>) -> CreditClassification {
    match subject.and_then(ReservePub::find_in_subject) {
        Some(reserve_pub) => CreditClassification::Talerable(reserve_pub),
        None => CreditClassification::Bounceable,
    }
}

/// Processes one camt entry. Returns the affected row and whether this
/// delivery was the first; replays are no-ops with `is_new = false`.
#[instrument(skip_all, err, fields(bank_id = %entry.bank_id))]
pub async fn ingest_entry(
    store: &PaymentStore,
    settings: &IngestSettings,
    entry: &CamtEntry,
) -> Result<Registration, IngestError> {
    if entry.amount.currency() != settings.currency {
        return Err(IngestError::Skipped {
            bank_id: entry.bank_id.clone(),
            detail: format!(
                "currency {} does not match configured {}",
                entry.amount.currency(),
                settings.currency
            ),
        });
    }
    match entry.direction {
        Direction::Debit => ingest_debit(store, entry).await,
        Direction::Credit => ingest_credit(store, settings, entry).await,
    }
}

async fn ingest_debit(
    store: &PaymentStore,
    entry: &CamtEntry,
) -> Result<Registration, IngestError> {
    // MessageIdentification is the reconciliation key; entries without one
    // still register under their bank id so the booking is not lost.
    let message_id = entry
        .message_id
        .clone()
        .unwrap_or_else(|| entry.bank_id.clone());
    let outcome = store
        .register_outgoing(&NewOutgoingPayment {
            amount: entry.amount.clone(),
            execution_time: entry.execution_time,
            message_id,
            creditor: entry.creditor.clone(),
            subject: entry.subject.clone(),
        })
        .await?;
    if outcome.was_initiated {
        tracing::info!(row_id = outcome.row_id, "outgoing booking reconciled an initiated payment");
    }
    Ok(Registration {
        row_id: outcome.row_id,
        is_new: outcome.is_new,
    })
}

async fn ingest_credit(
    store: &PaymentStore,
    settings: &IngestSettings,
    entry: &CamtEntry,
) -> Result<Registration, IngestError> {
    let debtor = entry.debtor.clone().ok_or_else(|| IngestError::Skipped {
        bank_id: entry.bank_id.clone(),
        detail: "credit entry names no debtor account".to_string(),
    })?;
    let incoming = NewIncomingPayment {
        amount: entry.amount.clone(),
        subject: entry.subject.clone().unwrap_or_default(),
        debtor,
        execution_time: entry.execution_time,
        bank_id: entry.bank_id.clone(),
    };

    if let CreditClassification::Talerable(reserve_pub) =
        classify_subject(entry.subject.as_deref())
    {
        // A replayed reserve key is indistinguishable from a typo to the
        // sender: bounce it rather than crediting the same reserve twice.
        if !store.reserve_seen(reserve_pub).await? {
            let registration = store
                .register_incoming_and_talerable(&incoming, reserve_pub)
                .await?;
            tracing::info!(
                row_id = registration.row_id,
                new = registration.is_new,
                reserve_pub = %reserve_pub,
                "talerable transfer ingested"
            );
            return Ok(registration);
        }
        tracing::warn!(reserve_pub = %reserve_pub, "reserve public key replayed, bouncing");
    }

    let bounce_amount = incoming
        .amount
        .saturating_sub(&settings.bounce_fee)
        .map_err(|e| IngestError::Skipped {
            bank_id: entry.bank_id.clone(),
            detail: e.to_string(),
        })?;
    let registration = store
        .register_incoming_and_bounce(
            &incoming,
            &bounce_amount,
            Utc::now(),
            &fresh_request_uid(),
        )
        .await?;
    tracing::info!(
        row_id = registration.row_id,
        new = registration.is_new,
        bounce = %bounce_amount,
        "incoming transfer bounced"
    );
    Ok(registration)
}

/// Ingests pain.002 statuses: rejections park the matching initiated row.
#[instrument(skip_all, err)]
pub async fn ingest_statuses(
    store: &PaymentStore,
    statuses: &[PaymentStatus],
) -> Result<(), StoreError> {
    for status in statuses {
        if !status.is_rejection() {
            continue;
        }
        let Some(request_uid) = status.original_msg_id.as_deref() else {
            tracing::warn!("rejection without OrgnlMsgId, nothing to park");
            continue;
        };
        let mut message = format!(
            "rejected by the bank ({})",
            status.reason_code.as_deref().unwrap_or("no reason code")
        );
        if let Some(info) = &status.additional_info {
            message.push_str(": ");
            message.push_str(info);
        }
        if store.mark_failed_by_request_uid(request_uid, &message).await? {
            tracing::warn!(request_uid, %message, "payment rejected via pain.002");
        }
    }
    Ok(())
}

/// Submits every pending initiated payment once. Per-payment failures are
/// recorded on the row and do not stop the batch.
#[instrument(skip_all, err, fields(currency = %settings.currency))]
pub async fn submit_pending(
    store: &PaymentStore,
    connection: &dyn BankConnection,
    session: &EbicsSession,
    account: &OwnedAccount,
    settings: &IngestSettings,
    lock: &SubscriberLock,
    cancel: &CancellationToken,
) -> Result<usize, StoreError> {
    let batch = store.submittable(&settings.currency).await?;
    let mut submitted = 0;
    for payment in &batch {
        if cancel.is_cancelled() {
            break;
        }
        match submit_one(store, connection, session, account, payment, lock, cancel).await {
            Ok(()) => submitted += 1,
            Err(err) => {
                tracing::warn!(request_uid = %payment.request_uid, %err, "submission failed");
            }
        }
    }
    Ok(submitted)
}

async fn submit_one(
    store: &PaymentStore,
    connection: &dyn BankConnection,
    session: &EbicsSession,
    account: &OwnedAccount,
    payment: &SubmittablePayment,
    lock: &SubscriberLock,
    cancel: &CancellationToken,
) -> Result<(), StoreError> {
    let creditor_name = payment
        .creditor
        .receiver_name()
        .unwrap_or("unknown recipient");
    let document = iso20022::pain001(
        &payment.request_uid,
        Utc::now(),
        &payment.amount,
        &payment.subject,
        account,
        &payment.creditor,
        creditor_name,
    );
    let order = session.dialect.upload_order();

    let outcome = {
        let _serialized = lock.lock().await;
        transport::upload(connection, session, &order, &document, cancel).await
    };
    match outcome {
        Ok(order_id) => {
            tracing::info!(request_uid = %payment.request_uid, %order_id, "pain.001 accepted");
            store
                .set_submitted(payment.row_id, SubmissionState::Success, Utc::now())
                .await
        }
        Err(err) => {
            let state = if err.is_transient() {
                SubmissionState::TransientFailure
            } else {
                SubmissionState::PermanentFailure
            };
            store.set_submitted(payment.row_id, state, Utc::now()).await?;
            store.set_failure(payment.row_id, &err.to_string()).await?;
            match err {
                EbicsError::Cancelled => tracing::warn!("submission cancelled mid-flight"),
                _ => tracing::warn!(%err, state = state.as_str(), "bank declined or unreachable"),
            }
            Ok(())
        }
    }
}

fn fresh_request_uid() -> String {
    Uuid::new_v4().simple().to_string()
}
