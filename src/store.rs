//! The payment store: a serializable Postgres repository.
//!
//! Every public operation runs as one transaction at SERIALIZABLE isolation
//! inside a bounded retry loop; serialization conflicts are invisible to
//! callers until the retry budget is gone. Expected business conditions
//! (duplicate request UID, replayed camt entries) come back as typed
//! outcomes, never as errors.
//!
//! Insertions of bank-observed rows dedupe on the bank-assigned identifier
//! (`bank_id` for incoming, `message_id` for outgoing): a replayed camt
//! entry is a no-op that reports the existing row id with `is_new = false`.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Row};
use tracing::instrument;

use crate::primitives::{to_unix_micros, Amount, IbanPayto, NegativeTimestamp, ReservePub};

const SERIALIZATION_RETRIES: usize = 16;

/// Channels the store NOTIFYs on; the notification daemon LISTENs on the
/// same fixed set.
pub const CHANNEL_INCOMING: &str = "nexus_incoming_tx";
pub const CHANNEL_OUTGOING: &str = "nexus_outgoing_tx";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database failure: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization conflict persisted after {SERIALIZATION_RETRIES} attempts")]
    ConflictRetriesExhausted,
    #[error("row carries a malformed value: {0}")]
    BadRow(String),
    #[error(transparent)]
    Time(#[from] NegativeTimestamp),
}

/// Submission lifecycle of an initiated payment. Transitions are monotone
/// except for the `unsubmitted → transient_failure → success` path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Unsubmitted,
    TransientFailure,
    PermanentFailure,
    Success,
    NeverHeardBack,
}

impl SubmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionState::Unsubmitted => "unsubmitted",
            SubmissionState::TransientFailure => "transient_failure",
            SubmissionState::PermanentFailure => "permanent_failure",
            SubmissionState::Success => "success",
            SubmissionState::NeverHeardBack => "never_heard_back",
        }
    }

}

impl std::str::FromStr for SubmissionState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsubmitted" => Ok(SubmissionState::Unsubmitted),
            "transient_failure" => Ok(SubmissionState::TransientFailure),
            "permanent_failure" => Ok(SubmissionState::PermanentFailure),
            "success" => Ok(SubmissionState::Success),
            "never_heard_back" => Ok(SubmissionState::NeverHeardBack),
            other => Err(StoreError::BadRow(format!("bad submission state '{other}'"))),
        }
    }
}

/// Outcome of [`PaymentStore::initiate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiationOutcome {
    Success { row_id: i64 },
    /// The request UID already exists; nothing changed.
    UniqueConstraintViolation,
}

/// Outcome of the `register_*` family: the row backing this bank event,
/// and whether this delivery created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub row_id: i64,
    pub is_new: bool,
}

/// Outcome of [`PaymentStore::register_outgoing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingRegistration {
    pub row_id: i64,
    pub is_new: bool,
    /// True when the booking reconciled an initiated payment.
    pub was_initiated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// A fresh local payment intent.
#[derive(Debug, Clone)]
pub struct NewInitiatedPayment {
    pub amount: Amount,
    pub subject: String,
    pub creditor: IbanPayto,
    pub initiation_time: DateTime<Utc>,
    pub request_uid: String,
}

/// A credit booking observed on the owned account.
#[derive(Debug, Clone)]
pub struct NewIncomingPayment {
    pub amount: Amount,
    pub subject: String,
    pub debtor: IbanPayto,
    pub execution_time: DateTime<Utc>,
    pub bank_id: String,
}

/// A debit booking observed on the owned account.
#[derive(Debug, Clone)]
pub struct NewOutgoingPayment {
    pub amount: Amount,
    pub execution_time: DateTime<Utc>,
    pub message_id: String,
    pub creditor: Option<IbanPayto>,
    pub subject: Option<String>,
}

/// One row the submission loop still owes the bank.
#[derive(Debug, Clone)]
pub struct SubmittablePayment {
    pub row_id: i64,
    pub amount: Amount,
    pub subject: String,
    pub creditor: IbanPayto,
    pub request_uid: String,
}

/// An incoming booking as served by the history endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IncomingRecord {
    pub row_id: i64,
    pub amount: Amount,
    pub subject: String,
    pub debtor: IbanPayto,
    pub execution_time: Option<DateTime<Utc>>,
    pub bank_id: String,
}

#[derive(Clone)]
pub struct PaymentStore {
    pool: PgPool,
}

impl PaymentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(PaymentStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PaymentStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the DDL asset. Safe to re-run.
    pub async fn dbinit(&self, schema_sql: &str) -> Result<(), StoreError> {
        sqlx::raw_sql(schema_sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Runs `op` inside one SERIALIZABLE transaction, retrying on
    /// serialization conflicts up to the bounded budget.
    async fn serializable<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T, sqlx::Error>>,
    {
        for attempt in 1..=SERIALIZATION_RETRIES {
            let mut tx = self.pool.begin().await?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await?;
            match op(&mut tx).await {
                Ok(value) => match tx.commit().await {
                    Ok(()) => return Ok(value),
                    Err(err) if is_serialization_conflict(&err) => {
                        tracing::debug!(attempt, "serialization conflict on commit, retrying");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                },
                Err(err) if is_serialization_conflict(&err) => {
                    tx.rollback().await.ok();
                    tracing::debug!(attempt, "serialization conflict, retrying");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::ConflictRetriesExhausted)
    }

    /// Records a payment intent. Repeats with the same request UID return
    /// [`InitiationOutcome::UniqueConstraintViolation`] and change nothing.
    #[instrument(skip_all, err, fields(request_uid = %payment.request_uid))]
    pub async fn initiate(
        &self,
        payment: &NewInitiatedPayment,
    ) -> Result<InitiationOutcome, StoreError> {
        let initiation_time = to_unix_micros(payment.initiation_time)?;
        self.serializable(|conn| {
            let payment = payment.clone();
            Box::pin(async move {
                let row = sqlx::query(
                    "INSERT INTO libeufin_nexus.initiated_outgoing_transactions
                       (amount_val, amount_frac, currency, wire_transfer_subject,
                        credit_payto_uri, initiation_time, request_uid)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (request_uid) DO NOTHING
                     RETURNING initiated_outgoing_transaction_id",
                )
                .bind(payment.amount.value())
                .bind(payment.amount.frac() as i32)
                .bind(payment.amount.currency())
                .bind(&payment.subject)
                .bind(payment.creditor.to_string())
                .bind(initiation_time)
                .bind(&payment.request_uid)
                .fetch_optional(&mut *conn)
                .await?;
                Ok(match row {
                    Some(row) => InitiationOutcome::Success {
                        row_id: row.try_get(0)?,
                    },
                    None => InitiationOutcome::UniqueConstraintViolation,
                })
            })
        })
        .await
    }

    /// Moves an initiated row to `state` and stamps the submission time.
    #[instrument(skip_all, err, fields(row_id, state = state.as_str()))]
    pub async fn set_submitted(
        &self,
        row_id: i64,
        state: SubmissionState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now = to_unix_micros(now)?;
        self.serializable(|conn| {
            Box::pin(async move {
                sqlx::query(
                    "UPDATE libeufin_nexus.initiated_outgoing_transactions
                     SET submitted = $2, last_submission_time = $3
                     WHERE initiated_outgoing_transaction_id = $1",
                )
                .bind(row_id)
                .bind(state.as_str())
                .bind(now)
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
        })
        .await
    }

    /// Records the latest failure reason on an initiated row.
    #[instrument(skip_all, err, fields(row_id))]
    pub async fn set_failure(&self, row_id: i64, message: &str) -> Result<(), StoreError> {
        self.serializable(|conn| {
            let message = message.to_string();
            Box::pin(async move {
                sqlx::query(
                    "UPDATE libeufin_nexus.initiated_outgoing_transactions
                     SET failure_message = $2
                     WHERE initiated_outgoing_transaction_id = $1",
                )
                .bind(row_id)
                .bind(message)
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
        })
        .await
    }

    /// All rows the submission loop should (re)try, in insertion order.
    /// Zero amounts are excluded: they exist for bookkeeping only.
    #[instrument(skip_all, err)]
    pub async fn submittable(&self, currency: &str) -> Result<Vec<SubmittablePayment>, StoreError> {
        let rows = self
            .serializable(|conn| {
                let currency = currency.to_string();
                Box::pin(async move {
                    sqlx::query(
                        "SELECT initiated_outgoing_transaction_id, amount_val, amount_frac,
                                currency, wire_transfer_subject, credit_payto_uri, request_uid
                         FROM libeufin_nexus.initiated_outgoing_transactions
                         WHERE submitted IN ('unsubmitted', 'transient_failure')
                           AND currency = $1
                           AND NOT (amount_val = 0 AND amount_frac = 0)
                         ORDER BY initiated_outgoing_transaction_id",
                    )
                    .bind(currency)
                    .fetch_all(&mut *conn)
                    .await
                })
            })
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(SubmittablePayment {
                    row_id: row.try_get(0)?,
                    amount: amount_from_row(&row, 1, 2, 3)?,
                    subject: row.try_get(4)?,
                    creditor: payto_from_row(&row, 5)?,
                    request_uid: row.try_get(6)?,
                })
            })
            .collect()
    }

    /// Records a debit booking. When the bank `MessageIdentification`
    /// matches a pending request UID the initiated row flips to `success`
    /// and the two rows are linked.
    #[instrument(skip_all, err, fields(message_id = %payment.message_id))]
    pub async fn register_outgoing(
        &self,
        payment: &NewOutgoingPayment,
    ) -> Result<OutgoingRegistration, StoreError> {
        let execution_time = to_unix_micros(payment.execution_time)?;
        self.serializable(|conn| {
            let payment = payment.clone();
            Box::pin(async move {
                let inserted = sqlx::query(
                    "INSERT INTO libeufin_nexus.outgoing_transactions
                       (amount_val, amount_frac, currency, wire_transfer_subject,
                        execution_time, credit_payto_uri, message_id)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (message_id) DO NOTHING
                     RETURNING outgoing_transaction_id",
                )
                .bind(payment.amount.value())
                .bind(payment.amount.frac() as i32)
                .bind(payment.amount.currency())
                .bind(payment.subject.as_deref())
                .bind(execution_time)
                .bind(payment.creditor.as_ref().map(|p| p.to_string()))
                .bind(&payment.message_id)
                .fetch_optional(&mut *conn)
                .await?;

                let (row_id, is_new) = match inserted {
                    Some(row) => (row.try_get::<i64, _>(0)?, true),
                    None => {
                        let row = sqlx::query(
                            "SELECT outgoing_transaction_id
                             FROM libeufin_nexus.outgoing_transactions
                             WHERE message_id = $1",
                        )
                        .bind(&payment.message_id)
                        .fetch_one(&mut *conn)
                        .await?;
                        (row.try_get(0)?, false)
                    }
                };

                let mut was_initiated = false;
                if is_new {
                    let linked = sqlx::query(
                        "UPDATE libeufin_nexus.initiated_outgoing_transactions
                         SET submitted = 'success', outgoing_transaction_id = $2
                         WHERE request_uid = $1
                         RETURNING initiated_outgoing_transaction_id",
                    )
                    .bind(&payment.message_id)
                    .bind(row_id)
                    .fetch_optional(&mut *conn)
                    .await?;
                    was_initiated = linked.is_some();
                    sqlx::query("SELECT pg_notify($1, $2)")
                        .bind(CHANNEL_OUTGOING)
                        .bind(row_id.to_string())
                        .execute(&mut *conn)
                        .await?;
                }

                Ok(OutgoingRegistration {
                    row_id,
                    is_new,
                    was_initiated,
                })
            })
        })
        .await
    }

    /// Records a talerable credit booking together with its reserve public
    /// key. Dedupes on the bank identifier.
    #[instrument(skip_all, err, fields(bank_id = %payment.bank_id))]
    pub async fn register_incoming_and_talerable(
        &self,
        payment: &NewIncomingPayment,
        reserve_pub: ReservePub,
    ) -> Result<Registration, StoreError> {
        let execution_time = to_unix_micros(payment.execution_time)?;
        self.serializable(|conn| {
            let payment = payment.clone();
            Box::pin(async move {
                let registration = insert_incoming(conn, &payment, execution_time).await?;
                if registration.is_new {
                    sqlx::query(
                        "INSERT INTO libeufin_nexus.talerable_incoming_transactions
                           (incoming_transaction_id, reserve_public_key)
                         VALUES ($1, $2)",
                    )
                    .bind(registration.row_id)
                    .bind(reserve_pub.0.to_vec())
                    .execute(&mut *conn)
                    .await?;
                    notify_incoming(conn, registration.row_id).await?;
                }
                Ok(registration)
            })
        })
        .await
    }

    /// Records a malformed credit booking and enqueues its bounce: a fresh
    /// initiated payment addressed back to the debtor over `bounce_amount`.
    /// Dedupes on the bank identifier.
    #[instrument(skip_all, err, fields(bank_id = %payment.bank_id))]
    pub async fn register_incoming_and_bounce(
        &self,
        payment: &NewIncomingPayment,
        bounce_amount: &Amount,
        refund_timestamp: DateTime<Utc>,
        bounce_request_uid: &str,
    ) -> Result<Registration, StoreError> {
        let execution_time = to_unix_micros(payment.execution_time)?;
        let refund_time = to_unix_micros(refund_timestamp)?;
        self.serializable(|conn| {
            let payment = payment.clone();
            let bounce_amount = bounce_amount.clone();
            let bounce_request_uid = bounce_request_uid.to_string();
            Box::pin(async move {
                let registration = insert_incoming(conn, &payment, execution_time).await?;
                if registration.is_new {
                    sqlx::query(
                        "INSERT INTO libeufin_nexus.bounced_incoming_transactions
                           (incoming_transaction_id, request_uid, amount_val, amount_frac, currency)
                         VALUES ($1, $2, $3, $4, $5)",
                    )
                    .bind(registration.row_id)
                    .bind(bounce_request_uid.clone())
                    .bind(bounce_amount.value())
                    .bind(bounce_amount.frac() as i32)
                    .bind(bounce_amount.currency())
                    .execute(&mut *conn)
                    .await?;
                    sqlx::query(
                        "INSERT INTO libeufin_nexus.initiated_outgoing_transactions
                           (amount_val, amount_frac, currency, wire_transfer_subject,
                            credit_payto_uri, initiation_time, request_uid)
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    )
                    .bind(bounce_amount.value())
                    .bind(bounce_amount.frac() as i32)
                    .bind(bounce_amount.currency())
                    .bind(format!("bounce: {}", payment.bank_id))
                    .bind(payment.debtor.to_string())
                    .bind(refund_time)
                    .bind(bounce_request_uid)
                    .execute(&mut *conn)
                    .await?;
                    notify_incoming(conn, registration.row_id).await?;
                }
                Ok(registration)
            })
        })
        .await
    }

    /// Incoming rows with an id strictly greater than `after`, oldest
    /// first. Backs the long-polling history endpoint.
    #[instrument(skip_all, err, fields(after))]
    pub async fn incoming_after(&self, after: i64) -> Result<Vec<IncomingRecord>, StoreError> {
        let rows = self
            .serializable(|conn| {
                Box::pin(async move {
                    sqlx::query(
                        "SELECT incoming_transaction_id, amount_val, amount_frac, currency,
                                wire_transfer_subject, debit_payto_uri, execution_time, bank_id
                         FROM libeufin_nexus.incoming_transactions
                         WHERE incoming_transaction_id > $1
                         ORDER BY incoming_transaction_id",
                    )
                    .bind(after)
                    .fetch_all(&mut *conn)
                    .await
                })
            })
            .await?;
        rows.into_iter()
            .map(|row| {
                let execution_time: i64 = row.try_get(6)?;
                Ok(IncomingRecord {
                    row_id: row.try_get(0)?,
                    amount: amount_from_row(&row, 1, 2, 3)?,
                    subject: row.try_get(4)?,
                    debtor: payto_from_row(&row, 5)?,
                    execution_time: crate::primitives::from_unix_micros(execution_time),
                    bank_id: row.try_get(7)?,
                })
            })
            .collect()
    }

    /// Watermark source: the latest execution time seen in one direction.
    #[instrument(skip_all, err)]
    pub async fn last_exec_time(
        &self,
        direction: Direction,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let query = match direction {
            Direction::Incoming => {
                "SELECT MAX(execution_time) FROM libeufin_nexus.incoming_transactions"
            }
            Direction::Outgoing => {
                "SELECT MAX(execution_time) FROM libeufin_nexus.outgoing_transactions"
            }
        };
        let max: Option<i64> = self
            .serializable(|conn| {
                Box::pin(async move {
                    sqlx::query_scalar(query).fetch_one(&mut *conn).await
                })
            })
            .await?;
        Ok(max.and_then(crate::primitives::from_unix_micros))
    }

    /// True iff this reserve public key already arrived on some credit.
    #[instrument(skip_all, err)]
    pub async fn reserve_seen(&self, reserve_pub: ReservePub) -> Result<bool, StoreError> {
        self.serializable(|conn| {
            let key = reserve_pub.0.to_vec();
            Box::pin(async move {
                sqlx::query_scalar(
                    "SELECT EXISTS (
                       SELECT 1 FROM libeufin_nexus.talerable_incoming_transactions
                       WHERE reserve_public_key = $1)",
                )
                .bind(key)
                .fetch_one(&mut *conn)
                .await
            })
        })
        .await
    }

    /// Parks an initiated payment after a pain.002 rejection. Rows already
    /// reconciled as `success` are left alone. Returns whether a row
    /// matched.
    #[instrument(skip_all, err, fields(request_uid))]
    pub async fn mark_failed_by_request_uid(
        &self,
        request_uid: &str,
        message: &str,
    ) -> Result<bool, StoreError> {
        self.serializable(|conn| {
            let request_uid = request_uid.to_string();
            let message = message.to_string();
            Box::pin(async move {
                let result = sqlx::query(
                    "UPDATE libeufin_nexus.initiated_outgoing_transactions
                     SET submitted = 'permanent_failure', failure_message = $2
                     WHERE request_uid = $1 AND submitted <> 'success'",
                )
                .bind(request_uid)
                .bind(message)
                .execute(&mut *conn)
                .await?;
                Ok(result.rows_affected() > 0)
            })
        })
        .await
    }

    /// Diagnostic sweep: submissions the bank accepted but never booked
    /// within the reconciliation window flip to `never_heard_back`.
    #[instrument(skip_all, err)]
    pub async fn sweep_never_heard_back(
        &self,
        submitted_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let cutoff = to_unix_micros(submitted_before)?;
        self.serializable(|conn| {
            Box::pin(async move {
                let result = sqlx::query(
                    "UPDATE libeufin_nexus.initiated_outgoing_transactions
                     SET submitted = 'never_heard_back'
                     WHERE submitted = 'success'
                       AND outgoing_transaction_id IS NULL
                       AND last_submission_time IS NOT NULL
                       AND last_submission_time < $1",
                )
                .bind(cutoff)
                .execute(&mut *conn)
                .await?;
                Ok(result.rows_affected())
            })
        })
        .await
    }
}

async fn insert_incoming(
    conn: &mut PgConnection,
    payment: &NewIncomingPayment,
    execution_time: i64,
) -> Result<Registration, sqlx::Error> {
    let inserted = sqlx::query(
        "INSERT INTO libeufin_nexus.incoming_transactions
           (amount_val, amount_frac, currency, wire_transfer_subject,
            debit_payto_uri, execution_time, bank_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (bank_id) DO NOTHING
         RETURNING incoming_transaction_id",
    )
    .bind(payment.amount.value())
    .bind(payment.amount.frac() as i32)
    .bind(payment.amount.currency())
    .bind(&payment.subject)
    .bind(payment.debtor.to_string())
    .bind(execution_time)
    .bind(&payment.bank_id)
    .fetch_optional(&mut *conn)
    .await?;
    match inserted {
        Some(row) => Ok(Registration {
            row_id: row.try_get(0)?,
            is_new: true,
        }),
        None => {
            let row = sqlx::query(
                "SELECT incoming_transaction_id
                 FROM libeufin_nexus.incoming_transactions
                 WHERE bank_id = $1",
            )
            .bind(&payment.bank_id)
            .fetch_one(&mut *conn)
            .await?;
            Ok(Registration {
                row_id: row.try_get(0)?,
                is_new: false,
            })
        }
    }
}

async fn notify_incoming(conn: &mut PgConnection, row_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANNEL_INCOMING)
        .bind(row_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

fn is_serialization_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

fn amount_from_row(
    row: &sqlx::postgres::PgRow,
    val_idx: usize,
    frac_idx: usize,
    currency_idx: usize,
) -> Result<Amount, StoreError> {
    let value: i64 = row.try_get(val_idx)?;
    let frac: i32 = row.try_get(frac_idx)?;
    let currency: String = row.try_get(currency_idx)?;
    Amount::new(&currency, value, frac as u32)
        .map_err(|e| StoreError::BadRow(format!("stored amount is invalid: {e}")))
}

fn payto_from_row(row: &sqlx::postgres::PgRow, idx: usize) -> Result<IbanPayto, StoreError> {
    let raw: String = row.try_get(idx)?;
    raw.parse()
        .map_err(|e| StoreError::BadRow(format!("stored payto URI is invalid: {e}")))
}
