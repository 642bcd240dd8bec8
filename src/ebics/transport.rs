//! Business transport: the EBICS download and upload state machines.
//!
//! A download walks `InitSent → Transferring(k of N) → ReceiptSent` and a
//! upload walks `InitSent → Transferring(k of N) → Done`. Both run against
//! the [`BankConnection`] seam, verify the bank's envelope signature on
//! every response, and check the technical and bank-technical return codes
//! before looking at payloads.
//!
//! Cancellation is deferred: once an init response opened a transaction the
//! machine owes the bank a receipt, so an external cancellation request is
//! honoured only between HTTP exchanges, and for downloads it first sends a
//! failure receipt to release the bank-side transaction slot.

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::crypto::{self, E002Session};
use crate::xml::{self, XmlBuilder, XmlNode};

use super::order::{EbicsVersion, OrderParams};
use super::return_code::ReturnCode;
use super::{
    assemble_signed, bank_pubkey_digests, request_root, utc_timestamp, BankConnection,
    EbicsError, EbicsSession, ResponseCommon,
};

/// Upper bound on one order-data segment, per the EBICS transfer rules.
pub const SEGMENT_LIMIT: usize = 1024 * 1024;

/// Outcome of a download transaction.
#[derive(Debug, PartialEq, Eq)]
pub enum DownloadResult {
    /// The bank had nothing for this order; no transaction was opened and
    /// no receipt is owed.
    Empty,
    /// Fully decrypted and inflated order data.
    Data(Vec<u8>),
}

/// Phase labels of an open transaction, used for tracing and for the
/// transfer loop bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InitSent,
    Transferring { segment: u32 },
    ReceiptSent,
}

/// An open download transaction as announced by the init response.
struct OpenDownload {
    transaction_id: String,
    num_segments: u32,
    wrapped_key: Vec<u8>,
    chunks: Vec<Vec<u8>>,
}

/// Runs one complete download transaction.
///
/// `date_range` bounds the requested documents where the caller tracks a
/// watermark; `None` asks for whatever the bank queued ("Latest").
#[instrument(skip_all, err, fields(order = %order, host = %session.host_id))]
pub async fn download(
    connection: &dyn BankConnection,
    session: &EbicsSession,
    order: &OrderParams,
    date_range: Option<(NaiveDate, NaiveDate)>,
    cancel: &CancellationToken,
) -> Result<DownloadResult, EbicsError> {
    session.bank_keys()?;
    let version = order.version();

    let init = download_init_request(session, order, date_range);
    let response = post_checked(connection, session, init.to_document()).await?;

    // "Nothing available" arrives as an Error-class bank code but opens no
    // transaction; it is the one code inspected before the generic check.
    let common = ResponseCommon::parse(&response)?;
    if common.bank_code == Some(ReturnCode::NoDownloadDataAvailable)
        || common.technical_code == ReturnCode::NoDownloadDataAvailable
    {
        tracing::debug!("download window is empty");
        return Ok(DownloadResult::Empty);
    }
    common.check()?;

    let mut open = parse_download_init(&response, &common)?;
    let mut phase = Phase::InitSent;
    tracing::debug!(
        ?phase,
        transaction = %open.transaction_id,
        segments = open.num_segments,
        "download transaction open"
    );

    // Transfer phase: segments 2..N. A single-segment download goes
    // straight to the receipt; the init response already carried the only
    // chunk and the supported dialects expect no empty transfer exchange.
    while (open.chunks.len() as u32) < open.num_segments {
        let segment = open.chunks.len() as u32 + 1;
        if cancel.is_cancelled() {
            abort_with_receipt(connection, session, version, &open.transaction_id).await;
            return Err(EbicsError::Cancelled);
        }
        phase = Phase::Transferring { segment };
        tracing::trace!(?phase, "requesting segment");
        let request = transfer_request(
            session,
            version,
            &open.transaction_id,
            segment,
            segment == open.num_segments,
            None,
        );
        let response = match post_checked(connection, session, request.to_document()).await {
            Ok(response) => response,
            Err(err) => {
                // The transaction is open on the bank side: release it
                // before surfacing whatever went wrong.
                abort_with_receipt(connection, session, version, &open.transaction_id).await;
                return Err(err);
            }
        };
        ResponseCommon::parse(&response)?.check()?;
        open.chunks.push(order_data_chunk(&response)?);
    }

    // Decode before the receipt: a payload that cannot be decrypted is
    // reported to the bank as a failed transfer, anything after decoding
    // (ingest trouble) is our problem and still gets a positive receipt.
    let decoded = decode_download(session, &open);
    let receipt_code = if decoded.is_ok() { "0" } else { "1" };
    let receipt = receipt_request(session, version, &open.transaction_id, receipt_code);
    let receipt_response = post_checked(connection, session, receipt.to_document()).await?;
    ResponseCommon::parse(&receipt_response)?.check()?;
    phase = Phase::ReceiptSent;
    tracing::debug!(?phase, transaction = %open.transaction_id, "download transaction closed");

    decoded.map(DownloadResult::Data)
}

fn decode_download(session: &EbicsSession, open: &OpenDownload) -> Result<Vec<u8>, EbicsError> {
    let ciphertext: Vec<u8> = open.chunks.concat();
    let deflated =
        crypto::e002_decrypt(&session.client_keys.encryption, &open.wrapped_key, &ciphertext)?;
    Ok(xml::inflate(&deflated)?)
}

/// Sends a failure receipt for an open transaction, swallowing any
/// follow-up error: the caller is already propagating the primary one.
async fn abort_with_receipt(
    connection: &dyn BankConnection,
    session: &EbicsSession,
    version: EbicsVersion,
    transaction_id: &str,
) {
    let receipt = receipt_request(session, version, transaction_id, "1");
    match connection.post(receipt.to_document()).await {
        Ok(_) => tracing::warn!(transaction = %transaction_id, "sent failure receipt"),
        Err(err) => {
            tracing::warn!(transaction = %transaction_id, %err, "failure receipt not delivered")
        }
    }
}

/// Runs one complete upload transaction and returns the bank order id.
#[instrument(skip_all, err, fields(order = %order, host = %session.host_id, bytes = payload.len()))]
pub async fn upload(
    connection: &dyn BankConnection,
    session: &EbicsSession,
    order: &OrderParams,
    payload: &[u8],
    cancel: &CancellationToken,
) -> Result<String, EbicsError> {
    let bank_keys = session.bank_keys()?;
    let version = order.version();

    // One ephemeral session key covers the signature block and the payload.
    let session_key = E002Session::fresh();
    let wrapped_key = session_key.wrap_for(&bank_keys.encryption)?;
    let signature_block = user_signature_data(session, payload);
    let encrypted_signature = session_key.encrypt(&xml::deflate(&signature_block.to_document()));
    let ciphertext = session_key.encrypt(&xml::deflate(payload));
    let segments: Vec<&[u8]> = ciphertext.chunks(SEGMENT_LIMIT).collect();
    let num_segments = segments.len() as u32;
    let payload_digest = crypto::sha256(payload);

    let init = upload_init_request(
        session,
        order,
        num_segments,
        &wrapped_key,
        &encrypted_signature,
        &payload_digest,
    );
    let response = post_checked(connection, session, init.to_document()).await?;
    let common = ResponseCommon::parse(&response)?;
    common.check()?;
    let transaction_id = common.transaction_id.clone().ok_or_else(|| {
        EbicsError::Protocol("upload init response lacks a TransactionID".to_string())
    })?;
    let mut order_id = common.order_id.clone();
    let mut phase = Phase::InitSent;
    tracing::debug!(?phase, transaction = %transaction_id, segments = num_segments, "upload transaction open");

    for (index, segment) in segments.into_iter().enumerate() {
        let segment_number = index as u32 + 1;
        if cancel.is_cancelled() {
            // No receipt phase exists for uploads; the bank expires the
            // half-fed transaction on its own.
            return Err(EbicsError::Cancelled);
        }
        phase = Phase::Transferring {
            segment: segment_number,
        };
        let request = transfer_request(
            session,
            version,
            &transaction_id,
            segment_number,
            segment_number == num_segments,
            Some(segment),
        );
        let response = post_checked(connection, session, request.to_document()).await?;
        let common = ResponseCommon::parse(&response)?;
        common.check()?;
        if order_id.is_none() {
            order_id = common.order_id.clone();
        }
    }
    debug_assert!(matches!(phase, Phase::Transferring { .. }));

    order_id.ok_or_else(|| {
        EbicsError::Protocol("bank never assigned an OrderID to the upload".to_string())
    })
}

/// POSTs a document and verifies the bank's envelope signature before
/// anything else looks at the response.
async fn post_checked(
    connection: &dyn BankConnection,
    session: &EbicsSession,
    document: Vec<u8>,
) -> Result<XmlNode, EbicsError> {
    let bank_keys = session.bank_keys()?;
    let raw = connection.post(document).await?;
    let parsed = XmlNode::parse(&raw)?;
    super::verify_auth_signature(&parsed, &bank_keys.authentication)?;
    Ok(parsed)
}

fn parse_download_init(
    response: &XmlNode,
    common: &ResponseCommon,
) -> Result<OpenDownload, EbicsError> {
    let transaction_id = common.transaction_id.clone().ok_or_else(|| {
        EbicsError::Protocol("download init response lacks a TransactionID".to_string())
    })?;
    let num_segments: u32 = response
        .one("header")?
        .one("static")?
        .one("NumSegments")?
        .text()
        .parse()
        .map_err(|_| EbicsError::Protocol("NumSegments is not a number".to_string()))?;
    if num_segments == 0 {
        return Err(EbicsError::Protocol(
            "download announced zero segments".to_string(),
        ));
    }
    let data_transfer = response.one("body")?.one("DataTransfer")?;
    let wrapped_key = data_transfer
        .one("DataEncryptionInfo")?
        .one("TransactionKey")?
        .text_base64()?;
    let first_chunk = data_transfer.one("OrderData")?.text_base64()?;
    Ok(OpenDownload {
        transaction_id,
        num_segments,
        wrapped_key,
        chunks: vec![first_chunk],
    })
}

fn order_data_chunk(response: &XmlNode) -> Result<Vec<u8>, EbicsError> {
    Ok(response
        .one("body")?
        .one("DataTransfer")?
        .one("OrderData")?
        .text_base64()?)
}

fn download_init_request(
    session: &EbicsSession,
    order: &OrderParams,
    date_range: Option<(NaiveDate, NaiveDate)>,
) -> XmlBuilder {
    let version = order.version();
    let root = request_root(version, "ebicsRequest");
    let mut header = XmlBuilder::new("header");
    header.attr("authenticate", "true");
    header.el("static", |fixed| {
        fixed.leaf("HostID", &session.host_id);
        fixed.leaf("Nonce", &crypto::fresh_nonce());
        fixed.leaf("Timestamp", &utc_timestamp(chrono::Utc::now()));
        fixed.leaf("PartnerID", &session.partner_id);
        fixed.leaf("UserID", &session.user_id);
        fixed.push(order_details(order, date_range));
        if let Ok(bank) = session.bank_keys() {
            fixed.push(bank_pubkey_digests(bank));
        }
        fixed.leaf("SecurityMedium", "0000");
    });
    header.el("mutable", |mutable| {
        mutable.leaf("TransactionPhase", "Initialisation");
    });
    let body = XmlBuilder::new("body");
    assemble_signed(root, header, body, &session.client_keys.authentication)
}

fn upload_init_request(
    session: &EbicsSession,
    order: &OrderParams,
    num_segments: u32,
    wrapped_key: &[u8],
    encrypted_signature: &[u8],
    payload_digest: &[u8; 32],
) -> XmlBuilder {
    let version = order.version();
    let root = request_root(version, "ebicsRequest");
    let mut header = XmlBuilder::new("header");
    header.attr("authenticate", "true");
    header.el("static", |fixed| {
        fixed.leaf("HostID", &session.host_id);
        fixed.leaf("Nonce", &crypto::fresh_nonce());
        fixed.leaf("Timestamp", &utc_timestamp(chrono::Utc::now()));
        fixed.leaf("PartnerID", &session.partner_id);
        fixed.leaf("UserID", &session.user_id);
        fixed.push(order_details(order, None));
        if let Ok(bank) = session.bank_keys() {
            fixed.push(bank_pubkey_digests(bank));
        }
        fixed.leaf("SecurityMedium", "0000");
        fixed.leaf("NumSegments", &num_segments.to_string());
    });
    header.el("mutable", |mutable| {
        mutable.leaf("TransactionPhase", "Initialisation");
    });
    let mut body = XmlBuilder::new("body");
    body.el("DataTransfer", |transfer| {
        transfer.el("DataEncryptionInfo", |info| {
            info.attr("authenticate", "true");
            info.el("EncryptionPubKeyDigest", |digest| {
                digest
                    .attr("Version", "E002")
                    .attr("Algorithm", "http://www.w3.org/2001/04/xmlenc#sha256");
                if let Ok(bank) = session.bank_keys() {
                    digest.text(&xml::to_base64(&crypto::public_key_digest(&bank.encryption)));
                }
            });
            info.leaf_base64("TransactionKey", wrapped_key);
        });
        transfer.el("SignatureData", |sig| {
            sig.attr("authenticate", "true")
                .text(&xml::to_base64(encrypted_signature));
        });
        if version == EbicsVersion::H005 {
            transfer.el("DataDigest", |digest| {
                digest
                    .attr("SignatureVersion", "A006")
                    .text(&xml::to_base64(payload_digest));
            });
        }
    });
    assemble_signed(root, header, body, &session.client_keys.authentication)
}

fn transfer_request(
    session: &EbicsSession,
    version: EbicsVersion,
    transaction_id: &str,
    segment_number: u32,
    last: bool,
    upload_chunk: Option<&[u8]>,
) -> XmlBuilder {
    let root = request_root(version, "ebicsRequest");
    let mut header = XmlBuilder::new("header");
    header.attr("authenticate", "true");
    header.el("static", |fixed| {
        fixed.leaf("HostID", &session.host_id);
        fixed.leaf("TransactionID", transaction_id);
    });
    header.el("mutable", |mutable| {
        mutable.leaf("TransactionPhase", "Transfer");
        mutable.el("SegmentNumber", |segment| {
            segment
                .attr("lastSegment", if last { "true" } else { "false" })
                .text(&segment_number.to_string());
        });
    });
    let mut body = XmlBuilder::new("body");
    if let Some(chunk) = upload_chunk {
        body.el("DataTransfer", |transfer| {
            transfer.leaf_base64("OrderData", chunk);
        });
    }
    assemble_signed(root, header, body, &session.client_keys.authentication)
}

fn receipt_request(
    session: &EbicsSession,
    version: EbicsVersion,
    transaction_id: &str,
    receipt_code: &str,
) -> XmlBuilder {
    let root = request_root(version, "ebicsRequest");
    let mut header = XmlBuilder::new("header");
    header.attr("authenticate", "true");
    header.el("static", |fixed| {
        fixed.leaf("HostID", &session.host_id);
        fixed.leaf("TransactionID", transaction_id);
    });
    header.el("mutable", |mutable| {
        mutable.leaf("TransactionPhase", "Receipt");
    });
    let mut body = XmlBuilder::new("body");
    body.el("TransferReceipt", |receipt| {
        receipt.attr("authenticate", "true");
        receipt.leaf("ReceiptCode", receipt_code);
    });
    assemble_signed(root, header, body, &session.client_keys.authentication)
}

fn order_details(order: &OrderParams, date_range: Option<(NaiveDate, NaiveDate)>) -> XmlBuilder {
    let mut details = XmlBuilder::new("OrderDetails");
    match order {
        OrderParams::H004 {
            order_type,
            attribute,
        } => {
            details.leaf("OrderType", order_type);
            details.leaf("OrderAttribute", attribute);
            details.el("StandardOrderParams", |params| {
                if let Some(range) = date_range {
                    params.push(date_range_element(range));
                }
            });
        }
        OrderParams::H005 {
            btf,
            service_name,
            scope,
            message_name,
            message_version,
            container,
            option,
        } => {
            details.leaf("AdminOrderType", btf.as_str());
            let params_name = match btf {
                super::order::BtfKind::Btd => "BTDOrderParams",
                super::order::BtfKind::Btu => "BTUOrderParams",
            };
            details.el(params_name, |params| {
                params.el("Service", |service| {
                    service.leaf("ServiceName", service_name);
                    if let Some(option) = option {
                        service.leaf("ServiceOption", option);
                    }
                    service.leaf("Scope", scope);
                    if let Some(container) = container {
                        service.el("Container", |c| {
                            c.attr("containerType", container);
                        });
                    }
                    service.el("MsgName", |msg| {
                        if let Some(version) = message_version {
                            msg.attr("version", version);
                        }
                        msg.text(message_name);
                    });
                });
                if let Some(range) = date_range {
                    params.push(date_range_element(range));
                }
            });
        }
    }
    details
}

fn date_range_element((start, end): (NaiveDate, NaiveDate)) -> XmlBuilder {
    let mut range = XmlBuilder::new("DateRange");
    range.leaf("Start", &start.format("%Y-%m-%d").to_string());
    range.leaf("End", &end.format("%Y-%m-%d").to_string());
    range
}

/// The `UserSignatureData` block carrying the A006 signature of an upload.
fn user_signature_data(session: &EbicsSession, payload: &[u8]) -> XmlBuilder {
    let signature = crypto::sign_a006(&session.client_keys.signature, payload);
    let mut root = XmlBuilder::new("UserSignatureData");
    root.ns("http://www.ebics.org/S001");
    root.el("OrderSignatureData", |data| {
        data.leaf("SignatureVersion", "A006");
        data.leaf_base64("SignatureValue", &signature);
        data.leaf("PartnerID", &session.partner_id);
        data.leaf("UserID", &session.user_id);
    });
    root
}

#[cfg(test)]
mod tests {
    use super::super::testing::ScriptedBank;
    use super::*;
    use crate::ebics::order::Dialect;
    use crate::keys::{BankKeys, ClientKeys};
    use once_cell::sync::Lazy;
    use rsa::RsaPrivateKey;

    static CLIENT_KEYS: Lazy<ClientKeys> = Lazy::new(|| ClientKeys::generate().unwrap());
    static BANK_AUTH: Lazy<RsaPrivateKey> = Lazy::new(|| crypto::generate_key().unwrap());
    static BANK_ENC: Lazy<RsaPrivateKey> = Lazy::new(|| crypto::generate_key().unwrap());

    fn session() -> EbicsSession {
        EbicsSession {
            host_id: "EBIXHOST".to_string(),
            partner_id: "PARTNER1".to_string(),
            user_id: "USER1".to_string(),
            dialect: Dialect::Postfinance,
            client_keys: CLIENT_KEYS.clone(),
            bank_keys: Some(BankKeys {
                authentication: BANK_AUTH.to_public_key(),
                encryption: BANK_ENC.to_public_key(),
                accepted: true,
            }),
        }
    }

    fn statement_order() -> OrderParams {
        Dialect::Postfinance
            .download_order(crate::ebics::order::Document::Statement, EbicsVersion::H004)
            .unwrap()
    }

    /// Builds a signed ebicsResponse the way the scripted bank would.
    fn signed_response(
        static_fields: &[(&str, &str)],
        mutable_fields: &[(&str, &str)],
        body_builder: impl FnOnce(&mut XmlBuilder),
    ) -> Vec<u8> {
        let root = request_root(EbicsVersion::H004, "ebicsResponse");
        let mut header = XmlBuilder::new("header");
        header.attr("authenticate", "true");
        header.el("static", |fixed| {
            for (name, value) in static_fields {
                fixed.leaf(name, value);
            }
        });
        header.el("mutable", |mutable| {
            for (name, value) in mutable_fields {
                mutable.leaf(name, value);
            }
        });
        let mut body = XmlBuilder::new("body");
        body_builder(&mut body);
        body.el("ReturnCode", |code| {
            code.attr("authenticate", "true").text("000000");
        });
        assemble_signed(root, header, body, &BANK_AUTH).to_document()
    }

    /// Splits an encrypted payload into `pieces` chunks the way the bank
    /// segments downloads, returning (wrapped key, chunks).
    fn encrypted_chunks(payload: &[u8], pieces: usize) -> (Vec<u8>, Vec<Vec<u8>>) {
        let session_key = E002Session::fresh();
        let wrapped = session_key
            .wrap_for(&CLIENT_KEYS.encryption.to_public_key())
            .unwrap();
        let ciphertext = session_key.encrypt(&xml::deflate(payload));
        let chunk_len = ciphertext.len().div_ceil(pieces);
        let chunks = ciphertext.chunks(chunk_len).map(<[u8]>::to_vec).collect();
        (wrapped, chunks)
    }

    fn init_response(
        transaction_id: &str,
        num_segments: usize,
        wrapped_key: &[u8],
        first_chunk: &[u8],
    ) -> Vec<u8> {
        signed_response(
            &[
                ("TransactionID", transaction_id),
                ("NumSegments", &num_segments.to_string()),
            ],
            &[
                ("TransactionPhase", "Initialisation"),
                ("ReturnCode", "000000"),
            ],
            |body| {
                body.el("DataTransfer", |transfer| {
                    transfer.el("DataEncryptionInfo", |info| {
                        info.attr("authenticate", "true");
                        info.leaf_base64("TransactionKey", wrapped_key);
                    });
                    transfer.leaf_base64("OrderData", first_chunk);
                });
            },
        )
    }

    fn transfer_response(chunk: &[u8]) -> Vec<u8> {
        signed_response(
            &[],
            &[("TransactionPhase", "Transfer"), ("ReturnCode", "000000")],
            |body| {
                body.el("DataTransfer", |transfer| {
                    transfer.leaf_base64("OrderData", chunk);
                });
            },
        )
    }

    fn receipt_response() -> Vec<u8> {
        signed_response(
            &[],
            &[("TransactionPhase", "Receipt"), ("ReturnCode", "011000")],
            |_| {},
        )
    }

    #[tokio::test]
    async fn single_segment_download_skips_transfer_phase() {
        let payload = b"<Document>camt</Document>".to_vec();
        let (wrapped, chunks) = encrypted_chunks(&payload, 1);
        let bank = ScriptedBank::new(vec![
            init_response("TX1", 1, &wrapped, &chunks[0]),
            receipt_response(),
        ]);

        let result = download(
            &bank,
            &session(),
            &statement_order(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result, DownloadResult::Data(payload));

        // Exactly init + receipt, no empty transfer exchange.
        assert_eq!(bank.request_count(), 2);
        let receipt = bank.request(1);
        let mutable = receipt.one("header").unwrap().one("mutable").unwrap();
        assert_eq!(mutable.one("TransactionPhase").unwrap().text(), "Receipt");
        let code = receipt
            .one("body")
            .unwrap()
            .one("TransferReceipt")
            .unwrap()
            .one("ReceiptCode")
            .unwrap();
        assert_eq!(code.text(), "0");
    }

    #[tokio::test]
    async fn multi_segment_download_reassembles_in_order() {
        let payload: Vec<u8> = (0..100_000u32).flat_map(|v| v.to_be_bytes()).collect();
        let (wrapped, chunks) = encrypted_chunks(&payload, 3);
        assert_eq!(chunks.len(), 3);
        let bank = ScriptedBank::new(vec![
            init_response("TX2", 3, &wrapped, &chunks[0]),
            transfer_response(&chunks[1]),
            transfer_response(&chunks[2]),
            receipt_response(),
        ]);

        let result = download(
            &bank,
            &session(),
            &statement_order(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result, DownloadResult::Data(payload));
        assert_eq!(bank.request_count(), 4);

        let second_transfer = bank.request(2);
        let segment = second_transfer
            .one("header")
            .unwrap()
            .one("mutable")
            .unwrap()
            .one("SegmentNumber")
            .unwrap();
        assert_eq!(segment.text(), "3");
        assert_eq!(segment.attr("lastSegment"), Some("true"));
        assert_eq!(
            second_transfer
                .one("header")
                .unwrap()
                .one("static")
                .unwrap()
                .one("TransactionID")
                .unwrap()
                .text(),
            "TX2"
        );
    }

    #[tokio::test]
    async fn empty_download_sends_no_receipt() {
        let root = request_root(EbicsVersion::H004, "ebicsResponse");
        let mut header = XmlBuilder::new("header");
        header.attr("authenticate", "true");
        header.empty("static");
        header.el("mutable", |mutable| {
            mutable.leaf("TransactionPhase", "Initialisation");
            mutable.leaf("ReturnCode", "000000");
        });
        let mut body = XmlBuilder::new("body");
        body.el("ReturnCode", |code| {
            code.attr("authenticate", "true").text("090005");
        });
        let empty = assemble_signed(root, header, body, &BANK_AUTH).to_document();
        let bank = ScriptedBank::new(vec![empty]);
        let result = download(
            &bank,
            &session(),
            &statement_order(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result, DownloadResult::Empty);
        assert_eq!(bank.request_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_after_init_sends_failure_receipt() {
        let payload = vec![1u8; 64];
        let (wrapped, chunks) = encrypted_chunks(&payload, 2);
        let bank = ScriptedBank::new(vec![
            init_response("TX3", 2, &wrapped, &chunks[0]),
            receipt_response(),
        ]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = download(&bank, &session(), &statement_order(), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EbicsError::Cancelled));

        // init + failure receipt, no transfer.
        assert_eq!(bank.request_count(), 2);
        let receipt = bank.request(1);
        let code = receipt
            .one("body")
            .unwrap()
            .one("TransferReceipt")
            .unwrap()
            .one("ReceiptCode")
            .unwrap();
        assert_eq!(code.text(), "1");
    }

    #[tokio::test]
    async fn tampered_response_signature_is_rejected() {
        let payload = b"payload".to_vec();
        let (wrapped, chunks) = encrypted_chunks(&payload, 1);
        let raw = init_response("TX4", 1, &wrapped, &chunks[0]);
        let tampered = String::from_utf8(raw)
            .unwrap()
            .replace("TX4", "TX5")
            .into_bytes();
        let bank = ScriptedBank::new(vec![tampered]);

        let err = download(
            &bank,
            &session(),
            &statement_order(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EbicsError::Protocol(_)));
    }

    #[tokio::test]
    async fn bank_error_on_init_aborts_without_receipt() {
        let root = request_root(EbicsVersion::H004, "ebicsResponse");
        let mut header = XmlBuilder::new("header");
        header.attr("authenticate", "true");
        header.empty("static");
        header.el("mutable", |mutable| {
            mutable.leaf("TransactionPhase", "Initialisation");
            mutable.leaf("ReturnCode", "061001");
        });
        let body = XmlBuilder::new("body");
        let response = assemble_signed(root, header, body, &BANK_AUTH).to_document();
        let bank = ScriptedBank::new(vec![response]);

        let err = download(
            &bank,
            &session(),
            &statement_order(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            EbicsError::Technical(ReturnCode::AuthenticationFailed)
        ));
        assert_eq!(bank.request_count(), 1);
    }

    fn upload_init_ok(transaction_id: &str, order_id: Option<&str>) -> Vec<u8> {
        let mut mutable_fields = vec![
            ("TransactionPhase", "Initialisation"),
            ("ReturnCode", "000000"),
        ];
        if let Some(order_id) = order_id {
            mutable_fields.push(("OrderID", order_id));
        }
        signed_response(&[("TransactionID", transaction_id)], &mutable_fields, |_| {})
    }

    fn upload_transfer_ok() -> Vec<u8> {
        signed_response(
            &[],
            &[("TransactionPhase", "Transfer"), ("ReturnCode", "000000")],
            |_| {},
        )
    }

    #[tokio::test]
    async fn upload_segments_and_returns_order_id() {
        // Compressible but non-trivial payload spanning three segments
        // after deflate stays one segment; use incompressible bytes.
        let mut payload = Vec::with_capacity(2 * SEGMENT_LIMIT + 1024);
        let mut state = 0x12345678u32;
        while payload.len() < 2 * SEGMENT_LIMIT + 1024 {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            payload.extend_from_slice(&state.to_be_bytes());
        }

        let bank = ScriptedBank::new(vec![
            upload_init_ok("UTX1", Some("OR01")),
            upload_transfer_ok(),
            upload_transfer_ok(),
            upload_transfer_ok(),
        ]);
        let order = Dialect::Postfinance.upload_order();
        let order_id = upload(
            &bank,
            &session(),
            &order,
            &payload,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(order_id, "OR01");

        // NumSegments announced equals transfer exchanges performed.
        let init = bank.request(0);
        let fixed = init.one("header").unwrap().one("static").unwrap();
        let announced: usize = fixed.one("NumSegments").unwrap().text().parse().unwrap();
        assert_eq!(bank.request_count(), 1 + announced);

        // The last transfer is flagged as such.
        let last = bank.request(bank.request_count() - 1);
        let segment = last
            .one("header")
            .unwrap()
            .one("mutable")
            .unwrap()
            .one("SegmentNumber")
            .unwrap();
        assert_eq!(segment.attr("lastSegment"), Some("true"));
    }

    #[tokio::test]
    async fn upload_round_trips_through_bank_decryption() {
        let payload = b"<Document>pain.001 single transfer</Document>".to_vec();
        let bank = ScriptedBank::new(vec![
            upload_init_ok("UTX2", Some("OR02")),
            upload_transfer_ok(),
        ]);
        let order = Dialect::Postfinance.upload_order();
        upload(
            &bank,
            &session(),
            &order,
            &payload,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // Replay what the bank would do: unwrap the session key, decrypt
        // the payload segments and the signature block, check the A006
        // signature against the client signature key.
        let init = bank.request(0);
        let transfer = init.one("body").unwrap().one("DataTransfer").unwrap();
        let wrapped_key = transfer
            .one("DataEncryptionInfo")
            .unwrap()
            .one("TransactionKey")
            .unwrap()
            .text_base64()
            .unwrap();
        let session_key = BANK_ENC.decrypt(rsa::Pkcs1v15Encrypt, &wrapped_key).unwrap();
        let session_key = E002Session::from_key(&session_key).unwrap();

        let chunk = bank
            .request(1)
            .one("body")
            .unwrap()
            .one("DataTransfer")
            .unwrap()
            .one("OrderData")
            .unwrap()
            .text_base64()
            .unwrap();
        let decrypted = xml::inflate(&session_key.decrypt(&chunk).unwrap()).unwrap();
        assert_eq!(decrypted, payload);

        let signature_block = transfer
            .one("SignatureData")
            .unwrap()
            .text_base64()
            .unwrap();
        let signature_xml =
            xml::inflate(&session_key.decrypt(&signature_block).unwrap()).unwrap();
        let parsed = XmlNode::parse(&signature_xml).unwrap();
        let signature = parsed
            .one("OrderSignatureData")
            .unwrap()
            .one("SignatureValue")
            .unwrap()
            .text_base64()
            .unwrap();
        crypto::verify_a006(
            &CLIENT_KEYS.signature.to_public_key(),
            &payload,
            &signature,
        )
        .unwrap();

        // And the announced DataDigest matches the payload hash.
        let digest = transfer.one("DataDigest").unwrap().text_base64().unwrap();
        assert_eq!(digest, crypto::sha256(&payload).to_vec());
    }

    #[tokio::test]
    async fn upload_without_accepted_bank_keys_is_refused() {
        let mut no_keys = session();
        no_keys.bank_keys = None;
        let bank = ScriptedBank::new(vec![]);
        let order = Dialect::Postfinance.upload_order();
        let err = upload(&bank, &no_keys, &order, b"x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EbicsError::Protocol(_)));
        assert_eq!(bank.request_count(), 0);
    }
}
