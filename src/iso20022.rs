//! ISO 20022 documents: pain.001 emission, camt and pain.002 ingestion.
//!
//! Only the fields the reconciliation engine consumes are modeled. Schema
//! validation is the bank's job; this parser is deliberately tolerant about
//! optional structure (camt versions disagree on where party names live)
//! and strict about the fields reconciliation depends on: amount, direction
//! and the account servicer reference.

use chrono::{DateTime, NaiveDate, Utc};

use crate::primitives::{Amount, AmountError, IbanPayto};
use crate::xml::{XmlBuilder, XmlError, XmlNode};

pub const PAIN_001_NS: &str = "urn:iso:std:iso:20022:tech:xsd:pain.001.001.09";

#[derive(thiserror::Error, Debug)]
pub enum IsoError {
    #[error(transparent)]
    Xml(#[from] XmlError),
    #[error("bad amount in document: {0}")]
    Amount(#[from] AmountError),
    #[error("entry {reference} is malformed: {detail}")]
    MalformedEntry { reference: String, detail: String },
    #[error("unrecognized document root <{0}>")]
    UnknownDocument(String),
}

/// Booking direction relative to the owned account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
}

/// One booked camt entry, flattened to what ingestion needs.
#[derive(Debug, Clone)]
pub struct CamtEntry {
    pub direction: Direction,
    pub amount: Amount,
    pub execution_time: DateTime<Utc>,
    /// `AcctSvcrRef`: the bank-assigned identifier ingestion dedupes on.
    pub bank_id: String,
    /// `Refs/MsgId`, the reconciliation key for debits.
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub debtor: Option<IbanPayto>,
    pub creditor: Option<IbanPayto>,
}

/// One transaction status out of a pain.002 acknowledgement.
#[derive(Debug, Clone)]
pub struct PaymentStatus {
    pub original_msg_id: Option<String>,
    pub original_end_to_end_id: Option<String>,
    pub status: Option<String>,
    pub reason_code: Option<String>,
    pub additional_info: Option<String>,
}

impl PaymentStatus {
    /// RJCT is the only status that parks a payment; everything else is
    /// progress reporting.
    pub fn is_rejection(&self) -> bool {
        self.status.as_deref() == Some("RJCT")
    }
}

/// The debtor-side account data stamped into every outgoing pain.001.
#[derive(Debug, Clone)]
pub struct OwnedAccount {
    pub iban: String,
    pub bic: String,
    pub name: String,
}

/// Renders a single-transfer pain.001.001.09 credit-transfer initiation.
///
/// The caller's request UID becomes both `MsgId` and `InstrId`, which is
/// what later links the camt debit booking back to the initiated row.
pub fn pain001(
    request_uid: &str,
    creation_time: DateTime<Utc>,
    amount: &Amount,
    subject: &str,
    debtor: &OwnedAccount,
    creditor: &IbanPayto,
    creditor_name: &str,
) -> Vec<u8> {
    let mut document = XmlBuilder::new("Document");
    document.ns(PAIN_001_NS);
    document.el("CstmrCdtTrfInitn", |initiation| {
        initiation.el("GrpHdr", |header| {
            header.leaf("MsgId", request_uid);
            header.leaf("CreDtTm", &creation_time.format("%Y-%m-%dT%H:%M:%S").to_string());
            header.leaf("NbOfTxs", "1");
            header.leaf("CtrlSum", &amount.to_bank_decimal());
            header.el("InitgPty", |party| {
                party.leaf("Nm", &debtor.name);
            });
        });
        initiation.el("PmtInf", |payment| {
            payment.leaf("PmtInfId", request_uid);
            payment.leaf("PmtMtd", "TRF");
            payment.leaf("BtchBookg", "false");
            payment.el("ReqdExctnDt", |date| {
                date.leaf("Dt", &creation_time.format("%Y-%m-%d").to_string());
            });
            payment.el("Dbtr", |party| {
                party.leaf("Nm", &debtor.name);
            });
            payment.el("DbtrAcct", |account| {
                account.el("Id", |id| {
                    id.leaf("IBAN", &debtor.iban);
                });
            });
            payment.el("DbtrAgt", |agent| {
                agent.el("FinInstnId", |institution| {
                    institution.leaf("BICFI", &debtor.bic);
                });
            });
            payment.el("CdtTrfTxInf", |transfer| {
                transfer.el("PmtId", |payment_id| {
                    payment_id.leaf("InstrId", request_uid);
                    payment_id.leaf("EndToEndId", "NOTPROVIDED");
                });
                transfer.el("Amt", |amt| {
                    amt.el("InstdAmt", |instructed| {
                        instructed
                            .attr("Ccy", amount.currency())
                            .text(&amount.to_bank_decimal());
                    });
                });
                transfer.el("Cdtr", |party| {
                    party.leaf("Nm", creditor_name);
                });
                transfer.el("CdtrAcct", |account| {
                    account.el("Id", |id| {
                        id.leaf("IBAN", creditor.iban());
                    });
                });
                transfer.el("RmtInf", |remittance| {
                    remittance.leaf("Ustrd", subject);
                });
            });
        });
    });
    document.to_document()
}

/// Parses any of camt.052 / camt.053 / camt.054 into booked entries, in
/// document order.
pub fn parse_camt(bytes: &[u8]) -> Result<Vec<CamtEntry>, IsoError> {
    let document = XmlNode::parse(bytes)?;
    let container = ["BkToCstmrStmt", "BkToCstmrAcctRpt", "BkToCstmrDbtCdtNtfctn"]
        .iter()
        .find_map(|name| document.opt(name))
        .ok_or_else(|| IsoError::UnknownDocument(first_child_name(&document)))?;

    let mut entries = Vec::new();
    for report in container.children.iter().filter(|child| {
        matches!(child.name.as_str(), "Stmt" | "Rpt" | "Ntfctn")
    }) {
        for entry in report.iter("Ntry") {
            // Only booked entries count; pending ones reappear later.
            if let Some(status) = entry.opt("Sts") {
                let code = status.opt("Cd").map(|c| c.text()).unwrap_or(status.text());
                if !code.is_empty() && code != "BOOK" {
                    continue;
                }
            }
            entries.push(parse_entry(entry)?);
        }
    }
    Ok(entries)
}

fn parse_entry(entry: &XmlNode) -> Result<CamtEntry, IsoError> {
    let bank_id = entry
        .opt("AcctSvcrRef")
        .map(|node| node.text().to_string())
        .or_else(|| {
            transaction_details(entry)
                .and_then(|details| details.opt("Refs"))
                .and_then(|refs| refs.opt("AcctSvcrRef"))
                .map(|node| node.text().to_string())
        })
        .ok_or_else(|| IsoError::MalformedEntry {
            reference: "<unknown>".to_string(),
            detail: "entry carries no AcctSvcrRef".to_string(),
        })?;
    let malformed = |detail: &str| IsoError::MalformedEntry {
        reference: bank_id.clone(),
        detail: detail.to_string(),
    };

    let amount_node = entry.one("Amt").map_err(|_| malformed("missing Amt"))?;
    let currency = amount_node
        .attr("Ccy")
        .ok_or_else(|| malformed("Amt lacks Ccy"))?;
    let amount = Amount::from_bank_decimal(amount_node.text(), currency)?;

    let direction = match entry
        .one("CdtDbtInd")
        .map_err(|_| malformed("missing CdtDbtInd"))?
        .text()
    {
        "CRDT" => Direction::Credit,
        "DBIT" => Direction::Debit,
        other => return Err(malformed(&format!("bad CdtDbtInd '{other}'"))),
    };

    let execution_time = entry
        .opt("BookgDt")
        .or_else(|| entry.opt("ValDt"))
        .and_then(parse_date_choice)
        .ok_or_else(|| malformed("missing booking date"))?;

    let details = transaction_details(entry);
    let message_id = details
        .and_then(|d| d.opt("Refs"))
        .and_then(|refs| refs.opt("MsgId"))
        .map(|node| node.text().to_string());
    let subject = details
        .and_then(|d| d.opt("RmtInf"))
        .and_then(|remittance| {
            let lines: Vec<&str> = remittance.iter("Ustrd").map(|u| u.text()).collect();
            if lines.is_empty() {
                None
            } else {
                Some(lines.join(" "))
            }
        });
    let parties = details.and_then(|d| d.opt("RltdPties"));
    let debtor = parties.and_then(|p| related_account(p, "Dbtr", "DbtrAcct"));
    let creditor = parties.and_then(|p| related_account(p, "Cdtr", "CdtrAcct"));

    Ok(CamtEntry {
        direction,
        amount,
        execution_time,
        bank_id,
        message_id,
        subject,
        debtor,
        creditor,
    })
}

fn transaction_details(entry: &XmlNode) -> Option<&XmlNode> {
    entry.opt("NtryDtls").and_then(|details| details.opt("TxDtls"))
}

fn first_child_name(document: &XmlNode) -> String {
    document
        .children
        .first()
        .map(|child| child.name.clone())
        .unwrap_or_else(|| "empty".to_string())
}

/// `BookgDt`/`ValDt` is a date-or-datetime choice.
fn parse_date_choice(node: &XmlNode) -> Option<DateTime<Utc>> {
    if let Some(datetime) = node.opt("DtTm") {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(datetime.text()) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    let date = node.opt("Dt")?;
    let parsed = NaiveDate::parse_from_str(date.text(), "%Y-%m-%d").ok()?;
    Some(DateTime::from_naive_utc_and_offset(
        parsed.and_hms_opt(0, 0, 0)?,
        Utc,
    ))
}

/// Party name plus IBAN, wherever this camt version put them. Newer
/// versions nest the name under `Pty`, older ones inline it.
fn related_account(parties: &XmlNode, party: &str, account: &str) -> Option<IbanPayto> {
    let iban = parties
        .opt(account)?
        .opt("Id")?
        .opt("IBAN")
        .map(|node| node.text().to_string())?;
    let mut payto = IbanPayto::new(&iban).ok()?;
    let name = parties.opt(party).and_then(|node| {
        node.opt("Nm")
            .or_else(|| node.opt("Pty").and_then(|pty| pty.opt("Nm")))
            .map(|nm| nm.text().to_string())
    });
    if let Some(name) = name {
        payto = payto.with_receiver_name(&name);
    }
    Some(payto)
}

/// Parses a pain.002 customer payment status report.
pub fn parse_pain002(bytes: &[u8]) -> Result<Vec<PaymentStatus>, IsoError> {
    let document = XmlNode::parse(bytes)?;
    let report = document
        .opt("CstmrPmtStsRpt")
        .ok_or_else(|| IsoError::UnknownDocument(first_child_name(&document)))?;
    let original_msg_id = report
        .opt("OrgnlGrpInfAndSts")
        .and_then(|group| group.opt("OrgnlMsgId"))
        .map(|node| node.text().to_string());
    let group_status = report
        .opt("OrgnlGrpInfAndSts")
        .and_then(|group| group.opt("GrpSts"))
        .map(|node| node.text().to_string());

    let mut statuses = Vec::new();
    for payment_info in report.iter("OrgnlPmtInfAndSts") {
        for tx in payment_info.iter("TxInfAndSts") {
            let reason = tx.opt("StsRsnInf");
            statuses.push(PaymentStatus {
                original_msg_id: original_msg_id.clone(),
                original_end_to_end_id: tx
                    .opt("OrgnlEndToEndId")
                    .map(|node| node.text().to_string()),
                status: tx
                    .opt("TxSts")
                    .map(|node| node.text().to_string())
                    .or_else(|| group_status.clone()),
                reason_code: reason
                    .and_then(|r| r.opt("Rsn"))
                    .and_then(|rsn| rsn.opt("Cd"))
                    .map(|node| node.text().to_string()),
                additional_info: reason
                    .and_then(|r| r.opt("AddtlInf"))
                    .map(|node| node.text().to_string()),
            });
        }
    }
    // A group-level rejection with no per-transaction detail still needs
    // to reach the reconciliation sweep.
    if statuses.is_empty() {
        if let Some(status) = group_status {
            statuses.push(PaymentStatus {
                original_msg_id,
                original_end_to_end_id: None,
                status: Some(status),
                reason_code: None,
                additional_info: None,
            });
        }
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_camt054(bank_id: &str, direction: &str, subject: &str) -> Vec<u8> {
        let mut document = XmlBuilder::new("Document");
        document.ns("urn:iso:std:iso:20022:tech:xsd:camt.054.001.08");
        document.el("BkToCstmrDbtCdtNtfctn", |notification| {
            notification.el("Ntfctn", |body| {
                body.leaf("Id", "N1");
                body.el("Ntry", |entry| {
                    entry.el("Amt", |amt| {
                        amt.attr("Ccy", "CHF").text("10.00");
                    });
                    entry.leaf("CdtDbtInd", direction);
                    entry.el("Sts", |sts| {
                        sts.leaf("Cd", "BOOK");
                    });
                    entry.el("BookgDt", |date| {
                        date.leaf("Dt", "2024-03-15");
                    });
                    entry.leaf("AcctSvcrRef", bank_id);
                    entry.el("NtryDtls", |details| {
                        details.el("TxDtls", |tx| {
                            tx.el("Refs", |refs| {
                                refs.leaf("MsgId", "MSG-77");
                                refs.leaf("EndToEndId", "NOTPROVIDED");
                            });
                            tx.el("RltdPties", |parties| {
                                parties.el("Dbtr", |debtor| {
                                    debtor.el("Pty", |pty| {
                                        pty.leaf("Nm", "Jane Debtor");
                                    });
                                });
                                parties.el("DbtrAcct", |account| {
                                    account.el("Id", |id| {
                                        id.leaf("IBAN", "DE75512108001245126199");
                                    });
                                });
                            });
                            tx.el("RmtInf", |remittance| {
                                remittance.leaf("Ustrd", subject);
                            });
                        });
                    });
                });
            });
        });
        document.to_document()
    }

    #[test]
    fn camt_credit_entry_is_flattened() {
        let raw = sample_camt054("REF-1", "CRDT", "test subject");
        let entries = parse_camt(&raw).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.direction, Direction::Credit);
        assert_eq!(entry.amount.to_string(), "CHF:10");
        assert_eq!(entry.bank_id, "REF-1");
        assert_eq!(entry.message_id.as_deref(), Some("MSG-77"));
        assert_eq!(entry.subject.as_deref(), Some("test subject"));
        let debtor = entry.debtor.as_ref().unwrap();
        assert_eq!(debtor.iban(), "DE75512108001245126199");
        assert_eq!(debtor.receiver_name(), Some("Jane Debtor"));
        assert_eq!(
            entry.execution_time,
            Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn pending_entries_are_skipped() {
        let raw = String::from_utf8(sample_camt054("REF-2", "CRDT", "x"))
            .unwrap()
            .replace("BOOK", "PDNG");
        let entries = parse_camt(raw.as_bytes()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn entry_without_bank_reference_is_an_error() {
        let raw = String::from_utf8(sample_camt054("REF-3", "DBIT", "x"))
            .unwrap()
            .replace("<AcctSvcrRef>REF-3</AcctSvcrRef>", "");
        assert!(matches!(
            parse_camt(raw.as_bytes()),
            Err(IsoError::MalformedEntry { .. })
        ));
    }

    #[test]
    fn unknown_root_is_rejected() {
        let mut document = XmlBuilder::new("Document");
        document.el("SomethingElse", |_| {});
        assert!(matches!(
            parse_camt(&document.to_document()),
            Err(IsoError::UnknownDocument(_))
        ));
    }

    #[test]
    fn pain001_carries_reconciliation_key_and_amount() {
        let debtor = OwnedAccount {
            iban: "CH9300762011623852957".to_string(),
            bic: "POFICHBEXXX".to_string(),
            name: "Nexus Operator".to_string(),
        };
        let creditor: IbanPayto = "payto://iban/DE75512108001245126199?receiver-name=Jane"
            .parse()
            .unwrap();
        let amount: Amount = "EUR:4.5".parse().unwrap();
        let when = Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 0).unwrap();
        let raw = pain001("UID-42", when, &amount, "bounce: REF-2", &debtor, &creditor, "Jane");

        let document = XmlNode::parse(&raw).unwrap();
        let initiation = document.one("CstmrCdtTrfInitn").unwrap();
        let header = initiation.one("GrpHdr").unwrap();
        assert_eq!(header.one("MsgId").unwrap().text(), "UID-42");
        assert_eq!(header.one("NbOfTxs").unwrap().text(), "1");

        let payment = initiation.one("PmtInf").unwrap();
        let transfer = payment.one("CdtTrfTxInf").unwrap();
        let instructed = transfer
            .one("Amt")
            .unwrap()
            .one("InstdAmt")
            .unwrap();
        assert_eq!(instructed.attr("Ccy"), Some("EUR"));
        assert_eq!(instructed.text(), "4.5");
        assert_eq!(
            transfer
                .one("CdtrAcct")
                .unwrap()
                .one("Id")
                .unwrap()
                .one("IBAN")
                .unwrap()
                .text(),
            "DE75512108001245126199"
        );
        assert_eq!(
            transfer
                .one("RmtInf")
                .unwrap()
                .one("Ustrd")
                .unwrap()
                .text(),
            "bounce: REF-2"
        );
        assert_eq!(
            payment
                .one("DbtrAcct")
                .unwrap()
                .one("Id")
                .unwrap()
                .one("IBAN")
                .unwrap()
                .text(),
            "CH9300762011623852957"
        );
    }

    #[test]
    fn pain002_rejection_is_parsed() {
        let mut document = XmlBuilder::new("Document");
        document.ns("urn:iso:std:iso:20022:tech:xsd:pain.002.001.10");
        document.el("CstmrPmtStsRpt", |report| {
            report.el("OrgnlGrpInfAndSts", |group| {
                group.leaf("OrgnlMsgId", "UID-42");
            });
            report.el("OrgnlPmtInfAndSts", |payment| {
                payment.el("TxInfAndSts", |tx| {
                    tx.leaf("OrgnlEndToEndId", "NOTPROVIDED");
                    tx.leaf("TxSts", "RJCT");
                    tx.el("StsRsnInf", |reason| {
                        reason.el("Rsn", |rsn| {
                            rsn.leaf("Cd", "AC04");
                        });
                        reason.leaf("AddtlInf", "account closed");
                    });
                });
            });
        });

        let statuses = parse_pain002(&document.to_document()).unwrap();
        assert_eq!(statuses.len(), 1);
        let status = &statuses[0];
        assert!(status.is_rejection());
        assert_eq!(status.original_msg_id.as_deref(), Some("UID-42"));
        assert_eq!(status.reason_code.as_deref(), Some("AC04"));
        assert_eq!(status.additional_info.as_deref(), Some("account closed"));
    }

    #[test]
    fn pain002_group_level_rejection_survives() {
        let mut document = XmlBuilder::new("Document");
        document.el("CstmrPmtStsRpt", |report| {
            report.el("OrgnlGrpInfAndSts", |group| {
                group.leaf("OrgnlMsgId", "UID-43");
                group.leaf("GrpSts", "RJCT");
            });
        });
        let statuses = parse_pain002(&document.to_document()).unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].is_rejection());
        assert_eq!(statuses[0].original_msg_id.as_deref(), Some("UID-43"));
    }
}
