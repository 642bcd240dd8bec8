//! EBICS protocol engine.
//!
//! - [`return_code`] — the closed return-code table.
//! - [`order`] — document-to-order catalog per bank dialect.
//! - [`keymgmt`] — INI / HIA / HPB subscriber initialisation.
//! - [`transport`] — the business download and upload state machines.
//!
//! This module holds what the flows share: the error taxonomy, the
//! [`BankConnection`] seam (an HTTP POST behind a trait so state machines
//! run against scripted banks in tests), the signed-envelope helpers and
//! the common response header parsing.

pub mod keymgmt;
pub mod order;
pub mod return_code;
pub mod transport;

use async_trait::async_trait;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::time::Duration;
use url::Url;

use crate::crypto::{self, CryptoError};
use crate::keys::{BankKeys, ClientKeys};
use crate::xml::{to_base64, XmlBuilder, XmlError, XmlNode};
use order::{Dialect, EbicsVersion};
use return_code::{ReturnCode, Severity, UnknownReturnCode};

pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Error taxonomy of every EBICS exchange. Callers must not collapse the
/// kinds: transport problems retry, protocol problems abort, bank-technical
/// codes park the affected payment.
#[derive(thiserror::Error, Debug)]
pub enum EbicsError {
    /// Network, TLS or non-200 HTTP. Retryable, mutates nothing.
    #[error("transport failure talking to the bank: {0}")]
    Transport(String),
    /// The response does not follow the protocol (bad signature, missing
    /// mandatory element). Fatal for the current transaction.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Error-class technical return code: session or configuration trouble.
    #[error("EBICS technical error: {0}")]
    Technical(ReturnCode),
    /// Error-class bank-technical return code: the business order itself
    /// was declined.
    #[error("bank technical error: {0}")]
    BankTechnical(ReturnCode),
    /// Key management flow declined by the bank.
    #[error("key management rejected: {0}")]
    KeyMgmtRejected(ReturnCode),
    /// The surrounding task was cancelled; any open transaction has already
    /// received its failure receipt.
    #[error("cancelled while talking to the bank")]
    Cancelled,
}

impl From<XmlError> for EbicsError {
    fn from(e: XmlError) -> Self {
        EbicsError::Protocol(e.to_string())
    }
}

impl From<CryptoError> for EbicsError {
    fn from(e: CryptoError) -> Self {
        EbicsError::Protocol(e.to_string())
    }
}

impl From<UnknownReturnCode> for EbicsError {
    fn from(e: UnknownReturnCode) -> Self {
        EbicsError::Protocol(e.to_string())
    }
}

impl EbicsError {
    /// Whether a later retry of the same request can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EbicsError::Transport(_) => true,
            EbicsError::Technical(code) => code.is_transient(),
            _ => false,
        }
    }
}

/// The HTTP seam to the bank. Implemented by [`HttpBankConnection`] in
/// production and by scripted doubles in state-machine tests.
#[async_trait]
pub trait BankConnection: Send + Sync {
    /// POSTs one EBICS document and returns the raw response body.
    async fn post(&self, document: Vec<u8>) -> Result<Vec<u8>, EbicsError>;
}

pub struct HttpBankConnection {
    client: reqwest::Client,
    url: Url,
}

impl HttpBankConnection {
    pub fn new(url: Url) -> Result<Self, EbicsError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| EbicsError::Transport(e.to_string()))?;
        Ok(HttpBankConnection { client, url })
    }
}

#[async_trait]
impl BankConnection for HttpBankConnection {
    async fn post(&self, document: Vec<u8>) -> Result<Vec<u8>, EbicsError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(document)
            .send()
            .await
            .map_err(|e| EbicsError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EbicsError::Transport(format!(
                "bank answered HTTP {status}"
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| EbicsError::Transport(e.to_string()))?;
        Ok(body.to_vec())
    }
}

/// Static subscriber identity plus the key material a session needs.
#[derive(Clone)]
pub struct EbicsSession {
    pub host_id: String,
    pub partner_id: String,
    pub user_id: String,
    pub dialect: Dialect,
    pub client_keys: ClientKeys,
    pub bank_keys: Option<BankKeys>,
}

impl EbicsSession {
    /// Bank keys, required for anything past INI/HIA.
    pub fn bank_keys(&self) -> Result<&BankKeys, EbicsError> {
        self.bank_keys
            .as_ref()
            .filter(|keys| keys.accepted)
            .ok_or_else(|| {
                EbicsError::Protocol("bank keys are missing or not yet accepted".to_string())
            })
    }
}

/// Root element for one of the EBICS request flavours, with the namespace
/// and version attributes every flavour carries.
pub fn request_root(version: EbicsVersion, name: &str) -> XmlBuilder {
    let mut root = XmlBuilder::new(name);
    root.ns(version.namespace())
        .ns_prefix("ds", XMLDSIG_NS)
        .attr("Version", version.label())
        .attr("Revision", "1");
    root
}

/// `xs:dateTime` rendering of now, as EBICS headers expect.
pub fn utc_timestamp(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Assembles a signed EBICS request: `header`, then the `AuthSignature`
/// element (an XML-DSIG `SignedInfo` whose single reference digests every
/// `authenticate="true"` subtree, plus the X002 signature over the
/// canonicalized `SignedInfo`), then `body`.
pub fn assemble_signed(
    mut root: XmlBuilder,
    header: XmlBuilder,
    body: XmlBuilder,
    auth_key: &RsaPrivateKey,
) -> XmlBuilder {
    let mut canonical = header.authenticated_bytes();
    canonical.extend_from_slice(&body.authenticated_bytes());
    let digest = crypto::sha256(&canonical);
    let signed_info = signed_info(&digest);
    let signature_value = crypto::sign_x002(auth_key, &signed_info.canonical_bytes());
    root.push(header);
    root.el("AuthSignature", |auth| {
        auth.push(signed_info);
        auth.leaf_base64("ds:SignatureValue", &signature_value);
    });
    root.push(body);
    root
}

fn signed_info(digest: &[u8; 32]) -> XmlBuilder {
    let mut signed_info = XmlBuilder::new("ds:SignedInfo");
    signed_info.el("ds:CanonicalizationMethod", |method| {
        method.attr("Algorithm", "http://www.w3.org/TR/2001/REC-xml-c14n-20010315");
    });
    signed_info.el("ds:SignatureMethod", |method| {
        method.attr(
            "Algorithm",
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
        );
    });
    signed_info.el("ds:Reference", |reference| {
        reference.attr("URI", "#xpointer(//*[@authenticate='true'])");
        reference.el("ds:Transforms", |transforms| {
            transforms.el("ds:Transform", |transform| {
                transform.attr(
                    "Algorithm",
                    "http://www.w3.org/TR/2001/REC-xml-c14n-20010315",
                );
            });
        });
        reference.el("ds:DigestMethod", |method| {
            method.attr("Algorithm", "http://www.w3.org/2001/04/xmlenc#sha256");
        });
        reference.leaf_base64("ds:DigestValue", digest);
    });
    signed_info
}

/// Verifies the bank's X002 envelope signature on a parsed response.
///
/// Recomputes the digest of the `authenticate="true"` subtree, compares it
/// against the `DigestValue` the bank signed, then checks the RSA signature
/// over the canonicalized `SignedInfo`.
pub fn verify_auth_signature(
    document: &XmlNode,
    bank_auth_key: &RsaPublicKey,
) -> Result<(), EbicsError> {
    let authenticated = document.find_with_attr("authenticate", "true");
    if authenticated.is_empty() {
        return Err(EbicsError::Protocol(
            "response has no authenticated subtree".to_string(),
        ));
    }
    let mut canonical = Vec::new();
    for node in &authenticated {
        canonical.extend_from_slice(&node.canonical_bytes());
    }
    let digest = crypto::sha256(&canonical);

    let auth_signature = document.one("AuthSignature")?;
    let signed_info = auth_signature.one("SignedInfo")?;
    let carried_digest = signed_info
        .one("Reference")?
        .one("DigestValue")?
        .text_base64()?;
    if carried_digest != digest {
        return Err(EbicsError::Protocol(
            "digest of authenticated subtree does not match DigestValue".to_string(),
        ));
    }
    let signature = auth_signature.one("SignatureValue")?.text_base64()?;
    crypto::verify_x002(bank_auth_key, &rebuild_signed_info(signed_info)?, &signature)
        .map_err(|_| EbicsError::Protocol("bank envelope signature is invalid".to_string()))
}

/// The bank signed its own serialization of `SignedInfo` with `ds:`
/// prefixes; rebuild that form from the parsed node before verifying.
fn rebuild_signed_info(signed_info: &XmlNode) -> Result<Vec<u8>, EbicsError> {
    let digest = signed_info
        .one("Reference")?
        .one("DigestValue")?
        .text_base64()?;
    let digest: [u8; 32] = digest
        .try_into()
        .map_err(|_| EbicsError::Protocol("DigestValue is not 32 bytes".to_string()))?;
    Ok(self::signed_info(&digest).canonical_bytes())
}

/// Return codes and transaction identifiers common to every response body.
#[derive(Debug, Clone)]
pub struct ResponseCommon {
    pub technical_code: ReturnCode,
    pub bank_code: Option<ReturnCode>,
    pub report_text: Option<String>,
    pub transaction_id: Option<String>,
    pub order_id: Option<String>,
}

impl ResponseCommon {
    pub fn parse(document: &XmlNode) -> Result<Self, EbicsError> {
        let header = document.one("header")?;
        let mutable = header.one("mutable")?;
        let technical_code = ReturnCode::lookup(mutable.one("ReturnCode")?.text())?;
        let report_text = mutable.opt("ReportText").map(|n| n.text().to_string());
        // Key-management responses ship an empty or absent static block.
        let transaction_id = header
            .opt("static")
            .and_then(|fixed| fixed.opt("TransactionID"))
            .map(|n| n.text().to_string());
        let body = document.one("body")?;
        let bank_code = match body.opt("ReturnCode") {
            Some(node) => Some(ReturnCode::lookup(node.text())?),
            None => None,
        };
        let order_id = mutable.opt("OrderID").map(|n| n.text().to_string());
        Ok(ResponseCommon {
            technical_code,
            bank_code,
            report_text,
            transaction_id,
            order_id,
        })
    }

    /// Promotes Error-class codes into the matching [`EbicsError`] kind.
    pub fn check(&self) -> Result<(), EbicsError> {
        if self.technical_code.severity() == Severity::Error {
            return Err(EbicsError::Technical(self.technical_code));
        }
        if let Some(bank_code) = self.bank_code {
            if bank_code.severity() == Severity::Error {
                return Err(EbicsError::BankTechnical(bank_code));
            }
        }
        Ok(())
    }
}

/// Bank-key digests block present in every business request header.
pub fn bank_pubkey_digests(bank: &BankKeys) -> XmlBuilder {
    let mut digests = XmlBuilder::new("BankPubKeyDigests");
    let auth_digest = crypto::public_key_digest(&bank.authentication);
    let enc_digest = crypto::public_key_digest(&bank.encryption);
    digests.el("Authentication", |auth| {
        auth.attr("Version", "X002")
            .attr("Algorithm", "http://www.w3.org/2001/04/xmlenc#sha256")
            .text(&to_base64(&auth_digest));
    });
    digests.el("Encryption", |enc| {
        enc.attr("Version", "E002")
            .attr("Algorithm", "http://www.w3.org/2001/04/xmlenc#sha256")
            .text(&to_base64(&enc_digest));
    });
    digests
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_key;
    use once_cell::sync::Lazy;

    static AUTH_KEY: Lazy<RsaPrivateKey> = Lazy::new(|| generate_key().unwrap());

    fn signed_sample() -> XmlBuilder {
        let root = request_root(EbicsVersion::H004, "ebicsResponse");
        let mut header = XmlBuilder::new("header");
        header.attr("authenticate", "true");
        header.el("static", |fixed| {
            fixed.leaf("TransactionID", "TX1");
        });
        header.el("mutable", |mutable| {
            mutable.leaf("TransactionPhase", "Initialisation");
            mutable.leaf("ReturnCode", "000000");
        });
        let mut body = XmlBuilder::new("body");
        body.el("ReturnCode", |code| {
            code.attr("authenticate", "true").text("000000");
        });
        assemble_signed(root, header, body, &AUTH_KEY)
    }

    #[test]
    fn response_signature_round_trip() {
        let document = XmlNode::parse(&signed_sample().to_document()).unwrap();
        verify_auth_signature(&document, &AUTH_KEY.to_public_key()).unwrap();
    }

    #[test]
    fn tampered_header_is_rejected() {
        let raw = String::from_utf8(signed_sample().to_document()).unwrap();
        let tampered = raw.replace("TX1", "TX2");
        let document = XmlNode::parse(tampered.as_bytes()).unwrap();
        assert!(verify_auth_signature(&document, &AUTH_KEY.to_public_key()).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let document = XmlNode::parse(&signed_sample().to_document()).unwrap();
        let other = generate_key().unwrap().to_public_key();
        assert!(verify_auth_signature(&document, &other).is_err());
    }

    #[test]
    fn response_common_extracts_codes() {
        let document = XmlNode::parse(&signed_sample().to_document()).unwrap();
        let common = ResponseCommon::parse(&document).unwrap();
        assert!(common.technical_code.is_ok());
        assert_eq!(common.bank_code, Some(ReturnCode::Ok));
        assert_eq!(common.transaction_id, Some("TX1".to_string()));
        common.check().unwrap();
    }

    #[test]
    fn error_codes_map_to_kinds() {
        let common = ResponseCommon {
            technical_code: ReturnCode::Ok,
            bank_code: Some(ReturnCode::AuthorisationOrderTypeFailed),
            report_text: None,
            transaction_id: None,
            order_id: None,
        };
        assert!(matches!(
            common.check(),
            Err(EbicsError::BankTechnical(_))
        ));

        let common = ResponseCommon {
            technical_code: ReturnCode::AuthenticationFailed,
            bank_code: None,
            report_text: None,
            transaction_id: None,
            order_id: None,
        };
        assert!(matches!(common.check(), Err(EbicsError::Technical(_))));
    }
}
