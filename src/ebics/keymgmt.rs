//! Subscriber key initialisation: INI, HIA and HPB.
//!
//! Three single-shot flows against a blank subscriber. INI submits the
//! signature public key, HIA the authentication and encryption keys; both
//! travel unsigned because the bank cannot verify anything yet. HPB is the
//! first signed request and returns the bank's own key pair, encrypted
//! under the just-submitted client encryption key.

use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::instrument;

use crate::crypto;
use crate::keys::BankKeys;
use crate::xml::{self, XmlBuilder, XmlNode};

use super::order::EbicsVersion;
use super::return_code::Severity;
use super::{
    assemble_signed, request_root, utc_timestamp, BankConnection, EbicsError, EbicsSession,
    ResponseCommon, XMLDSIG_NS,
};

/// Which unsigned key-submission flow is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFlow {
    Ini,
    Hia,
}

impl KeyFlow {
    fn order_type(&self) -> &'static str {
        match self {
            KeyFlow::Ini => "INI",
            KeyFlow::Hia => "HIA",
        }
    }
}

/// Sends the INI order carrying the signature public key.
#[instrument(skip_all, err, fields(host = %session.host_id))]
pub async fn submit_ini(
    connection: &dyn BankConnection,
    session: &EbicsSession,
) -> Result<(), EbicsError> {
    let version = session.dialect.download_version();
    let order_data = ini_order_data(session, version)?;
    submit_key_flow(connection, session, version, KeyFlow::Ini, &order_data).await
}

/// Sends the HIA order carrying the authentication and encryption keys.
#[instrument(skip_all, err, fields(host = %session.host_id))]
pub async fn submit_hia(
    connection: &dyn BankConnection,
    session: &EbicsSession,
) -> Result<(), EbicsError> {
    let version = session.dialect.download_version();
    let order_data = hia_order_data(session, version)?;
    submit_key_flow(connection, session, version, KeyFlow::Hia, &order_data).await
}

async fn submit_key_flow(
    connection: &dyn BankConnection,
    session: &EbicsSession,
    version: EbicsVersion,
    flow: KeyFlow,
    order_data: &[u8],
) -> Result<(), EbicsError> {
    let request = unsecured_request(session, version, flow, order_data);
    let response = connection.post(request.to_document()).await?;
    let document = XmlNode::parse(&response)?;
    let common = ResponseCommon::parse(&document)?;
    reject_on_error(&common)?;
    tracing::info!(flow = flow.order_type(), "key submission accepted");
    Ok(())
}

/// Runs HPB and returns the bank key pair, not yet accepted.
#[instrument(skip_all, err, fields(host = %session.host_id))]
pub async fn fetch_bank_keys(
    connection: &dyn BankConnection,
    session: &EbicsSession,
) -> Result<BankKeys, EbicsError> {
    let version = session.dialect.download_version();
    let request = hpb_request(session, version);
    let response = connection.post(request.to_document()).await?;
    let document = XmlNode::parse(&response)?;
    let common = ResponseCommon::parse(&document)?;
    reject_on_error(&common)?;

    let data_transfer = document.one("body")?.one("DataTransfer")?;
    let wrapped_key = data_transfer
        .one("DataEncryptionInfo")?
        .one("TransactionKey")?
        .text_base64()?;
    let ciphertext = data_transfer.one("OrderData")?.text_base64()?;
    let deflated = crypto::e002_decrypt(&session.client_keys.encryption, &wrapped_key, &ciphertext)?;
    let order_data = xml::inflate(&deflated)?;
    let (authentication, encryption) = parse_hpb_order_data(&order_data)?;
    tracing::info!(
        auth_digest = %hex::encode(crypto::public_key_digest(&authentication)),
        enc_digest = %hex::encode(crypto::public_key_digest(&encryption)),
        "bank keys received, pending operator acceptance"
    );
    Ok(BankKeys {
        authentication,
        encryption,
        accepted: false,
    })
}

fn reject_on_error(common: &ResponseCommon) -> Result<(), EbicsError> {
    if common.technical_code.severity() == Severity::Error {
        return Err(EbicsError::KeyMgmtRejected(common.technical_code));
    }
    if let Some(bank_code) = common.bank_code {
        if bank_code.severity() == Severity::Error {
            return Err(EbicsError::KeyMgmtRejected(bank_code));
        }
    }
    Ok(())
}

fn unsecured_request(
    session: &EbicsSession,
    version: EbicsVersion,
    flow: KeyFlow,
    order_data: &[u8],
) -> XmlBuilder {
    let mut root = request_root(version, "ebicsUnsecuredRequest");
    root.el("header", |header| {
        header.attr("authenticate", "true");
        header.el("static", |fixed| {
            fixed.leaf("HostID", &session.host_id);
            fixed.leaf("PartnerID", &session.partner_id);
            fixed.leaf("UserID", &session.user_id);
            fixed.el("OrderDetails", |details| {
                match version {
                    EbicsVersion::H004 => {
                        details.leaf("OrderType", flow.order_type());
                        details.leaf("OrderAttribute", "DZNNN");
                    }
                    EbicsVersion::H005 => {
                        details.leaf("AdminOrderType", flow.order_type());
                    }
                };
            });
            fixed.leaf("SecurityMedium", "0200");
        });
        header.empty("mutable");
    });
    root.el("body", |body| {
        body.el("DataTransfer", |transfer| {
            transfer.leaf_base64("OrderData", &xml::deflate(order_data));
        });
    });
    root
}

fn hpb_request(session: &EbicsSession, version: EbicsVersion) -> XmlBuilder {
    let root = request_root(version, "ebicsNoPubKeyDigestsRequest");
    let mut header = XmlBuilder::new("header");
    header.attr("authenticate", "true");
    header.el("static", |fixed| {
        fixed.leaf("HostID", &session.host_id);
        fixed.leaf("Nonce", &crypto::fresh_nonce());
        fixed.leaf("Timestamp", &utc_timestamp(chrono::Utc::now()));
        fixed.leaf("PartnerID", &session.partner_id);
        fixed.leaf("UserID", &session.user_id);
        fixed.el("OrderDetails", |details| {
            match version {
                EbicsVersion::H004 => {
                    details.leaf("OrderType", "HPB");
                    details.leaf("OrderAttribute", "DZHNN");
                }
                EbicsVersion::H005 => {
                    details.leaf("AdminOrderType", "HPB");
                }
            };
        });
        fixed.leaf("SecurityMedium", "0000");
    });
    header.empty("mutable");
    let body = XmlBuilder::new("body");
    assemble_signed(root, header, body, &session.client_keys.authentication)
}

/// The INI order data: the signature key, as `RSAKeyValue` under H004 and
/// as a self-signed X.509 certificate under H005.
fn ini_order_data(session: &EbicsSession, version: EbicsVersion) -> Result<Vec<u8>, EbicsError> {
    let namespace = match version {
        EbicsVersion::H004 => "http://www.ebics.org/S001",
        EbicsVersion::H005 => "http://www.ebics.org/S002",
    };
    let mut root = XmlBuilder::new("SignaturePubKeyOrderData");
    root.ns(namespace).ns_prefix("ds", XMLDSIG_NS);
    let mut info = XmlBuilder::new("SignaturePubKeyInfo");
    attach_public_key(
        &mut info,
        version,
        &session.client_keys.signature,
        &session.user_id,
    )?;
    info.leaf("SignatureVersion", "A006");
    root.push(info);
    root.leaf("PartnerID", &session.partner_id);
    root.leaf("UserID", &session.user_id);
    Ok(root.to_document())
}

/// The HIA order data: authentication (X002) and encryption (E002) keys.
fn hia_order_data(session: &EbicsSession, version: EbicsVersion) -> Result<Vec<u8>, EbicsError> {
    let mut root = XmlBuilder::new("HIARequestOrderData");
    root.ns(version.namespace()).ns_prefix("ds", XMLDSIG_NS);
    let mut auth_info = XmlBuilder::new("AuthenticationPubKeyInfo");
    attach_public_key(
        &mut auth_info,
        version,
        &session.client_keys.authentication,
        &session.user_id,
    )?;
    auth_info.leaf("AuthenticationVersion", "X002");
    root.push(auth_info);
    let mut enc_info = XmlBuilder::new("EncryptionPubKeyInfo");
    attach_public_key(
        &mut enc_info,
        version,
        &session.client_keys.encryption,
        &session.user_id,
    )?;
    enc_info.leaf("EncryptionVersion", "E002");
    root.push(enc_info);
    root.leaf("PartnerID", &session.partner_id);
    root.leaf("UserID", &session.user_id);
    Ok(root.to_document())
}

fn attach_public_key(
    info: &mut XmlBuilder,
    version: EbicsVersion,
    key: &RsaPrivateKey,
    common_name: &str,
) -> Result<(), EbicsError> {
    match version {
        EbicsVersion::H004 => {
            let public = key.to_public_key();
            info.el("PubKeyValue", |value| {
                value.el("ds:RSAKeyValue", |rsa_value| {
                    rsa_value.leaf_base64("ds:Modulus", &public.n().to_bytes_be());
                    rsa_value.leaf_base64("ds:Exponent", &public.e().to_bytes_be());
                });
            });
        }
        EbicsVersion::H005 => {
            let certificate = crypto::self_signed_certificate(key, common_name)?;
            info.el("ds:X509Data", |x509| {
                x509.leaf_base64("ds:X509Certificate", &certificate);
            });
        }
    }
    Ok(())
}

/// Parses the decrypted HPB order data and checks the advertised algorithm
/// versions before trusting either key.
fn parse_hpb_order_data(bytes: &[u8]) -> Result<(RsaPublicKey, RsaPublicKey), EbicsError> {
    let root = XmlNode::parse(bytes)?;
    let auth_info = root.one("AuthenticationPubKeyInfo")?;
    let auth_version = auth_info.one("AuthenticationVersion")?.text();
    if auth_version != "X002" {
        return Err(EbicsError::Protocol(format!(
            "bank offered unsupported authentication version {auth_version}"
        )));
    }
    let enc_info = root.one("EncryptionPubKeyInfo")?;
    let enc_version = enc_info.one("EncryptionVersion")?.text();
    if enc_version != "E002" {
        return Err(EbicsError::Protocol(format!(
            "bank offered unsupported encryption version {enc_version}"
        )));
    }
    Ok((extract_public_key(auth_info)?, extract_public_key(enc_info)?))
}

fn extract_public_key(info: &XmlNode) -> Result<RsaPublicKey, EbicsError> {
    if let Some(x509) = info.opt("X509Data") {
        let der = x509.one("X509Certificate")?.text_base64()?;
        return Ok(crypto::public_key_from_certificate(&der)?);
    }
    let key_value = info.one("PubKeyValue")?.one("RSAKeyValue")?;
    let modulus = key_value.one("Modulus")?.text_base64()?;
    let exponent = key_value.one("Exponent")?.text_base64()?;
    Ok(crypto::public_key_from_components(&modulus, &exponent)?)
}

#[cfg(test)]
mod tests {
    use super::super::testing::ScriptedBank;
    use super::*;
    use crate::keys::ClientKeys;
    use crate::ebics::order::Dialect;
    use crate::ebics::return_code::ReturnCode;
    use once_cell::sync::Lazy;

    static CLIENT_KEYS: Lazy<ClientKeys> = Lazy::new(|| ClientKeys::generate().unwrap());

    fn session() -> EbicsSession {
        EbicsSession {
            host_id: "EBIXHOST".to_string(),
            partner_id: "PARTNER1".to_string(),
            user_id: "USER1".to_string(),
            dialect: Dialect::Postfinance,
            client_keys: CLIENT_KEYS.clone(),
            bank_keys: None,
        }
    }

    fn keymgmt_response(technical: &str, with_transfer: Option<(&[u8], &[u8])>) -> Vec<u8> {
        let mut root = XmlBuilder::new("ebicsKeyManagementResponse");
        root.ns("urn:org:ebics:H004").attr("Version", "H004");
        root.el("header", |header| {
            header.attr("authenticate", "true");
            header.empty("static");
            header.el("mutable", |mutable| {
                mutable.leaf("ReturnCode", technical);
                mutable.leaf("ReportText", "[EBICS_OK]");
            });
        });
        root.el("body", |body| {
            if let Some((wrapped_key, order_data)) = with_transfer {
                body.el("DataTransfer", |transfer| {
                    transfer.el("DataEncryptionInfo", |info| {
                        info.attr("authenticate", "true");
                        info.el("EncryptionPubKeyDigest", |digest| {
                            digest.attr("Version", "E002").text("");
                        });
                        info.leaf_base64("TransactionKey", wrapped_key);
                    });
                    transfer.leaf_base64("OrderData", order_data);
                });
            }
            body.el("ReturnCode", |code| {
                code.attr("authenticate", "true").text("000000");
            });
        });
        root.to_document()
    }

    #[tokio::test]
    async fn ini_tolerates_absent_data_transfer() {
        let bank = ScriptedBank::new(vec![keymgmt_response("000000", None)]);
        submit_ini(&bank, &session()).await.unwrap();

        let request = bank.request(0);
        assert_eq!(request.name, "ebicsUnsecuredRequest");
        let fixed = request.one("header").unwrap().one("static").unwrap();
        let details = fixed.one("OrderDetails").unwrap();
        assert_eq!(details.one("OrderType").unwrap().text(), "INI");
        assert_eq!(details.one("OrderAttribute").unwrap().text(), "DZNNN");
        assert_eq!(fixed.one("SecurityMedium").unwrap().text(), "0200");
    }

    #[tokio::test]
    async fn hia_carries_both_keys() {
        let bank = ScriptedBank::new(vec![keymgmt_response("000000", None)]);
        submit_hia(&bank, &session()).await.unwrap();

        let request = bank.request(0);
        let order_data = request
            .one("body")
            .unwrap()
            .one("DataTransfer")
            .unwrap()
            .one("OrderData")
            .unwrap()
            .text_base64()
            .unwrap();
        let inflated = xml::inflate(&order_data).unwrap();
        let parsed = XmlNode::parse(&inflated).unwrap();
        assert_eq!(parsed.name, "HIARequestOrderData");
        assert!(parsed.opt("AuthenticationPubKeyInfo").is_some());
        assert!(parsed.opt("EncryptionPubKeyInfo").is_some());
    }

    #[tokio::test]
    async fn rejected_flow_maps_to_keymgmt_error() {
        let bank = ScriptedBank::new(vec![keymgmt_response("091002", None)]);
        let err = submit_ini(&bank, &session()).await.unwrap_err();
        assert!(matches!(
            err,
            EbicsError::KeyMgmtRejected(ReturnCode::InvalidUserOrUserState)
        ));
    }

    #[tokio::test]
    async fn hpb_decrypts_and_validates_bank_keys() {
        let bank_auth = crypto::generate_key().unwrap();
        let bank_enc = crypto::generate_key().unwrap();

        let mut order_data = XmlBuilder::new("HPBResponseOrderData");
        order_data.ns("urn:org:ebics:H004").ns_prefix("ds", XMLDSIG_NS);
        for (name, key, version_tag, version) in [
            ("AuthenticationPubKeyInfo", &bank_auth, "AuthenticationVersion", "X002"),
            ("EncryptionPubKeyInfo", &bank_enc, "EncryptionVersion", "E002"),
        ] {
            let public = key.to_public_key();
            order_data.el(name, |info| {
                info.el("PubKeyValue", |value| {
                    value.el("ds:RSAKeyValue", |rsa_value| {
                        rsa_value.leaf_base64("ds:Modulus", &public.n().to_bytes_be());
                        rsa_value.leaf_base64("ds:Exponent", &public.e().to_bytes_be());
                    });
                });
                info.leaf(version_tag, version);
            });
        }
        order_data.leaf("HostID", "EBIXHOST");

        let session = session();
        let deflated = xml::deflate(&order_data.to_document());
        let envelope = crypto::e002_encrypt(
            &session.client_keys.encryption.to_public_key(),
            &deflated,
        )
        .unwrap();
        let bank = ScriptedBank::new(vec![keymgmt_response(
            "000000",
            Some((&envelope.wrapped_key, &envelope.ciphertext)),
        )]);

        let keys = fetch_bank_keys(&bank, &session).await.unwrap();
        assert!(!keys.accepted);
        assert_eq!(keys.authentication, bank_auth.to_public_key());
        assert_eq!(keys.encryption, bank_enc.to_public_key());

        let request = bank.request(0);
        assert_eq!(request.name, "ebicsNoPubKeyDigestsRequest");
        assert!(request.opt("AuthSignature").is_some());
    }

    #[tokio::test]
    async fn hpb_rejects_unknown_encryption_version() {
        let bank_key = crypto::generate_key().unwrap();
        let public = bank_key.to_public_key();
        let mut order_data = XmlBuilder::new("HPBResponseOrderData");
        for (name, version_tag, version) in [
            ("AuthenticationPubKeyInfo", "AuthenticationVersion", "X002"),
            ("EncryptionPubKeyInfo", "EncryptionVersion", "E001"),
        ] {
            order_data.el(name, |info| {
                info.el("PubKeyValue", |value| {
                    value.el("RSAKeyValue", |rsa_value| {
                        rsa_value.leaf_base64("Modulus", &public.n().to_bytes_be());
                        rsa_value.leaf_base64("Exponent", &public.e().to_bytes_be());
                    });
                });
                info.leaf(version_tag, version);
            });
        }

        let session = session();
        let deflated = xml::deflate(&order_data.to_document());
        let envelope = crypto::e002_encrypt(
            &session.client_keys.encryption.to_public_key(),
            &deflated,
        )
        .unwrap();
        let bank = ScriptedBank::new(vec![keymgmt_response(
            "000000",
            Some((&envelope.wrapped_key, &envelope.ciphertext)),
        )]);

        let err = fetch_bank_keys(&bank, &session).await.unwrap_err();
        assert!(matches!(err, EbicsError::Protocol(_)));
    }
}
