//! Order catalog: which EBICS order fetches or submits which document.
//!
//! EBICS 2.5 (H004) names orders with a three-letter type plus a five-letter
//! attribute; EBICS 3.0 (H005) replaces that with a BTF service descriptor.
//! Banks bind logical documents to these orders differently, so the concrete
//! parameters hang off a [`Dialect`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// EBICS schema generation in use for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EbicsVersion {
    H004,
    H005,
}

impl EbicsVersion {
    pub fn namespace(&self) -> &'static str {
        match self {
            EbicsVersion::H004 => "urn:org:ebics:H004",
            EbicsVersion::H005 => "urn:org:ebics:H005",
        }
    }

    /// The `Version` attribute and protocol revision of request roots.
    pub fn label(&self) -> &'static str {
        match self {
            EbicsVersion::H004 => "H004",
            EbicsVersion::H005 => "H005",
        }
    }
}

/// Logical document kinds moved through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Document {
    /// pain.002 payment acknowledgements.
    Acknowledgement,
    /// camt.052 intraday account reports.
    Report,
    /// camt.053 end-of-period statements.
    Statement,
    /// camt.054 debit/credit notifications.
    Notification,
}

impl Document {
    pub const ALL: [Document; 4] = [
        Document::Acknowledgement,
        Document::Report,
        Document::Statement,
        Document::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Document::Acknowledgement => "acknowledgement",
            Document::Report => "report",
            Document::Statement => "statement",
            Document::Notification => "notification",
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete order parameters, split by schema generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderParams {
    /// `(type, attribute)`, e.g. `(Z53, DZHNN)`.
    H004 {
        order_type: &'static str,
        attribute: &'static str,
    },
    /// BTF descriptor, e.g. `(BTD, EOP, CH, camt.053, 08, ZIP)`.
    H005 {
        btf: BtfKind,
        service_name: &'static str,
        scope: &'static str,
        message_name: &'static str,
        message_version: Option<&'static str>,
        container: Option<&'static str>,
        option: Option<&'static str>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtfKind {
    /// Business Transaction Download.
    Btd,
    /// Business Transaction Upload.
    Btu,
}

impl BtfKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BtfKind::Btd => "BTD",
            BtfKind::Btu => "BTU",
        }
    }
}

impl OrderParams {
    pub fn version(&self) -> EbicsVersion {
        match self {
            OrderParams::H004 { .. } => EbicsVersion::H004,
            OrderParams::H005 { .. } => EbicsVersion::H005,
        }
    }

    /// Whether the delivered payload arrives as a ZIP container rather than
    /// a bare document.
    pub fn zip_container(&self) -> bool {
        match self {
            // EBICS 2.5 download orders of both supported banks ship ZIPs.
            OrderParams::H004 { .. } => true,
            OrderParams::H005 { container, .. } => *container == Some("ZIP"),
        }
    }
}

impl fmt::Display for OrderParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderParams::H004 {
                order_type,
                attribute,
            } => write!(f, "{order_type}/{attribute}"),
            OrderParams::H005 {
                btf,
                service_name,
                scope,
                message_name,
                message_version,
                container,
                option,
            } => {
                write!(f, "{}/{service_name}/{scope}/{message_name}", btf.as_str())?;
                if let Some(version) = message_version {
                    write!(f, ".{version}")?;
                }
                if let Some(container) = container {
                    write!(f, "/{container}")?;
                }
                if let Some(option) = option {
                    write!(f, "/{option}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("dialect {dialect} has no {version:?} order for {document}")]
pub struct UnsupportedOrder {
    pub dialect: Dialect,
    pub document: Document,
    pub version: EbicsVersion,
}

/// Bank-specific binding of logical documents to concrete orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Swiss PostFinance: downloads over EBICS 2.5, uploads over 3.0.
    Postfinance,
    /// German GLS: EBICS 3.0 throughout, DE scope.
    Gls,
}

impl Dialect {
    /// The schema generation this dialect fetches documents with.
    pub fn download_version(&self) -> EbicsVersion {
        match self {
            Dialect::Postfinance => EbicsVersion::H004,
            Dialect::Gls => EbicsVersion::H005,
        }
    }

    pub fn download_order(
        &self,
        document: Document,
        version: EbicsVersion,
    ) -> Result<OrderParams, UnsupportedOrder> {
        let unsupported = || UnsupportedOrder {
            dialect: *self,
            document,
            version,
        };
        match (self, version) {
            (Dialect::Postfinance, EbicsVersion::H004) => {
                let order_type = match document {
                    Document::Acknowledgement => "Z01",
                    Document::Report => "Z52",
                    Document::Statement => "Z53",
                    Document::Notification => "Z54",
                };
                Ok(OrderParams::H004 {
                    order_type,
                    attribute: "DZHNN",
                })
            }
            (Dialect::Postfinance, EbicsVersion::H005) => {
                let (service_name, message_name, message_version) = match document {
                    Document::Acknowledgement => ("PSR", "pain.002", "10"),
                    Document::Report => ("STM", "camt.052", "08"),
                    Document::Statement => ("EOP", "camt.053", "08"),
                    Document::Notification => ("REP", "camt.054", "08"),
                };
                Ok(OrderParams::H005 {
                    btf: BtfKind::Btd,
                    service_name,
                    scope: "CH",
                    message_name,
                    message_version: Some(message_version),
                    container: Some("ZIP"),
                    option: None,
                })
            }
            (Dialect::Gls, EbicsVersion::H005) => {
                let (service_name, message_name, message_version, option) = match document {
                    Document::Acknowledgement => ("PSR", "pain.002", "10", Some("SCT")),
                    Document::Report => ("STM", "camt.052", "08", None),
                    Document::Statement => ("EOP", "camt.053", "08", None),
                    Document::Notification => ("REP", "camt.054", "08", Some("SCI")),
                };
                Ok(OrderParams::H005 {
                    btf: BtfKind::Btd,
                    service_name,
                    scope: "DE",
                    message_name,
                    message_version: Some(message_version),
                    container: Some("ZIP"),
                    option,
                })
            }
            (Dialect::Gls, EbicsVersion::H004) => Err(unsupported()),
        }
    }

    /// pain.001 submission order. Both supported banks take uploads over
    /// EBICS 3.0 regardless of their download generation.
    pub fn upload_order(&self) -> OrderParams {
        match self {
            Dialect::Postfinance => OrderParams::H005 {
                btf: BtfKind::Btu,
                service_name: "MCT",
                scope: "CH",
                message_name: "pain.001",
                message_version: Some("09"),
                container: None,
                option: None,
            },
            Dialect::Gls => OrderParams::H005 {
                btf: BtfKind::Btu,
                service_name: "SCT",
                scope: "DE",
                message_name: "pain.001",
                message_version: None,
                container: None,
                option: None,
            },
        }
    }

    /// The pain.001 schema revision this dialect's bank expects.
    pub fn pain001_version(&self) -> &'static str {
        "09"
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postfinance => f.write_str("postfinance"),
            Dialect::Gls => f.write_str("gls"),
        }
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postfinance" => Ok(Dialect::Postfinance),
            "gls" => Ok(Dialect::Gls),
            other => Err(format!("unknown bank dialect '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postfinance_downloads_are_h004() {
        let order = Dialect::Postfinance
            .download_order(Document::Statement, EbicsVersion::H004)
            .unwrap();
        assert_eq!(
            order,
            OrderParams::H004 {
                order_type: "Z53",
                attribute: "DZHNN"
            }
        );
        assert!(order.zip_container());
    }

    #[test]
    fn postfinance_also_speaks_h005_btd() {
        let order = Dialect::Postfinance
            .download_order(Document::Statement, EbicsVersion::H005)
            .unwrap();
        match order {
            OrderParams::H005 {
                btf,
                service_name,
                scope,
                message_name,
                ..
            } => {
                assert_eq!(btf, BtfKind::Btd);
                assert_eq!(service_name, "EOP");
                assert_eq!(scope, "CH");
                assert_eq!(message_name, "camt.053");
            }
            other => panic!("expected H005 order, got {other}"),
        }
    }

    #[test]
    fn gls_rejects_h004() {
        assert!(Dialect::Gls
            .download_order(Document::Report, EbicsVersion::H004)
            .is_err());
        assert_eq!(Dialect::Gls.download_version(), EbicsVersion::H005);
    }

    #[test]
    fn gls_notification_carries_sci_option() {
        let order = Dialect::Gls
            .download_order(Document::Notification, EbicsVersion::H005)
            .unwrap();
        match order {
            OrderParams::H005 { scope, option, .. } => {
                assert_eq!(scope, "DE");
                assert_eq!(option, Some("SCI"));
            }
            other => panic!("expected H005 order, got {other}"),
        }
    }

    #[test]
    fn uploads_are_btu_for_both_dialects() {
        for dialect in [Dialect::Postfinance, Dialect::Gls] {
            match dialect.upload_order() {
                OrderParams::H005 {
                    btf, message_name, ..
                } => {
                    assert_eq!(btf, BtfKind::Btu);
                    assert_eq!(message_name, "pain.001");
                }
                other => panic!("expected H005 upload order, got {other}"),
            }
        }
    }

    #[test]
    fn dialect_parses_config_values() {
        assert_eq!("postfinance".parse::<Dialect>().unwrap(), Dialect::Postfinance);
        assert_eq!("gls".parse::<Dialect>().unwrap(), Dialect::Gls);
        assert!("sparkasse".parse::<Dialect>().is_err());
    }
}
