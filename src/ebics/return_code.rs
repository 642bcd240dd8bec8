//! The closed set of EBICS return codes this gateway understands.
//!
//! Every response carries up to two codes: the *technical* code in the
//! header (transport and session health) and the *bank-technical* code in
//! the body (business processing). Both draw from the same table. The
//! leading two digits classify severity; everything in the `06`/`09` range
//! aborts the running transaction.

use std::fmt;

#[derive(thiserror::Error, Debug)]
#[error("unknown EBICS return code '{0}'")]
pub struct UnknownReturnCode(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Information,
    Note,
    Warning,
    Error,
}

macro_rules! return_codes {
    ($(($variant:ident, $code:literal, $symbol:literal),)+) => {
        /// One entry of the EBICS return-code table.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum ReturnCode {
            $($variant,)+
        }

        impl ReturnCode {
            /// Looks up a six-digit wire code. Unknown codes are an error:
            /// guessing at semantics of a code we never classified is worse
            /// than failing the transaction.
            pub fn lookup(code: &str) -> Result<Self, UnknownReturnCode> {
                match code {
                    $($code => Ok(ReturnCode::$variant),)+
                    other => Err(UnknownReturnCode(other.to_string())),
                }
            }

            pub fn code(&self) -> &'static str {
                match self {
                    $(ReturnCode::$variant => $code,)+
                }
            }

            pub fn symbol(&self) -> &'static str {
                match self {
                    $(ReturnCode::$variant => $symbol,)+
                }
            }
        }
    };
}

return_codes! {
    (Ok, "000000", "EBICS_OK"),
    (DownloadPostprocessDone, "011000", "EBICS_DOWNLOAD_POSTPROCESS_DONE"),
    (DownloadPostprocessSkipped, "011001", "EBICS_DOWNLOAD_POSTPROCESS_SKIPPED"),
    (TxSegmentNumberUnderrun, "011101", "EBICS_TX_SEGMENT_NUMBER_UNDERRUN"),
    (OrderParamsIgnored, "031001", "EBICS_ORDER_PARAMS_IGNORED"),
    (AuthenticationFailed, "061001", "EBICS_AUTHENTICATION_FAILED"),
    (InvalidRequest, "061002", "EBICS_INVALID_REQUEST"),
    (InternalError, "061099", "EBICS_INTERNAL_ERROR"),
    (TxRecoverySync, "061101", "EBICS_TX_RECOVERY_SYNC"),
    (InvalidUserOrUserState, "091002", "EBICS_INVALID_USER_OR_USER_STATE"),
    (UserUnknown, "091003", "EBICS_USER_UNKNOWN"),
    (InvalidUserState, "091004", "EBICS_INVALID_USER_STATE"),
    (InvalidOrderType, "091005", "EBICS_INVALID_ORDER_TYPE"),
    (UnsupportedOrderType, "091006", "EBICS_UNSUPPORTED_ORDER_TYPE"),
    (DistributedSignatureAuthorisationFailed, "091007", "EBICS_DISTRIBUTED_SIGNATURE_AUTHORISATION_FAILED"),
    (BankPubkeyUpdateRequired, "091008", "EBICS_BANK_PUBKEY_UPDATE_REQUIRED"),
    (SegmentSizeExceeded, "091009", "EBICS_SEGMENT_SIZE_EXCEEDED"),
    (InvalidXml, "091010", "EBICS_INVALID_XML"),
    (InvalidHostId, "091011", "EBICS_INVALID_HOST_ID"),
    (TxUnknownTxid, "091101", "EBICS_TX_UNKNOWN_TXID"),
    (TxAbort, "091102", "EBICS_TX_ABORT"),
    (TxMessageReplay, "091103", "EBICS_TX_MESSAGE_REPLAY"),
    (TxSegmentNumberExceeded, "091104", "EBICS_TX_SEGMENT_NUMBER_EXCEEDED"),
    (InvalidOrderParams, "091112", "EBICS_INVALID_ORDER_PARAMS"),
    (InvalidRequestContent, "091113", "EBICS_INVALID_REQUEST_CONTENT"),
    (MaxOrderDataSizeExceeded, "091117", "EBICS_MAX_ORDER_DATA_SIZE_EXCEEDED"),
    (MaxSegmentsExceeded, "091118", "EBICS_MAX_SEGMENTS_EXCEEDED"),
    (MaxTransactionsExceeded, "091119", "EBICS_MAX_TRANSACTIONS_EXCEEDED"),
    (PartnerIdMismatch, "091120", "EBICS_PARTNER_ID_MISMATCH"),
    (IncompatibleOrderAttribute, "091121", "EBICS_INCOMPATIBLE_ORDER_ATTRIBUTE"),
    (OrderAlreadyExists, "091122", "EBICS_ORDER_ALREADY_EXISTS"),
    (AuthorisationOrderTypeFailed, "090003", "EBICS_AUTHORISATION_ORDER_TYPE_FAILED"),
    (InvalidOrderDataFormat, "090004", "EBICS_INVALID_ORDER_DATA_FORMAT"),
    (NoDownloadDataAvailable, "090005", "EBICS_NO_DOWNLOAD_DATA_AVAILABLE"),
    (UnsupportedRequestForOrderInstance, "090006", "EBICS_UNSUPPORTED_REQUEST_FOR_ORDER_INSTANCE"),
    (KeymgmtUnsupportedVersionSignature, "091201", "EBICS_KEYMGMT_UNSUPPORTED_VERSION_SIGNATURE"),
    (KeymgmtUnsupportedVersionAuthentication, "091202", "EBICS_KEYMGMT_UNSUPPORTED_VERSION_AUTHENTICATION"),
    (KeymgmtUnsupportedVersionEncryption, "091203", "EBICS_KEYMGMT_UNSUPPORTED_VERSION_ENCRYPTION"),
    (KeymgmtKeylengthErrorSignature, "091204", "EBICS_KEYMGMT_KEYLENGTH_ERROR_SIGNATURE"),
    (KeymgmtKeylengthErrorAuthentication, "091205", "EBICS_KEYMGMT_KEYLENGTH_ERROR_AUTHENTICATION"),
    (KeymgmtKeylengthErrorEncryption, "091206", "EBICS_KEYMGMT_KEYLENGTH_ERROR_ENCRYPTION"),
    (KeymgmtNoX509Support, "091207", "EBICS_KEYMGMT_NO_X509_SUPPORT"),
    (X509CertificateExpired, "091208", "EBICS_X509_CERTIFICATE_EXPIRED"),
    (X509CertificateNotValidYet, "091209", "EBICS_X509_CERTIFICATE_NOT_VALID_YET"),
    (SignerUnknown, "091301", "EBICS_SIGNER_UNKNOWN"),
    (InvalidSignerState, "091302", "EBICS_INVALID_SIGNER_STATE"),
    (DuplicateSignature, "091303", "EBICS_DUPLICATE_SIGNATURE"),
}

impl ReturnCode {
    pub fn severity(&self) -> Severity {
        match &self.code()[..2] {
            "00" => Severity::Information,
            "01" => Severity::Note,
            "03" => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == ReturnCode::Ok
    }

    /// Codes worth retrying on a later tick rather than parking the payment
    /// as permanently failed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReturnCode::InternalError
                | ReturnCode::TxRecoverySync
                | ReturnCode::MaxTransactionsExceeded
        )
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.symbol())
    }
}
