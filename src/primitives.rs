//! Domain primitives shared across the gateway.
//!
//! The key objects are [`Amount`] (a currency-tagged fixed-point pair),
//! [`IbanPayto`] (an RFC 8905 `payto://iban/` address), and [`ReservePub`]
//! (a 32-byte reserve public key embedded in transfer subjects).
//!
//! All of them validate on construction and deserialization so the rest of
//! the crate never sees a malformed value.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;
use url::Url;

/// Number of fractional units in one currency unit.
pub const FRACTION_BASE: u32 = 100_000_000;

/// Maximum value part of an [`Amount`], mirroring the wire-format bound of
/// `2^52` used by the upstream payment processor.
pub const MAX_AMOUNT_VALUE: i64 = 1 << 52;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount format: {0}")]
    Malformed(String),
    #[error("currency mismatch: {actual} where {expected} was required")]
    CurrencyMismatch { expected: String, actual: String },
    #[error("amount overflows the allowed range")]
    Overflow,
}

/// A non-negative monetary amount: integer units plus `1e-8` fractional
/// units, tagged with an ISO 4217 currency code.
///
/// Wire format is `CUR:units.fraction`, e.g. `CHF:10.5` or `EUR:0.00000001`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Amount {
    currency: String,
    value: i64,
    frac: u32,
}

static CURRENCY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{1,11}$").expect("invalid currency regex"));

impl Amount {
    pub fn new(currency: &str, value: i64, frac: u32) -> Result<Self, AmountError> {
        if !CURRENCY_REGEX.is_match(currency) {
            return Err(AmountError::Malformed(format!(
                "bad currency '{currency}'"
            )));
        }
        if value < 0 || value > MAX_AMOUNT_VALUE || frac >= FRACTION_BASE {
            return Err(AmountError::Overflow);
        }
        Ok(Amount {
            currency: currency.to_string(),
            value,
            frac,
        })
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn frac(&self) -> u32 {
        self.frac
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0 && self.frac == 0
    }

    /// Parses a bank-side decimal such as `10.00`, attaching `currency`.
    /// camt amounts carry at most five fractional digits; anything beyond
    /// eight is rejected rather than rounded.
    pub fn from_bank_decimal(decimal: &str, currency: &str) -> Result<Self, AmountError> {
        let (units, frac) = parse_decimal(decimal)?;
        Amount::new(currency, units, frac)
    }

    /// Checked subtraction, used to deduct the bounce fee. Returns zero in
    /// `self.currency` when the fee exceeds the amount.
    pub fn saturating_sub(&self, fee: &Amount) -> Result<Amount, AmountError> {
        if self.currency != fee.currency {
            return Err(AmountError::CurrencyMismatch {
                expected: self.currency.clone(),
                actual: fee.currency.clone(),
            });
        }
        let total = self.value as i128 * FRACTION_BASE as i128 + self.frac as i128;
        let sub = fee.value as i128 * FRACTION_BASE as i128 + fee.frac as i128;
        let rest = (total - sub).max(0);
        Amount::new(
            &self.currency,
            (rest / FRACTION_BASE as i128) as i64,
            (rest % FRACTION_BASE as i128) as u32,
        )
    }

    /// Renders the fractional part the way ISO 20022 amounts expect:
    /// a plain decimal with trailing zeros stripped, at most 8 digits.
    pub fn to_bank_decimal(&self) -> String {
        if self.frac == 0 {
            format!("{}", self.value)
        } else {
            let mut frac = format!("{:08}", self.frac);
            while frac.ends_with('0') {
                frac.pop();
            }
            format!("{}.{}", self.value, frac)
        }
    }
}

fn parse_decimal(s: &str) -> Result<(i64, u32), AmountError> {
    let malformed = || AmountError::Malformed(s.to_string());
    let (units_str, frac_str) = match s.split_once('.') {
        Some((u, f)) => (u, Some(f)),
        None => (s, None),
    };
    if units_str.is_empty() || !units_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let units: i64 = units_str.parse().map_err(|_| AmountError::Overflow)?;
    let frac = match frac_str {
        None => 0,
        Some(f) => {
            if f.is_empty() || f.len() > 8 || !f.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            let digits: u32 = f.parse().map_err(|_| malformed())?;
            digits * 10u32.pow(8 - f.len() as u32)
        }
    };
    Ok((units, frac))
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (currency, rest) = s
            .split_once(':')
            .ok_or_else(|| AmountError::Malformed(s.to_string()))?;
        let (units, frac) = parse_decimal(rest)?;
        Amount::new(currency, units, frac)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.currency, self.to_bank_decimal())
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PaytoError {
    #[error("invalid payto URI: {0}")]
    Malformed(String),
    #[error("payto URI is missing the receiver-name parameter")]
    MissingReceiverName,
}

/// An `payto://iban/` address. The IBAN is normalized to uppercase with
/// spaces removed; the receiver name travels as the `receiver-name` query
/// parameter and is mandatory wherever the address names a creditor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbanPayto {
    iban: String,
    bic: Option<String>,
    receiver_name: Option<String>,
}

static IBAN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2}[0-9]{2}[A-Z0-9]{10,30}$").expect("invalid IBAN regex"));

impl IbanPayto {
    pub fn new(iban: &str) -> Result<Self, PaytoError> {
        let normalized: String = iban
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if !IBAN_REGEX.is_match(&normalized) {
            return Err(PaytoError::Malformed(format!("bad IBAN '{iban}'")));
        }
        Ok(IbanPayto {
            iban: normalized,
            bic: None,
            receiver_name: None,
        })
    }

    pub fn with_receiver_name(mut self, name: &str) -> Self {
        self.receiver_name = Some(name.to_string());
        self
    }

    pub fn with_bic(mut self, bic: &str) -> Self {
        self.bic = Some(bic.to_string());
        self
    }

    pub fn iban(&self) -> &str {
        &self.iban
    }

    pub fn bic(&self) -> Option<&str> {
        self.bic.as_deref()
    }

    pub fn receiver_name(&self) -> Option<&str> {
        self.receiver_name.as_deref()
    }

    /// Fails unless the address carries a receiver name, which creditor
    /// addresses on initiated payments must.
    pub fn require_receiver_name(&self) -> Result<&str, PaytoError> {
        self.receiver_name
            .as_deref()
            .ok_or(PaytoError::MissingReceiverName)
    }
}

impl FromStr for IbanPayto {
    type Err = PaytoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| PaytoError::Malformed(e.to_string()))?;
        if url.scheme() != "payto" {
            return Err(PaytoError::Malformed(format!(
                "expected payto:// scheme in '{s}'"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| PaytoError::Malformed(s.to_string()))?;
        if host != "iban" {
            return Err(PaytoError::Malformed(format!(
                "unsupported payto target '{host}'"
            )));
        }
        // Path is either /IBAN or /BIC/IBAN.
        let segments: Vec<&str> = url.path().trim_start_matches('/').split('/').collect();
        let (bic, iban) = match segments.as_slice() {
            [iban] => (None, *iban),
            [bic, iban] => (Some((*bic).to_string()), *iban),
            _ => return Err(PaytoError::Malformed(s.to_string())),
        };
        let mut payto = IbanPayto::new(iban)?;
        payto.bic = bic;
        for (key, value) in url.query_pairs() {
            if key == "receiver-name" {
                payto.receiver_name = Some(value.into_owned());
            }
        }
        Ok(payto)
    }
}

impl Display for IbanPayto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bic {
            Some(bic) => write!(f, "payto://iban/{}/{}", bic, self.iban)?,
            None => write!(f, "payto://iban/{}", self.iban)?,
        }
        if let Some(name) = &self.receiver_name {
            let encoded: String =
                url::form_urlencoded::byte_serialize(name.as_bytes()).collect();
            write!(f, "?receiver-name={encoded}")?;
        }
        Ok(())
    }
}

impl Serialize for IbanPayto {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IbanPayto {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

/// A 32-byte reserve public key, transported in transfer subjects as 52
/// characters of Crockford base32.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservePub(pub [u8; 32]);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ReservePubError {
    #[error("reserve public key must be 52 base32 characters")]
    BadLength,
    #[error("invalid base32 character {0:?}")]
    BadCharacter(char),
}

impl ReservePub {
    /// Decodes the 52-character Crockford alphabet used by the upstream
    /// processor: `0-9 A-Z` without `I L O U`, case-insensitive, with
    /// `i`/`l` read as `1`, `o` as `0` and `u` as `v`.
    pub fn decode(token: &str) -> Result<Self, ReservePubError> {
        if token.len() != 52 {
            return Err(ReservePubError::BadLength);
        }
        let mut out = [0u8; 32];
        let mut acc: u64 = 0;
        let mut bits: u32 = 0;
        let mut pos = 0;
        for c in token.chars() {
            let value = crockford_value(c).ok_or(ReservePubError::BadCharacter(c))?;
            acc = (acc << 5) | value as u64;
            bits += 5;
            while bits >= 8 {
                bits -= 8;
                if pos < 32 {
                    out[pos] = (acc >> bits) as u8;
                    pos += 1;
                }
            }
        }
        Ok(ReservePub(out))
    }

    pub fn encode(&self) -> String {
        const ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
        let mut out = String::with_capacity(52);
        let mut acc: u64 = 0;
        let mut bits: u32 = 0;
        for &byte in &self.0 {
            acc = (acc << 8) | byte as u64;
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out.push(ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
            }
        }
        if bits > 0 {
            out.push(ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
        }
        out
    }

    /// Scans a wire-transfer subject for an embedded reserve public key.
    /// Tokens are delimited by anything outside the base32 alphabet; the
    /// first 52-character token that decodes wins.
    pub fn find_in_subject(subject: &str) -> Option<Self> {
        subject
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|token| token.len() == 52)
            .find_map(|token| ReservePub::decode(token).ok())
    }
}

fn crockford_value(c: char) -> Option<u8> {
    match c.to_ascii_uppercase() {
        '0' | 'O' => Some(0),
        '1' | 'I' | 'L' => Some(1),
        '2'..='9' => Some(c as u8 - b'0'),
        'A'..='H' => Some(c.to_ascii_uppercase() as u8 - b'A' + 10),
        'J' | 'K' => Some(c.to_ascii_uppercase() as u8 - b'A' + 9),
        'M' | 'N' => Some(c.to_ascii_uppercase() as u8 - b'A' + 8),
        'P'..='T' => Some(c.to_ascii_uppercase() as u8 - b'A' + 7),
        'U' | 'V' => Some(27),
        'W'..='Z' => Some(c.to_ascii_uppercase() as u8 - b'A' + 6),
        _ => None,
    }
}

impl fmt::Debug for ReservePub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReservePub({})", self.encode())
    }
}

impl Display for ReservePub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("timestamp predates the Unix epoch")]
pub struct NegativeTimestamp;

/// Converts to the microsecond-epoch representation the database uses.
/// Pre-1970 instants are rejected instead of being stored as negative rows.
pub fn to_unix_micros(ts: chrono::DateTime<chrono::Utc>) -> Result<i64, NegativeTimestamp> {
    let micros = ts.timestamp_micros();
    if micros < 0 {
        return Err(NegativeTimestamp);
    }
    Ok(micros)
}

pub fn from_unix_micros(micros: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_micros(micros)
}
