//! Subscriber key material on disk.
//!
//! Two JSON files live next to the configuration: `client_private_keys.json`
//! (the signature/authentication/encryption RSA triple plus per-flow
//! submission flags) and `bank_public_keys.json` (the bank authentication and
//! encryption keys plus the operator acceptance flag). The flags gate session
//! setup: business traffic requires `submitted_ini && submitted_hia` on the
//! client side and `accepted` on the bank side.

use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::crypto::{self, CryptoError};
use crate::xml::{from_base64, to_base64};

#[derive(thiserror::Error, Debug)]
pub enum KeysError {
    #[error("cannot access key file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("key file {path} is malformed: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("key material is invalid: {0}")]
    Crypto(#[from] CryptoError),
    #[error("key material is invalid: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("key material is invalid: {0}")]
    Pkcs1(#[from] rsa::pkcs1::Error),
}

/// The client RSA triple. Generated once by `ebics-setup`, never rotated in
/// place; INI and HIA submission is tracked per flow so an interrupted setup
/// resumes where it stopped.
#[derive(Clone)]
pub struct ClientKeys {
    pub signature: RsaPrivateKey,
    pub authentication: RsaPrivateKey,
    pub encryption: RsaPrivateKey,
    pub submitted_ini: bool,
    pub submitted_hia: bool,
}

#[derive(Serialize, Deserialize)]
struct ClientKeysFile {
    signature_private_key: String,
    authentication_private_key: String,
    encryption_private_key: String,
    submitted_ini: bool,
    submitted_hia: bool,
}

impl ClientKeys {
    pub fn generate() -> Result<Self, KeysError> {
        Ok(ClientKeys {
            signature: crypto::generate_key()?,
            authentication: crypto::generate_key()?,
            encryption: crypto::generate_key()?,
            submitted_ini: false,
            submitted_hia: false,
        })
    }

    pub fn submitted_both(&self) -> bool {
        self.submitted_ini && self.submitted_hia
    }

    pub fn load(path: &Path) -> Result<Self, KeysError> {
        let file: ClientKeysFile = read_json(path)?;
        Ok(ClientKeys {
            signature: private_from_b64(&file.signature_private_key)?,
            authentication: private_from_b64(&file.authentication_private_key)?,
            encryption: private_from_b64(&file.encryption_private_key)?,
            submitted_ini: file.submitted_ini,
            submitted_hia: file.submitted_hia,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), KeysError> {
        let file = ClientKeysFile {
            signature_private_key: private_to_b64(&self.signature)?,
            authentication_private_key: private_to_b64(&self.authentication)?,
            encryption_private_key: private_to_b64(&self.encryption)?,
            submitted_ini: self.submitted_ini,
            submitted_hia: self.submitted_hia,
        };
        write_json(path, &file)
    }
}

/// The bank key pair delivered by HPB. Persisted with `accepted = false`;
/// the operator flips the flag after comparing the printed digests against
/// the bank's out-of-band letter.
#[derive(Clone, Debug)]
pub struct BankKeys {
    pub authentication: RsaPublicKey,
    pub encryption: RsaPublicKey,
    pub accepted: bool,
}

#[derive(Serialize, Deserialize)]
struct BankKeysFile {
    bank_authentication_public_key: String,
    bank_encryption_public_key: String,
    accepted: bool,
}

impl BankKeys {
    pub fn load(path: &Path) -> Result<Self, KeysError> {
        let file: BankKeysFile = read_json(path)?;
        Ok(BankKeys {
            authentication: public_from_b64(&file.bank_authentication_public_key)?,
            encryption: public_from_b64(&file.bank_encryption_public_key)?,
            accepted: file.accepted,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), KeysError> {
        let file = BankKeysFile {
            bank_authentication_public_key: public_to_b64(&self.authentication)?,
            bank_encryption_public_key: public_to_b64(&self.encryption)?,
            accepted: self.accepted,
        };
        write_json(path, &file)
    }
}

fn private_to_b64(key: &RsaPrivateKey) -> Result<String, KeysError> {
    Ok(to_base64(&crypto::private_key_to_der(key)?))
}

fn private_from_b64(encoded: &str) -> Result<RsaPrivateKey, KeysError> {
    Ok(crypto::private_key_from_der(&from_base64(encoded)?)?)
}

fn public_to_b64(key: &RsaPublicKey) -> Result<String, KeysError> {
    Ok(to_base64(key.to_pkcs1_der()?.as_bytes()))
}

fn public_from_b64(encoded: &str) -> Result<RsaPublicKey, KeysError> {
    Ok(RsaPublicKey::from_pkcs1_der(&from_base64(encoded)?)?)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, KeysError> {
    let bytes = std::fs::read(path).map_err(|source| KeysError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| KeysError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Writes through a sibling temp file and renames, so a crash mid-write
/// never truncates existing key material.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), KeysError> {
    let body = serde_json::to_vec_pretty(value).map_err(|source| KeysError::Json {
        path: path.display().to_string(),
        source,
    })?;
    let tmp = path.with_extension("tmp");
    let io_err = |source| KeysError::Io {
        path: path.display().to_string(),
        source,
    };
    std::fs::write(&tmp, body).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_keys_round_trip_with_flags() {
        let dir = std::env::temp_dir().join(format!("nexus-keys-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("client_private_keys.json");

        let mut keys = ClientKeys::generate().unwrap();
        keys.submitted_ini = true;
        keys.save(&path).unwrap();

        let reloaded = ClientKeys::load(&path).unwrap();
        assert!(reloaded.submitted_ini);
        assert!(!reloaded.submitted_hia);
        assert!(!reloaded.submitted_both());
        assert_eq!(reloaded.signature, keys.signature);
        assert_eq!(reloaded.encryption, keys.encryption);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn bank_keys_default_to_unaccepted_persistence() {
        let dir = std::env::temp_dir().join(format!("nexus-bank-keys-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bank_public_keys.json");

        let auth = crypto::generate_key().unwrap().to_public_key();
        let enc = crypto::generate_key().unwrap().to_public_key();
        let keys = BankKeys {
            authentication: auth.clone(),
            encryption: enc.clone(),
            accepted: false,
        };
        keys.save(&path).unwrap();

        let reloaded = BankKeys::load(&path).unwrap();
        assert!(!reloaded.accepted);
        assert_eq!(reloaded.authentication, auth);
        assert_eq!(reloaded.encryption, enc);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_reports_missing_file() {
        let missing = Path::new("/nonexistent/client_private_keys.json");
        assert!(matches!(
            ClientKeys::load(missing),
            Err(KeysError::Io { .. })
        ));
    }
}
