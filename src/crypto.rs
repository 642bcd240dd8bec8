//! Cryptographic primitives of the EBICS envelope.
//!
//! Three algorithm identifiers matter on this wire:
//!
//! - **A006** — RSA-PSS-SHA256 over the raw order data, produced with the
//!   client *signature* key and carried inside `UserSignatureData`.
//! - **X002** — RSASSA-PKCS1-v1_5-SHA256 authenticating the request/response
//!   envelope, produced with the *authentication* key of whichever side is
//!   speaking.
//! - **E002** — hybrid encryption of order data: a fresh 16-byte AES-128-CBC
//!   session key (zero IV, PKCS#7 padding) wrapped with the peer's
//!   *encryption* RSA key under PKCS#1 v1.5.
//!
//! Public keys are identified by the SHA-256 digest over their hexadecimal
//! (exponent, modulus) rendering; H005 additionally moves client keys inside
//! self-signed X.509 certificates.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::sha2::{Digest, Sha256};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const RSA_KEY_BITS: usize = 2048;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("malformed PKCS#8 key material: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),
    #[error("signature rejected: {0}")]
    BadSignature(rsa::signature::Error),
    #[error("ciphertext is not valid AES-CBC/PKCS#7")]
    BadCiphertext,
    #[error("session key must be 16 bytes, got {0}")]
    BadSessionKey(usize),
    #[error("malformed X.509 certificate: {0}")]
    BadCertificate(String),
}

/// Generates one 2048-bit subscriber key. Callers invoke this three times
/// to obtain the signature/authentication/encryption triple.
pub fn generate_key() -> Result<RsaPrivateKey, CryptoError> {
    Ok(RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)?)
}

pub fn private_key_to_der(key: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
    Ok(key.to_pkcs8_der()?.as_bytes().to_vec())
}

pub fn private_key_from_der(der: &[u8]) -> Result<RsaPrivateKey, CryptoError> {
    Ok(RsaPrivateKey::from_pkcs8_der(der)?)
}

/// Rebuilds a public key from the big-endian (modulus, exponent) pair the
/// H004 `RSAKeyValue` element transports.
pub fn public_key_from_components(
    modulus: &[u8],
    exponent: &[u8],
) -> Result<RsaPublicKey, CryptoError> {
    Ok(RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from_bytes_be(exponent),
    )?)
}

/// Extracts the RSA public key out of a DER-encoded X.509 certificate, the
/// transport form H005 uses for both directions.
pub fn public_key_from_certificate(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    use x509_parser::prelude::FromDer;
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der)
        .map_err(|e| CryptoError::BadCertificate(e.to_string()))?;
    let spki = cert.public_key();
    RsaPublicKey::from_pkcs1_der(spki.subject_public_key.data.as_ref())
        .map_err(|e| CryptoError::BadCertificate(e.to_string()))
}

/// Mints the self-signed certificate wrapping a client public key for H005
/// key submission. The subscriber user id becomes the common name.
pub fn self_signed_certificate(
    key: &RsaPrivateKey,
    common_name: &str,
) -> Result<Vec<u8>, CryptoError> {
    let der = private_key_to_der(key)?;
    let key_pair = rcgen::KeyPair::from_der_and_sign_algo(&der, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| CryptoError::BadCertificate(e.to_string()))?;
    let mut distinguished_name = rcgen::DistinguishedName::new();
    distinguished_name.push(rcgen::DnType::CommonName, common_name);
    let mut params = rcgen::CertificateParams::default();
    params.alg = &rcgen::PKCS_RSA_SHA256;
    params.key_pair = Some(key_pair);
    params.distinguished_name = distinguished_name;
    let certificate = rcgen::Certificate::from_params(params)
        .map_err(|e| CryptoError::BadCertificate(e.to_string()))?;
    certificate
        .serialize_der()
        .map_err(|e| CryptoError::BadCertificate(e.to_string()))
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// EBICS public-key digest: SHA-256 over `"<exponent-hex> <modulus-hex>"`,
/// lowercase, leading zeros of each hex string stripped.
pub fn public_key_digest(key: &RsaPublicKey) -> [u8; 32] {
    let exponent = strip_leading_zeros(&hex::encode(key.e().to_bytes_be()));
    let modulus = strip_leading_zeros(&hex::encode(key.n().to_bytes_be()));
    sha256(format!("{exponent} {modulus}").as_bytes())
}

fn strip_leading_zeros(hex: &str) -> String {
    let stripped = hex.trim_start_matches('0');
    if stripped.is_empty() {
        "0".to_string()
    } else {
        stripped.to_string()
    }
}

/// A006 order-data signature (RSA-PSS-SHA256, salt length 32).
pub fn sign_a006(key: &RsaPrivateKey, order_data: &[u8]) -> Vec<u8> {
    let signing_key = rsa::pss::SigningKey::<Sha256>::new(key.clone());
    signing_key.sign_with_rng(&mut OsRng, order_data).to_vec()
}

pub fn verify_a006(
    key: &RsaPublicKey,
    order_data: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let verifying_key = rsa::pss::VerifyingKey::<Sha256>::new(key.clone());
    let signature =
        rsa::pss::Signature::try_from(signature).map_err(CryptoError::BadSignature)?;
    verifying_key
        .verify(order_data, &signature)
        .map_err(CryptoError::BadSignature)
}

/// X002 envelope signature (RSASSA-PKCS1-v1_5-SHA256) over canonical bytes.
pub fn sign_x002(key: &RsaPrivateKey, canonical: &[u8]) -> Vec<u8> {
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
    signing_key.sign(canonical).to_vec()
}

pub fn verify_x002(
    key: &RsaPublicKey,
    canonical: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
    let signature =
        rsa::pkcs1v15::Signature::try_from(signature).map_err(CryptoError::BadSignature)?;
    verifying_key
        .verify(canonical, &signature)
        .map_err(CryptoError::BadSignature)
}

/// One E002 envelope: the RSA-wrapped session key plus the CBC ciphertext.
#[derive(Debug, Clone)]
pub struct E002Envelope {
    pub wrapped_key: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Encrypts (already deflated) order data for the peer. Uploads call this
/// twice with [`E002Session::encrypt`] instead to reuse one session key for
/// the signature block and the payload.
pub fn e002_encrypt(peer: &RsaPublicKey, plaintext: &[u8]) -> Result<E002Envelope, CryptoError> {
    let session = E002Session::fresh();
    Ok(E002Envelope {
        wrapped_key: session.wrap_for(peer)?,
        ciphertext: session.encrypt(plaintext),
    })
}

pub fn e002_decrypt(
    key: &RsaPrivateKey,
    wrapped_key: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let session_key = key.decrypt(Pkcs1v15Encrypt, wrapped_key)?;
    let session = E002Session::from_key(&session_key)?;
    session.decrypt(ciphertext)
}

/// An ephemeral AES-128 session key. EBICS mandates a zero IV; uniqueness
/// comes from the key itself being single-use.
pub struct E002Session {
    key: [u8; 16],
}

impl E002Session {
    pub fn fresh() -> Self {
        let mut key = [0u8; 16];
        OsRng.fill_bytes(&mut key);
        E002Session { key }
    }

    pub fn from_key(key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; 16] = key
            .try_into()
            .map_err(|_| CryptoError::BadSessionKey(key.len()))?;
        Ok(E002Session { key })
    }

    pub fn wrap_for(&self, peer: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
        Ok(peer.encrypt(&mut OsRng, Pkcs1v15Encrypt, &self.key)?)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let iv = [0u8; 16];
        Aes128CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let iv = [0u8; 16];
        Aes128CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::BadCiphertext)
    }
}

/// 128-bit nonce for EBICS request headers, rendered uppercase hex.
pub fn fresh_nonce() -> String {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    hex::encode_upper(nonce)
}
