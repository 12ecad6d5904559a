//! Pairing crypto core.
//!
//! The server never sees `secret` or any key derived from it — this module
//! exists so the server-assisted link-generation path and the test suite
//! can exercise the same derivation and framing the clients use. All
//! outputs are hex or base64, never raw bytes, to stay JSON-friendly.
//!
//! Reference: HKDF-SHA256 (RFC 5869), AES-256-GCM with a random 96-bit
//! nonce prepended to the ciphertext.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, AeadCore, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;
use sha2::Sha256;

const INFO_SIG: &[u8] = b"pairing-sig-v1";
const INFO_MAC: &[u8] = b"pairing-mac-v1";
const INFO_SAS: &[u8] = b"pairing-sas-v1";

/// Shared secret plus its derived keys and short authentication string.
pub struct DerivedKeys {
    pub k_sig: [u8; 32],
    pub k_mac: [u8; 32],
    pub sas: String,
}

/// Generate a fresh 256-bit pairing secret.
pub fn generate_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// Derive `k_sig`, `k_mac`, and the SAS from a shared secret via
/// HKDF-SHA256 with a zero salt and fixed, purpose-separated info strings.
pub fn derive(secret: &[u8; 32]) -> DerivedKeys {
    let hk = hkdf::Hkdf::<Sha256>::new(None, secret);

    let mut k_sig = [0u8; 32];
    hk.expand(INFO_SIG, &mut k_sig)
        .expect("32 bytes is a valid HKDF-SHA256 output length");

    let mut k_mac = [0u8; 32];
    hk.expand(INFO_MAC, &mut k_mac)
        .expect("32 bytes is a valid HKDF-SHA256 output length");

    let mut sas_bytes = [0u8; 8];
    hk.expand(INFO_SAS, &mut sas_bytes)
        .expect("8 bytes is a valid HKDF-SHA256 output length");
    let sas = sas_bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();

    DerivedKeys { k_sig, k_mac, sas }
}

/// Encrypt `plaintext` under `k_sig`, returning `base64(nonce || ciphertext)`.
pub fn encrypt(k_sig: &[u8; 32], plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new(k_sig.into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptFailed)?;

    let mut combined = Vec::with_capacity(nonce.len() + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(B64.encode(combined))
}

/// Decrypt a `base64(nonce || ciphertext)` blob produced by [`encrypt`].
pub fn decrypt(k_sig: &[u8; 32], ciphertext_b64: &str) -> Result<Vec<u8>, CryptoError> {
    let combined = B64
        .decode(ciphertext_b64)
        .map_err(|_| CryptoError::MalformedCiphertext)?;
    if combined.len() < 12 {
        return Err(CryptoError::MalformedCiphertext);
    }
    let (nonce_bytes, ct) = combined.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(k_sig.into());
    cipher
        .decrypt(nonce, ct)
        .map_err(|_| CryptoError::DecryptFailed)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("malformed ciphertext")]
    MalformedCiphertext,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed (wrong key or tampered ciphertext)")]
    DecryptFailed,
}
