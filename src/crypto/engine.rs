use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::EncryptionService;
use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const SIGNATURE_LEN: usize = 32;

/// Helper to create an HMAC instance, resolving trait ambiguity.
fn new_hmac(key: &[u8]) -> Result<HmacSha256, GatewayError> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| GatewayError::Crypto(format!("HMAC init failed: {e}")))
}

fn decode_key(name: &str, key_b64: &str) -> Result<Vec<u8>, GatewayError> {
    let key = base64::engine::general_purpose::STANDARD
        .decode(key_b64)
        .map_err(|e| GatewayError::Crypto(format!("Invalid {name} base64: {e}")))?;

    if key.len() != 32 {
        return Err(GatewayError::Crypto(format!(
            "{name} must be 32 bytes, got {}",
            key.len()
        )));
    }

    Ok(key)
}

/// AES-256-GCM encryption for stored tokens and HMAC signing for OAuth state.
pub struct CryptoEngine {
    cipher: Aes256Gcm,
    hmac_key: Vec<u8>,
}

impl CryptoEngine {
    /// Create a new CryptoEngine from base64-encoded keys.
    pub fn new(master_key_b64: &str, hmac_secret_b64: &str) -> Result<Self, GatewayError> {
        let master_key = decode_key("MASTER_KEY", master_key_b64)?;
        let hmac_key = decode_key("HMAC_SECRET", hmac_secret_b64)?;

        let cipher = Aes256Gcm::new_from_slice(&master_key)
            .map_err(|e| GatewayError::Crypto(format!("Failed to init AES cipher: {e}")))?;

        Ok(Self { cipher, hmac_key })
    }

    /// Sign a state payload with HMAC-SHA256. Returns base64url(hmac || payload).
    pub fn sign_state(&self, payload: &str) -> Result<String, GatewayError> {
        let mut mac = new_hmac(&self.hmac_key)?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();

        let mut combined = signature.to_vec();
        combined.extend_from_slice(payload.as_bytes());

        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&combined))
    }

    /// Verify a signed state parameter and return its payload.
    pub fn verify_state(&self, signed: &str) -> Result<String, GatewayError> {
        let invalid = || GatewayError::Auth("invalid state parameter".into());

        let combined = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(signed)
            .map_err(|_| invalid())?;

        if combined.len() < SIGNATURE_LEN {
            return Err(invalid());
        }

        let (signature, payload_bytes) = combined.split_at(SIGNATURE_LEN);

        let mut mac = new_hmac(&self.hmac_key)?;
        mac.update(payload_bytes);
        mac.verify_slice(signature).map_err(|_| invalid())?;

        String::from_utf8(payload_bytes.to_vec()).map_err(|_| invalid())
    }
}

impl EncryptionService for CryptoEngine {
    /// Returns base64(nonce || ciphertext).
    fn encrypt(&self, plaintext: &str) -> Result<String, GatewayError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| GatewayError::Encryption(format!("Encryption failed: {e}")))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    fn decrypt(&self, encrypted_b64: &str) -> Result<String, GatewayError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encrypted_b64)
            .map_err(|e| GatewayError::Decryption(format!("Invalid base64: {e}")))?;

        if combined.len() < NONCE_LEN {
            return Err(GatewayError::Decryption("Ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| GatewayError::Decryption(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| GatewayError::Decryption(format!("Invalid UTF-8 after decrypt: {e}")))
    }
}

#[cfg(test)]
pub(crate) fn test_engine() -> CryptoEngine {
    let key = base64::engine::general_purpose::STANDARD.encode([0x42u8; 32]);
    let hmac = base64::engine::general_purpose::STANDARD.encode([0x43u8; 32]);
    CryptoEngine::new(&key, &hmac).unwrap()
}
