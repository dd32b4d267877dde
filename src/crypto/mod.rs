//! Credential encryption and OAuth state signing.

mod engine;

pub use engine::CryptoEngine;

use crate::error::GatewayError;

/// Encryption collaborator for credentials at rest.
///
/// Key management lives behind this trait; the gateway only ever sees
/// plaintext transiently while a token is in use.
pub trait EncryptionService: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, GatewayError>;

    fn decrypt(&self, ciphertext: &str) -> Result<String, GatewayError>;
}

#[cfg(test)]
pub(crate) use engine::test_engine;
