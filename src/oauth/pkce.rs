//! PKCE (RFC 7636) verifier/challenge pairs using the S256 method.

use std::fmt;

use base64::Engine as _;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::GatewayError;

pub const CHALLENGE_METHOD: &str = "S256";
pub const VERIFIER_LEN: usize = 64;

const MIN_VERIFIER_LEN: usize = 43;
const MAX_VERIFIER_LEN: usize = 128;
const UNRESERVED: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// A PKCE code verifier. The caller keeps it for the lifetime of one
/// authorization round trip and hands it back on callback.
#[derive(Clone, PartialEq, Eq)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    /// Wrap a verifier received from the caller, validating length and charset.
    pub fn new(raw: impl Into<String>) -> Result<Self, GatewayError> {
        let raw = raw.into();
        if !(MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&raw.len()) {
            return Err(GatewayError::Auth(format!(
                "code verifier must be {MIN_VERIFIER_LEN}-{MAX_VERIFIER_LEN} characters"
            )));
        }
        if !raw.bytes().all(|b| UNRESERVED.contains(&b)) {
            return Err(GatewayError::Auth(
                "code verifier contains reserved characters".into(),
            ));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn challenge(&self) -> String {
        challenge_for(&self.0)
    }
}

impl fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PkceVerifier(***)")
    }
}

/// A freshly generated verifier together with its derived challenge.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: PkceVerifier,
    pub challenge: String,
    pub method: &'static str,
}

/// Generate a random verifier from the unreserved set and its S256 challenge.
pub fn generate_challenge_pair() -> PkcePair {
    let mut rng = rand::thread_rng();
    let raw: String = (0..VERIFIER_LEN)
        .map(|_| UNRESERVED[rng.gen_range(0..UNRESERVED.len())] as char)
        .collect();

    let verifier = PkceVerifier(raw);
    let challenge = verifier.challenge();

    PkcePair {
        verifier,
        challenge,
        method: CHALLENGE_METHOD,
    }
}

/// base64url(SHA-256(verifier)) without padding.
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_pair_matches_s256() {
        let pair = generate_challenge_pair();
        assert_eq!(pair.method, "S256");
        assert_eq!(pair.verifier.as_str().len(), VERIFIER_LEN);
        assert!(pair.verifier.as_str().bytes().all(|b| UNRESERVED.contains(&b)));
        assert_eq!(pair.challenge, challenge_for(pair.verifier.as_str()));
        assert_eq!(pair.challenge.len(), 43);
    }

    #[test]
    fn test_rfc7636_appendix_b_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            challenge_for(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_pairs_are_unique() {
        let a = generate_challenge_pair();
        let b = generate_challenge_pair();
        assert_ne!(a.verifier, b.verifier);
    }

    #[test]
    fn test_verifier_validation() {
        assert!(PkceVerifier::new("short").is_err());
        assert!(PkceVerifier::new("a".repeat(129)).is_err());
        assert!(PkceVerifier::new(format!("{}+", "a".repeat(50))).is_err());
        assert!(PkceVerifier::new("a".repeat(43)).is_ok());
    }

    #[test]
    fn test_debug_redacts_verifier() {
        let pair = generate_challenge_pair();
        let rendered = format!("{:?}", pair.verifier);
        assert!(!rendered.contains(pair.verifier.as_str()));
    }
}
