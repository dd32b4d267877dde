//! Signed OAuth `state` parameter and the ledger of claimed nonces.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::CryptoEngine;
use crate::error::GatewayError;

/// Clock skew tolerated on `issued_at` before a state counts as forged.
const MAX_FUTURE_SKEW_SECS: i64 = 60;

/// Payload carried inside the HMAC-signed state parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub owner_id: String,
    pub platform: String,
    pub issued_at: i64,
    pub nonce: String,
    /// PKCE challenge of the flow this state was issued for.
    pub challenge: String,
}

impl StatePayload {
    pub fn new(owner_id: &str, platform: &str, challenge: &str, now: DateTime<Utc>) -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        Self {
            owner_id: owner_id.to_string(),
            platform: platform.to_string(),
            issued_at: now.timestamp(),
            nonce: nonce.iter().map(|b| format!("{:02x}", b)).collect(),
            challenge: challenge.to_string(),
        }
    }

    pub fn expires_at(&self, ttl: Duration) -> i64 {
        self.issued_at + ttl.num_seconds()
    }

    pub fn sign(&self, crypto: &CryptoEngine) -> Result<String, GatewayError> {
        let json = serde_json::to_string(self)
            .map_err(|e| GatewayError::Internal(format!("state serialization failed: {e}")))?;
        crypto.sign_state(&json)
    }

    /// Check the signature only. Freshness is not validated.
    pub fn decode(signed: &str, crypto: &CryptoEngine) -> Result<Self, GatewayError> {
        let json = crypto.verify_state(signed)?;
        serde_json::from_str(&json).map_err(|_| GatewayError::Auth("malformed state parameter".into()))
    }

    /// Verify the signature and freshness of a state string.
    pub fn verify(
        signed: &str,
        crypto: &CryptoEngine,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, GatewayError> {
        let payload = Self::decode(signed, crypto)?;

        let now = now.timestamp();
        if payload.issued_at > now + MAX_FUTURE_SKEW_SECS {
            return Err(GatewayError::Auth("state issued in the future".into()));
        }
        if now >= payload.expires_at(ttl) {
            return Err(GatewayError::Auth("OAuth session expired".into()));
        }

        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonceMark {
    /// A code exchange for this state is in progress.
    Claimed,
    Used,
}

/// Nonces of states that are being exchanged or already completed one.
///
/// Entries are kept until the state would have expired anyway, after which
/// freshness validation rejects the state on its own.
#[derive(Debug, Default)]
pub struct NonceLedger {
    marks: Mutex<HashMap<String, (NonceMark, i64)>>,
}

impl NonceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn marks(&self) -> std::sync::MutexGuard<'_, HashMap<String, (NonceMark, i64)>> {
        match self.marks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reserve a nonce for one exchange attempt.
    ///
    /// Fails while another attempt holds the claim or once an exchange
    /// succeeded. Dropping the claim without redeeming it releases the nonce.
    pub fn claim(&self, nonce: &str, expires_at: i64, now: DateTime<Utc>) -> Result<NonceClaim<'_>, GatewayError> {
        let mut marks = self.marks();
        let now = now.timestamp();
        marks.retain(|_, (_, exp)| *exp > now);

        match marks.get(nonce) {
            Some((NonceMark::Used, _)) => Err(GatewayError::Auth("state has already been used".into())),
            Some((NonceMark::Claimed, _)) => Err(GatewayError::Auth("state is already being exchanged".into())),
            None => {
                marks.insert(nonce.to_string(), (NonceMark::Claimed, expires_at));
                Ok(NonceClaim {
                    ledger: self,
                    nonce: nonce.to_string(),
                    redeemed: false,
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.marks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An in-progress exchange attempt on one nonce.
pub struct NonceClaim<'a> {
    ledger: &'a NonceLedger,
    nonce: String,
    redeemed: bool,
}

impl NonceClaim<'_> {
    /// The exchange succeeded: the nonce stays used until its state expires.
    pub fn redeem(mut self) {
        if let Some((mark, _)) = self.ledger.marks().get_mut(&self.nonce) {
            *mark = NonceMark::Used;
        }
        self.redeemed = true;
    }
}

impl Drop for NonceClaim<'_> {
    fn drop(&mut self) {
        if self.redeemed {
            return;
        }
        let mut marks = self.ledger.marks();
        if matches!(marks.get(&self.nonce), Some((NonceMark::Claimed, _))) {
            marks.remove(&self.nonce);
        }
    }
}
