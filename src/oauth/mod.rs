//! OAuth 2.0 authorization-code flow with PKCE.

pub mod flow;
pub mod pkce;
pub mod state;

pub use flow::{AuthFlow, AuthorizationRequest, AuthorizedGrant};
pub use pkce::{challenge_for, generate_challenge_pair, PkcePair, PkceVerifier};
pub use state::{NonceClaim, NonceLedger, StatePayload};
