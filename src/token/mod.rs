//! Credential lifecycle and access-token refresh.

mod manager;

pub use manager::{ConnectionStatus, CredentialState, TokenManager};
