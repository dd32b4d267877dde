//! Quota-aware request orchestration.
//!
//! Every Ads API call goes through [`Orchestrator`], which owns the quota
//! windows and the request queue. Nothing else mutates either.

mod queue;
pub mod quota;

pub use queue::{Orchestrator, RequestHandle, TokenSource};
pub use quota::{QuotaDimension, QuotaLedger, QuotaSnapshot, QuotaWindow, WindowSnapshot};
