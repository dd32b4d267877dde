//! Quota windows for the three limits enforced per developer token.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::QuotaConfig;
use crate::executor::OperationKind;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const SECOND: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    DailyOperations,
    AccountQps,
    HourlyReports,
}

impl fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaDimension::DailyOperations => f.write_str("daily operations"),
            QuotaDimension::AccountQps => f.write_str("per-account QPS"),
            QuotaDimension::HourlyReports => f.write_str("hourly reports"),
        }
    }
}

/// A fixed-duration counting bucket.
///
/// The window opens at the first recorded request and is reset lazily: the
/// first check at or after `reset_at` zeroes the count. Nothing runs on a timer.
#[derive(Debug, Clone)]
pub struct QuotaWindow {
    limit: u32,
    duration: Duration,
    count: u32,
    reset_at: Option<Instant>,
}

impl QuotaWindow {
    pub fn new(limit: u32, duration: Duration) -> Self {
        Self {
            limit,
            duration,
            count: 0,
            reset_at: None,
        }
    }

    fn expire(&mut self, now: Instant) {
        if self.reset_at.is_some_and(|reset_at| now >= reset_at) {
            self.count = 0;
            self.reset_at = None;
        }
    }

    pub fn has_capacity(&mut self, now: Instant) -> bool {
        self.expire(now);
        self.count < self.limit
    }

    pub fn record(&mut self, now: Instant) {
        self.expire(now);
        if self.reset_at.is_none() {
            self.reset_at = Some(now + self.duration);
        }
        self.count += 1;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset_at(&self) -> Option<Instant> {
        self.reset_at
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.reset_at.map_or(true, |reset_at| now >= reset_at)
    }

    fn snapshot(&self, now: Instant) -> WindowSnapshot {
        let live = !self.is_idle(now);
        WindowSnapshot {
            used: if live { self.count } else { 0 },
            limit: self.limit,
            resets_in_ms: self
                .reset_at
                .filter(|_| live)
                .map(|reset_at| reset_at.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    pub used: u32,
    pub limit: u32,
    pub resets_in_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    pub daily_operations: WindowSnapshot,
    pub hourly_reports: WindowSnapshot,
    pub account_qps: BTreeMap<String, WindowSnapshot>,
}

/// All quota windows for one developer token.
#[derive(Debug)]
pub struct QuotaLedger {
    config: QuotaConfig,
    daily: QuotaWindow,
    hourly_reports: QuotaWindow,
    account_qps: HashMap<String, QuotaWindow>,
}

impl QuotaLedger {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            daily: QuotaWindow::new(config.daily_operations, DAY),
            hourly_reports: QuotaWindow::new(config.hourly_reports, HOUR),
            account_qps: HashMap::new(),
            config,
        }
    }

    /// First dimension without capacity for this request, if any.
    pub fn check(&mut self, now: Instant, account: &str, kind: OperationKind) -> Result<(), QuotaDimension> {
        if !self.daily.has_capacity(now) {
            return Err(QuotaDimension::DailyOperations);
        }

        let qps = self.config.qps_per_account;
        if !self
            .account_qps
            .entry(account.to_string())
            .or_insert_with(|| QuotaWindow::new(qps, SECOND))
            .has_capacity(now)
        {
            return Err(QuotaDimension::AccountQps);
        }

        if kind == OperationKind::Report && !self.hourly_reports.has_capacity(now) {
            return Err(QuotaDimension::HourlyReports);
        }

        Ok(())
    }

    /// Count a dispatch against every dimension it touches.
    pub fn commit(&mut self, now: Instant, account: &str, kind: OperationKind) {
        self.daily.record(now);

        let qps = self.config.qps_per_account;
        self.account_qps
            .entry(account.to_string())
            .or_insert_with(|| QuotaWindow::new(qps, SECOND))
            .record(now);

        if kind == OperationKind::Report {
            self.hourly_reports.record(now);
        }
    }

    /// Drop per-account windows that have expired; they are recreated on demand.
    pub fn prune(&mut self, now: Instant) {
        self.account_qps.retain(|_, window| !window.is_idle(now));
    }

    pub fn snapshot(&self, now: Instant) -> QuotaSnapshot {
        QuotaSnapshot {
            daily_operations: self.daily.snapshot(now),
            hourly_reports: self.hourly_reports.snapshot(now),
            account_qps: self
                .account_qps
                .iter()
                .filter(|(_, window)| !window.is_idle(now))
                .map(|(account, window)| (account.clone(), window.snapshot(now)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(daily: u32, qps: u32, hourly: u32) -> QuotaLedger {
        QuotaLedger::new(QuotaConfig {
            daily_operations: daily,
            qps_per_account: qps,
            hourly_reports: hourly,
        })
    }

    #[test]
    fn test_window_resets_one_duration_after_first_request() {
        let start = Instant::now();
        let mut window = QuotaWindow::new(2, SECOND);

        assert!(window.has_capacity(start));
        window.record(start);
        window.record(start + Duration::from_millis(900));
        assert!(!window.has_capacity(start + Duration::from_millis(999)));
        assert_eq!(window.count(), 2);

        assert!(window.has_capacity(start + SECOND));
        assert_eq!(window.count(), 0);
    }

    #[test]
    fn test_checking_without_recording_does_not_open_window() {
        let start = Instant::now();
        let mut window = QuotaWindow::new(1, SECOND);

        assert!(window.has_capacity(start));
        assert!(window.reset_at().is_none());

        let first = start + Duration::from_millis(700);
        window.record(first);
        assert_eq!(window.reset_at(), Some(first + SECOND));
        assert!(!window.has_capacity(start + Duration::from_millis(1500)));
    }

    #[test]
    fn test_qps_buckets_are_independent_per_account() {
        let now = Instant::now();
        let mut ledger = ledger(100, 2, 100);

        for _ in 0..2 {
            assert!(ledger.check(now, "111", OperationKind::Standard).is_ok());
            ledger.commit(now, "111", OperationKind::Standard);
        }

        assert_eq!(
            ledger.check(now, "111", OperationKind::Standard),
            Err(QuotaDimension::AccountQps)
        );
        assert!(ledger.check(now, "222", OperationKind::Standard).is_ok());
    }

    #[test]
    fn test_daily_limit_blocks_every_account() {
        let now = Instant::now();
        let mut ledger = ledger(3, 10, 100);

        for account in ["1", "2", "3"] {
            ledger.commit(now, account, OperationKind::Standard);
        }

        assert_eq!(
            ledger.check(now, "4", OperationKind::Standard),
            Err(QuotaDimension::DailyOperations)
        );
        assert_eq!(
            ledger.check(now + Duration::from_secs(3600), "4", OperationKind::Standard),
            Err(QuotaDimension::DailyOperations)
        );
        assert!(ledger.check(now + DAY, "4", OperationKind::Standard).is_ok());
    }

    #[test]
    fn test_hourly_limit_only_applies_to_reports() {
        let now = Instant::now();
        let mut ledger = ledger(100, 100, 1);

        ledger.commit(now, "1", OperationKind::Report);
        assert_eq!(
            ledger.check(now, "1", OperationKind::Report),
            Err(QuotaDimension::HourlyReports)
        );
        assert!(ledger.check(now, "1", OperationKind::Standard).is_ok());
    }

    #[test]
    fn test_snapshot_and_prune() {
        let now = Instant::now();
        let mut ledger = ledger(100, 5, 10);
        ledger.commit(now, "111", OperationKind::Report);

        let snap = ledger.snapshot(now);
        assert_eq!(snap.daily_operations.used, 1);
        assert_eq!(snap.hourly_reports.used, 1);
        assert_eq!(snap.account_qps["111"].used, 1);
        assert_eq!(snap.account_qps["111"].resets_in_ms, Some(1000));

        let later = now + Duration::from_secs(2);
        ledger.prune(later);
        assert!(ledger.snapshot(later).account_qps.is_empty());
        assert_eq!(ledger.snapshot(later).daily_operations.used, 1);
    }
}
