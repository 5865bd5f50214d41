use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::types::{RunSummary, SkipReason};

/// Local belief that the session holds no lock and may claim a new one.
///
/// Single writer (the lock monitor), many readers. Starts eligible.
#[derive(Debug, Clone)]
pub struct Eligibility(Arc<AtomicBool>);

impl Eligibility {
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(AtomicBool::new(initial)))
    }

    pub fn can_lock(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Store a new value, returning the previous one.
    pub fn set(&self, can_lock: bool) -> bool {
        self.0.swap(can_lock, Ordering::AcqRel)
    }
}

impl Default for Eligibility {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Run-wide counters, shared between the feed listener, claim tasks and
/// the monitor.
#[derive(Debug)]
pub struct RaceStats {
    started: Instant,
    pub events_seen: AtomicU64,
    pub events_malformed: AtomicU64,
    pub skipped_not_eligible: AtomicU64,
    pub skipped_already_locked: AtomicU64,
    pub skipped_too_old: AtomicU64,
    pub claims_scheduled: AtomicU64,
    pub claims_succeeded: AtomicU64,
    pub claims_failed: AtomicU64,
    /// Claims logged but not sent (`--dry-run`).
    pub claims_dry_run: AtomicU64,
    pub claims_dropped: AtomicU64,
    pub claims_aborted: AtomicU64,
    pub monitor_checks: AtomicU64,
    pub monitor_failures: AtomicU64,
    pub feed_connections: AtomicU64,
}

impl Default for RaceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RaceStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            events_seen: AtomicU64::new(0),
            events_malformed: AtomicU64::new(0),
            skipped_not_eligible: AtomicU64::new(0),
            skipped_already_locked: AtomicU64::new(0),
            skipped_too_old: AtomicU64::new(0),
            claims_scheduled: AtomicU64::new(0),
            claims_succeeded: AtomicU64::new(0),
            claims_failed: AtomicU64::new(0),
            claims_dry_run: AtomicU64::new(0),
            claims_dropped: AtomicU64::new(0),
            claims_aborted: AtomicU64::new(0),
            monitor_checks: AtomicU64::new(0),
            monitor_failures: AtomicU64::new(0),
            feed_connections: AtomicU64::new(0),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::NotEligible => &self.skipped_not_eligible,
            SkipReason::AlreadyLocked => &self.skipped_already_locked,
            SkipReason::TooOld => &self.skipped_too_old,
        };
        Self::bump(counter);
    }

    pub fn summary(&self) -> RunSummary {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RunSummary {
            uptime_secs: self.started.elapsed().as_secs_f64(),
            events_seen: get(&self.events_seen),
            events_malformed: get(&self.events_malformed),
            skipped_not_eligible: get(&self.skipped_not_eligible),
            skipped_already_locked: get(&self.skipped_already_locked),
            skipped_too_old: get(&self.skipped_too_old),
            claims_scheduled: get(&self.claims_scheduled),
            claims_succeeded: get(&self.claims_succeeded),
            claims_failed: get(&self.claims_failed),
            claims_dry_run: get(&self.claims_dry_run),
            claims_dropped: get(&self.claims_dropped),
            claims_aborted: get(&self.claims_aborted),
            monitor_checks: get(&self.monitor_checks),
            monitor_failures: get(&self.monitor_failures),
            feed_connections: get(&self.feed_connections),
        }
    }
}
