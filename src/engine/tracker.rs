//! Per-target health state tracking.
//!
//! Holds a bounded ring of recent check results per target and derives
//! [`DeviceHealthState`] from it with a hysteresis rule, so a single
//! transient failure never flips a device's status. Status is only ever
//! changed by [`StateTracker::ingest`]; everything else is a read.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::db::CheckResult;

/// How many recent entries feed the rolling latency/loss features.
const FEATURE_WINDOW: usize = 20;

/// Health classification for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No check has completed yet.
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Derived per-target health aggregate. The only entity a caller needs to
/// render status.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealthState {
    pub target_id: i64,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_seen_online: Option<DateTime<Utc>>,
    /// Trailing-24h uptime percentage; filled in lazily on read paths,
    /// None on ingest deltas.
    pub uptime_pct: Option<f64>,
    /// Rolling average latency over recent successful checks.
    pub avg_latency_ms: Option<f64>,
}

/// Rolling (latency, loss) feature vector for the anomaly scorer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthFeatures {
    pub latency_ms: f64,
    pub loss_ratio: f64,
}

/// One ingestion outcome: the status before and the state after.
#[derive(Debug, Clone)]
pub struct Ingestion {
    pub prev_status: HealthStatus,
    pub state: DeviceHealthState,
}

struct TargetTracker {
    ring: VecDeque<CheckResult>,
    capacity: usize,
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_seen_online: Option<DateTime<Utc>>,
}

impl TargetTracker {
    fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_seen_online: None,
        }
    }

    fn push(&mut self, result: CheckResult) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(result);
    }

    /// Average latency over the most recent successful checks.
    fn rolling_latency(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut n = 0usize;
        for r in self.ring.iter().rev().take(FEATURE_WINDOW) {
            if let Some(ms) = r.latency_ms {
                sum += ms;
                n += 1;
            }
        }
        if n == 0 {
            None
        } else {
            Some(sum / n as f64)
        }
    }

    /// Failure ratio over the most recent checks.
    fn rolling_loss(&self) -> f64 {
        let mut failed = 0usize;
        let mut n = 0usize;
        for r in self.ring.iter().rev().take(FEATURE_WINDOW) {
            if !r.success {
                failed += 1;
            }
            n += 1;
        }
        if n == 0 {
            0.0
        } else {
            failed as f64 / n as f64
        }
    }

    /// Apply the hysteresis transition guards and return the new status.
    fn transition(&self, cfg: &EngineConfig, success: bool) -> HealthStatus {
        let latency_soft_breach = self
            .rolling_latency()
            .map(|ms| ms > cfg.soft_latency_ms)
            .unwrap_or(false);

        if success {
            match self.status {
                HealthStatus::Unknown => HealthStatus::Healthy,
                HealthStatus::Healthy => {
                    if latency_soft_breach {
                        HealthStatus::Degraded
                    } else {
                        HealthStatus::Healthy
                    }
                }
                HealthStatus::Degraded => {
                    if self.consecutive_successes >= cfg.recover_threshold && !latency_soft_breach {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Degraded
                    }
                }
                // Recovery demands M consecutive successes, not just one.
                HealthStatus::Unhealthy => {
                    if self.consecutive_successes >= cfg.recover_threshold {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    }
                }
            }
        } else {
            if self.consecutive_failures >= cfg.fail_threshold {
                return HealthStatus::Unhealthy;
            }
            match self.status {
                // Unknown means no check has completed; the first completed
                // result always classifies the device.
                HealthStatus::Unknown => HealthStatus::Degraded,
                // A lone failure only degrades when latency was already soft-breached.
                HealthStatus::Healthy => {
                    if self.consecutive_failures >= cfg.degrade_failures
                        || (self.consecutive_failures >= 1 && latency_soft_breach)
                    {
                        HealthStatus::Degraded
                    } else {
                        self.status
                    }
                }
                HealthStatus::Degraded => HealthStatus::Degraded,
                HealthStatus::Unhealthy => HealthStatus::Unhealthy,
            }
        }
    }

    fn snapshot(&self, target_id: i64, uptime_pct: Option<f64>) -> DeviceHealthState {
        DeviceHealthState {
            target_id,
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            last_seen_online: self.last_seen_online,
            uptime_pct,
            avg_latency_ms: self.rolling_latency(),
        }
    }

    /// Uptime percentage over the trailing window. O(ring) on read, never
    /// paid on ingest.
    fn uptime_pct(&self, window: ChronoDuration, now: DateTime<Utc>) -> Option<f64> {
        let cutoff = now - window;
        let mut total = 0usize;
        let mut ok = 0usize;
        for r in self.ring.iter().rev() {
            if r.time < cutoff {
                break;
            }
            total += 1;
            if r.success {
                ok += 1;
            }
        }
        if total == 0 {
            None
        } else {
            Some(ok as f64 / total as f64 * 100.0)
        }
    }
}

/// Single-writer state tracker over all targets.
///
/// Each target's history is independent; there is no cross-target state in
/// here, so per-target results can never interfere with each other.
pub struct StateTracker {
    cfg: EngineConfig,
    targets: HashMap<i64, TargetTracker>,
}

impl StateTracker {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            targets: HashMap::new(),
        }
    }

    /// Ingest one check result and recompute the target's health state.
    ///
    /// This is the only path that may change `DeviceHealthState.status`.
    pub fn ingest(&mut self, result: CheckResult) -> Ingestion {
        let capacity = self.cfg.history_len;
        let tracker = self
            .targets
            .entry(result.target_id)
            .or_insert_with(|| TargetTracker::new(capacity));

        let prev_status = tracker.status;

        if result.success {
            tracker.consecutive_successes += 1;
            tracker.consecutive_failures = 0;
            tracker.last_seen_online = Some(result.time);
        } else {
            tracker.consecutive_failures += 1;
            tracker.consecutive_successes = 0;
        }

        let target_id = result.target_id;
        tracker.push(result);
        tracker.status = tracker.transition(&self.cfg, tracker.consecutive_failures == 0);

        Ingestion {
            prev_status,
            state: tracker.snapshot(target_id, None),
        }
    }

    /// Current health for one target, with the uptime percentage computed.
    pub fn health(&self, target_id: i64) -> Option<DeviceHealthState> {
        let tracker = self.targets.get(&target_id)?;
        let uptime = tracker.uptime_pct(
            ChronoDuration::seconds(self.cfg.uptime_window_secs),
            Utc::now(),
        );
        Some(tracker.snapshot(target_id, uptime))
    }

    /// Health snapshots for every tracked target.
    pub fn all_health(&self) -> Vec<DeviceHealthState> {
        let mut out: Vec<_> = self
            .targets
            .keys()
            .filter_map(|id| self.health(*id))
            .collect();
        out.sort_by_key(|s| s.target_id);
        out
    }

    /// Recent check results for one target, oldest first.
    pub fn history(&self, target_id: i64) -> Vec<CheckResult> {
        self.targets
            .get(&target_id)
            .map(|t| t.ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rolling feature vector for the anomaly scorer.
    pub fn features(&self, target_id: i64) -> Option<HealthFeatures> {
        let tracker = self.targets.get(&target_id)?;
        let latency_ms = tracker.rolling_latency()?;
        Some(HealthFeatures {
            latency_ms,
            loss_ratio: tracker.rolling_loss(),
        })
    }

    /// Drop all state for a deleted target.
    pub fn remove(&mut self, target_id: i64) {
        self.targets.remove(&target_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckKind, ErrorKind};

    fn tracker() -> StateTracker {
        StateTracker::new(EngineConfig::default())
    }

    fn ok(id: i64, ms: f64) -> CheckResult {
        CheckResult::ok(id, CheckKind::Ping, ms)
    }

    fn fail(id: i64) -> CheckResult {
        CheckResult::failed(id, CheckKind::Ping, ErrorKind::Timeout)
    }

    #[test]
    fn test_unknown_until_first_result() {
        let t = tracker();
        assert!(t.health(1).is_none());
    }

    #[test]
    fn test_first_result_always_classifies() {
        let mut t = tracker();
        // The very first completed check leaves Unknown, whichever way it goes.
        assert_eq!(t.ingest(fail(1)).state.status, HealthStatus::Degraded);
        assert_eq!(t.ingest(ok(2, 5.0)).state.status, HealthStatus::Healthy);
        // Further failures walk the normal ladder down.
        assert_eq!(t.ingest(fail(1)).state.status, HealthStatus::Degraded);
        assert_eq!(t.ingest(fail(1)).state.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_single_transient_failure_stays_healthy() {
        let mut t = tracker();
        // [success, success, fail, success, success] never leaves healthy.
        let mut statuses = Vec::new();
        for r in [ok(1, 5.0), ok(1, 5.0), fail(1), ok(1, 5.0), ok(1, 5.0)] {
            statuses.push(t.ingest(r).state.status);
        }
        assert!(statuses.iter().all(|s| *s == HealthStatus::Healthy));
    }

    #[test]
    fn test_consecutive_failures_degrade_then_fail() {
        let mut t = tracker();
        t.ingest(ok(1, 5.0));
        assert_eq!(t.ingest(fail(1)).state.status, HealthStatus::Healthy);
        assert_eq!(t.ingest(fail(1)).state.status, HealthStatus::Degraded);
        assert_eq!(t.ingest(fail(1)).state.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_recovery_needs_two_successes() {
        let mut t = tracker();
        t.ingest(ok(1, 5.0));
        for _ in 0..3 {
            t.ingest(fail(1));
        }
        assert_eq!(t.health(1).unwrap().status, HealthStatus::Unhealthy);

        // One success is not enough.
        assert_eq!(t.ingest(ok(1, 5.0)).state.status, HealthStatus::Unhealthy);
        // The second flips it back.
        assert_eq!(t.ingest(ok(1, 5.0)).state.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_soft_latency_degrades_on_single_failure() {
        let mut t = tracker();
        // Sustained latency above the soft threshold (default 250ms).
        for _ in 0..5 {
            t.ingest(ok(1, 400.0));
        }
        // Elevated latency alone already degrades.
        assert_eq!(t.health(1).unwrap().status, HealthStatus::Degraded);

        // A fresh target at normal latency does not degrade on one failure.
        t.ingest(ok(2, 5.0));
        t.ingest(ok(2, 5.0));
        assert_eq!(t.ingest(fail(2)).state.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_uptime_is_order_independent() {
        let cfg = EngineConfig::default();
        let mut a = StateTracker::new(cfg.clone());
        let mut b = StateTracker::new(cfg);

        // 8 successes + 2 failures, in different orders.
        for i in 0..10 {
            let r = if i < 2 { fail(1) } else { ok(1, 5.0) };
            a.ingest(r);
        }
        for i in 0..10 {
            let r = if i % 5 == 0 { fail(1) } else { ok(1, 5.0) };
            b.ingest(r);
        }

        assert_eq!(a.health(1).unwrap().uptime_pct, Some(80.0));
        assert_eq!(b.health(1).unwrap().uptime_pct, Some(80.0));
    }

    #[test]
    fn test_targets_do_not_interfere() {
        let mut t = tracker();
        t.ingest(ok(1, 5.0));
        for _ in 0..5 {
            t.ingest(fail(2));
        }
        assert_eq!(t.health(1).unwrap().status, HealthStatus::Healthy);
        assert_eq!(t.health(2).unwrap().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_ring_is_bounded() {
        let mut cfg = EngineConfig::default();
        cfg.history_len = 16;
        let mut t = StateTracker::new(cfg);
        for _ in 0..100 {
            t.ingest(ok(1, 5.0));
        }
        assert_eq!(t.history(1).len(), 16);
    }

    #[test]
    fn test_last_seen_online_tracks_successes() {
        let mut t = tracker();
        let first = t.ingest(ok(1, 5.0)).state.last_seen_online.unwrap();
        t.ingest(fail(1));
        let after_fail = t.health(1).unwrap().last_seen_online.unwrap();
        assert_eq!(first, after_fail);
    }

    #[test]
    fn test_remove_drops_state() {
        let mut t = tracker();
        t.ingest(ok(1, 5.0));
        t.remove(1);
        assert!(t.health(1).is_none());
    }
}
