//! Transition detection and mass-outage correlation.
//!
//! [`detect`] is a pure function over consecutive health snapshots. The
//! [`OutageCorrelator`] turns a burst of went-unhealthy transitions into a
//! single [`MassOutageEvent`] instead of per-device spam: down events are
//! held for up to the correlation window, drained into one mass event when
//! the threshold is crossed, and released individually when it is not.
//!
//! The window is a bounded ring of timestamped target IDs, reset on process
//! restart. Rate limiting and delivery belong to the external dispatcher.

use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::engine::tracker::HealthStatus;

/// A health-state boundary crossing for one device. Write-once.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub target_id: i64,
    pub prev: HealthStatus,
    pub curr: HealthStatus,
    pub time: DateTime<Utc>,
}

/// Many devices failing together, reported as one correlated event.
#[derive(Debug, Clone, Serialize)]
pub struct MassOutageEvent {
    pub started_at: DateTime<Utc>,
    pub target_ids: Vec<i64>,
    pub window_secs: i64,
}

/// Event stream handed to the external notification dispatcher.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthEvent {
    Transition(TransitionEvent),
    MassOutage(MassOutageEvent),
}

/// Detect a state-boundary crossing between consecutive snapshots.
///
/// The initial unknown→healthy classification is not a crossing; every
/// other change is. Flapping is already suppressed by the tracker's
/// hysteresis, so at most one event per ingest.
pub fn detect(
    target_id: i64,
    prev: HealthStatus,
    curr: HealthStatus,
    time: DateTime<Utc>,
) -> Option<TransitionEvent> {
    if prev == curr {
        return None;
    }
    if prev == HealthStatus::Unknown && curr == HealthStatus::Healthy {
        return None;
    }
    Some(TransitionEvent {
        target_id,
        prev,
        curr,
        time,
    })
}

/// Sliding-window correlator for went-unhealthy transitions.
pub struct OutageCorrelator {
    window: ChronoDuration,
    min_targets: usize,
    fleet_fraction: f64,
    fleet_size: usize,
    /// Down events held for correlation, oldest first.
    held: VecDeque<TransitionEvent>,
    /// Distinct targets that went unhealthy within the window.
    recent_down: VecDeque<(DateTime<Utc>, i64)>,
    active: bool,
}

impl OutageCorrelator {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            window: ChronoDuration::seconds(cfg.outage_window_secs),
            min_targets: cfg.outage_min_targets,
            fleet_fraction: cfg.outage_fleet_fraction,
            fleet_size: 0,
            held: VecDeque::new(),
            recent_down: VecDeque::new(),
            active: false,
        }
    }

    /// Update the fleet size; the scheduler reports it once per tick.
    pub fn set_fleet_size(&mut self, n: usize) {
        self.fleet_size = n;
    }

    /// Threshold: 5 or 30% of the fleet, whichever is smaller, never below 2.
    pub fn threshold(&self) -> usize {
        let fraction = (self.fleet_fraction * self.fleet_size as f64).ceil() as usize;
        self.min_targets.min(fraction.max(1)).max(2)
    }

    /// Whether a mass outage window is currently active.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one transition through the correlator.
    ///
    /// Non-down transitions pass through untouched. Down transitions are
    /// absorbed into the window and surface either as one mass event or,
    /// later, as released individuals via [`sweep`].
    pub fn offer(&mut self, event: TransitionEvent, now: DateTime<Utc>) -> Vec<HealthEvent> {
        let mut out = self.sweep(now);

        if event.curr != HealthStatus::Unhealthy {
            out.push(HealthEvent::Transition(event));
            return out;
        }

        if !self.recent_down.iter().any(|(_, id)| *id == event.target_id) {
            self.recent_down.push_back((now, event.target_id));
        }

        if self.active {
            // Outage ongoing; this device joins it silently.
            return out;
        }

        if self.recent_down.len() >= self.threshold() {
            self.active = true;
            let mut ids: Vec<i64> = self.held.drain(..).map(|e| e.target_id).collect();
            ids.push(event.target_id);
            ids.sort_unstable();
            ids.dedup();
            let started_at = self
                .recent_down
                .front()
                .map(|(t, _)| *t)
                .unwrap_or(now);
            tracing::warn!(
                "mass outage: {} targets down within {}s window",
                ids.len(),
                self.window.num_seconds()
            );
            out.push(HealthEvent::MassOutage(MassOutageEvent {
                started_at,
                target_ids: ids,
                window_secs: self.window.num_seconds(),
            }));
        } else if !self.held.iter().any(|e| e.target_id == event.target_id) {
            self.held.push_back(event);
        }

        out
    }

    /// Expire window entries and release held down events whose hold ran
    /// out without a mass outage forming. Call once per scheduler tick.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<HealthEvent> {
        let cutoff = now - self.window;

        while let Some((t, _)) = self.recent_down.front() {
            if *t < cutoff {
                self.recent_down.pop_front();
            } else {
                break;
            }
        }

        if self.active && self.recent_down.len() < self.threshold() {
            self.active = false;
        }

        let mut released = Vec::new();
        while let Some(event) = self.held.front() {
            if event.time < cutoff {
                let event = self.held.pop_front().unwrap();
                released.push(HealthEvent::Transition(event));
            } else {
                break;
            }
        }
        released
    }
}
