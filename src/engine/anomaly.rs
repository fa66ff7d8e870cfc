//! Online anomaly scoring over per-target health features.
//!
//! Each target's rolling (latency, loss) vector feeds an online-updating
//! outlier model. The concrete model sits behind [`OutlierModel`] so it can
//! be swapped (z-score, streaming k-NN, ...) without touching the scheduler
//! or tracker contracts. Warm-up is an explicit outcome, never a silent
//! false: a model that has not seen enough samples cannot flag anything.
//!
//! Anomaly flags are advisory. They never override the threshold-based
//! health status.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::engine::tracker::HealthFeatures;

/// Outcome of scoring one observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScoreOutcome {
    /// Not enough history yet; the observation was only absorbed.
    WarmingUp,
    Scored { score: f64, is_anomaly: bool },
}

/// An advisory anomaly flag for the event stream.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyEvent {
    pub target_id: i64,
    pub score: f64,
    pub latency_ms: f64,
    pub loss_ratio: f64,
    pub time: DateTime<Utc>,
}

/// Capability interface for online outlier models.
///
/// Updates must be incremental; scoring is O(1) amortized per call.
pub trait OutlierModel: Send {
    /// Fold one observation into the model.
    fn observe(&mut self, features: &[f64]);
    /// Score an observation against the model's history. Higher is more
    /// unusual. None while the model is still warming up.
    fn score(&self, features: &[f64]) -> Option<f64>;
    fn warmed_up(&self) -> bool;
}

/// Per-feature running z-score via Welford's online mean/variance.
pub struct RunningZScore {
    warmup: u64,
    count: u64,
    mean: Vec<f64>,
    m2: Vec<f64>,
    /// Per-dimension spread floor. A history with less variance than this is
    /// treated as having exactly this much, so measurement jitter on a flat
    /// history cannot produce an unbounded z-score.
    noise_floor: Vec<f64>,
}

impl RunningZScore {
    pub fn new(noise_floor: &[f64], warmup: u32) -> Self {
        Self {
            warmup: warmup as u64,
            count: 0,
            mean: vec![0.0; noise_floor.len()],
            m2: vec![0.0; noise_floor.len()],
            noise_floor: noise_floor.to_vec(),
        }
    }

    fn stddev(&self, dim: usize) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2[dim] / (self.count - 1) as f64).sqrt()
    }
}

impl OutlierModel for RunningZScore {
    fn observe(&mut self, features: &[f64]) {
        debug_assert_eq!(features.len(), self.mean.len());
        self.count += 1;
        for (dim, &x) in features.iter().enumerate() {
            let delta = x - self.mean[dim];
            self.mean[dim] += delta / self.count as f64;
            let delta2 = x - self.mean[dim];
            self.m2[dim] += delta * delta2;
        }
    }

    fn score(&self, features: &[f64]) -> Option<f64> {
        if !self.warmed_up() {
            return None;
        }
        let mut worst: f64 = 0.0;
        for (dim, &x) in features.iter().enumerate() {
            let std = self.stddev(dim).max(self.noise_floor[dim]).max(1e-6);
            worst = worst.max(((x - self.mean[dim]) / std).abs());
        }
        Some(worst)
    }

    fn warmed_up(&self) -> bool {
        self.count >= self.warmup
    }
}

/// Latency spread below 1ms is timer noise, not signal.
const LATENCY_NOISE_FLOOR_MS: f64 = 1.0;
/// One lost check in the feature window is the smallest observable loss step.
const LOSS_NOISE_FLOOR: f64 = 0.05;

/// Per-target anomaly scoring over the shared metric stream.
pub struct AnomalyScorer {
    warmup: u32,
    threshold: f64,
    models: HashMap<i64, Box<dyn OutlierModel>>,
}

impl AnomalyScorer {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            warmup: cfg.anomaly_warmup,
            threshold: cfg.anomaly_z_threshold,
            models: HashMap::new(),
        }
    }

    /// Score one observation against the target's history, then fold it in.
    ///
    /// Malformed features are logged and skipped; they never abort the
    /// batch for other targets.
    pub fn score_and_update(
        &mut self,
        target_id: i64,
        features: HealthFeatures,
    ) -> Option<ScoreOutcome> {
        let vector = [features.latency_ms, features.loss_ratio];
        if vector.iter().any(|v| !v.is_finite()) {
            tracing::warn!(
                "anomaly scorer: skipping malformed feature vector for target {}: {:?}",
                target_id,
                vector
            );
            return None;
        }

        let warmup = self.warmup;
        let model = self
            .models
            .entry(target_id)
            .or_insert_with(|| {
                Box::new(RunningZScore::new(
                    &[LATENCY_NOISE_FLOOR_MS, LOSS_NOISE_FLOOR],
                    warmup,
                ))
            });

        let outcome = match model.score(&vector) {
            None => ScoreOutcome::WarmingUp,
            Some(score) => ScoreOutcome::Scored {
                score,
                is_anomaly: score > self.threshold,
            },
        };
        model.observe(&vector);
        Some(outcome)
    }

    /// Drop the model for a deleted target.
    pub fn remove(&mut self, target_id: i64) {
        self.models.remove(&target_id);
    }
}
