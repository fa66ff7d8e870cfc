//! The device-health engine.
//!
//! Wires the scheduler, state tracker, transition notifier, and anomaly
//! scorer together: probe workers are stateless and hand every result to a
//! single-writer ingest loop over an mpsc channel, so no per-target locking
//! is ever needed. Consumers get health snapshots through [`HealthEngine`]
//! reads and events through broadcast subscriptions.

mod anomaly;
mod outage;
mod scheduler;
mod tracker;

pub use anomaly::{AnomalyEvent, AnomalyScorer, OutlierModel, RunningZScore, ScoreOutcome};
pub use outage::{detect, HealthEvent, MassOutageEvent, OutageCorrelator, TransitionEvent};
pub use scheduler::Scheduler;
pub use tracker::{DeviceHealthState, HealthFeatures, HealthStatus, Ingestion, StateTracker};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::config::EngineConfig;
use crate::db::{CheckResult, Store};
use scheduler::IngestMsg;

/// How many recent events the engine keeps for the events API.
const EVENT_RING_LEN: usize = 256;

/// Public face of the health engine.
pub struct HealthEngine {
    store: Arc<Store>,
    cfg: EngineConfig,
    tracker: Arc<RwLock<StateTracker>>,
    recent_events: Arc<RwLock<VecDeque<HealthEvent>>>,
    tx: mpsc::Sender<IngestMsg>,
    events_tx: broadcast::Sender<HealthEvent>,
    anomalies_tx: broadcast::Sender<AnomalyEvent>,
    stop: broadcast::Sender<()>,
    scheduler: Scheduler,
}

impl HealthEngine {
    /// Create the engine and start its ingest loop. The scheduler is not
    /// started until [`HealthEngine::start`].
    pub fn new(store: Arc<Store>, cfg: EngineConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1000);
        let (events_tx, _) = broadcast::channel(256);
        let (anomalies_tx, _) = broadcast::channel(256);
        let (stop, _) = broadcast::channel(1);

        let tracker = Arc::new(RwLock::new(StateTracker::new(cfg.clone())));
        let recent_events = Arc::new(RwLock::new(VecDeque::with_capacity(EVENT_RING_LEN)));

        tokio::spawn(run_ingest_loop(
            cfg.clone(),
            store.clone(),
            tracker.clone(),
            recent_events.clone(),
            rx,
            events_tx.clone(),
            anomalies_tx.clone(),
            stop.subscribe(),
        ));

        let scheduler = Scheduler::new(store.clone(), cfg.clone(), tx.clone(), stop.clone());

        Arc::new(Self {
            store,
            cfg,
            tracker,
            recent_events,
            tx,
            events_tx,
            anomalies_tx,
            stop,
            scheduler,
        })
    }

    /// Start the periodic scheduler and the retention sweeper.
    pub fn start(&self) {
        self.scheduler.start();

        let store = self.store.clone();
        let retention = ChronoDuration::seconds(self.cfg.retention_secs);
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        match store.delete_results_before(Utc::now() - retention) {
                            Ok(0) => {}
                            Ok(n) => tracing::debug!("retention: deleted {} stale results", n),
                            Err(e) => tracing::error!("retention sweep failed: {}", e),
                        }
                    }
                }
            }
        });
    }

    /// Current health for one target.
    pub async fn health(&self, target_id: i64) -> Option<DeviceHealthState> {
        self.tracker.read().await.health(target_id)
    }

    /// Health snapshots for the whole fleet.
    pub async fn all_health(&self) -> Vec<DeviceHealthState> {
        self.tracker.read().await.all_health()
    }

    /// In-memory check history for one target, oldest first.
    pub async fn history(&self, target_id: i64) -> Vec<CheckResult> {
        self.tracker.read().await.history(target_id)
    }

    /// Recent transition/mass-outage events, oldest first.
    pub async fn recent_events(&self) -> Vec<HealthEvent> {
        self.recent_events.read().await.iter().cloned().collect()
    }

    /// Subscribe to transition and mass-outage events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe to advisory anomaly flags.
    pub fn subscribe_anomalies(&self) -> broadcast::Receiver<AnomalyEvent> {
        self.anomalies_tx.subscribe()
    }

    /// Drop all derived state for a deleted target.
    pub async fn remove_target(&self, target_id: i64) {
        let _ = self.tx.send(IngestMsg::Remove(target_id)).await;
    }

    /// Feed one check result into the engine, bypassing the scheduler.
    /// Used by tests and external check sources.
    pub async fn ingest(&self, result: CheckResult) {
        let _ = self.tx.send(IngestMsg::Result(result)).await;
    }

    /// Stop the scheduler and ingest loop; in-flight probes are abandoned.
    pub fn shutdown(&self) {
        let _ = self.stop.send(());
    }
}

/// Single-writer ingestion: the only path that mutates health state, the
/// outage window, and the anomaly models.
#[allow(clippy::too_many_arguments)]
async fn run_ingest_loop(
    cfg: EngineConfig,
    store: Arc<Store>,
    tracker: Arc<RwLock<StateTracker>>,
    recent_events: Arc<RwLock<VecDeque<HealthEvent>>>,
    mut rx: mpsc::Receiver<IngestMsg>,
    events_tx: broadcast::Sender<HealthEvent>,
    anomalies_tx: broadcast::Sender<AnomalyEvent>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut correlator = OutageCorrelator::new(&cfg);
    let mut scorer = AnomalyScorer::new(&cfg);
    let mut buffer: Vec<CheckResult> = Vec::with_capacity(128);
    let mut flush_interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                // Nothing queued past this point is ingested.
                flush_buffer(&store, &mut buffer);
                break;
            }
            msg = rx.recv() => match msg {
                None => {
                    flush_buffer(&store, &mut buffer);
                    break;
                }
                Some(IngestMsg::FleetSize(n)) => correlator.set_fleet_size(n),
                Some(IngestMsg::Remove(target_id)) => {
                    tracker.write().await.remove(target_id);
                    scorer.remove(target_id);
                }
                Some(IngestMsg::Result(result)) => {
                    buffer.push(result.clone());
                    if buffer.len() >= 500 {
                        flush_buffer(&store, &mut buffer);
                    }

                    let target_id = result.target_id;
                    let time = result.time;
                    let ingestion = tracker.write().await.ingest(result);

                    if let Some(event) =
                        detect(target_id, ingestion.prev_status, ingestion.state.status, time)
                    {
                        tracing::info!(
                            "target {} transitioned {:?} -> {:?}",
                            target_id,
                            event.prev,
                            event.curr
                        );
                        for out in correlator.offer(event, Utc::now()) {
                            publish(&events_tx, &recent_events, out).await;
                        }
                    }

                    let features = tracker.read().await.features(target_id);
                    if let Some(features) = features {
                        if let Some(ScoreOutcome::Scored { score, is_anomaly: true }) =
                            scorer.score_and_update(target_id, features)
                        {
                            tracing::info!(
                                "target {} anomalous: score {:.2}, latency {:.1}ms, loss {:.0}%",
                                target_id,
                                score,
                                features.latency_ms,
                                features.loss_ratio * 100.0
                            );
                            let _ = anomalies_tx.send(AnomalyEvent {
                                target_id,
                                score,
                                latency_ms: features.latency_ms,
                                loss_ratio: features.loss_ratio,
                                time: Utc::now(),
                            });
                        }
                    }
                }
            },
            _ = flush_interval.tick() => {
                flush_buffer(&store, &mut buffer);
                for out in correlator.sweep(Utc::now()) {
                    publish(&events_tx, &recent_events, out).await;
                }
            }
        }
    }
}

async fn publish(
    events_tx: &broadcast::Sender<HealthEvent>,
    recent_events: &Arc<RwLock<VecDeque<HealthEvent>>>,
    event: HealthEvent,
) {
    let mut ring = recent_events.write().await;
    if ring.len() == EVENT_RING_LEN {
        ring.pop_front();
    }
    ring.push_back(event.clone());
    drop(ring);

    // No subscribers is fine.
    let _ = events_tx.send(event);
}

fn flush_buffer(store: &Store, buffer: &mut Vec<CheckResult>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_check_results(buffer) {
        tracing::error!("failed to flush check results: {}", e);
    }

    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckKind, ErrorKind, MonitoredTarget};
    use tempfile::NamedTempFile;

    async fn engine() -> (NamedTempFile, Arc<HealthEngine>, i64) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut target = MonitoredTarget {
            name: "router".to_string(),
            address: "192.168.1.1".to_string(),
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();
        let engine = HealthEngine::new(store, EngineConfig::default());
        (tmp, engine, target.id)
    }

    async fn settle() {
        // Give the ingest loop a chance to drain the channel.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_ingest_updates_health_snapshot() {
        let (_tmp, engine, id) = engine().await;

        engine.ingest(CheckResult::ok(id, CheckKind::Ping, 4.2)).await;
        settle().await;

        let health = engine.health(id).await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.uptime_pct, Some(100.0));
        assert_eq!(engine.history(id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_degradation_event_is_broadcast() {
        let (_tmp, engine, id) = engine().await;
        let mut events = engine.subscribe_events();

        engine.ingest(CheckResult::ok(id, CheckKind::Ping, 4.2)).await;
        engine
            .ingest(CheckResult::failed(id, CheckKind::Ping, ErrorKind::Timeout))
            .await;
        engine
            .ingest(CheckResult::failed(id, CheckKind::Ping, ErrorKind::Timeout))
            .await;
        settle().await;

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("no event within 1s")
            .unwrap();
        match event {
            HealthEvent::Transition(e) => {
                assert_eq!(e.target_id, id);
                assert_eq!(e.prev, HealthStatus::Healthy);
                assert_eq!(e.curr, HealthStatus::Degraded);
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(engine.recent_events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_target_drops_state() {
        let (_tmp, engine, id) = engine().await;

        engine.ingest(CheckResult::ok(id, CheckKind::Ping, 4.2)).await;
        settle().await;
        assert!(engine.health(id).await.is_some());

        engine.remove_target(id).await;
        settle().await;
        assert!(engine.health(id).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_ingestion() {
        let (_tmp, engine, id) = engine().await;

        engine.shutdown();
        settle().await;

        engine.ingest(CheckResult::ok(id, CheckKind::Ping, 4.2)).await;
        settle().await;
        assert!(engine.health(id).await.is_none());
    }
}
