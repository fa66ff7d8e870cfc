//! Batch probe scheduler.
//!
//! A single periodic driver: on each tick it reads the current enabled
//! target set (membership changes take effect on the next cycle, never
//! mid-batch), fans out one probe task per (target, check) bounded by a
//! semaphore, and waits for the batch to finish or the batch deadline to
//! fire. A probe still outstanding at the deadline is aborted and recorded
//! as a failure for this cycle, so a slow device can never stall the batch
//! or leak work into the next one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::config::EngineConfig;
use crate::db::{CheckKind, CheckResult, ErrorKind, Store};
use crate::probe;

/// Messages consumed by the single-writer ingest loop.
#[derive(Debug)]
pub(crate) enum IngestMsg {
    Result(CheckResult),
    /// Enabled-target count, reported once per tick for the outage threshold.
    FleetSize(usize),
    /// Drop all derived state for a deleted target.
    Remove(i64),
}

/// The periodic driver that fans out probe batches.
pub struct Scheduler {
    store: Arc<Store>,
    cfg: EngineConfig,
    tx: mpsc::Sender<IngestMsg>,
    stop: broadcast::Sender<()>,
}

impl Scheduler {
    pub(crate) fn new(
        store: Arc<Store>,
        cfg: EngineConfig,
        tx: mpsc::Sender<IngestMsg>,
        stop: broadcast::Sender<()>,
    ) -> Self {
        Self {
            store,
            cfg,
            tx,
            stop,
        }
    }

    /// Start the tick loop in a background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let cfg = self.cfg.clone();
        let tx = self.tx.clone();
        let mut stop_rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(cfg.poll_interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::info!("scheduler: stopping, abandoning in-flight probes");
                        break;
                    }
                    _ = interval.tick() => {
                        run_batch(&store, &cfg, &tx).await;
                    }
                }
            }
        });
    }
}

/// Run one probe batch over the enabled target set.
pub(crate) async fn run_batch(store: &Store, cfg: &EngineConfig, tx: &mpsc::Sender<IngestMsg>) {
    // An upstream failure skips the cycle; the next tick retries.
    let targets = match store.get_enabled_targets() {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!("scheduler: cannot enumerate targets, skipping cycle: {}", e);
            return;
        }
    };

    if tx.send(IngestMsg::FleetSize(targets.len())).await.is_err() {
        return; // engine shut down
    }
    if targets.is_empty() {
        return;
    }

    let semaphore = Arc::new(Semaphore::new(cfg.max_concurrent_probes));
    let mut join_set = JoinSet::new();
    // Probes not finished by the deadline get a synthesized failure.
    let mut pending: HashMap<usize, (i64, CheckKind)> = HashMap::new();

    let mut idx = 0usize;
    for target in &targets {
        for check in &target.checks {
            let sem = semaphore.clone();
            let target = target.clone();
            let check = check.clone();
            let timeout = probe::default_timeout(check.kind());

            pending.insert(idx, (target.id, check.kind()));
            join_set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let result = probe::run_check(&target, &check, timeout).await;
                (idx, result)
            });
            idx += 1;
        }
    }

    tracing::debug!("scheduler: batch of {} probes dispatched", idx);

    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(cfg.batch_deadline_secs);

    loop {
        tokio::select! {
            joined = join_set.join_next() => match joined {
                None => break, // batch complete
                Some(Ok((idx, result))) => {
                    pending.remove(&idx);
                    if tx.send(IngestMsg::Result(result)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    // Leave the pending entry in place; the probe is
                    // recorded as failed below.
                    tracing::error!("scheduler: probe task failed: {}", e);
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(
                    "scheduler: batch deadline hit with {} probes outstanding",
                    pending.len()
                );
                join_set.abort_all();
                break;
            }
        }
    }

    for (target_id, kind) in pending.into_values() {
        let result = CheckResult::failed(target_id, kind, ErrorKind::Timeout);
        if tx.send(IngestMsg::Result(result)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckSpec, MonitoredTarget};
    use tempfile::NamedTempFile;

    fn store_with_target(checks: Vec<CheckSpec>, enabled: bool) -> (NamedTempFile, Arc<Store>) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut target = MonitoredTarget {
            name: "t".to_string(),
            address: "127.0.0.1".to_string(),
            checks,
            enabled,
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();
        (tmp, Arc::new(store))
    }

    #[tokio::test]
    async fn test_batch_reports_fleet_size_and_results() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (_tmp, store) = store_with_target(vec![CheckSpec::Tcp { port }], true);

        let (tx, mut rx) = mpsc::channel(64);
        run_batch(&store, &EngineConfig::default(), &tx).await;
        drop(tx);

        let mut fleet = None;
        let mut results = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                IngestMsg::FleetSize(n) => fleet = Some(n),
                IngestMsg::Result(r) => results.push(r),
                IngestMsg::Remove(_) => {}
            }
        }
        assert_eq!(fleet, Some(1));
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn test_disabled_targets_are_not_probed() {
        let (_tmp, store) = store_with_target(vec![CheckSpec::Tcp { port: 1 }], false);

        let (tx, mut rx) = mpsc::channel(64);
        run_batch(&store, &EngineConfig::default(), &tx).await;
        drop(tx);

        let mut results = 0;
        let mut fleet = None;
        while let Some(msg) = rx.recv().await {
            match msg {
                IngestMsg::FleetSize(n) => fleet = Some(n),
                IngestMsg::Result(_) => results += 1,
                IngestMsg::Remove(_) => {}
            }
        }
        assert_eq!(fleet, Some(0));
        assert_eq!(results, 0);
    }

    #[tokio::test]
    async fn test_deadline_records_outstanding_probe_as_failure() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        // A listener with a saturated accept backlog: the connect stalls
        // until the probe timeout (2s), well past the 1s batch deadline.
        let (_listener, _fillers, port) = crate::probe::testutil::stalled_listener();
        let mut target = MonitoredTarget {
            name: "stalled".to_string(),
            address: "127.0.0.1".to_string(),
            checks: vec![CheckSpec::Tcp { port }],
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();
        let id = target.id;

        let mut cfg = EngineConfig::default();
        cfg.batch_deadline_secs = 1;

        let (tx, mut rx) = mpsc::channel(64);
        let started = std::time::Instant::now();
        run_batch(&Arc::new(store), &cfg, &tx).await;
        drop(tx);

        // The batch must not run past its deadline by much.
        assert!(started.elapsed() < Duration::from_millis(1900));

        let mut results = Vec::new();
        while let Some(msg) = rx.recv().await {
            if let IngestMsg::Result(r) = msg {
                results.push(r);
            }
        }
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].target_id, id);
        assert!(!results[0].success);
        assert_eq!(results[0].error, Some(ErrorKind::Timeout));
    }
}
