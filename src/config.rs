//! Configuration for lanpulse.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the JSON API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "lanpulse.db")
    pub db_path: String,
    pub engine: EngineConfig,
}

/// Tunables for the health engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Seconds between scheduler ticks.
    pub poll_interval_secs: u64,
    /// Batch deadline; probes still outstanding are recorded as failures.
    pub batch_deadline_secs: u64,
    /// Maximum concurrent probe tasks per batch.
    pub max_concurrent_probes: usize,
    /// Ring buffer capacity per target (2880 = 24h at 30s ticks).
    pub history_len: usize,
    /// Consecutive hard failures before a target goes unhealthy.
    pub fail_threshold: u32,
    /// Consecutive successes before an unhealthy target recovers.
    pub recover_threshold: u32,
    /// Consecutive failures before a healthy target degrades.
    pub degrade_failures: u32,
    /// Rolling-average latency above which a single failure degrades.
    pub soft_latency_ms: f64,
    /// Trailing window for the uptime percentage, in seconds.
    pub uptime_window_secs: i64,
    /// Mass-outage correlation window, in seconds.
    pub outage_window_secs: i64,
    /// Absolute cap on the mass-outage threshold.
    pub outage_min_targets: usize,
    /// Fleet fraction for the mass-outage threshold.
    pub outage_fleet_fraction: f64,
    /// Observations per target before the anomaly model may score.
    pub anomaly_warmup: u32,
    /// Z-score above which a sample is flagged anomalous.
    pub anomaly_z_threshold: f64,
    /// How long persisted check results are kept, in seconds.
    pub retention_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            batch_deadline_secs: 25,
            max_concurrent_probes: 32,
            history_len: 2880,
            fail_threshold: 3,
            recover_threshold: 2,
            degrade_failures: 2,
            soft_latency_ms: 250.0,
            uptime_window_secs: 86_400,
            outage_window_secs: 120,
            outage_min_targets: 5,
            outage_fleet_fraction: 0.30,
            anomaly_warmup: 30,
            anomaly_z_threshold: 3.0,
            retention_secs: 7 * 86_400,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "lanpulse.db".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LANPULSE_HTTP_PORT`: HTTP port (default: 8080)
    /// - `LANPULSE_DB_PATH`: database file path (default: "lanpulse.db")
    /// - `LANPULSE_POLL_INTERVAL`: seconds between ticks (default: 30)
    /// - `LANPULSE_MAX_CONCURRENT`: probe concurrency limit (default: 32)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port) = env::var("LANPULSE_HTTP_PORT") {
            if let Ok(port) = port.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("LANPULSE_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(secs) = env::var("LANPULSE_POLL_INTERVAL") {
            if let Ok(secs) = secs.parse::<u64>() {
                if secs > 0 {
                    cfg.engine.poll_interval_secs = secs;
                    cfg.engine.batch_deadline_secs = secs.saturating_sub(5).max(1);
                }
            }
        }

        if let Ok(n) = env::var("LANPULSE_MAX_CONCURRENT") {
            if let Ok(n) = n.parse::<usize>() {
                if n > 0 {
                    cfg.engine.max_concurrent_probes = n;
                }
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "lanpulse.db");
        assert_eq!(cfg.engine.poll_interval_secs, 30);
        assert!(cfg.engine.batch_deadline_secs < cfg.engine.poll_interval_secs);
    }

    #[test]
    fn test_engine_defaults_consistent() {
        let eng = EngineConfig::default();
        // Recovery must demand more than a single success.
        assert!(eng.recover_threshold >= 2);
        // Degradation must trip before the unhealthy threshold.
        assert!(eng.degrade_failures < eng.fail_threshold);
    }
}
