//! LanPulse - Device Health Monitoring
//!
//! Polls a fleet of LAN devices on a fixed cadence, tracks per-device
//! health with hysteresis, and raises transition, mass-outage, and anomaly
//! events over a JSON API.

mod config;
mod db;
mod engine;
mod probe;
mod web;

use config::ServerConfig;
use db::Store;
use engine::{HealthEngine, HealthEvent};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("lanpulse=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting LanPulse on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Add sample target if none exist
    let targets = store.get_targets()?;
    if targets.is_empty() {
        tracing::info!("Adding sample target: gateway");
        let mut target = db::MonitoredTarget {
            name: "Gateway".to_string(),
            address: "192.168.1.1".to_string(),
            ..Default::default()
        };
        store.add_target(&mut target)?;
    }

    // Create and start the health engine
    let engine = HealthEngine::new(store.clone(), cfg.engine.clone());
    engine.start();

    // Log events until a real notification dispatcher is attached
    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                HealthEvent::Transition(e) => {
                    tracing::info!(
                        "event: target {} went {:?} -> {:?}",
                        e.target_id,
                        e.prev,
                        e.curr
                    );
                }
                HealthEvent::MassOutage(m) => {
                    tracing::warn!(
                        "event: mass outage of {} targets starting {}",
                        m.target_ids.len(),
                        m.started_at
                    );
                }
            }
        }
    });

    // Start web server
    let server = Server::new(cfg, store, engine);
    server.start().await?;

    Ok(())
}
