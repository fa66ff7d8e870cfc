//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("invalid checks column: {0}")]
    InvalidChecks(#[from] serde_json::Error),
    #[error("not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| DbError::Migration(format!("init migration failed: {}", e)))?;
        Ok(())
    }

    // --- Target CRUD ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut MonitoredTarget) -> Result<i64, DbError> {
        let checks = serde_json::to_string(&target.checks)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO targets (name, address, checks, enabled) VALUES (?1, ?2, ?3, ?4)",
            params![target.name, target.address, checks, target.enabled],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        Ok(id)
    }

    /// Update an existing target.
    pub fn update_target(&self, target: &MonitoredTarget) -> Result<(), DbError> {
        let checks = serde_json::to_string(&target.checks)?;
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE targets SET name=?1, address=?2, checks=?3, enabled=?4 WHERE id=?5",
            params![target.name, target.address, checks, target.enabled, target.id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Enable or disable monitoring for a target without touching its config.
    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE targets SET enabled=?1 WHERE id=?2",
            params![enabled, id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all targets, enabled or not.
    pub fn get_targets(&self) -> Result<Vec<MonitoredTarget>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, name, address, checks, enabled FROM targets ORDER BY id")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        drop(stmt);
        drop(conn);

        rows.into_iter()
            .map(|(id, name, address, checks, enabled)| {
                Ok(MonitoredTarget {
                    id,
                    name,
                    address,
                    checks: serde_json::from_str(&checks)?,
                    enabled,
                })
            })
            .collect()
    }

    /// Get only targets with monitoring enabled.
    pub fn get_enabled_targets(&self) -> Result<Vec<MonitoredTarget>, DbError> {
        Ok(self
            .get_targets()?
            .into_iter()
            .filter(|t| t.enabled)
            .collect())
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: i64) -> Result<MonitoredTarget, DbError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, address, checks, enabled FROM targets WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::NotFound,
                other => DbError::Sqlite(other),
            })?;

        Ok(MonitoredTarget {
            id: row.0,
            name: row.1,
            address: row.2,
            checks: serde_json::from_str(&row.3)?,
            enabled: row.4,
        })
    }

    /// Delete a target and its history.
    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM check_results WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Check results ---

    /// Add check results in batch.
    pub fn add_check_results(&self, results: &[CheckResult]) -> Result<(), DbError> {
        if results.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO check_results (time, target_id, kind, success, latency_ms, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for r in results {
                stmt.execute(params![
                    format_db_time(r.time),
                    r.target_id,
                    r.kind.as_str(),
                    r.success,
                    r.latency_ms,
                    r.error.map(|e| e.as_str()),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get the most recent check results for a target, oldest first.
    pub fn get_check_results(&self, target_id: i64, limit: i64) -> Result<Vec<CheckResult>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, target_id, kind, success, latency_ms, error FROM (
                 SELECT * FROM check_results WHERE target_id = ?1
                 ORDER BY time DESC LIMIT ?2
             ) ORDER BY time ASC",
        )?;

        let results = stmt
            .query_map(params![target_id, limit], |row| {
                let time_str: String = row.get(0)?;
                let kind_str: String = row.get(2)?;
                let error_str: Option<String> = row.get(5)?;
                Ok(CheckResult {
                    time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                    target_id: row.get(1)?,
                    kind: CheckKind::parse(&kind_str).unwrap_or(CheckKind::Ping),
                    success: row.get(3)?,
                    latency_ms: row.get(4)?,
                    error: error_str.as_deref().and_then(ErrorKind::parse),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(results)
    }

    /// Delete check results older than the cutoff, across all targets.
    pub fn delete_results_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM check_results WHERE time < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(n)
    }
}

fn format_db_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_target_crud() {
        let (_tmp, store) = open_store();

        let mut target = MonitoredTarget {
            name: "Router".to_string(),
            address: "192.168.1.1".to_string(),
            checks: vec![CheckSpec::Ping, CheckSpec::Tcp { port: 80 }],
            ..Default::default()
        };
        let id = store.add_target(&mut target).unwrap();
        assert!(id > 0);

        let fetched = store.get_target(id).unwrap();
        assert_eq!(fetched.name, "Router");
        assert_eq!(fetched.checks.len(), 2);
        assert!(fetched.enabled);

        let mut updated = fetched;
        updated.name = "Gateway".to_string();
        store.update_target(&updated).unwrap();
        assert_eq!(store.get_target(id).unwrap().name, "Gateway");

        store.delete_target(id).unwrap();
        assert!(matches!(store.get_target(id), Err(DbError::NotFound)));
    }

    #[test]
    fn test_enable_disable() {
        let (_tmp, store) = open_store();

        let mut target = MonitoredTarget {
            name: "NAS".to_string(),
            address: "192.168.1.20".to_string(),
            ..Default::default()
        };
        let id = store.add_target(&mut target).unwrap();

        store.set_enabled(id, false).unwrap();
        assert!(!store.get_target(id).unwrap().enabled);
        assert!(store.get_enabled_targets().unwrap().is_empty());

        store.set_enabled(id, true).unwrap();
        assert_eq!(store.get_enabled_targets().unwrap().len(), 1);

        assert!(matches!(store.set_enabled(9999, true), Err(DbError::NotFound)));
    }

    #[test]
    fn test_check_result_history() {
        let (_tmp, store) = open_store();

        let mut target = MonitoredTarget {
            name: "Printer".to_string(),
            address: "192.168.1.50".to_string(),
            ..Default::default()
        };
        let id = store.add_target(&mut target).unwrap();

        let mut results = Vec::new();
        for i in 0..5 {
            let mut r = if i == 2 {
                CheckResult::failed(id, CheckKind::Ping, ErrorKind::Timeout)
            } else {
                CheckResult::ok(id, CheckKind::Ping, 3.5 + i as f64)
            };
            r.time = Utc::now() + chrono::Duration::milliseconds(i);
            results.push(r);
        }
        store.add_check_results(&results).unwrap();

        let history = store.get_check_results(id, 100).unwrap();
        assert_eq!(history.len(), 5);
        // Oldest first.
        assert!(history.windows(2).all(|w| w[0].time <= w[1].time));
        assert!(!history[2].success);
        assert_eq!(history[2].error, Some(ErrorKind::Timeout));

        // Limit keeps the most recent entries.
        let tail = store.get_check_results(id, 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].time, history[4].time);
    }

    #[test]
    fn test_retention_cutoff() {
        let (_tmp, store) = open_store();

        let mut target = MonitoredTarget {
            name: "AP".to_string(),
            address: "192.168.1.2".to_string(),
            ..Default::default()
        };
        let id = store.add_target(&mut target).unwrap();

        let mut old = CheckResult::ok(id, CheckKind::Ping, 1.0);
        old.time = Utc::now() - chrono::Duration::days(8);
        let fresh = CheckResult::ok(id, CheckKind::Ping, 1.0);
        store.add_check_results(&[old, fresh]).unwrap();

        let deleted = store
            .delete_results_before(Utc::now() - chrono::Duration::days(7))
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.get_check_results(id, 100).unwrap().len(), 1);
    }
}
