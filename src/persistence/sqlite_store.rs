//! SQLite implementation of the AlertStore trait

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use super::{AlertStore, PersistenceError};
use crate::models::{Alert, Enrichment, LogEvent, Severity};
use crate::sink::{AlertSink, SinkError};

/// SQLite-based alert storage
pub struct SqliteAlertStore {
    conn: Mutex<Connection>,
}

/// Columns of one `alerts` row, before validation
type AlertRow = (String, String, i64, String, String, String, Option<f64>, Option<String>, i64);

impl SqliteAlertStore {
    /// Open (or create) the database at the specified path and initialize the schema
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, PersistenceError> {
        let conn = Connection::open(db_path)?;
        let store = SqliteAlertStore {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing)
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteAlertStore {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    fn to_datetime(millis: i64) -> Result<DateTime<Utc>, PersistenceError> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| PersistenceError::InvalidData(format!("Invalid timestamp: {}", millis)))
    }

    fn to_json<T: serde::Serialize>(value: &T) -> Result<String, PersistenceError> {
        serde_json::to_string(value).map_err(|e| PersistenceError::InvalidData(e.to_string()))
    }

    fn decode_alert(row: AlertRow) -> Result<Alert, PersistenceError> {
        let (event_id, source, event_ts, message, severity, rule_hits, anomaly_score, enrichment, created_at) =
            row;

        let severity = Severity::parse(&severity)
            .ok_or_else(|| PersistenceError::InvalidData(format!("Invalid severity: {}", severity)))?;
        let rule_hits: BTreeSet<String> = serde_json::from_str(&rule_hits)
            .map_err(|e| PersistenceError::InvalidData(format!("Invalid rule hits: {}", e)))?;
        let enrichment: Option<Enrichment> = match enrichment {
            Some(json) => Some(
                serde_json::from_str(&json)
                    .map_err(|e| PersistenceError::InvalidData(format!("Invalid enrichment: {}", e)))?,
            ),
            None => None,
        };

        Ok(Alert {
            event_id,
            source,
            event_timestamp: Self::to_datetime(event_ts)?,
            message,
            severity,
            rule_hits,
            anomaly_score,
            enrichment,
            created_at: Self::to_datetime(created_at)?,
        })
    }

    /// Log records stored for `source`, oldest first
    pub fn logs_for_source(&self, source: &str) -> Result<Vec<(String, BTreeMap<String, String>)>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, parsed_fields FROM log_records WHERE source = ? ORDER BY timestamp ASC",
        )?;
        let rows = stmt
            .query_map(params![source], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, fields)| {
                let fields = serde_json::from_str(&fields)
                    .map_err(|e| PersistenceError::InvalidData(format!("Invalid fields: {}", e)))?;
                Ok((id, fields))
            })
            .collect()
    }
}

impl AlertStore for SqliteAlertStore {
    fn store_alert(&self, alert: &Alert) -> Result<(), PersistenceError> {
        let rule_hits = Self::to_json(&alert.rule_hits)?;
        let enrichment = alert.enrichment.as_ref().map(Self::to_json).transpose()?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO alerts
             (event_id, source, event_timestamp, message, severity, rule_hits, anomaly_score, enrichment, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                alert.event_id,
                alert.source,
                alert.event_timestamp.timestamp_millis(),
                alert.message,
                alert.severity.to_string(),
                rule_hits,
                alert.anomaly_score,
                enrichment,
                alert.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>, PersistenceError> {
        let rows: Vec<AlertRow> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT event_id, source, event_timestamp, message, severity, rule_hits,
                        anomaly_score, enrichment, created_at
                 FROM alerts
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        rows.into_iter().map(Self::decode_alert).collect()
    }

    fn alert_count(&self) -> Result<usize, PersistenceError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn store_log(&self, event: &LogEvent) -> Result<(), PersistenceError> {
        let fields = Self::to_json(&event.parsed_fields)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO log_records (event_id, source, timestamp, raw_text, parsed_fields, parse_ok)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                event.id,
                event.source,
                event.timestamp_millis(),
                event.raw_text,
                fields,
                event.parse_ok,
            ],
        )?;
        Ok(())
    }

    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, PersistenceError> {
        let cutoff = cutoff.timestamp_millis();
        let conn = self.conn.lock();

        let mut total_deleted = conn.execute("DELETE FROM alerts WHERE created_at < ?", params![cutoff])?;
        total_deleted += conn.execute("DELETE FROM log_records WHERE timestamp < ?", params![cutoff])?;

        Ok(total_deleted)
    }

    fn clear_all(&self) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "DELETE FROM alerts;
             DELETE FROM log_records;",
        )?;
        Ok(())
    }
}

#[async_trait]
impl AlertSink for SqliteAlertStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn put(&self, alert: &Alert) -> Result<(), SinkError> {
        self.store_alert(alert)?;
        Ok(())
    }

    async fn forward_log(&self, event: &LogEvent) -> Result<(), SinkError> {
        self.store_log(event)?;
        Ok(())
    }
}
