//! Persistence module for alert storage
//!
//! Alerts (and optionally the plain log records that raised none) are kept in
//! a local database so they can be queried after the fact and survive
//! daemon restarts.

pub mod sqlite_store;

pub use sqlite_store::SqliteAlertStore;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Alert, LogEvent};

/// Errors that can occur during persistence operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data in database: {0}")]
    InvalidData(String),
}

/// Trait for alert storage backends
pub trait AlertStore: Send + Sync {
    /// Store an alert. Storing the same event id twice keeps the first copy.
    fn store_alert(&self, alert: &Alert) -> Result<(), PersistenceError>;

    /// Most recently created alerts first
    fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>, PersistenceError>;

    fn alert_count(&self) -> Result<usize, PersistenceError>;

    /// Store a log record for an event that raised no alert
    fn store_log(&self, event: &LogEvent) -> Result<(), PersistenceError>;

    /// Remove alerts created, and log records timestamped, before `cutoff`
    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, PersistenceError>;

    /// Clear all data (useful for testing)
    fn clear_all(&self) -> Result<(), PersistenceError>;
}
