//! Log collectors
//!
//! Collectors only deliver raw lines; parsing belongs to the normalizer.

pub mod file_tailer;
pub mod syslog_listener;

use std::path::Path;

use chrono::Utc;
use thiserror::Error;

use crate::models::RawLine;

pub use file_tailer::FileTailer;
pub use syslog_listener::SyslogListener;

/// Errors raised by collectors
#[derive(Error, Debug)]
pub enum InputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipeline channel closed")]
    ChannelClosed,
}

/// Read a whole log file into raw lines, skipping blank ones
pub async fn read_file_lines(path: &Path) -> Result<Vec<RawLine>, InputError> {
    let bytes = tokio::fs::read(path).await?;
    let contents = String::from_utf8_lossy(&bytes);
    let source = path.display().to_string();
    let received_at = Utc::now();

    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| RawLine::new(line, source.clone(), received_at))
        .collect())
}
