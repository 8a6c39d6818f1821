pub mod alert;
pub mod event;

pub use alert::{Alert, Enrichment, Severity};
pub use event::{LogEvent, RawLine};
