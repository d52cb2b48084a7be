//! audit-log: durable, append-only record of every frame exchanged with the drive
//!
//! Each frame becomes one CSV line (timestamp, direction, identifier, length, eight byte
//! columns, decoded text). Files are named by probing a numbered pattern so a new run
//! never overwrites an earlier one.

mod error;
pub use error::{AuditError, Result};

mod record;
pub use record::{format_record, parse_record, read_records, Decoded, LogEntry, LogRecord, HEADER};

mod sink;
pub use sink::{next_log_name, FileSink, FileStore, LogSink, LogStore, MemorySink, MemoryStore};

mod log;
pub use log::AuditLog;
