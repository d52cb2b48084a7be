use thiserror::Error;

pub type Result<T, E = AuditError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("cannot open log {name}: {reason}")]
    Open { name: String, reason: String },
    #[error("no free log name left for prefix {0}")]
    NamesExhausted(String),
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed log line {line}: {reason}")]
    Parse { line: usize, reason: &'static str },
}
