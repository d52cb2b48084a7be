use audit_log::AuditError;
use can_transport::TransportError;
use drive_protocol::MapperError;
use thiserror::Error;

/// Everything that can stop a bring-up run.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("audit log failure: {0}")]
    Audit(#[from] AuditError),
    #[error("no drive response within {waited_ms} ms")]
    DriveUnreachable { waited_ms: u64 },
    #[error("torque mapping rejected: {0}")]
    Mapper(#[from] MapperError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("metrics init error: {0}")]
    Metrics(String),
}

pub type Result<T, E = ControlError> = core::result::Result<T, E>;
