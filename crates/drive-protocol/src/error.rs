use thiserror::Error;

pub type Result<T, E = MapperError> = core::result::Result<T, E>;

/// Rejected torque mapping configuration.
#[derive(Debug, Error, PartialEq)]
pub enum MapperError {
    #[error("max_percent must be within (0, 100], got {0}")]
    MaxPercent(f32),
    #[error("full_scale_counts must be within 1..=32767, got {0}")]
    FullScale(i32),
    #[error("center {center} must be within 1..={max_raw}")]
    Center { center: u16, max_raw: u16 },
    #[error("deadzone {deadzone} must be smaller than center {center}")]
    Deadzone { deadzone: u16, center: u16 },
    #[error("pedal rest {rest} and full {full} must differ and not exceed {max_raw}")]
    Travel { rest: u16, full: u16, max_raw: u16 },
}
