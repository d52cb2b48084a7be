//! drive-protocol: register codec and torque mapping for the drive
//!
//! Every command and telemetry reply is a CAN frame whose first data byte selects a
//! register and whose next two bytes carry the value, little-endian. This crate maps
//! between those frames and typed [`Command`] / [`Telemetry`] values and turns raw
//! analog samples into clamped torque setpoints.

pub mod registers;

mod types;
pub use types::{Direction, DriveIds, RegisterFrame, StatusWord};

mod error;
pub use error::{MapperError, Result};

mod encode;
pub use encode::{decode_command, encode, Command};

mod decode;
pub use decode::{decode, decode_can, decode_register, Telemetry};

mod torque;
pub use torque::{MappingPolicy, Resolution, TorqueConfig, TorqueMapper, TORQUE_FULL_SCALE_PERCENT};
