//! can-transport: bus driver contract for the drive bring-up controller
//!
//! This crate provides the frame-level primitives the controller core calls into: a
//! non-blocking receive, a fire-and-forget send, and bitrate configuration. The default
//! build enables a `mock` backend so that binaries and tests run on any host without a
//! transceiver attached.

mod types;
pub use types::{Bitrate, BusInfo, CanFilter, CanFrame, CanId, Timestamp};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::CanBus;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBus, Responder};

#[cfg(feature = "slcan")]
mod slcan;

#[cfg(feature = "slcan")]
pub use slcan::SlcanBus;
