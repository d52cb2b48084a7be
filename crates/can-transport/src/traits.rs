use crate::{Bitrate, BusInfo, CanFilter, CanFrame, Result, TransportError};

/// Frame-level bus driver consumed by the controller core.
///
/// Receive is strictly non-blocking so a cooperative loop can drain what is available
/// and move on. Sends are fire-and-forget: callers log a failure and proceed.
pub trait CanBus {
    /// Open a CAN interface by name (e.g., "can0", "/dev/ttyACM0", "mock0").
    fn open(name: &str) -> Result<Self>
    where
        Self: Sized;

    /// Attempt to list available interfaces for this backend.
    fn list() -> Result<Vec<BusInfo>>
    where
        Self: Sized;

    /// Reconfigure the bus bitrate. Backends re-open the channel as needed.
    fn configure_bitrate(&mut self, bitrate: Bitrate) -> Result<()>;

    /// Set acceptance filters if supported.
    fn set_filters(&mut self, _filters: &[CanFilter]) -> Result<()> {
        Err(TransportError::Unsupported("filters not supported"))
    }

    /// Return at most one pending frame without waiting for more.
    fn try_recv(&mut self) -> Result<Option<CanFrame>>;

    /// Send one frame.
    fn send(&mut self, frame: &CanFrame) -> Result<()>;
}
