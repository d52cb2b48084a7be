//! Register identifiers (first data byte of every frame)

/// Read request: byte1 = register to read, byte2 = cyclic interval in ms (0 = once)
pub const READ_REQUEST: u8 = 0x3D;
/// Clear all latched error flags
pub const CLEAR_ERRORS: u8 = 0x8E;
/// Mode word: 0x04 in byte1 locks/disables, 0x00 enables
pub const MODE: u8 = 0x51;
/// Torque setpoint, signed 16-bit, ±32767 = ±150 %
pub const TORQUE_SETPOINT: u8 = 0x90;
/// Bus communication timeout in ms
pub const BUS_TIMEOUT: u8 = 0xD0;

/// Status word (reply)
pub const STATUS: u8 = 0x40;
/// Actual speed, rpm (reply)
pub const SPEED: u8 = 0x30;
/// DC bus voltage, 0.1 V (reply)
pub const DC_BUS_VOLTAGE: u8 = 0xEB;
/// Actual current, 0.1 A (reply)
pub const CURRENT: u8 = 0x5F;
/// Torque feedback, ±32767 = ±100 % (reply)
pub const TORQUE_FEEDBACK: u8 = 0xA0;

pub(crate) const MODE_DISABLE: u8 = 0x04;
pub(crate) const MODE_ENABLE: u8 = 0x00;
