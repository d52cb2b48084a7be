use crate::registers::{
    BUS_TIMEOUT, CLEAR_ERRORS, MODE, MODE_DISABLE, MODE_ENABLE, READ_REQUEST, TORQUE_SETPOINT,
};
use crate::{Direction, RegisterFrame};
use core::fmt;

/// Commands the controller writes to the drive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    /// Ask for one reply of the given register.
    RequestTelemetryOnce(u8),
    /// Ask the drive to transmit the register every `interval_ms`.
    RequestTelemetryCyclic(u8, u8),
    ClearErrors,
    /// `false` locks the power stage, `true` releases it.
    SetArmed(bool),
    /// Signed setpoint, ±32767 = ±150 % rated torque.
    SetTorque(i16),
    /// Drive-side watchdog on bus silence, in ms.
    SetBusTimeout(u16),
}

/// Wire form of a command. Total and deterministic.
pub fn encode(cmd: Command) -> RegisterFrame {
    let out = Direction::Outbound;
    match cmd {
        Command::RequestTelemetryOnce(reg) => RegisterFrame::word(READ_REQUEST, reg, 0x00, out),
        Command::RequestTelemetryCyclic(reg, ms) => RegisterFrame::word(READ_REQUEST, reg, ms, out),
        Command::ClearErrors => RegisterFrame::word(CLEAR_ERRORS, 0x00, 0x00, out),
        Command::SetArmed(false) => RegisterFrame::word(MODE, MODE_DISABLE, 0x00, out),
        Command::SetArmed(true) => RegisterFrame::word(MODE, MODE_ENABLE, 0x00, out),
        Command::SetTorque(v) => {
            let [lo, hi] = v.to_le_bytes();
            RegisterFrame::word(TORQUE_SETPOINT, lo, hi, out)
        }
        Command::SetBusTimeout(ms) => {
            let [lo, hi] = ms.to_le_bytes();
            RegisterFrame::word(BUS_TIMEOUT, lo, hi, out)
        }
    }
}

/// Inverse of [`encode`]: recognise a command frame seen on the bus or in a log.
pub fn decode_command(frame: &RegisterFrame) -> Option<Command> {
    let [b1, b2] = match frame.payload() {
        [b1, b2] => [*b1, *b2],
        _ => return None,
    };
    match frame.register() {
        READ_REQUEST if b2 == 0 => Some(Command::RequestTelemetryOnce(b1)),
        READ_REQUEST => Some(Command::RequestTelemetryCyclic(b1, b2)),
        CLEAR_ERRORS => Some(Command::ClearErrors),
        MODE if b1 == MODE_DISABLE => Some(Command::SetArmed(false)),
        MODE if b1 == MODE_ENABLE => Some(Command::SetArmed(true)),
        TORQUE_SETPOINT => Some(Command::SetTorque(i16::from_le_bytes([b1, b2]))),
        BUS_TIMEOUT => Some(Command::SetBusTimeout(u16::from_le_bytes([b1, b2]))),
        _ => None,
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Command::RequestTelemetryOnce(reg) => write!(f, "Request register 0x{reg:02X}"),
            Command::RequestTelemetryCyclic(reg, ms) => {
                write!(f, "Request register 0x{reg:02X} every {ms} ms")
            }
            Command::ClearErrors => f.write_str("Clear all error flags"),
            Command::SetArmed(false) => f.write_str("Lock/Disable drive"),
            Command::SetArmed(true) => f.write_str("Enable drive"),
            Command::SetTorque(v) => write!(f, "Set torque = {v}"),
            Command::SetBusTimeout(ms) => write!(f, "Set CAN timeout = {ms} ms"),
        }
    }
}
