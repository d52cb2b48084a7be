use can_transport::{CanFrame, CanId};
use core::fmt;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    /// Column text used by the audit log.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Outbound => "TX",
            Direction::Inbound => "RX",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CAN identities of the drive: the id it listens on and the id it answers from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DriveIds {
    pub command: CanId,
    pub reply: CanId,
}

impl DriveIds {
    /// Factory default command id (host to drive).
    pub const DEFAULT_COMMAND: u32 = 0x201;
    /// Factory default reply id (drive to host).
    pub const DEFAULT_REPLY: u32 = 0x181;

    pub fn new(command: u32, reply: u32) -> Option<Self> {
        Some(Self {
            command: CanId::from_raw(command)?,
            reply: CanId::from_raw(reply)?,
        })
    }
}

/// One register frame: register id plus up to two payload bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterFrame {
    register: u8,
    payload: [u8; 2],
    payload_len: u8,
    direction: Direction,
}

impl RegisterFrame {
    pub fn new(register: u8, payload: &[u8], direction: Direction) -> Option<Self> {
        if payload.len() > 2 {
            return None;
        }
        let mut buf = [0u8; 2];
        buf[..payload.len()].copy_from_slice(payload);
        Some(Self {
            register,
            payload: buf,
            payload_len: payload.len() as u8,
            direction,
        })
    }

    pub(crate) fn word(register: u8, lo: u8, hi: u8, direction: Direction) -> Self {
        Self {
            register,
            payload: [lo, hi],
            payload_len: 2,
            direction,
        }
    }

    pub fn register(&self) -> u8 {
        self.register
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..usize::from(self.payload_len)]
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Register byte followed by the payload, as it appears on the wire.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3);
        out.push(self.register);
        out.extend_from_slice(self.payload());
        out
    }

    pub fn to_can(&self, id: CanId) -> CanFrame {
        let mut data = [0u8; 8];
        data[0] = self.register;
        data[1..=2].copy_from_slice(&self.payload);
        CanFrame {
            id,
            len: 1 + self.payload_len,
            data,
            rtr: false,
            timestamp: None,
        }
    }

    /// Take the register and the next (at most two) bytes of a CAN frame.
    /// Returns `None` for frames without data.
    pub fn from_can(frame: &CanFrame, direction: Direction) -> Option<Self> {
        let (register, rest) = frame.payload().split_first()?;
        Self::new(*register, &rest[..rest.len().min(2)], direction)
    }
}

/// Drive status word (register 0x40).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub fn enabled(self) -> bool {
        self.0 & (1 << 0) != 0
    }

    pub fn ready(self) -> bool {
        self.0 & (1 << 2) != 0
    }

    pub fn fault(self) -> bool {
        self.0 & (1 << 6) != 0
    }
}
