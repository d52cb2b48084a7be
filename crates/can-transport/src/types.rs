use core::fmt;
use time::OffsetDateTime;

/// 11-bit or 29-bit CAN identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    pub fn standard(id11: u16) -> Option<Self> {
        if id11 <= 0x7FF {
            Some(Self {
                raw: u32::from(id11),
                extended: false,
            })
        } else {
            None
        }
    }

    pub fn extended(id29: u32) -> Option<Self> {
        if id29 <= 0x1FFF_FFFF {
            Some(Self {
                raw: id29,
                extended: true,
            })
        } else {
            None
        }
    }

    /// Pick the narrowest identifier form that holds `raw`.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match u16::try_from(raw) {
            Ok(id11) if id11 <= 0x7FF => Self::standard(id11),
            _ => Self::extended(raw),
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }
    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{raw:08X}", raw = self.raw)
        } else {
            write!(f, "0x{raw:03X}", raw = self.raw)
        }
    }
}

/// A classic CAN data frame
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanFrame {
    pub id: CanId,
    pub len: u8,
    pub data: [u8; 8],
    pub rtr: bool,
    pub timestamp: Option<Timestamp>,
}

impl CanFrame {
    pub fn new(id: CanId, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            len: data.len() as u8,
            data: buf,
            rtr: false,
            timestamp: None,
        })
    }

    /// The valid data bytes (`len` clamped to 8).
    pub fn payload(&self) -> &[u8] {
        let len = usize::from(self.len).min(self.data.len());
        &self.data[..len]
    }

    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(Timestamp(OffsetDateTime::now_utc()));
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CanFilter {
    pub id: CanId,
    pub mask: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp(pub OffsetDateTime);

#[derive(Clone, Debug)]
pub struct BusInfo {
    pub name: String,
    pub driver: String,
}

/// Standard CAN bitrates
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Bitrate {
    B10k,
    B20k,
    B50k,
    B100k,
    B125k,
    B250k,
    B500k,
    B800k,
    B1M,
}

impl Bitrate {
    pub fn from_bps(bps: u32) -> Option<Self> {
        Some(match bps {
            10_000 => Bitrate::B10k,
            20_000 => Bitrate::B20k,
            50_000 => Bitrate::B50k,
            100_000 => Bitrate::B100k,
            125_000 => Bitrate::B125k,
            250_000 => Bitrate::B250k,
            500_000 => Bitrate::B500k,
            800_000 => Bitrate::B800k,
            1_000_000 => Bitrate::B1M,
            _ => return None,
        })
    }

    pub fn bps(self) -> u32 {
        match self {
            Bitrate::B10k => 10_000,
            Bitrate::B20k => 20_000,
            Bitrate::B50k => 50_000,
            Bitrate::B100k => 100_000,
            Bitrate::B125k => 125_000,
            Bitrate::B250k => 250_000,
            Bitrate::B500k => 500_000,
            Bitrate::B800k => 800_000,
            Bitrate::B1M => 1_000_000,
        }
    }
}
