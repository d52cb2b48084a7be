use crate::{Bitrate, BusInfo, CanBus, CanFilter, CanFrame, CanId, Result, TransportError};
use serialport::{SerialPort, SerialPortType};
use std::io::{Read, Write};
use std::time::Duration;

/// SLCAN text protocol over serial (common USB-CAN dongles)
pub struct SlcanBus {
    port_path: String,
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SlcanBus {
    pub fn open_with(path: &str, bitrate: Option<Bitrate>) -> Result<Self> {
        let port = serialport::new(path, 115200)
            .timeout(Duration::from_millis(5))
            .open()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let mut bus = SlcanBus {
            port_path: path.to_string(),
            port,
            pending: Vec::with_capacity(64),
        };
        bus.configure_bitrate(bitrate.unwrap_or(Bitrate::B500k))?;
        Ok(bus)
    }

    fn code(bitrate: Bitrate) -> u8 {
        match bitrate {
            Bitrate::B10k => b'0',
            Bitrate::B20k => b'1',
            Bitrate::B50k => b'2',
            Bitrate::B100k => b'3',
            Bitrate::B125k => b'4',
            Bitrate::B250k => b'5',
            Bitrate::B500k => b'6',
            Bitrate::B800k => b'7',
            Bitrate::B1M => b'8',
        }
    }

    fn encode_frame(frame: &CanFrame) -> Result<Vec<u8>> {
        if frame.rtr {
            return Err(TransportError::Unsupported("RTR not implemented"));
        }
        if frame.len > 8 {
            return Err(TransportError::InvalidFrame("dlc > 8"));
        }
        let mut out = if frame.id.is_extended() {
            format!("T{:08X}{}", frame.id.raw(), frame.len)
        } else {
            format!("t{:03X}{}", frame.id.raw(), frame.len)
        };
        for b in frame.payload() {
            out.push_str(&format!("{b:02X}"));
        }
        out.push('\r');
        Ok(out.into_bytes())
    }

    fn parse_frame(line: &[u8]) -> Result<CanFrame> {
        let text = std::str::from_utf8(line).map_err(|_| TransportError::InvalidFrame("utf8"))?;
        let (kind, rest) = match text.char_indices().nth(1) {
            Some((split, _)) => text.split_at(split),
            None => return Err(TransportError::InvalidFrame("empty")),
        };
        let id_digits = match kind {
            "t" | "r" => 3,
            "T" | "R" => 8,
            _ => return Err(TransportError::InvalidFrame("unknown header")),
        };
        let id_hex = rest.get(..id_digits).ok_or(TransportError::InvalidFrame("short id"))?;
        let raw = u32::from_str_radix(id_hex, 16).map_err(|_| TransportError::InvalidFrame("id"))?;
        let id = if id_digits == 3 {
            u16::try_from(raw).ok().and_then(CanId::standard)
        } else {
            CanId::extended(raw)
        }
        .ok_or(TransportError::InvalidFrame("id range"))?;

        let dlc = rest
            .get(id_digits..=id_digits)
            .and_then(|d| d.parse::<usize>().ok())
            .filter(|d| *d <= 8)
            .ok_or(TransportError::InvalidFrame("dlc"))?;
        let mut data = Vec::with_capacity(dlc);
        let body = rest.get(id_digits + 1..).unwrap_or("");
        if kind == "t" || kind == "T" {
            for i in 0..dlc {
                let hex = body
                    .get(i * 2..i * 2 + 2)
                    .ok_or(TransportError::InvalidFrame("short data"))?;
                data.push(
                    u8::from_str_radix(hex, 16).map_err(|_| TransportError::InvalidFrame("byte"))?,
                );
            }
        }
        let mut frame = CanFrame::new(id, &data).ok_or(TransportError::InvalidFrame("len"))?;
        if kind == "r" || kind == "R" {
            frame.rtr = true;
            frame.len = dlc as u8;
        }
        Ok(frame.stamped())
    }

    fn write_cmd(&mut self, cmd: &[u8]) -> Result<()> {
        self.port
            .write_all(cmd)
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    /// Pull whatever the adapter has buffered without waiting.
    fn fill_pending(&mut self) -> Result<()> {
        let available = self
            .port
            .bytes_to_read()
            .map_err(|e| TransportError::Io(e.to_string()))? as usize;
        if available == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; available.min(512)];
        match self.port.read(&mut buf) {
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(()),
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }
}

impl CanBus for SlcanBus {
    fn open(path: &str) -> Result<Self>
    where
        Self: Sized,
    {
        Self::open_with(path, Some(Bitrate::B500k))
    }

    fn list() -> Result<Vec<BusInfo>> {
        let ports = serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| BusInfo {
                driver: match p.port_type {
                    SerialPortType::UsbPort(_) => "slcan-serial".to_string(),
                    _ => "serial".to_string(),
                },
                name: p.port_name,
            })
            .collect())
    }

    fn configure_bitrate(&mut self, bitrate: Bitrate) -> Result<()> {
        // Close, select Sx, reopen
        self.write_cmd(b"C\r")?;
        self.write_cmd(&[b'S', Self::code(bitrate), b'\r'])?;
        self.write_cmd(b"O\r")?;
        tracing::info!(port = %self.port_path, bps = bitrate.bps(), "slcan channel opened");
        Ok(())
    }

    fn set_filters(&mut self, _filters: &[CanFilter]) -> Result<()> {
        // SLCAN hardware filters are not standardized
        Err(TransportError::Unsupported("slcan filters not supported"))
    }

    fn try_recv(&mut self) -> Result<Option<CanFrame>> {
        self.fill_pending()?;
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\r' || b == 0x07) {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let body = &line[..line.len() - 1];
            // Bare CR/BEL acknowledge commands; z/Z acknowledge transmits
            match body.first() {
                None | Some(b'z') | Some(b'Z') => continue,
                Some(_) => return Self::parse_frame(body).map(Some),
            }
        }
        Ok(None)
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let line = Self::encode_frame(frame)?;
        self.write_cmd(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_standard_frame_as_text() -> anyhow::Result<()> {
        let id = CanId::standard(0x201).ok_or_else(|| anyhow::anyhow!("id"))?;
        let frame = CanFrame::new(id, &[0x90, 0xD2, 0x04]).ok_or_else(|| anyhow::anyhow!("len"))?;
        assert_eq!(SlcanBus::encode_frame(&frame)?, b"t201390D204\r".to_vec());
        Ok(())
    }

    #[test]
    fn parses_standard_and_extended_lines() -> anyhow::Result<()> {
        let std_frame = SlcanBus::parse_frame(b"t1813400500")?;
        assert_eq!(std_frame.id.raw(), 0x181);
        assert_eq!(std_frame.payload(), &[0x40, 0x05, 0x00]);

        let ext = SlcanBus::parse_frame(b"T1ABCDEF0211FF")?;
        assert!(ext.id.is_extended());
        assert_eq!(ext.payload(), &[0x11, 0xFF]);

        assert!(SlcanBus::parse_frame(b"t1813400").is_err());
        assert!(SlcanBus::parse_frame(b"x").is_err());
        Ok(())
    }
}
