use crate::registers::{CURRENT, DC_BUS_VOLTAGE, SPEED, STATUS, TORQUE_FEEDBACK};
use crate::{DriveIds, RegisterFrame, StatusWord};
use can_transport::CanFrame;
use core::fmt;
use serde::Serialize;

/// Typed reply from the drive. Decoding never fails; anything unknown or malformed
/// degrades to [`Telemetry::Unrecognized`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Telemetry {
    Status(StatusWord),
    /// rpm
    Speed(i16),
    /// 0.1 V per count
    DcBusVoltage(u16),
    /// 0.1 A per count
    Current(i16),
    /// ±32767 = ±100 %
    TorqueFeedback(i16),
    Unrecognized { register: u8, raw: Vec<u8> },
}

impl Telemetry {
    pub fn volts(decivolts: u16) -> f32 {
        f32::from(decivolts) * 0.1
    }

    pub fn amps(deciamps: i16) -> f32 {
        f32::from(deciamps) * 0.1
    }

    pub fn torque_percent(raw: i16) -> f32 {
        f32::from(raw) / 327.67
    }
}

/// Decode an inbound register frame.
pub fn decode(frame: &RegisterFrame) -> Telemetry {
    decode_register(frame.register(), frame.payload())
}

/// Decode a raw CAN frame; only frames from the drive's reply identity carry telemetry.
pub fn decode_can(ids: &DriveIds, frame: &CanFrame) -> Telemetry {
    let (register, value) = match frame.payload().split_first() {
        Some((reg, rest)) => (*reg, rest),
        None => (0, &[][..]),
    };
    if frame.id != ids.reply || frame.rtr {
        return Telemetry::Unrecognized {
            register,
            raw: value.to_vec(),
        };
    }
    decode_register(register, value)
}

pub fn decode_register(register: u8, value: &[u8]) -> Telemetry {
    let word = match value {
        [lo, hi, ..] => [*lo, *hi],
        _ => {
            return Telemetry::Unrecognized {
                register,
                raw: value.to_vec(),
            }
        }
    };
    match register {
        STATUS => Telemetry::Status(StatusWord(u16::from_le_bytes(word))),
        SPEED => Telemetry::Speed(i16::from_le_bytes(word)),
        DC_BUS_VOLTAGE => Telemetry::DcBusVoltage(u16::from_le_bytes(word)),
        CURRENT => Telemetry::Current(i16::from_le_bytes(word)),
        TORQUE_FEEDBACK => Telemetry::TorqueFeedback(i16::from_le_bytes(word)),
        _ => Telemetry::Unrecognized {
            register,
            raw: value.to_vec(),
        },
    }
}

impl fmt::Display for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Telemetry::Status(word) => write!(f, "Status word = 0x{:04X}", word.0),
            Telemetry::Speed(rpm) => write!(f, "Speed feedback = {rpm} rpm"),
            Telemetry::DcBusVoltage(dv) => {
                write!(f, "DC bus voltage = {:.1} V", Telemetry::volts(*dv))
            }
            Telemetry::Current(da) => write!(f, "Current = {:.1} A", Telemetry::amps(*da)),
            Telemetry::TorqueFeedback(raw) => {
                write!(f, "Torque feedback = {:.1} %", Telemetry::torque_percent(*raw))
            }
            Telemetry::Unrecognized { register, .. } => {
                write!(f, "Reply register 0x{register:02X}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Direction;
    use can_transport::CanId;

    fn inbound(bytes: &[u8]) -> RegisterFrame {
        let (reg, rest) = bytes.split_first().unwrap();
        RegisterFrame::new(*reg, rest, Direction::Inbound).unwrap()
    }

    #[test]
    fn status_bits() {
        match decode(&inbound(&[0x40, 0x05, 0x00])) {
            Telemetry::Status(word) => {
                assert!(word.enabled());
                assert!(word.ready());
                assert!(!word.fault());
            }
            other => panic!("expected status, got {other:?}"),
        }
        match decode(&inbound(&[0x40, 0x40, 0x00])) {
            Telemetry::Status(word) => assert!(word.fault() && !word.enabled()),
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn signed_and_scaled_values() {
        assert_eq!(decode(&inbound(&[0x30, 0xD2, 0x04])), Telemetry::Speed(1234));
        assert_eq!(decode(&inbound(&[0x30, 0x2E, 0xFB])), Telemetry::Speed(-1234));
        assert_eq!(
            decode(&inbound(&[0xEB, 0x1C, 0x02])),
            Telemetry::DcBusVoltage(540)
        );
        assert_eq!(decode(&inbound(&[0x5F, 0x9C, 0xFF])), Telemetry::Current(-100));
        assert!((Telemetry::volts(540) - 54.0).abs() < 1e-3);
        assert!((Telemetry::torque_percent(32767) - 100.0).abs() < 1e-2);
    }

    #[test]
    fn unknown_or_short_frames_degrade() {
        assert_eq!(
            decode(&inbound(&[0x99, 0x01, 0x02])),
            Telemetry::Unrecognized {
                register: 0x99,
                raw: vec![0x01, 0x02]
            }
        );
        assert_eq!(
            decode(&inbound(&[0x40, 0x01])),
            Telemetry::Unrecognized {
                register: 0x40,
                raw: vec![0x01]
            }
        );
    }

    #[test]
    fn only_the_reply_identity_carries_telemetry() {
        let ids = DriveIds::new(0x201, 0x181).unwrap();
        let status = CanFrame::new(ids.reply, &[0x40, 0x05, 0x00]).unwrap();
        assert!(matches!(decode_can(&ids, &status), Telemetry::Status(_)));

        let foreign = CanFrame::new(CanId::standard(0x700).unwrap(), &[0x40, 0x05, 0x00]).unwrap();
        assert!(matches!(
            decode_can(&ids, &foreign),
            Telemetry::Unrecognized { register: 0x40, .. }
        ));

        let empty = CanFrame::new(ids.reply, &[]).unwrap();
        assert!(matches!(decode_can(&ids, &empty), Telemetry::Unrecognized { .. }));
    }

    #[test]
    fn descriptions() {
        assert_eq!(Telemetry::Speed(1234).to_string(), "Speed feedback = 1234 rpm");
        assert_eq!(
            Telemetry::Status(StatusWord(0x0005)).to_string(),
            "Status word = 0x0005"
        );
        assert_eq!(
            Telemetry::DcBusVoltage(540).to_string(),
            "DC bus voltage = 54.0 V"
        );
    }

    #[test]
    fn telemetry_serializes_for_tooling() -> anyhow::Result<()> {
        let json = serde_json::to_string(&decode(&inbound(&[0x30, 0xD2, 0x04])))?;
        assert_eq!(json, r#"{"speed":1234}"#);
        let json = serde_json::to_string(&decode(&inbound(&[0x40, 0x05, 0x00])))?;
        assert_eq!(json, r#"{"status":5}"#);
        Ok(())
    }
}
