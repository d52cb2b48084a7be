//! Deterministic stand-ins for hardware: a hand-cranked clock, a scripted
//! analog input, a console capture and a drive that answers telemetry requests.

use crate::io::{AnalogError, AnalogSource, Clock};
use can_transport::{CanFrame, Responder};
use drive_protocol::{
    decode_command, registers, Command, Direction, DriveIds, RegisterFrame, StatusWord,
};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// A clock that only moves when told to. `sleep_ms` advances it.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManualClock {
    now_ms: u64,
    slept_ms: u64,
}

impl ManualClock {
    pub fn starting_at(now_ms: u64) -> Self {
        Self {
            now_ms,
            slept_ms: 0,
        }
    }

    pub fn advance(&mut self, ms: u64) {
        self.now_ms += ms;
    }

    /// Total time spent in `sleep_ms`.
    pub fn slept_ms(&self) -> u64 {
        self.slept_ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn sleep_ms(&mut self, ms: u64) {
        self.now_ms += ms;
        self.slept_ms += ms;
    }
}

/// Plays queued samples in order, then repeats the last one.
#[derive(Clone, Debug, Default)]
pub struct ScriptedAnalog {
    queue: VecDeque<u16>,
    last: u16,
    failures: u32,
    reads: u64,
}

impl ScriptedAnalog {
    pub fn new(samples: impl IntoIterator<Item = u16>) -> Self {
        Self {
            queue: samples.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Drop any queued samples and hold `raw` from now on.
    pub fn hold(&mut self, raw: u16) {
        self.queue.clear();
        self.last = raw;
    }

    pub fn push(&mut self, raw: u16) {
        self.queue.push_back(raw);
    }

    /// Make the next `count` reads fail.
    pub fn fail_next(&mut self, count: u32) {
        self.failures = count;
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }
}

impl AnalogSource for ScriptedAnalog {
    fn read_raw(&mut self) -> Result<u16, AnalogError> {
        self.reads += 1;
        if self.failures > 0 {
            self.failures -= 1;
            return Err(AnalogError::Read {
                path: "scripted".into(),
                reason: "injected failure".into(),
            });
        }
        if let Some(raw) = self.queue.pop_front() {
            self.last = raw;
        }
        Ok(self.last)
    }
}

/// Console sink whose contents stay readable after it is boxed away.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn text(&self) -> String {
        self.0
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| io::Error::other("console buffer poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Drive model behind the mock bus: tracks arming and torque, answers every
/// telemetry request with one reply frame.
#[derive(Clone, Debug)]
pub struct SimulatedDrive {
    ids: DriveIds,
    armed: bool,
    fault: bool,
    torque: i16,
    dc_bus_decivolts: u16,
    bus_timeout_ms: u16,
}

impl SimulatedDrive {
    pub fn new(ids: DriveIds) -> Self {
        Self {
            ids,
            armed: false,
            fault: true,
            torque: 0,
            dc_bus_decivolts: 540,
            bus_timeout_ms: 0,
        }
    }

    pub fn status(&self) -> StatusWord {
        let mut word = 0b100;
        if self.armed {
            word |= 0b1;
        }
        if self.fault {
            word |= 0b100_0000;
        }
        StatusWord(word)
    }

    pub fn armed(&self) -> bool {
        self.armed
    }

    pub fn torque(&self) -> i16 {
        self.torque
    }

    pub fn bus_timeout_ms(&self) -> u16 {
        self.bus_timeout_ms
    }

    pub fn respond(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        if frame.id != self.ids.command {
            return Vec::new();
        }
        let Some(cmd) = RegisterFrame::from_can(frame, Direction::Outbound)
            .as_ref()
            .and_then(decode_command)
        else {
            return Vec::new();
        };
        match cmd {
            Command::RequestTelemetryOnce(reg) | Command::RequestTelemetryCyclic(reg, _) => {
                self.reply(reg).into_iter().collect()
            }
            Command::ClearErrors => {
                self.fault = false;
                Vec::new()
            }
            Command::SetArmed(armed) => {
                self.armed = armed;
                if !armed {
                    self.torque = 0;
                }
                Vec::new()
            }
            Command::SetTorque(t) => {
                self.torque = if self.armed { t } else { 0 };
                Vec::new()
            }
            Command::SetBusTimeout(ms) => {
                self.bus_timeout_ms = ms;
                Vec::new()
            }
        }
    }

    fn reply(&self, register: u8) -> Option<CanFrame> {
        let value: [u8; 2] = match register {
            registers::STATUS => self.status().0.to_le_bytes(),
            registers::SPEED => (self.torque / 10).to_le_bytes(),
            registers::DC_BUS_VOLTAGE => self.dc_bus_decivolts.to_le_bytes(),
            registers::CURRENT => (self.torque / 100).to_le_bytes(),
            registers::TORQUE_FEEDBACK => self.torque.to_le_bytes(),
            _ => return None,
        };
        let frame = RegisterFrame::new(register, &value, Direction::Inbound)?;
        Some(frame.to_can(self.ids.reply))
    }

    /// Box the model as a [`Responder`] for `MockBus::with_responder`.
    pub fn into_responder(mut self) -> Responder {
        Box::new(move |frame| self.respond(frame))
    }
}

/// A shared handle on a drive model, so tests can inspect it while the bus
/// owns the responder.
pub fn shared_responder(drive: Arc<Mutex<SimulatedDrive>>) -> Responder {
    Box::new(move |frame| match drive.lock() {
        Ok(mut d) => d.respond(frame),
        Err(_) => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_protocol::{decode_can, encode, Telemetry};

    fn ids() -> DriveIds {
        DriveIds::new(0x201, 0x181).unwrap()
    }

    fn command_frame(ids: &DriveIds, cmd: Command) -> CanFrame {
        encode(cmd).to_can(ids.command)
    }

    #[test]
    fn manual_clock_moves_only_on_request() {
        let mut clock = ManualClock::starting_at(5);
        assert_eq!(clock.now_ms(), 5);
        clock.sleep_ms(10);
        clock.advance(3);
        assert_eq!(clock.now_ms(), 18);
        assert_eq!(clock.slept_ms(), 10);
    }

    #[test]
    fn scripted_analog_repeats_last_sample() -> anyhow::Result<()> {
        let mut src = ScriptedAnalog::new([10, 20]);
        assert_eq!(src.read_raw()?, 10);
        assert_eq!(src.read_raw()?, 20);
        assert_eq!(src.read_raw()?, 20);
        src.fail_next(1);
        assert!(src.read_raw().is_err());
        src.hold(7);
        assert_eq!(src.read_raw()?, 7);
        assert_eq!(src.reads(), 5);
        Ok(())
    }

    #[test]
    fn drive_answers_status_and_tracks_arming() {
        let ids = ids();
        let mut drive = SimulatedDrive::new(ids);
        let ask = command_frame(&ids, Command::RequestTelemetryOnce(registers::STATUS));
        let replies = drive.respond(&ask);
        assert_eq!(replies.len(), 1);
        let Telemetry::Status(word) = decode_can(&ids, &replies[0]) else {
            panic!("expected a status reply");
        };
        assert!(word.ready() && word.fault() && !word.enabled());

        drive.respond(&command_frame(&ids, Command::ClearErrors));
        drive.respond(&command_frame(&ids, Command::SetArmed(true)));
        drive.respond(&command_frame(&ids, Command::SetTorque(500)));
        assert!(drive.status().enabled() && !drive.status().fault());
        assert_eq!(drive.torque(), 500);

        drive.respond(&command_frame(&ids, Command::SetArmed(false)));
        assert_eq!(drive.torque(), 0);
    }

    #[test]
    fn drive_ignores_foreign_ids() {
        let ids = ids();
        let mut drive = SimulatedDrive::new(ids);
        let foreign = encode(Command::RequestTelemetryOnce(registers::STATUS))
            .to_can(can_transport::CanId::standard(0x300).unwrap());
        assert!(drive.respond(&foreign).is_empty());
    }
}
