use crate::diagnostics::MetricsHub;
use crate::Result;
use audit_log::{AuditLog, LogEntry};
use can_transport::{CanBus, CanFrame, TransportError};
use drive_protocol::{decode_can, encode, Command, DriveIds, Telemetry};
use std::io::Write;
use tracing::{debug, warn};

/// Outcome of one non-blocking receive.
#[derive(Debug)]
pub enum Received {
    Frame { frame: CanFrame, telemetry: Telemetry },
    Empty,
    BusError(TransportError),
}

/// Everything that touches the wire: each frame is encoded, sent, appended to the
/// audit log and echoed to the console, in that order.
pub struct DriveLink<B> {
    bus: B,
    ids: DriveIds,
    log: AuditLog,
    console: Box<dyn Write + Send>,
    metrics: MetricsHub,
    sent: u64,
    send_failures: u64,
}

impl<B: CanBus> DriveLink<B> {
    pub fn new(
        bus: B,
        ids: DriveIds,
        log: AuditLog,
        console: Box<dyn Write + Send>,
        metrics: MetricsHub,
    ) -> Self {
        Self {
            bus,
            ids,
            log,
            console,
            metrics,
            sent: 0,
            send_failures: 0,
        }
    }

    /// Send one command. A rejected send is logged with a note and does not fail
    /// the call; a failed audit append does.
    pub fn transmit(&mut self, cmd: Command, now_ms: u64) -> Result<()> {
        let frame = encode(cmd).to_can(self.ids.command);
        let mut entry = LogEntry::outbound(now_ms, frame.clone(), cmd);
        match self.bus.send(&frame) {
            Ok(()) => {
                self.sent += 1;
                self.metrics.bus.tx_frames.inc();
                debug!(command = %cmd, "sent");
            }
            Err(e) => {
                self.send_failures += 1;
                self.metrics.bus.send_errors.inc();
                warn!(command = %cmd, error = %e, "send failed, continuing");
                entry = entry.with_note(format!("send failed: {e}"));
            }
        }
        self.log.append(&entry)?;
        self.echo(&entry);
        Ok(())
    }

    /// Take at most one frame off the bus, logging it if present.
    pub fn receive(&mut self, now_ms: u64) -> Result<Received> {
        let frame = match self.bus.try_recv() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(Received::Empty),
            Err(e) => return Ok(Received::BusError(e)),
        };
        let telemetry = decode_can(&self.ids, &frame);
        let entry = LogEntry::inbound(now_ms, frame.clone(), telemetry.clone());
        self.log.append(&entry)?;
        self.echo(&entry);
        Ok(Received::Frame { frame, telemetry })
    }

    /// Zero torque then disarm, straight onto the bus. Used when the audit log
    /// can no longer record traffic, so nothing here is logged to it.
    pub fn fail_safe(&mut self) {
        for cmd in [Command::SetTorque(0), Command::SetArmed(false)] {
            let frame = encode(cmd).to_can(self.ids.command);
            if let Err(e) = self.bus.send(&frame) {
                warn!(command = %cmd, error = %e, "fail-safe send failed");
            }
        }
    }

    pub fn flush_log(&mut self) -> Result<()> {
        self.log.flush()?;
        Ok(())
    }

    /// Replay the whole audit log to the console.
    pub fn dump_log(&mut self) -> Result<usize> {
        let bytes = self.log.dump(&mut *self.console)?;
        Ok(bytes)
    }

    /// One line of operator-facing text.
    pub fn say(&mut self, line: &str) {
        if let Err(e) = writeln!(self.console, "{line}") {
            debug!(error = %e, "console write failed");
        }
    }

    fn echo(&mut self, entry: &LogEntry) {
        let bytes: Vec<String> = entry.frame.payload().iter().map(|b| format!("{b:02X}")).collect();
        let line = format!(
            "{:>8} {} 0x{:03X} [{}] {}",
            entry.timestamp_ms,
            entry.direction,
            entry.frame.id.raw(),
            bytes.join(" "),
            entry.text()
        );
        self.say(&line);
    }

    pub fn ids(&self) -> &DriveIds {
        &self.ids
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn log(&self) -> &AuditLog {
        &self.log
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures
    }
}
