use crate::config::SequencerConfig;
use crate::io::{AnalogSource, Clock};
use crate::link::DriveLink;
use crate::stage::{plan, Stage, Step, Trigger};
use crate::{ControlError, Result};
use can_transport::CanBus;
use drive_protocol::{registers, Command, Telemetry, TorqueMapper};
use tracing::{debug, error, info, warn};

/// The peripherals the sequencer drives: the wire, time, and the torque input.
pub struct DriveIo<B, C, A> {
    pub link: DriveLink<B>,
    pub clock: C,
    pub pedal: A,
}

impl<B: CanBus, C: Clock, A: AnalogSource> DriveIo<B, C, A> {
    pub fn new(link: DriveLink<B>, clock: C, pedal: A) -> Self {
        Self { link, clock, pedal }
    }

    /// Encode, send, log and echo one command, stamped with the current time.
    pub fn emit(&mut self, cmd: Command) -> Result<()> {
        let now = self.clock.now_ms();
        self.link.transmit(cmd, now)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SequencerState {
    pub stage: Stage,
    pub last_torque_setpoint: i16,
    pub last_torque_tx_ms: Option<u64>,
    pub drive_online: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Transition {
    pub at_ms: u64,
    pub from: Stage,
    pub to: Stage,
}

/// Walks the drive from power-on to torque control one trigger at a time.
/// Stages only move forward; the sole way back is Stop, which returns to
/// ZeroTorqueVerified.
pub struct Sequencer {
    state: SequencerState,
    config: SequencerConfig,
    mapper: TorqueMapper,
    awaiting_since_ms: u64,
    last_probe_ms: u64,
    gate_fresh: bool,
    history: Vec<Transition>,
}

impl Sequencer {
    pub fn new(config: SequencerConfig, mapper: TorqueMapper) -> Self {
        Self {
            state: SequencerState {
                stage: Stage::Idle,
                last_torque_setpoint: 0,
                last_torque_tx_ms: None,
                drive_online: false,
            },
            config,
            mapper,
            awaiting_since_ms: 0,
            last_probe_ms: 0,
            gate_fresh: false,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    pub fn stage(&self) -> Stage {
        self.state.stage
    }

    /// Every stage change so far, oldest first.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn mapper(&self) -> &TorqueMapper {
        &self.mapper
    }

    /// Leave Idle: ask for cyclic status and speed, then wait for the drive.
    pub fn start<B: CanBus, C: Clock, A: AnalogSource>(
        &mut self,
        io: &mut DriveIo<B, C, A>,
    ) -> Result<()> {
        if self.state.stage != Stage::Idle {
            return Ok(());
        }
        let interval = self.config.cyclic_interval_ms;
        io.emit(Command::RequestTelemetryCyclic(registers::STATUS, interval))?;
        io.emit(Command::RequestTelemetryCyclic(registers::SPEED, interval))?;
        let now = io.clock.now_ms();
        self.awaiting_since_ms = now;
        self.last_probe_ms = now;
        self.move_to(Stage::AwaitingDriveOnline, io);
        Ok(())
    }

    /// Feed one decoded inbound frame. A status word while waiting brings the
    /// drive online.
    pub fn on_telemetry<B: CanBus, C: Clock, A: AnalogSource>(
        &mut self,
        telemetry: &Telemetry,
        io: &mut DriveIo<B, C, A>,
    ) -> Result<()> {
        let Telemetry::Status(status) = telemetry else {
            return Ok(());
        };
        if status.fault() {
            warn!(status = status.0, stage = %self.state.stage, "drive reports a fault");
        }
        if self.state.stage == Stage::AwaitingDriveOnline {
            self.state.drive_online = true;
            io.emit(Command::RequestTelemetryOnce(registers::DC_BUS_VOLTAGE))?;
            self.move_to(Stage::TelemetryArmed, io);
        }
        Ok(())
    }

    /// Time-driven work: probing for the drive, the online deadline, and
    /// re-checking a gate that handed control back.
    pub fn service<B: CanBus, C: Clock, A: AnalogSource>(
        &mut self,
        io: &mut DriveIo<B, C, A>,
    ) -> Result<()> {
        match self.state.stage {
            Stage::AwaitingDriveOnline => {
                let now = io.clock.now_ms();
                let waited_ms = now.saturating_sub(self.awaiting_since_ms);
                if waited_ms >= self.config.online_timeout_ms {
                    error!(waited_ms, "drive never answered, halting");
                    io.link.say(&format!(
                        "No drive response within {waited_ms} ms. Check wiring, power and bitrate."
                    ));
                    self.move_to(Stage::Terminal, io);
                    return Err(ControlError::DriveUnreachable { waited_ms });
                }
                if now.saturating_sub(self.last_probe_ms) >= self.config.status_probe_interval_ms {
                    self.last_probe_ms = now;
                    io.emit(Command::RequestTelemetryOnce(registers::STATUS))?;
                }
                Ok(())
            }
            Stage::SafetyGateWaiting => self.run_gate(io),
            _ => Ok(()),
        }
    }

    /// Apply one trigger according to [`plan`].
    pub fn handle<B: CanBus, C: Clock, A: AnalogSource>(
        &mut self,
        trigger: Trigger,
        io: &mut DriveIo<B, C, A>,
    ) -> Result<()> {
        let stage = self.state.stage;
        match plan(stage, trigger) {
            Step::Start => self.start(io)?,
            Step::ClearErrors => {
                io.emit(Command::ClearErrors)?;
                self.move_to(Stage::ErrorsCleared, io);
            }
            Step::ConfigureTimeout => {
                io.emit(Command::SetBusTimeout(self.config.bus_timeout_ms))?;
                self.move_to(Stage::TimeoutConfigured, io);
            }
            Step::LockThenEnable => {
                io.emit(Command::ClearErrors)?;
                io.emit(Command::SetArmed(false))?;
                self.move_to(Stage::Locked, io);
                io.clock.sleep_ms(self.config.settle_delay_ms);
                io.emit(Command::SetArmed(true))?;
                io.emit(Command::RequestTelemetryOnce(registers::STATUS))?;
                self.move_to(Stage::Enabled, io);
            }
            Step::ZeroTorque | Step::StopTorque => {
                io.emit(Command::SetTorque(0))?;
                self.state.last_torque_setpoint = 0;
                self.state.last_torque_tx_ms = Some(io.clock.now_ms());
                self.move_to(Stage::ZeroTorqueVerified, io);
            }
            Step::OpenGate => {
                self.gate_fresh = true;
                self.move_to(Stage::SafetyGateWaiting, io);
                self.run_gate(io)?;
            }
            Step::Disable => {
                io.emit(Command::SetArmed(false))?;
                self.move_to(Stage::Disabled, io);
            }
            Step::Dump { finish } => {
                let bytes = io.link.dump_log()?;
                debug!(bytes, "audit log replayed");
                if finish {
                    self.move_to(Stage::Terminal, io);
                }
            }
            Step::Ignore(reason) => debug!(%stage, ?trigger, reason, "trigger ignored"),
        }
        Ok(())
    }

    /// True when a torque setpoint is owed under the given cadence.
    pub fn torque_due(&self, now_ms: u64, interval_ms: u64) -> bool {
        self.state.stage == Stage::TorqueControlActive
            && self
                .state
                .last_torque_tx_ms
                .map_or(true, |last| now_ms.saturating_sub(last) >= interval_ms)
    }

    /// Sample the input, map it and send the setpoint. An unreadable input
    /// commands zero.
    pub fn transmit_torque<B: CanBus, C: Clock, A: AnalogSource>(
        &mut self,
        io: &mut DriveIo<B, C, A>,
    ) -> Result<i16> {
        let setpoint = match io.pedal.read_raw() {
            Ok(raw) => self.mapper.map_sample(raw),
            Err(e) => {
                warn!(error = %e, "torque input unreadable, commanding zero");
                0
            }
        };
        io.emit(Command::SetTorque(setpoint))?;
        self.state.last_torque_setpoint = setpoint;
        self.state.last_torque_tx_ms = Some(io.clock.now_ms());
        Ok(setpoint)
    }

    /// Force Terminal without touching the wire.
    pub fn halt(&mut self, now_ms: u64) {
        self.record(Stage::Terminal, now_ms);
    }

    fn run_gate<B: CanBus, C: Clock, A: AnalogSource>(
        &mut self,
        io: &mut DriveIo<B, C, A>,
    ) -> Result<()> {
        let mut percent = if std::mem::take(&mut self.gate_fresh) {
            io.link.say("Release the pedal to continue...");
            self.averaged_input(io)
        } else {
            self.sampled_input(io)
        };
        let mut polls = 0u32;
        loop {
            if percent <= self.config.release_percent {
                info!(percent, "input released");
                io.link.say("Pedal released, torque control active.");
                self.state.last_torque_tx_ms = None;
                self.move_to(Stage::TorqueControlActive, io);
                return Ok(());
            }
            if self.config.gate_poll_limit.is_some_and(|limit| polls >= limit) {
                debug!(percent, polls, "gate still closed, yielding");
                return Ok(());
            }
            io.clock.sleep_ms(self.config.gate_poll_interval_ms);
            polls += 1;
            percent = self.sampled_input(io);
        }
    }

    fn sampled_input<B, C, A: AnalogSource>(&self, io: &mut DriveIo<B, C, A>) -> f32 {
        match io.pedal.read_raw() {
            Ok(raw) => self.mapper.input_percent(raw),
            Err(e) => {
                warn!(error = %e, "gate input unreadable, treating as pressed");
                100.0
            }
        }
    }

    fn averaged_input<B, C: Clock, A: AnalogSource>(&self, io: &mut DriveIo<B, C, A>) -> f32 {
        let samples = self.config.gate_samples.max(1);
        let mut sum = 0u64;
        for i in 0..samples {
            if i > 0 {
                io.clock.sleep_ms(self.config.gate_sample_spacing_ms);
            }
            match io.pedal.read_raw() {
                Ok(raw) => sum += u64::from(raw),
                Err(e) => {
                    warn!(error = %e, "gate input unreadable, treating as pressed");
                    return 100.0;
                }
            }
        }
        let mean = (sum as f64 / f64::from(samples)).round() as u16;
        self.mapper.input_percent(mean)
    }

    fn move_to<B: CanBus, C: Clock, A: AnalogSource>(
        &mut self,
        to: Stage,
        io: &mut DriveIo<B, C, A>,
    ) {
        let now = io.clock.now_ms();
        if self.record(to, now) {
            io.link.say(&format!("[{now} ms] stage: {to}"));
            if let Some(hint) = prompt(to) {
                io.link.say(hint);
            }
        }
    }

    fn record(&mut self, to: Stage, at_ms: u64) -> bool {
        let from = self.state.stage;
        if from == to {
            return false;
        }
        info!(%from, %to, at_ms, "stage transition");
        self.history.push(Transition { at_ms, from, to });
        self.state.stage = to;
        true
    }
}

fn prompt(stage: Stage) -> Option<&'static str> {
    Some(match stage {
        Stage::AwaitingDriveOnline => "Waiting for drive telemetry...",
        Stage::TelemetryArmed => "Drive online. Advance to clear errors.",
        Stage::ErrorsCleared => "Advance to set the CAN timeout.",
        Stage::TimeoutConfigured => "Advance to lock and enable the drive.",
        Stage::Enabled => "Drive enabled. Advance to command zero torque.",
        Stage::ZeroTorqueVerified => "Zero torque sent. Advance to start torque control.",
        Stage::TorqueControlActive => "Stop or advance returns to zero torque.",
        Stage::Disabled => "Drive disabled. Advance or dump to print the log and finish.",
        Stage::Idle | Stage::Locked | Stage::SafetyGateWaiting | Stage::Terminal => return None,
    })
}
