use crate::config::SchedulerConfig;
use crate::diagnostics::BusDiagnostics;
use crate::io::{AnalogSource, Clock, TriggerSource};
use crate::link::Received;
use crate::sequencer::{DriveIo, Sequencer};
use crate::stage::{Stage, TriggerLatch};
use crate::{ControlError, Result};
use can_transport::CanBus;
use drive_protocol::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// Cooperative single-threaded loop. Each tick runs, in order: inbound drain and
/// sequencer service, the torque task, one trigger, the log flush, diagnostics.
pub struct Scheduler<B, C, A, T> {
    io: DriveIo<B, C, A>,
    sequencer: Sequencer,
    diagnostics: BusDiagnostics,
    triggers: T,
    latch: TriggerLatch,
    config: SchedulerConfig,
    last_flush_ms: u64,
    halted: bool,
}

impl<B, C, A, T> Scheduler<B, C, A, T>
where
    B: CanBus,
    C: Clock,
    A: AnalogSource,
    T: TriggerSource,
{
    pub fn new(
        io: DriveIo<B, C, A>,
        sequencer: Sequencer,
        diagnostics: BusDiagnostics,
        triggers: T,
        config: SchedulerConfig,
    ) -> Self {
        let last_flush_ms = io.clock.now_ms();
        Self {
            io,
            sequencer,
            diagnostics,
            triggers,
            latch: TriggerLatch::default(),
            config,
            last_flush_ms,
            halted: false,
        }
    }

    /// One pass of the loop. Fatal errors halt the scheduler; later ticks are no-ops.
    pub fn tick(&mut self) -> Result<()> {
        if self.halted {
            return Ok(());
        }
        match self.step() {
            Ok(()) => Ok(()),
            Err(ControlError::Audit(e)) => {
                self.halt_on_audit_failure(&e);
                Err(ControlError::Audit(e))
            }
            Err(e) => {
                error!(error = %e, stage = %self.sequencer.stage(), "scheduler halted");
                self.halted = true;
                Err(e)
            }
        }
    }

    /// Tick until `cancel` is set or the sequence reaches Terminal.
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<()> {
        info!(stage = %self.sequencer.stage(), "scheduler running");
        while !cancel.load(Ordering::Relaxed) {
            if let Err(e) = self.tick() {
                if let Err(flush_err) = self.io.link.flush_log() {
                    warn!(error = %flush_err, "final audit flush failed");
                }
                return Err(e);
            }
            if self.halted || self.sequencer.stage() == Stage::Terminal {
                break;
            }
            self.io.clock.sleep_ms(self.config.idle_sleep_ms);
        }
        if cancel.load(Ordering::Relaxed) {
            self.shutdown()?;
        }
        self.io.link.flush_log()?;
        info!(stage = %self.sequencer.stage(), "scheduler stopped");
        Ok(())
    }

    /// Leave an armed drive safe when the operator quits mid-sequence.
    pub fn shutdown(&mut self) -> Result<()> {
        let stage = self.sequencer.stage();
        if self.halted || !(Stage::Locked..=Stage::TorqueControlActive).contains(&stage) {
            return Ok(());
        }
        warn!(%stage, "cancelled while armed, zeroing torque and disarming");
        self.io.emit(Command::SetTorque(0))?;
        self.io.emit(Command::SetArmed(false))?;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let io = &mut self.io;
        if self.config.auto_start && self.sequencer.stage() == Stage::Idle {
            self.sequencer.start(io)?;
        }

        for _ in 0..self.config.max_rx_per_tick {
            let now = io.clock.now_ms();
            match io.link.receive(now)? {
                Received::Frame { frame, telemetry } => {
                    self.diagnostics.record_rx(frame.id, now);
                    self.sequencer.on_telemetry(&telemetry, io)?;
                }
                Received::Empty => break,
                Received::BusError(e) => {
                    self.diagnostics.record_rx_error();
                    warn!(error = %e, "receive failed");
                    break;
                }
            }
        }
        self.sequencer.service(io)?;

        let now = io.clock.now_ms();
        if self.sequencer.torque_due(now, self.config.torque_interval_ms) {
            self.sequencer.transmit_torque(io)?;
        }

        // drain the burst; only the latched trigger survives
        let stage = self.sequencer.stage();
        while let Some(trigger) = self.triggers.poll_trigger(now, stage) {
            self.latch.offer(trigger);
        }
        if let Some(trigger) = self.latch.take() {
            info!(?trigger, %stage, "trigger");
            self.sequencer.handle(trigger, io)?;
        }

        let now = io.clock.now_ms();
        if now.saturating_sub(self.last_flush_ms) >= self.config.log_flush_interval_ms {
            io.link.flush_log()?;
            self.last_flush_ms = now;
        }

        if let Some(stats) = self.diagnostics.stats_due(now) {
            info!(total = stats.total, errors = stats.errors, "bus statistics");
            io.link.say(&stats.to_string());
        }
        if let Some(notice) = self.diagnostics.check_silence(now) {
            warn!(silent_for_ms = notice.silent_for_ms, "bus silent");
            io.link
                .say(&format!("No CAN traffic for {} ms", notice.silent_for_ms));
        }
        self.diagnostics.set_stage(self.sequencer.stage());
        Ok(())
    }

    fn halt_on_audit_failure(&mut self, e: &audit_log::AuditError) {
        error!(error = %e, "audit log failed, disarming drive and halting");
        self.io.link.fail_safe();
        self.io.link.say(&format!(
            "Audit log failure ({e}). Drive commanded to zero torque and disarmed. Halting."
        ));
        let now = self.io.clock.now_ms();
        self.sequencer.halt(now);
        self.halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn diagnostics(&self) -> &BusDiagnostics {
        &self.diagnostics
    }

    pub fn io(&self) -> &DriveIo<B, C, A> {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut DriveIo<B, C, A> {
        &mut self.io
    }

    pub fn triggers_mut(&mut self) -> &mut T {
        &mut self.triggers
    }

    /// Triggers dropped because a more urgent one was already pending.
    pub fn collapsed_triggers(&self) -> u64 {
        self.latch.collapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveConfig;
    use crate::diagnostics::MetricsHub;
    use crate::io::{ChannelTriggers, ScriptedTriggers};
    use crate::link::DriveLink;
    use crate::sim::{shared_responder, ManualClock, ScriptedAnalog, SharedBuffer, SimulatedDrive};
    use crate::stage::Trigger;
    use audit_log::{AuditLog, MemoryStore};
    use can_transport::MockBus;
    use drive_protocol::{decode_command, registers, Direction, RegisterFrame, TorqueMapper};
    use std::sync::mpsc::{self, Sender};
    use std::sync::{Arc, Mutex};

    type Sched<T> = Scheduler<MockBus, ManualClock, ScriptedAnalog, T>;

    struct Rig<T> {
        sched: Sched<T>,
        store: MemoryStore,
        console: SharedBuffer,
        drive: Arc<Mutex<SimulatedDrive>>,
    }

    fn rig<T: TriggerSource>(config: &DriveConfig, responsive: bool, triggers: T) -> Rig<T> {
        let ids = config.drive_ids().unwrap();
        let drive = Arc::new(Mutex::new(SimulatedDrive::new(ids)));
        let mut bus = MockBus::open("mock0").unwrap();
        if responsive {
            bus = bus.with_responder(shared_responder(Arc::clone(&drive)));
        }
        let mut store = MemoryStore::new();
        let log = AuditLog::open(&mut store, &config.log.prefix).unwrap();
        let console = SharedBuffer::default();
        let metrics = MetricsHub::new().unwrap();
        let link = DriveLink::new(bus, ids, log, Box::new(console.clone()), metrics.clone());
        let io = DriveIo::new(link, ManualClock::default(), ScriptedAnalog::new([0]));
        let sequencer = Sequencer::new(
            config.sequencer.clone(),
            TorqueMapper::new(config.torque).unwrap(),
        );
        let diagnostics = BusDiagnostics::new(
            metrics,
            config.scheduler.stats_interval_ms,
            config.scheduler.silence_timeout_ms,
            0,
        );
        let sched = Scheduler::new(io, sequencer, diagnostics, triggers, config.scheduler.clone());
        Rig {
            sched,
            store,
            console,
            drive,
        }
    }

    fn channel_rig(config: &DriveConfig, responsive: bool) -> (Rig<ChannelTriggers>, Sender<Trigger>) {
        let (tx, rx) = mpsc::channel();
        (rig(config, responsive, ChannelTriggers::new(rx)), tx)
    }

    fn commands<T: TriggerSource>(sched: &Sched<T>) -> Vec<Command> {
        sched
            .io()
            .link
            .bus()
            .sent()
            .iter()
            .filter_map(|f| RegisterFrame::from_can(f, Direction::Outbound))
            .filter_map(|f| decode_command(&f))
            .collect()
    }

    fn tick_for<T: TriggerSource>(sched: &mut Sched<T>, ms: u64, step_ms: u64) {
        let mut elapsed = 0;
        while elapsed < ms {
            sched.tick().unwrap();
            sched.io_mut().clock.advance(step_ms);
            elapsed += step_ms;
        }
    }

    fn advance<T: TriggerSource>(sched: &mut Sched<T>, tx: &Sender<Trigger>) {
        tx.send(Trigger::Advance).unwrap();
        sched.tick().unwrap();
    }

    /// Drive a responsive rig up to ZeroTorqueVerified.
    fn to_zero_torque(sched: &mut Sched<ChannelTriggers>, tx: &Sender<Trigger>) {
        sched.tick().unwrap();
        assert_eq!(sched.sequencer().stage(), Stage::TelemetryArmed);
        for _ in 0..4 {
            advance(sched, tx);
        }
        assert_eq!(sched.sequencer().stage(), Stage::ZeroTorqueVerified);
    }

    #[test]
    fn silent_drive_times_out_with_only_telemetry_requests() {
        let config = DriveConfig::default();
        let (mut rig, tx) = channel_rig(&config, false);
        let sched = &mut rig.sched;
        let mut outcome = Ok(());
        for _ in 0..2000 {
            tx.send(Trigger::Advance).unwrap();
            outcome = sched.tick();
            if outcome.is_err() {
                break;
            }
            assert_eq!(sched.sequencer().stage(), Stage::AwaitingDriveOnline);
            sched.io_mut().clock.advance(10);
        }
        assert!(matches!(outcome, Err(ControlError::DriveUnreachable { waited_ms: 10_000 })));
        assert_eq!(sched.sequencer().stage(), Stage::Terminal);

        let sent = sched.io().link.bus().sent().len();
        assert!(sched
            .io()
            .link
            .bus()
            .sent()
            .iter()
            .all(|f| f.payload()[0] == registers::READ_REQUEST));
        // two cyclic requests plus one probe per 100 ms before the deadline
        assert_eq!(sent, 2 + 99);

        tick_for(sched, 1000, 10);
        assert_eq!(sched.io().link.bus().sent().len(), sent);
        assert!(rig.console.text().contains("No drive response within 10000 ms"));

        let history = sched.sequencer().history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].to, Stage::Terminal);
    }

    #[test]
    fn run_returns_the_unreachable_error() {
        let config = DriveConfig::default();
        let (mut rig, _tx) = channel_rig(&config, false);
        let cancel = AtomicBool::new(false);
        let err = rig.sched.run(&cancel);
        assert!(matches!(err, Err(ControlError::DriveUnreachable { .. })));
        assert!(rig.sched.is_halted());

        // header, two cyclic requests and 99 probes all reach storage
        let name = rig.sched.io().link.log().file_name().to_string();
        let csv = rig.store.contents(&name).unwrap_or_default();
        assert_eq!(csv.lines().count(), 1 + 2 + 99);
    }

    #[test]
    fn full_bring_up_emits_the_expected_commands() {
        let config = DriveConfig::default();
        let (mut rig, tx) = channel_rig(&config, true);
        to_zero_torque(&mut rig.sched, &tx);
        advance(&mut rig.sched, &tx);
        assert_eq!(rig.sched.sequencer().stage(), Stage::TorqueControlActive);

        assert_eq!(
            commands(&rig.sched),
            vec![
                Command::RequestTelemetryCyclic(registers::STATUS, 100),
                Command::RequestTelemetryCyclic(registers::SPEED, 100),
                Command::RequestTelemetryOnce(registers::DC_BUS_VOLTAGE),
                Command::ClearErrors,
                Command::SetBusTimeout(2000),
                Command::ClearErrors,
                Command::SetArmed(false),
                Command::SetArmed(true),
                Command::RequestTelemetryOnce(registers::STATUS),
                Command::SetTorque(0),
            ]
        );

        let history = rig.sched.sequencer().history();
        let stages: Vec<Stage> = history.iter().map(|t| t.to).collect();
        assert_eq!(
            stages,
            vec![
                Stage::AwaitingDriveOnline,
                Stage::TelemetryArmed,
                Stage::ErrorsCleared,
                Stage::TimeoutConfigured,
                Stage::Locked,
                Stage::Enabled,
                Stage::ZeroTorqueVerified,
                Stage::SafetyGateWaiting,
                Stage::TorqueControlActive,
            ]
        );
        let locked = history[4].at_ms;
        assert_eq!(history[5].at_ms, locked + 100);
        assert!(history.windows(2).all(|w| w[0].to < w[1].to));

        let drive = rig.drive.lock().unwrap();
        assert!(drive.armed());
        assert_eq!(drive.bus_timeout_ms(), 2000);
    }

    #[test]
    fn a_burst_of_triggers_advances_once() {
        let config = DriveConfig::default();
        let (mut rig, tx) = channel_rig(&config, true);
        rig.sched.tick().unwrap();
        for _ in 0..3 {
            tx.send(Trigger::Advance).unwrap();
        }
        rig.sched.tick().unwrap();
        assert_eq!(rig.sched.sequencer().stage(), Stage::ErrorsCleared);
        rig.sched.tick().unwrap();
        assert_eq!(rig.sched.sequencer().stage(), Stage::ErrorsCleared);
        assert_eq!(rig.sched.collapsed_triggers(), 2);
    }

    #[test]
    fn a_large_burst_still_advances_once() {
        let config = DriveConfig::default();
        let (mut rig, tx) = channel_rig(&config, true);
        rig.sched.tick().unwrap();
        assert_eq!(rig.sched.sequencer().stage(), Stage::TelemetryArmed);
        for _ in 0..500 {
            tx.send(Trigger::Advance).unwrap();
        }
        rig.sched.tick().unwrap();
        rig.sched.tick().unwrap();
        assert_eq!(rig.sched.sequencer().stage(), Stage::ErrorsCleared);
        assert_eq!(rig.sched.collapsed_triggers(), 499);
    }

    #[test]
    fn disable_wins_a_mixed_burst() {
        let config = DriveConfig::default();
        let (mut rig, tx) = channel_rig(&config, true);
        rig.sched.tick().unwrap();
        tx.send(Trigger::Advance).unwrap();
        tx.send(Trigger::Disable).unwrap();
        tx.send(Trigger::Advance).unwrap();
        rig.sched.tick().unwrap();
        assert_eq!(rig.sched.sequencer().stage(), Stage::Disabled);
        assert_eq!(commands(&rig.sched).last(), Some(&Command::SetArmed(false)));
    }

    #[test]
    fn gate_holds_while_pressed_and_opens_once_released() {
        let mut config = DriveConfig::default();
        config.sequencer.gate_poll_limit = Some(2);
        let (mut rig, tx) = channel_rig(&config, true);
        to_zero_torque(&mut rig.sched, &tx);

        rig.sched.io_mut().pedal.hold(4095);
        advance(&mut rig.sched, &tx);
        assert_eq!(rig.sched.sequencer().stage(), Stage::SafetyGateWaiting);
        let sent_at_gate = rig.sched.io().link.bus().sent().len();

        // 6 % travel is still pressed, however long it is held
        rig.sched.io_mut().pedal.hold(246);
        tick_for(&mut rig.sched, 60_000, 50);
        assert_eq!(rig.sched.sequencer().stage(), Stage::SafetyGateWaiting);
        assert_eq!(rig.sched.io().link.bus().sent().len(), sent_at_gate);

        // triggers cannot push past the gate either
        advance(&mut rig.sched, &tx);
        assert_eq!(rig.sched.sequencer().stage(), Stage::SafetyGateWaiting);

        rig.sched.io_mut().pedal.hold(204);
        rig.sched.tick().unwrap();
        rig.sched.tick().unwrap();
        assert_eq!(rig.sched.sequencer().stage(), Stage::TorqueControlActive);
        let activations = rig
            .sched
            .sequencer()
            .history()
            .iter()
            .filter(|t| t.to == Stage::TorqueControlActive)
            .count();
        assert_eq!(activations, 1);
    }

    #[test]
    fn unreadable_gate_input_keeps_the_gate_closed() {
        let mut config = DriveConfig::default();
        config.sequencer.gate_poll_limit = Some(0);
        let (mut rig, tx) = channel_rig(&config, true);
        to_zero_torque(&mut rig.sched, &tx);
        rig.sched.io_mut().pedal.fail_next(1);
        advance(&mut rig.sched, &tx);
        assert_eq!(rig.sched.sequencer().stage(), Stage::SafetyGateWaiting);
        rig.sched.tick().unwrap();
        assert_eq!(rig.sched.sequencer().stage(), Stage::TorqueControlActive);
    }

    #[test]
    fn torque_follows_its_cadence_and_cap() {
        let config = DriveConfig::default();
        let (mut rig, tx) = channel_rig(&config, true);
        to_zero_torque(&mut rig.sched, &tx);
        advance(&mut rig.sched, &tx);
        rig.sched.io_mut().pedal.hold(4095);
        let before = commands(&rig.sched).len();

        tick_for(&mut rig.sched, 100, 5);
        let torque: Vec<Command> = commands(&rig.sched)[before..].to_vec();
        assert_eq!(torque, vec![Command::SetTorque(10922); 5]);
        assert_eq!(rig.sched.sequencer().state().last_torque_setpoint, 10922);
        assert_eq!(rig.drive.lock().unwrap().torque(), 10922);

        rig.sched.io_mut().pedal.fail_next(1);
        rig.sched.tick().unwrap();
        assert_eq!(commands(&rig.sched).last(), Some(&Command::SetTorque(0)));
    }

    #[test]
    fn stop_returns_to_zero_torque_and_disable_then_dump_finishes() {
        let config = DriveConfig::default();
        let (mut rig, tx) = channel_rig(&config, true);
        to_zero_torque(&mut rig.sched, &tx);
        advance(&mut rig.sched, &tx);
        rig.sched.io_mut().pedal.hold(2000);
        tick_for(&mut rig.sched, 40, 5);

        tx.send(Trigger::Stop).unwrap();
        rig.sched.tick().unwrap();
        assert_eq!(rig.sched.sequencer().stage(), Stage::ZeroTorqueVerified);
        assert_eq!(commands(&rig.sched).last(), Some(&Command::SetTorque(0)));
        let settled = commands(&rig.sched).len();
        tick_for(&mut rig.sched, 100, 5);
        assert_eq!(commands(&rig.sched).len(), settled, "no torque outside control");

        tx.send(Trigger::Disable).unwrap();
        rig.sched.tick().unwrap();
        assert_eq!(rig.sched.sequencer().stage(), Stage::Disabled);
        assert!(!rig.drive.lock().unwrap().armed());

        advance(&mut rig.sched, &tx);
        assert_eq!(rig.sched.sequencer().stage(), Stage::Terminal);
        let console = rig.console.text();
        assert!(console.contains(audit_log::HEADER));
        assert!(console.contains("Lock/Disable drive"));
    }

    #[test]
    fn rejected_sends_do_not_stall_the_sequence() {
        let config = DriveConfig::default();
        let (mut rig, tx) = channel_rig(&config, true);
        rig.sched.tick().unwrap();
        rig.sched.io_mut().link.bus_mut().fail_next_sends(1);
        advance(&mut rig.sched, &tx);
        assert_eq!(rig.sched.sequencer().stage(), Stage::ErrorsCleared);
        assert_eq!(rig.sched.io().link.send_failures(), 1);
        let text = rig.sched.diagnostics().metrics().encode_text();
        assert!(text.contains("drive_can_send_errors 1"));
    }

    #[test]
    fn bus_silence_is_announced_once() {
        let config = DriveConfig::default();
        let (mut rig, _tx) = channel_rig(&config, true);
        tick_for(&mut rig.sched, 8000, 10);
        let console = rig.console.text();
        assert_eq!(console.matches("No CAN traffic for").count(), 1);
    }

    #[test]
    fn audit_failure_disarms_and_halts() {
        let config = DriveConfig::default();
        let (mut rig, tx) = channel_rig(&config, true);
        to_zero_torque(&mut rig.sched, &tx);
        let before = rig.sched.io().link.bus().sent().len();
        rig.store.set_full(true);

        tx.send(Trigger::Disable).unwrap();
        let err = rig.sched.tick();
        assert!(matches!(err, Err(ControlError::Audit(_))));
        assert_eq!(rig.sched.sequencer().stage(), Stage::Terminal);
        assert!(rig.sched.is_halted());

        let tail = &commands(&rig.sched)[before..];
        assert_eq!(tail.last(), Some(&Command::SetArmed(false)));
        assert!(tail.contains(&Command::SetTorque(0)));
        let sent = rig.sched.io().link.bus().sent().len();
        tick_for(&mut rig.sched, 1000, 10);
        assert_eq!(rig.sched.io().link.bus().sent().len(), sent);
        assert!(rig.console.text().contains("Audit log failure"));
    }

    #[test]
    fn log_reaches_storage_on_the_flush_cadence() {
        let config = DriveConfig::default();
        let (mut rig, _tx) = channel_rig(&config, true);
        let name = rig.sched.io().link.log().file_name().to_string();
        rig.sched.tick().unwrap();
        assert_eq!(rig.store.contents(&name).unwrap_or_default().lines().count(), 1);
        tick_for(&mut rig.sched, 510, 10);
        assert!(rig.store.contents(&name).unwrap_or_default().lines().count() > 1);
    }

    #[test]
    fn headless_script_reaches_torque_control() {
        let config = DriveConfig::default();
        let mut rig = rig(&config, true, ScriptedTriggers::bring_up());
        tick_for(&mut rig.sched, 3000, 10);
        assert_eq!(rig.sched.sequencer().stage(), Stage::TorqueControlActive);
        assert_eq!(rig.sched.triggers_mut().remaining(), 0);
    }

    #[test]
    fn cancel_while_armed_leaves_the_drive_safe() {
        let config = DriveConfig::default();
        let (mut rig, tx) = channel_rig(&config, true);
        to_zero_torque(&mut rig.sched, &tx);
        let cancel = AtomicBool::new(true);
        rig.sched.run(&cancel).unwrap();
        let cmds = commands(&rig.sched);
        assert_eq!(
            &cmds[cmds.len() - 2..],
            &[Command::SetTorque(0), Command::SetArmed(false)]
        );
        assert!(!rig.drive.lock().unwrap().armed());
    }
}
