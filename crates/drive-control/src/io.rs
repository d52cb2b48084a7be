use crate::stage::{Stage, Trigger};
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Monotonic milliseconds plus a blocking sleep.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&mut self, ms: u64);
}

/// Wall clock measured from construction.
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn sleep_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

#[derive(Debug, Error)]
pub enum AnalogError {
    #[error("reading {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("sample {0:?} is not a raw count")]
    Parse(String),
}

/// One raw ADC reading per call.
pub trait AnalogSource {
    fn read_raw(&mut self) -> Result<u16, AnalogError>;
}

/// Always returns the same count.
#[derive(Clone, Copy, Debug)]
pub struct FixedAnalog(pub u16);

impl AnalogSource for FixedAnalog {
    fn read_raw(&mut self) -> Result<u16, AnalogError> {
        Ok(self.0)
    }
}

/// Reads a decimal count from a file on every call, e.g. a Linux IIO
/// `in_voltageN_raw` attribute.
#[derive(Clone, Debug)]
pub struct FileAnalog {
    path: PathBuf,
}

impl FileAnalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AnalogSource for FileAnalog {
    fn read_raw(&mut self) -> Result<u16, AnalogError> {
        let raw = fs::read_to_string(&self.path).map_err(|e| AnalogError::Read {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let trimmed = raw.trim();
        trimmed
            .parse::<u16>()
            .map_err(|_| AnalogError::Parse(trimmed.to_string()))
    }
}

/// Delivers operator or scripted triggers to the scheduler.
pub trait TriggerSource {
    /// Non-blocking; called repeatedly each tick until it returns `None`.
    fn poll_trigger(&mut self, now_ms: u64, stage: Stage) -> Option<Trigger>;
}

/// Never triggers; the sequence stops wherever a trigger is needed.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTriggers;

impl TriggerSource for NoTriggers {
    fn poll_trigger(&mut self, _now_ms: u64, _stage: Stage) -> Option<Trigger> {
        None
    }
}

/// Triggers produced on another thread (typically a stdin reader).
pub struct ChannelTriggers {
    rx: Receiver<Trigger>,
    disconnected: bool,
}

impl ChannelTriggers {
    pub fn new(rx: Receiver<Trigger>) -> Self {
        Self {
            rx,
            disconnected: false,
        }
    }

    /// True once every sender has gone away.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}

impl TriggerSource for ChannelTriggers {
    fn poll_trigger(&mut self, _now_ms: u64, _stage: Stage) -> Option<Trigger> {
        match self.rx.try_recv() {
            Ok(trigger) => Some(trigger),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                if !self.disconnected {
                    tracing::debug!("trigger channel closed");
                    self.disconnected = true;
                }
                None
            }
        }
    }
}

/// Maps one line of operator input to a trigger. An empty line advances.
pub fn parse_trigger_line(line: &str) -> Option<Trigger> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" | "n" | "next" | "advance" => Some(Trigger::Advance),
        "s" | "stop" => Some(Trigger::Stop),
        "x" | "disable" => Some(Trigger::Disable),
        "l" | "log" | "dump" => Some(Trigger::Dump),
        _ => None,
    }
}

/// Fires a fixed list of triggers, each after its delay has elapsed in a
/// stage where the trigger has an effect. Waiting stages pause the script.
#[derive(Clone, Debug)]
pub struct ScriptedTriggers {
    steps: VecDeque<(u64, Trigger)>,
    armed_at: Option<u64>,
}

impl ScriptedTriggers {
    pub fn new(steps: impl IntoIterator<Item = (u64, Trigger)>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            armed_at: None,
        }
    }

    /// Unattended bring-up from TelemetryArmed to the safety gate.
    pub fn bring_up() -> Self {
        Self::new([
            (200, Trigger::Advance),
            (200, Trigger::Advance),
            (200, Trigger::Advance),
            (500, Trigger::Advance),
            (500, Trigger::Advance),
        ])
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

impl TriggerSource for ScriptedTriggers {
    fn poll_trigger(&mut self, now_ms: u64, stage: Stage) -> Option<Trigger> {
        let &(delay, trigger) = self.steps.front()?;
        let effective = match trigger {
            Trigger::Advance => stage != Stage::Idle && stage.advances_on_trigger(),
            _ => !matches!(stage, Stage::Idle | Stage::AwaitingDriveOnline | Stage::Terminal),
        };
        if !effective {
            self.armed_at = None;
            return None;
        }
        let since = *self.armed_at.get_or_insert(now_ms);
        if now_ms.saturating_sub(since) < delay {
            return None;
        }
        self.armed_at = None;
        self.steps.pop_front();
        Some(trigger)
    }
}
