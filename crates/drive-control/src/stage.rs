use core::fmt;
use serde::{Deserialize, Serialize};

/// Bring-up stages, in the only order they can be visited.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Stage {
    Idle,
    AwaitingDriveOnline,
    TelemetryArmed,
    ErrorsCleared,
    TimeoutConfigured,
    Locked,
    Enabled,
    ZeroTorqueVerified,
    SafetyGateWaiting,
    TorqueControlActive,
    Disabled,
    Terminal,
}

impl Stage {
    /// Position in the bring-up order (Idle = 0).
    pub fn ordinal(self) -> i64 {
        self as i64
    }

    /// True where an `Advance` trigger moves the sequence on.
    pub fn advances_on_trigger(self) -> bool {
        matches!(
            plan(self, Trigger::Advance),
            Step::Start
                | Step::ClearErrors
                | Step::ConfigureTimeout
                | Step::LockThenEnable
                | Step::ZeroTorque
                | Step::OpenGate
                | Step::StopTorque
                | Step::Dump { finish: true }
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One externally delivered event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Trigger {
    /// Move to the next stage.
    Advance,
    /// Leave torque control, commanding zero.
    Stop,
    /// Disarm the drive from wherever we are.
    Disable,
    /// Copy the audit log to the console.
    Dump,
}

impl Trigger {
    fn priority(self) -> u8 {
        match self {
            Trigger::Advance => 0,
            Trigger::Dump => 1,
            Trigger::Stop => 2,
            Trigger::Disable => 3,
        }
    }
}

/// Holds at most one trigger between ticks; a burst collapses to its most
/// safety-relevant member (Disable > Stop > Dump > Advance).
#[derive(Debug, Default)]
pub struct TriggerLatch {
    pending: Option<Trigger>,
    collapsed: u64,
}

impl TriggerLatch {
    pub fn offer(&mut self, trigger: Trigger) {
        self.pending = match self.pending {
            None => Some(trigger),
            Some(held) => {
                self.collapsed += 1;
                if trigger.priority() > held.priority() {
                    Some(trigger)
                } else {
                    Some(held)
                }
            }
        };
    }

    pub fn take(&mut self) -> Option<Trigger> {
        self.pending.take()
    }

    /// Triggers discarded because another was already pending.
    pub fn collapsed(&self) -> u64 {
        self.collapsed
    }
}

/// What the sequencer does for a (stage, trigger) pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    /// Idle -> AwaitingDriveOnline
    Start,
    /// TelemetryArmed -> ErrorsCleared
    ClearErrors,
    /// ErrorsCleared -> TimeoutConfigured
    ConfigureTimeout,
    /// TimeoutConfigured -> Locked -> (settle) -> Enabled
    LockThenEnable,
    /// Enabled -> ZeroTorqueVerified
    ZeroTorque,
    /// ZeroTorqueVerified -> SafetyGateWaiting (-> TorqueControlActive once released)
    OpenGate,
    /// TorqueControlActive -> ZeroTorqueVerified
    StopTorque,
    /// any armed-or-arming stage -> Disabled
    Disable,
    /// Replay the log; `finish` also moves Disabled -> Terminal
    Dump { finish: bool },
    Ignore(&'static str),
}

/// Total transition function over every (stage, trigger) pair.
pub fn plan(stage: Stage, trigger: Trigger) -> Step {
    use Stage as S;
    use Trigger as T;
    match (stage, trigger) {
        (S::Terminal, T::Dump) => Step::Dump { finish: false },
        (S::Terminal, T::Advance | T::Stop | T::Disable) => Step::Ignore("sequence finished"),

        (S::Disabled, T::Advance | T::Dump) => Step::Dump { finish: true },
        (S::Disabled, T::Stop | T::Disable) => Step::Ignore("drive already disabled"),

        (_, T::Dump) => Step::Dump { finish: false },

        (S::Idle, T::Advance) => Step::Start,
        (S::Idle | S::AwaitingDriveOnline, T::Disable) => Step::Ignore("drive not armed yet"),
        (S::AwaitingDriveOnline, T::Advance) => Step::Ignore("waiting for drive telemetry"),

        (S::TelemetryArmed, T::Advance) => Step::ClearErrors,
        (S::ErrorsCleared, T::Advance) => Step::ConfigureTimeout,
        (S::TimeoutConfigured, T::Advance) => Step::LockThenEnable,
        // Locked only exists inside the lock/enable micro-sequence
        (S::Locked, T::Advance) => Step::Ignore("enable in progress"),
        (S::Enabled, T::Advance) => Step::ZeroTorque,
        (S::ZeroTorqueVerified, T::Advance) => Step::OpenGate,
        (S::SafetyGateWaiting, T::Advance) => Step::Ignore("waiting for input release"),
        (S::TorqueControlActive, T::Advance | T::Stop) => Step::StopTorque,

        (
            S::Idle
            | S::AwaitingDriveOnline
            | S::TelemetryArmed
            | S::ErrorsCleared
            | S::TimeoutConfigured
            | S::Locked
            | S::Enabled
            | S::ZeroTorqueVerified
            | S::SafetyGateWaiting,
            T::Stop,
        ) => Step::Ignore("torque control not active"),

        (
            S::TelemetryArmed
            | S::ErrorsCleared
            | S::TimeoutConfigured
            | S::Locked
            | S::Enabled
            | S::ZeroTorqueVerified
            | S::SafetyGateWaiting
            | S::TorqueControlActive,
            T::Disable,
        ) => Step::Disable,
    }
}
