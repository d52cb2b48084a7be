//! drive-control: bring-up sequencer and cooperative scheduler
//!
//! The [`Sequencer`] walks a drive from power-on to torque control one trigger at a
//! time, behind a release gate on the torque input. The [`Scheduler`] runs it on a
//! single thread together with the inbound drain, the periodic torque task, audit
//! log flushing and bus diagnostics.

mod error;
pub use error::{ControlError, Result};

pub mod config;
pub use config::{
    load_config_file, BusConfig, DriveConfig, LogConfig, SchedulerConfig, SequencerConfig,
};

mod stage;
pub use stage::{plan, Stage, Step, Trigger, TriggerLatch};

pub mod io;
pub use io::{
    parse_trigger_line, AnalogError, AnalogSource, ChannelTriggers, Clock, FileAnalog,
    FixedAnalog, NoTriggers, ScriptedTriggers, SystemClock, TriggerSource,
};

mod diagnostics;
pub use diagnostics::{
    BusDiagnostics, BusMetrics, BusStats, IdStats, MetricsHub, SilenceNotice, MAX_TRACKED_IDS,
};

mod link;
pub use link::{DriveLink, Received};

mod sequencer;
pub use sequencer::{DriveIo, Sequencer, SequencerState, Transition};

mod scheduler;
pub use scheduler::Scheduler;

pub mod sim;
