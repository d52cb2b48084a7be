use crate::{ControlError, Result};
use anyhow::Context;
use can_transport::Bitrate;
use drive_protocol::{DriveIds, TorqueConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Complete run configuration. Every field has a default, so an empty
/// YAML document is a valid config.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub bus: BusConfig,
    pub sequencer: SequencerConfig,
    pub scheduler: SchedulerConfig,
    pub torque: TorqueConfig,
    pub log: LogConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub command_id: u32,
    pub reply_id: u32,
    pub bitrate: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            command_id: DriveIds::DEFAULT_COMMAND,
            reply_id: DriveIds::DEFAULT_REPLY,
            bitrate: 500_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Give up on the drive if no status reply arrives within this window.
    pub online_timeout_ms: u64,
    /// Status probe cadence while waiting for the drive.
    pub status_probe_interval_ms: u64,
    /// Interval requested for cyclic status/speed telemetry.
    pub cyclic_interval_ms: u8,
    /// Drive-side CAN watchdog written during bring-up.
    pub bus_timeout_ms: u16,
    /// Pause between locking and enabling.
    pub settle_delay_ms: u64,
    /// Input travel (percent) at or below which the safety gate opens.
    pub release_percent: f32,
    pub gate_samples: u32,
    pub gate_sample_spacing_ms: u64,
    pub gate_poll_interval_ms: u64,
    /// Hand control back to the scheduler after this many gate polls.
    /// `None` keeps the gate blocking until release.
    pub gate_poll_limit: Option<u32>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            online_timeout_ms: 10_000,
            status_probe_interval_ms: 100,
            cyclic_interval_ms: 100,
            bus_timeout_ms: 2000,
            settle_delay_ms: 100,
            release_percent: 5.0,
            gate_samples: 10,
            gate_sample_spacing_ms: 10,
            gate_poll_interval_ms: 50,
            gate_poll_limit: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub torque_interval_ms: u64,
    pub log_flush_interval_ms: u64,
    pub stats_interval_ms: u64,
    pub silence_timeout_ms: u64,
    /// Upper bound on frames drained per tick.
    pub max_rx_per_tick: usize,
    pub idle_sleep_ms: u64,
    /// Leave Idle on the first tick instead of waiting for a trigger.
    pub auto_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            torque_interval_ms: 20,
            log_flush_interval_ms: 500,
            stats_interval_ms: 10_000,
            silence_timeout_ms: 5000,
            max_rx_per_tick: 64,
            idle_sleep_ms: 1,
            auto_start: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            prefix: "CAN_traffic_logs".to_string(),
        }
    }
}

impl DriveConfig {
    pub fn drive_ids(&self) -> Result<DriveIds> {
        let ids = DriveIds::new(self.bus.command_id, self.bus.reply_id)
            .filter(|ids| ids.command != ids.reply);
        ids.ok_or_else(|| {
            ControlError::Config(format!(
                "drive ids 0x{:X}/0x{:X} must be distinct valid identifiers",
                self.bus.command_id, self.bus.reply_id
            ))
        })
    }

    pub fn bitrate(&self) -> Result<Bitrate> {
        Bitrate::from_bps(self.bus.bitrate)
            .ok_or_else(|| ControlError::Config(format!("unsupported bitrate {}", self.bus.bitrate)))
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.drive_ids()?;
        self.bitrate()?;
        let seq = &self.sequencer;
        if !(0.0..=100.0).contains(&seq.release_percent) {
            return Err(ControlError::Config(format!(
                "release_percent {} outside 0..=100",
                seq.release_percent
            )));
        }
        if seq.gate_samples == 0 {
            return Err(ControlError::Config("gate_samples must be at least 1".into()));
        }
        if seq.cyclic_interval_ms == 0 || seq.status_probe_interval_ms == 0 {
            return Err(ControlError::Config("telemetry intervals must be non-zero".into()));
        }
        let sched = &self.scheduler;
        if sched.torque_interval_ms == 0 || sched.max_rx_per_tick == 0 {
            return Err(ControlError::Config(
                "torque_interval_ms and max_rx_per_tick must be non-zero".into(),
            ));
        }
        drive_protocol::TorqueMapper::new(self.torque)?;
        Ok(())
    }
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<DriveConfig> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
    let config: DriveConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating config: {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded drive config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_protocol::MappingPolicy;

    #[test]
    fn empty_document_yields_defaults() -> anyhow::Result<()> {
        let config: DriveConfig = serde_yaml::from_str("{}")?;
        assert_eq!(config, DriveConfig::default());
        assert_eq!(config.sequencer.online_timeout_ms, 10_000);
        assert_eq!(config.scheduler.torque_interval_ms, 20);
        assert_eq!(config.log.prefix, "CAN_traffic_logs");
        config.validate()?;
        Ok(())
    }

    #[test]
    fn partial_sections_keep_other_defaults() -> anyhow::Result<()> {
        let yaml = r#"
sequencer:
  gate_poll_limit: 4
torque:
  max_percent: 20.0
  policy:
    kind: pedal_travel
    rest: 2930
    full: 1860
"#;
        let config: DriveConfig = serde_yaml::from_str(yaml)?;
        assert_eq!(config.sequencer.gate_poll_limit, Some(4));
        assert_eq!(config.sequencer.release_percent, 5.0);
        assert_eq!(config.torque.max_percent, 20.0);
        assert_eq!(
            config.torque.policy,
            MappingPolicy::PedalTravel { rest: 2930, full: 1860 }
        );
        config.validate()?;
        Ok(())
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = DriveConfig::default();
        config.bus.reply_id = config.bus.command_id;
        assert!(matches!(config.validate(), Err(ControlError::Config(_))));

        let mut config = DriveConfig::default();
        config.bus.bitrate = 123;
        assert!(config.validate().is_err());

        let mut config = DriveConfig::default();
        config.torque.max_percent = 400.0;
        assert!(matches!(config.validate(), Err(ControlError::Mapper(_))));
    }

    #[test]
    fn shipped_config_loads() -> anyhow::Result<()> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/drive.yaml");
        let config = load_config_file(path)?;
        assert_eq!(config.drive_ids()?, DriveIds::new(0x201, 0x181).unwrap());
        assert_eq!(config.torque.max_percent, 20.0);
        assert_eq!(config.sequencer.gate_poll_limit, None);
        Ok(())
    }

    #[test]
    fn load_reports_the_path() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("drive-config-{}.yaml", std::process::id()));
        fs::write(&path, "bus: [not, a, map]\n")?;
        let err = load_config_file(&path).err().map(|e| format!("{e:#}"));
        fs::remove_file(&path)?;
        let err = err.unwrap_or_default();
        assert!(err.contains("parsing yaml"), "{err}");
        Ok(())
    }
}
