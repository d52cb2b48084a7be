use crate::{MapperError, Result};
use serde::{Deserialize, Serialize};

/// Torque percentage represented by a setpoint of 32767.
pub const TORQUE_FULL_SCALE_PERCENT: f32 = 150.0;

/// Analog sampling resolution, declared once at startup.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Bits10,
    Bits12,
}

impl Resolution {
    pub fn max_raw(self) -> u16 {
        match self {
            Resolution::Bits10 => 1023,
            Resolution::Bits12 => 4095,
        }
    }
}

/// How a raw sample becomes a torque percentage. Each policy has its own percentage
/// semantics; pick one per deployment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingPolicy {
    /// Full input travel commands `max_percent` of the 150 % protocol reference, so
    /// the applied torque is `max_percent / 150` of full-scale counts. Never negative.
    UnipolarCap,
    /// Centered input (joystick style). Full deflection commands `max_percent` of
    /// full-scale counts in either direction.
    BipolarDeadzone { center: u16, deadzone: u16 },
    /// Calibrated pedal between `rest` and `full` (either may be the larger count).
    /// Travel percent is capped at `max_percent` and applied against full-scale counts.
    PedalTravel { rest: u16, full: u16 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorqueConfig {
    pub resolution: Resolution,
    pub max_percent: f32,
    pub full_scale_counts: i32,
    pub policy: MappingPolicy,
}

impl Default for TorqueConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::Bits12,
            max_percent: 50.0,
            full_scale_counts: i32::from(i16::MAX),
            policy: MappingPolicy::UnipolarCap,
        }
    }
}

/// Pure mapping from analog samples to signed torque setpoints.
#[derive(Clone, Debug)]
pub struct TorqueMapper {
    config: TorqueConfig,
    max_raw: u16,
    full_scale: f32,
    cap: f32,
}

impl TorqueMapper {
    pub fn new(config: TorqueConfig) -> Result<Self> {
        let max_raw = config.resolution.max_raw();
        if !(config.max_percent > 0.0 && config.max_percent <= 100.0) {
            return Err(MapperError::MaxPercent(config.max_percent));
        }
        if !(1..=i32::from(i16::MAX)).contains(&config.full_scale_counts) {
            return Err(MapperError::FullScale(config.full_scale_counts));
        }
        match config.policy {
            MappingPolicy::UnipolarCap => {}
            MappingPolicy::BipolarDeadzone { center, deadzone } => {
                if center == 0 || center > max_raw {
                    return Err(MapperError::Center { center, max_raw });
                }
                if deadzone >= center {
                    return Err(MapperError::Deadzone { deadzone, center });
                }
            }
            MappingPolicy::PedalTravel { rest, full } => {
                if rest == full || rest > max_raw || full > max_raw {
                    return Err(MapperError::Travel {
                        rest,
                        full,
                        max_raw,
                    });
                }
            }
        }
        let full_scale = config.full_scale_counts as f32;
        Ok(Self {
            config,
            max_raw,
            full_scale,
            cap: full_scale * config.max_percent / 100.0,
        })
    }

    pub fn config(&self) -> &TorqueConfig {
        &self.config
    }

    /// Largest setpoint magnitude this mapper will ever produce.
    pub fn cap(&self) -> i16 {
        self.cap as i16
    }

    pub fn map_sample(&self, raw: u16) -> i16 {
        let raw = raw.min(self.max_raw);
        let torque = match self.config.policy {
            MappingPolicy::UnipolarCap => {
                let percent = f32::from(raw) / f32::from(self.max_raw) * self.config.max_percent;
                (self.full_scale * (percent / TORQUE_FULL_SCALE_PERCENT)).clamp(0.0, self.full_scale)
            }
            MappingPolicy::BipolarDeadzone { center, deadzone } => {
                let centered = Self::centered(raw, center, deadzone);
                centered as f32 * self.cap / f32::from(center)
            }
            MappingPolicy::PedalTravel { rest, full } => {
                let percent = Self::travel(raw, rest, full).clamp(0.0, self.config.max_percent);
                self.full_scale * percent / 100.0
            }
        };
        // `as` truncates toward zero, so the result never exceeds the cap
        torque.clamp(-self.cap, self.cap) as i16
    }

    /// How far the input is from rest, 0..=100 %. Used by the release gate.
    pub fn input_percent(&self, raw: u16) -> f32 {
        let raw = raw.min(self.max_raw);
        let percent = match self.config.policy {
            MappingPolicy::UnipolarCap => f32::from(raw) / f32::from(self.max_raw) * 100.0,
            MappingPolicy::BipolarDeadzone { center, deadzone } => {
                Self::centered(raw, center, deadzone).unsigned_abs() as f32 * 100.0
                    / f32::from(center)
            }
            MappingPolicy::PedalTravel { rest, full } => Self::travel(raw, rest, full),
        };
        percent.clamp(0.0, 100.0)
    }

    fn centered(raw: u16, center: u16, deadzone: u16) -> i32 {
        let centered = i32::from(raw) - i32::from(center);
        if centered.unsigned_abs() <= u32::from(deadzone) {
            0
        } else {
            centered
        }
    }

    fn travel(raw: u16, rest: u16, full: u16) -> f32 {
        (f32::from(raw) - f32::from(rest)) * 100.0 / (f32::from(full) - f32::from(rest))
    }
}
