//! Node configuration.
//!
//! Every section has defaults matching the flight build, so an empty JSON
//! object is a valid configuration.

use crate::logging::LogConfig;
use crate::redundancy::RedundancyConfig;
use crate::subsystems::{BatteryConfig, MpptConfig, PowerProfile, ProfilesConfig, RailsConfig, MAX_MPPT_CHANNELS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TICK_PERIOD_MS: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),
    #[error("rail {index} ({name}) has inverted voltage bounds")]
    InvertedRailBounds { index: usize, name: String },
    #[error("rail {index} ({name}) nominal voltage lies outside its bounds")]
    NominalOutOfBounds { index: usize, name: String },
    #[error("duplicate rail name {0}")]
    DuplicateRail(String),
    #[error("battery thresholds must satisfy critical < low < full charge <= over-voltage")]
    BatteryThresholds,
    #[error("too many MPPT channels: {0}")]
    TooManyMpptChannels(u8),
    #[error("{profile:?} profile names rail {rail}, which does not exist")]
    UnknownProfileRail { profile: PowerProfile, rail: u8 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpsConfig {
    pub tick_period_ms: u32,
    pub redundancy: RedundancyConfig,
    pub logging: LogConfig,
    pub rails: RailsConfig,
    pub battery: BatteryConfig,
    pub mppt: MpptConfig,
    pub profiles: ProfilesConfig,
}

impl Default for EpsConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: DEFAULT_TICK_PERIOD_MS,
            redundancy: RedundancyConfig::default(),
            logging: LogConfig::default(),
            rails: RailsConfig::default(),
            battery: BatteryConfig::default(),
            mppt: MpptConfig::default(),
            profiles: ProfilesConfig::default(),
        }
    }
}

impl EpsConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("tick_period_ms", self.tick_period_ms),
            ("redundancy.telemetry_interval_ticks", self.redundancy.telemetry_interval_ticks),
            ("logging.flush_interval_ticks", self.logging.flush_interval_ticks),
            ("rails.update_interval_ticks", self.rails.update_interval_ticks),
            ("rails.telemetry_interval_ticks", self.rails.telemetry_interval_ticks),
            ("battery.update_interval_ticks", self.battery.update_interval_ticks),
            ("battery.telemetry_interval_ticks", self.battery.telemetry_interval_ticks),
            ("mppt.update_interval_ticks", self.mppt.update_interval_ticks),
            ("mppt.telemetry_interval_ticks", self.mppt.telemetry_interval_ticks),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ZeroInterval(*name));
        }

        for (index, rail) in self.rails.rails.iter().enumerate() {
            let name = rail.name.as_str();
            if rail.min_mv > rail.max_mv {
                return Err(ConfigError::InvertedRailBounds {
                    index,
                    name: name.into(),
                });
            }
            if !(rail.min_mv..=rail.max_mv).contains(&rail.nominal_mv) {
                return Err(ConfigError::NominalOutOfBounds {
                    index,
                    name: name.into(),
                });
            }
            if self.rails.rails[..index].iter().any(|r| r.name == rail.name) {
                return Err(ConfigError::DuplicateRail(name.into()));
            }
        }

        let b = &self.battery;
        if !(b.critical_low_mv < b.low_mv && b.low_mv < b.full_charge_mv && b.full_charge_mv <= b.over_voltage_mv) {
            return Err(ConfigError::BatteryThresholds);
        }

        if usize::from(self.mppt.channel_count) > MAX_MPPT_CHANNELS {
            return Err(ConfigError::TooManyMpptChannels(self.mppt.channel_count));
        }

        let rail_count = self.rails.rails.len();
        for profile in [PowerProfile::Nominal, PowerProfile::Safe] {
            if let Some(&rail) = self.profiles.rails(profile).iter().find(|&&r| usize::from(r) >= rail_count) {
                return Err(ConfigError::UnknownProfileRail { profile, rail });
            }
        }
        Ok(())
    }
}
