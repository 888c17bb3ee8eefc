pub mod battery;
pub mod mppt;
pub mod profiles;
pub mod rails;

pub use battery::{BatteryConfig, BatteryMonitor, BatteryStatus, BatteryTelemetry};
pub use mppt::{MpptConfig, MpptController, MpptReading, MpptStatus, MpptTelemetry, MAX_MPPT_CHANNELS};
pub use profiles::{PowerPolicy, PowerProfile, PowerProfiles, ProfilesConfig};
pub use rails::{RailConfig, RailController, RailStatus, RailTelemetry, RailsConfig};

use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const MAX_RAILS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailReading {
    pub voltage_mv: u16,
    pub current_ma: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    pub voltage_mv: u16,
    /// Positive while charging.
    pub current_ma: i16,
    pub temperature_c: f32,
}

impl Default for BatteryReading {
    fn default() -> Self {
        Self {
            voltage_mv: 3900,
            current_ma: 0,
            temperature_c: 20.0,
        }
    }
}

/// Analog front end seen by the threshold producers.
pub trait Sensors {
    fn read_rail(&mut self, rail: usize) -> RailReading;
    fn read_battery(&mut self) -> BatteryReading;
    fn read_mppt(&mut self, channel: usize) -> MpptReading;
}

/// Scriptable sensor model: every rail reads nominal unless overridden.
#[derive(Debug, Clone)]
pub struct SimulatedSensors {
    nominal: Vec<RailReading, MAX_RAILS>,
    overrides: [Option<RailReading>; MAX_RAILS],
    battery: BatteryReading,
    mppt: [MpptReading; MAX_MPPT_CHANNELS],
}

impl SimulatedSensors {
    /// Nominal readings derived from the rail table: nominal voltage at a
    /// quarter of the current limit.
    pub fn new(rails: &RailsConfig) -> Self {
        let nominal = rails
            .rails
            .iter()
            .map(|r| RailReading {
                voltage_mv: r.nominal_mv,
                current_ma: r.current_limit_ma / 4,
            })
            .collect();
        Self {
            nominal,
            overrides: [None; MAX_RAILS],
            battery: BatteryReading::default(),
            mppt: [MpptReading::default(); MAX_MPPT_CHANNELS],
        }
    }

    pub fn set_rail(&mut self, rail: usize, reading: RailReading) {
        if let Some(slot) = self.overrides.get_mut(rail) {
            *slot = Some(reading);
        }
    }

    pub fn restore_rail(&mut self, rail: usize) {
        if let Some(slot) = self.overrides.get_mut(rail) {
            *slot = None;
        }
    }

    pub fn set_battery(&mut self, reading: BatteryReading) {
        self.battery = reading;
    }

    pub fn battery_mut(&mut self) -> &mut BatteryReading {
        &mut self.battery
    }

    pub fn set_mppt(&mut self, channel: usize, reading: MpptReading) {
        if let Some(slot) = self.mppt.get_mut(channel) {
            *slot = reading;
        }
    }

    pub fn restore_mppt(&mut self, channel: usize) {
        self.set_mppt(channel, MpptReading::default());
    }
}

impl Sensors for SimulatedSensors {
    fn read_rail(&mut self, rail: usize) -> RailReading {
        self.overrides
            .get(rail)
            .copied()
            .flatten()
            .or_else(|| self.nominal.get(rail).copied())
            .unwrap_or_default()
    }

    fn read_battery(&mut self) -> BatteryReading {
        self.battery
    }

    fn read_mppt(&mut self, channel: usize) -> MpptReading {
        self.mppt.get(channel).copied().unwrap_or_default()
    }
}
