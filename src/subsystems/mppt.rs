use super::Sensors;
use crate::bus::{Event, EventQueue};
use crate::fault::{FaultSource, Severity};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const MAX_MPPT_CHANNELS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MpptReading {
    pub input_mv: u16,
    pub input_ma: u16,
    pub output_mv: u16,
    pub output_ma: u16,
    pub temperature_c: f32,
    /// Converter power-good line.
    pub pgood: bool,
}

impl Default for MpptReading {
    fn default() -> Self {
        Self {
            input_mv: 8000,
            input_ma: 500,
            output_mv: 4100,
            output_ma: 900,
            temperature_c: 25.0,
            pgood: true,
        }
    }
}

impl MpptReading {
    pub fn power_mw(&self) -> u32 {
        u32::from(self.output_mv) * u32::from(self.output_ma) / 1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MpptStatus {
    Ok = 0,
    Disabled = 1,
    Fault = 2,
    Undervolt = 3,
    Overtemp = 4,
}

/// `kind << 8 | channel`, kind 1..=3 for power-good loss, input
/// under-voltage and over-temperature.
pub fn mppt_fault_code(channel: u8, status: MpptStatus) -> Option<u32> {
    let kind = match status {
        MpptStatus::Fault => 1,
        MpptStatus::Undervolt => 2,
        MpptStatus::Overtemp => 3,
        MpptStatus::Ok | MpptStatus::Disabled => return None,
    };
    Some((kind << 8) | u32::from(channel))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpptConfig {
    pub channel_count: u8,
    pub update_interval_ticks: u32,
    pub telemetry_interval_ticks: u32,
    pub min_input_mv: u16,
    pub over_temperature_c: f32,
}

impl Default for MpptConfig {
    fn default() -> Self {
        Self {
            channel_count: MAX_MPPT_CHANNELS as u8,
            update_interval_ticks: 10,
            telemetry_interval_ticks: 600,
            min_input_mv: 5000,
            over_temperature_c: 85.0,
        }
    }
}

impl MpptConfig {
    /// Power-good first, then input voltage, then temperature.
    pub fn check(&self, reading: &MpptReading) -> MpptStatus {
        if !reading.pgood {
            MpptStatus::Fault
        } else if reading.input_mv < self.min_input_mv {
            MpptStatus::Undervolt
        } else if reading.temperature_c > self.over_temperature_c {
            MpptStatus::Overtemp
        } else {
            MpptStatus::Ok
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MpptError {
    #[error("no MPPT channel {0}")]
    UnknownChannel(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MpptChannelState {
    pub enabled: bool,
    pub status: MpptStatus,
    pub last: MpptReading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpptTelemetry {
    pub channel: u8,
    pub status: MpptStatus,
    pub input_mv: u16,
    pub output_mv: u16,
    pub output_ma: u16,
    pub power_mw: u32,
}

/// Solar charge channels. Unlike rails, a faulted channel keeps harvesting;
/// a fault is reported once per status change and the status follows the
/// readings.
#[derive(Debug)]
pub struct MpptController {
    config: MpptConfig,
    channels: Vec<MpptChannelState, MAX_MPPT_CHANNELS>,
    ticks: u32,
}

impl MpptController {
    pub fn new(config: MpptConfig) -> Self {
        let count = usize::from(config.channel_count).min(MAX_MPPT_CHANNELS);
        let channels = (0..count)
            .map(|_| MpptChannelState {
                enabled: true,
                status: MpptStatus::Ok,
                last: MpptReading::default(),
            })
            .collect();
        Self {
            config,
            channels,
            ticks: 0,
        }
    }

    pub fn enable(&mut self, channel: u8) -> Result<(), MpptError> {
        let state = self.channel_mut(channel)?;
        state.enabled = true;
        if state.status == MpptStatus::Disabled {
            state.status = MpptStatus::Ok;
        }
        info!(channel, "MPPT channel enabled");
        Ok(())
    }

    pub fn disable(&mut self, channel: u8) -> Result<(), MpptError> {
        let state = self.channel_mut(channel)?;
        state.enabled = false;
        state.status = MpptStatus::Disabled;
        info!(channel, "MPPT channel disabled");
        Ok(())
    }

    fn channel_mut(&mut self, channel: u8) -> Result<&mut MpptChannelState, MpptError> {
        self.channels
            .get_mut(usize::from(channel))
            .ok_or(MpptError::UnknownChannel(channel))
    }

    pub fn on_request(&mut self, channel: u8, enable: bool, out: &mut EventQueue) {
        let result = if enable { self.enable(channel) } else { self.disable(channel) };
        if let Err(err) = result {
            warn!(%err, "MPPT request rejected");
        }
        out.publish(Event::MpptResponse {
            channel,
            enable,
            enabled: self.state(channel).is_some_and(|s| s.enabled),
            accepted: result.is_ok(),
        });
    }

    pub fn on_tick<S: Sensors>(&mut self, sensors: &mut S, out: &mut EventQueue) {
        self.ticks = self.ticks.wrapping_add(1);
        if self.config.update_interval_ticks != 0 && self.ticks % self.config.update_interval_ticks == 0 {
            self.evaluate(sensors, out);
        }
        if self.config.telemetry_interval_ticks != 0 && self.ticks % self.config.telemetry_interval_ticks == 0 {
            self.publish_telemetry(out);
        }
    }

    pub fn evaluate<S: Sensors>(&mut self, sensors: &mut S, out: &mut EventQueue) {
        for (index, state) in self.channels.iter_mut().enumerate() {
            if !state.enabled {
                continue;
            }
            let reading = sensors.read_mppt(index);
            state.last = reading;
            let status = self.config.check(&reading);
            if status == state.status {
                continue;
            }
            state.status = status;

            let channel = index as u8;
            let Some(code) = mppt_fault_code(channel, status) else {
                info!(channel, "MPPT channel back in bounds");
                continue;
            };
            warn!(channel, ?status, input_mv = reading.input_mv, "MPPT channel fault");
            out.publish(Event::FaultReported {
                source: FaultSource::Mppt,
                code,
                severity: Severity::Degraded,
                component: None,
            });
            out.publish(Event::MpptFault { channel, status });
        }
    }

    /// One telemetry event per enabled channel.
    pub fn publish_telemetry(&self, out: &mut EventQueue) {
        for channel in 0..self.channels.len() as u8 {
            if let Some(t) = self.telemetry(channel) {
                out.publish(Event::MpptTelemetry(t));
            }
        }
    }

    /// `None` for unknown or disabled channels.
    pub fn telemetry(&self, channel: u8) -> Option<MpptTelemetry> {
        self.state(channel).filter(|s| s.enabled).map(|s| MpptTelemetry {
            channel,
            status: s.status,
            input_mv: s.last.input_mv,
            output_mv: s.last.output_mv,
            output_ma: s.last.output_ma,
            power_mw: s.last.power_mw(),
        })
    }

    /// Harvested power across enabled channels.
    pub fn total_power_mw(&self) -> u32 {
        self.channels
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.last.power_mw())
            .sum()
    }

    pub fn state(&self, channel: u8) -> Option<&MpptChannelState> {
        self.channels.get(usize::from(channel))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for MpptController {
    fn default() -> Self {
        Self::new(MpptConfig::default())
    }
}
