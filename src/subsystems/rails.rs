use super::{RailReading, Sensors, MAX_RAILS};
use crate::bus::{Event, EventQueue};
use crate::fault::{FaultSource, Severity};
use crate::redundancy::{Component, ComponentDegradation};
use heapless::{String, Vec};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_UPDATE_INTERVAL_TICKS: u32 = 10;
pub const DEFAULT_TELEMETRY_INTERVAL_TICKS: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RailStatus {
    Disabled = 0,
    Ok = 1,
    Overcurrent = 2,
    Undervoltage = 3,
    Overvoltage = 4,
}

impl RailStatus {
    /// Fault-kind nibble used in rail fault codes.
    fn fault_kind(self) -> Option<u32> {
        match self {
            RailStatus::Overcurrent => Some(1),
            RailStatus::Undervoltage => Some(2),
            RailStatus::Overvoltage => Some(3),
            RailStatus::Disabled | RailStatus::Ok => None,
        }
    }
}

/// `kind << 8 | rail`, kind 1..=3 for over-current, under- and over-voltage.
pub fn rail_fault_code(rail: u8, status: RailStatus) -> Option<u32> {
    status.fault_kind().map(|kind| (kind << 8) | u32::from(rail))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailConfig {
    pub name: String<16>,
    pub nominal_mv: u16,
    pub min_mv: u16,
    pub max_mv: u16,
    pub current_limit_ma: u16,
    /// Redundant power bus this rail feeds, if any.
    #[serde(default)]
    pub component: Option<Component>,
}

impl RailConfig {
    pub fn new(name: &str, nominal_mv: u16, min_mv: u16, max_mv: u16, current_limit_ma: u16) -> Self {
        let mut label = String::new();
        for c in name.chars() {
            if label.push(c).is_err() {
                break;
            }
        }
        Self {
            name: label,
            nominal_mv,
            min_mv,
            max_mv,
            current_limit_ma,
            component: None,
        }
    }

    pub fn feeding(mut self, component: Component) -> Self {
        self.component = Some(component);
        self
    }

    /// Over-current first, then under- and over-voltage.
    pub fn check(&self, reading: RailReading) -> RailStatus {
        if reading.current_ma > self.current_limit_ma {
            RailStatus::Overcurrent
        } else if reading.voltage_mv < self.min_mv {
            RailStatus::Undervoltage
        } else if reading.voltage_mv > self.max_mv {
            RailStatus::Overvoltage
        } else {
            RailStatus::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RailsConfig {
    pub update_interval_ticks: u32,
    pub telemetry_interval_ticks: u32,
    pub rails: Vec<RailConfig, MAX_RAILS>,
}

impl Default for RailsConfig {
    fn default() -> Self {
        let table = [
            RailConfig::new("OBC", 3300, 3000, 3600, 2000),
            RailConfig::new("Radio", 5000, 4750, 5250, 1500),
            RailConfig::new("GPS", 3300, 3000, 3600, 500),
            RailConfig::new("Payload 1", 5000, 4750, 5250, 3000),
            RailConfig::new("Payload 2", 5000, 4750, 5250, 3000),
            RailConfig::new("5V Bus", 5000, 4750, 5250, 5000).feeding(Component::Bus5V),
            RailConfig::new("3.3V Bus", 3300, 3000, 3600, 4000).feeding(Component::Bus3V3),
        ];
        Self {
            update_interval_ticks: DEFAULT_UPDATE_INTERVAL_TICKS,
            telemetry_interval_ticks: DEFAULT_TELEMETRY_INTERVAL_TICKS,
            rails: table.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RailError {
    #[error("no rail with index {0}")]
    UnknownRail(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailState {
    pub enabled: bool,
    pub status: RailStatus,
    pub last: RailReading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailTelemetry {
    pub rail: u8,
    pub enabled: bool,
    pub status: RailStatus,
    pub voltage_mv: u16,
    pub current_ma: u16,
}

/// Samples enabled rails and removes power from any rail out of bounds.
#[derive(Debug)]
pub struct RailController {
    config: RailsConfig,
    rails: Vec<RailState, MAX_RAILS>,
    ticks: u32,
}

impl RailController {
    pub fn new(config: RailsConfig) -> Self {
        let rails = config
            .rails
            .iter()
            .map(|_| RailState {
                enabled: false,
                status: RailStatus::Disabled,
                last: RailReading::default(),
            })
            .collect();
        Self { config, rails, ticks: 0 }
    }

    pub fn enable(&mut self, rail: u8) -> Result<(), RailError> {
        let state = self.rails.get_mut(usize::from(rail)).ok_or(RailError::UnknownRail(rail))?;
        state.enabled = true;
        // A faulted status stays until an in-bounds reading clears it.
        if state.status == RailStatus::Disabled {
            state.status = RailStatus::Ok;
        }
        info!(rail, "rail enabled");
        Ok(())
    }

    pub fn disable(&mut self, rail: u8) -> Result<(), RailError> {
        let state = self.rails.get_mut(usize::from(rail)).ok_or(RailError::UnknownRail(rail))?;
        state.enabled = false;
        state.status = RailStatus::Disabled;
        info!(rail, "rail disabled");
        Ok(())
    }

    pub fn enable_all(&mut self) {
        for state in self.rails.iter_mut() {
            state.enabled = true;
            if state.status == RailStatus::Disabled {
                state.status = RailStatus::Ok;
            }
        }
    }

    /// Handles an enable/disable request and answers with a response event.
    pub fn on_request(&mut self, rail: u8, enable: bool, out: &mut EventQueue) {
        let result = if enable { self.enable(rail) } else { self.disable(rail) };
        if let Err(err) = result {
            warn!(%err, "rail request rejected");
        }
        out.publish(Event::RailResponse {
            rail,
            enable,
            enabled: self.state(rail).is_some_and(|s| s.enabled),
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

    /// One sampling pass over every enabled rail.
    pub fn evaluate<S: Sensors>(&mut self, sensors: &mut S, out: &mut EventQueue) {
        for (index, (state, config)) in self.rails.iter_mut().zip(self.config.rails.iter()).enumerate() {
            if !state.enabled {
                continue;
            }
            let reading = sensors.read_rail(index);
            state.last = reading;

            let status = config.check(reading);
            let rail = index as u8;
            let Some(code) = rail_fault_code(rail, status) else {
                state.status = RailStatus::Ok;
                continue;
            };

            warn!(
                rail = config.name.as_str(),
                ?status,
                voltage_mv = reading.voltage_mv,
                current_ma = reading.current_ma,
                "rail out of bounds, removing power"
            );
            state.status = status;
            state.enabled = false;

            out.publish(Event::FaultReported {
                source: FaultSource::Rail,
                code,
                severity: Severity::Degraded,
                component: config.component,
            });
            if let Some(component) = config.component {
                out.publish(Event::ComponentFaultReport(ComponentDegradation {
                    component,
                    source: FaultSource::Rail,
                    fallback_available: false,
                }));
            }
            out.publish(Event::RailFault { rail, status });
        }
    }

    pub fn publish_telemetry(&self, out: &mut EventQueue) {
        for rail in 0..self.rails.len() {
            if let Some(t) = self.telemetry(rail as u8) {
                out.publish(Event::RailTelemetry(t));
            }
        }
    }

    pub fn telemetry(&self, rail: u8) -> Option<RailTelemetry> {
        self.state(rail).map(|s| RailTelemetry {
            rail,
            enabled: s.enabled,
            status: s.status,
            voltage_mv: s.last.voltage_mv,
            current_ma: s.last.current_ma,
        })
    }

    pub fn state(&self, rail: u8) -> Option<&RailState> {
        self.rails.get(usize::from(rail))
    }

    pub fn rail_count(&self) -> usize {
        self.rails.len()
    }

    pub fn config(&self) -> &RailsConfig {
        &self.config
    }
}

impl Default for RailController {
    fn default() -> Self {
        Self::new(RailsConfig::default())
    }
}
