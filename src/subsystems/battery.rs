use super::{BatteryReading, Sensors};
use crate::bus::{Event, EventQueue};
use crate::fault::{FaultSource, Severity};
use crate::redundancy::{Component, ComponentDegradation};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const FAULT_CRITICAL_LOW: u32 = 1;
pub const FAULT_LOW: u32 = 2;
pub const FAULT_OVER_VOLTAGE: u32 = 3;
pub const FAULT_OVER_TEMPERATURE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BatteryStatus {
    Ok = 0,
    Low = 1,
    CriticalLow = 2,
    OverVoltage = 3,
    OverTemperature = 4,
}

impl BatteryStatus {
    fn fault(self) -> Option<(u32, Severity)> {
        match self {
            BatteryStatus::Ok => None,
            BatteryStatus::Low => Some((FAULT_LOW, Severity::Warning)),
            BatteryStatus::CriticalLow => Some((FAULT_CRITICAL_LOW, Severity::Critical)),
            BatteryStatus::OverVoltage => Some((FAULT_OVER_VOLTAGE, Severity::Degraded)),
            BatteryStatus::OverTemperature => Some((FAULT_OVER_TEMPERATURE, Severity::Degraded)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub update_interval_ticks: u32,
    pub telemetry_interval_ticks: u32,
    pub critical_low_mv: u16,
    pub low_mv: u16,
    pub over_voltage_mv: u16,
    /// Rising through this voltage announces a full charge.
    pub full_charge_mv: u16,
    pub over_temperature_c: f32,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            update_interval_ticks: 10,
            telemetry_interval_ticks: 600,
            critical_low_mv: 3300,
            low_mv: 3500,
            over_voltage_mv: 4250,
            full_charge_mv: 4150,
            over_temperature_c: 60.0,
        }
    }
}

impl BatteryConfig {
    /// Most severe condition wins: critical-low, over-voltage,
    /// over-temperature, low.
    pub fn classify(&self, reading: &BatteryReading) -> BatteryStatus {
        if reading.voltage_mv < self.critical_low_mv {
            BatteryStatus::CriticalLow
        } else if reading.voltage_mv > self.over_voltage_mv {
            BatteryStatus::OverVoltage
        } else if reading.temperature_c > self.over_temperature_c {
            BatteryStatus::OverTemperature
        } else if reading.voltage_mv < self.low_mv {
            BatteryStatus::Low
        } else {
            BatteryStatus::Ok
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryTelemetry {
    pub status: BatteryStatus,
    pub voltage_mv: u16,
    pub current_ma: i16,
    pub temperature_c: f32,
    pub charging: bool,
    pub protection: bool,
}

#[derive(Debug)]
pub struct BatteryMonitor {
    config: BatteryConfig,
    status: BatteryStatus,
    last: BatteryReading,
    charging: bool,
    protection: bool,
    full: bool,
    ticks: u32,
}

impl BatteryMonitor {
    pub fn new(config: BatteryConfig) -> Self {
        Self {
            config,
            status: BatteryStatus::Ok,
            last: BatteryReading::default(),
            charging: true,
            protection: false,
            full: false,
            ticks: 0,
        }
    }

    pub fn on_tick<S: Sensors>(&mut self, sensors: &mut S, out: &mut EventQueue) {
        self.ticks = self.ticks.wrapping_add(1);
        if self.config.update_interval_ticks != 0 && self.ticks % self.config.update_interval_ticks == 0 {
            let reading = sensors.read_battery();
            self.evaluate(reading, out);
        }
        if self.config.telemetry_interval_ticks != 0 && self.ticks % self.config.telemetry_interval_ticks == 0 {
            out.publish(Event::BatteryTelemetry(self.telemetry()));
        }
    }

    pub fn evaluate(&mut self, reading: BatteryReading, out: &mut EventQueue) {
        self.last = reading;
        let status = self.config.classify(&reading);

        if status != self.status {
            self.status = status;
            out.publish(Event::BatteryAlert {
                status,
                voltage_mv: reading.voltage_mv,
            });
            if let Some((code, severity)) = status.fault() {
                warn!(?status, voltage_mv = reading.voltage_mv, temperature_c = reading.temperature_c, "battery alarm");
                out.publish(Event::FaultReported {
                    source: FaultSource::Battery,
                    code,
                    severity,
                    component: Some(Component::BatteryPack),
                });
            }
        }

        if status == BatteryStatus::CriticalLow && !self.protection {
            self.enter_protect_mode(out);
        } else if self.protection && reading.voltage_mv >= self.config.low_mv {
            self.protection = false;
            self.charging = true;
            info!(voltage_mv = reading.voltage_mv, "battery recovered, leaving protect mode");
        }

        let full = reading.voltage_mv >= self.config.full_charge_mv;
        if full && !self.full {
            info!(voltage_mv = reading.voltage_mv, "battery fully charged");
            out.publish(Event::BatteryFullyCharged {
                voltage_mv: reading.voltage_mv,
            });
        }
        self.full = full;
    }

    fn enter_protect_mode(&mut self, out: &mut EventQueue) {
        warn!("battery critically low, entering protect mode");
        self.protection = true;
        self.charging = false;
        out.publish(Event::ComponentFaultReport(ComponentDegradation {
            component: Component::BatteryPack,
            source: FaultSource::Battery,
            fallback_available: false,
        }));
    }

    pub fn telemetry(&self) -> BatteryTelemetry {
        BatteryTelemetry {
            status: self.status,
            voltage_mv: self.last.voltage_mv,
            current_ma: self.last.current_ma,
            temperature_c: self.last.temperature_c,
            charging: self.charging,
            protection: self.protection,
        }
    }

    pub fn status(&self) -> BatteryStatus {
        self.status
    }

    pub fn is_charging(&self) -> bool {
        self.charging
    }

    pub fn in_protect_mode(&self) -> bool {
        self.protection
    }
}

impl Default for BatteryMonitor {
    fn default() -> Self {
        Self::new(BatteryConfig::default())
    }
}
