//! Fault & health engine.
//!
//! Owns the fault table, the per-component health flags and the published
//! system health. Every state change leaves through the event queue; the
//! engine never calls another service directly.

use crate::bus::{Event, EventQueue};
use crate::fault::{Fault, FaultError, FaultOutcome, FaultSource, FaultTable, Severity, SystemHealth};
use crate::link::ChannelId;
use crate::transport::LineError;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Faults carried by one fault-list response.
pub const FAULTS_PER_CHUNK: usize = 4;
pub const DEFAULT_TELEMETRY_INTERVAL_TICKS: u32 = 300;

/// Statically enumerated redundant resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Component {
    UartPrimary = 0,
    UartSecondary = 1,
    Bus5V = 2,
    Bus3V3 = 3,
    BatteryPack = 4,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::UartPrimary,
        Component::UartSecondary,
        Component::Bus5V,
        Component::Bus3V3,
        Component::BatteryPack,
    ];
    pub const COUNT: usize = Self::ALL.len();

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn for_channel(channel: ChannelId) -> Self {
        match channel {
            ChannelId::Primary => Component::UartPrimary,
            ChannelId::Secondary => Component::UartSecondary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub health: SystemHealth,
    pub active_faults: u8,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub component: Component,
    pub healthy: bool,
    /// Source of the most recent active fault attributed to the component.
    pub fault_source: Option<FaultSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSummary {
    pub source: FaultSource,
    pub code: u32,
    pub severity: Severity,
    pub occurrence_count: u32,
    pub first_seen_ms: u64,
}

impl From<&Fault> for FaultSummary {
    fn from(fault: &Fault) -> Self {
        Self {
            source: fault.source,
            code: fault.code,
            severity: fault.severity,
            occurrence_count: fault.occurrence_count,
            first_seen_ms: fault.first_seen_ms,
        }
    }
}

/// One page of a fault-list response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultListChunk {
    pub total_faults: u8,
    pub chunk_index: u8,
    pub faults_in_chunk: u8,
    pub faults: Vec<FaultSummary, FAULTS_PER_CHUNK>,
}

impl FaultListChunk {
    pub fn is_last(&self) -> bool {
        let emitted = usize::from(self.chunk_index) * FAULTS_PER_CHUNK + usize::from(self.faults_in_chunk);
        emitted >= usize::from(self.total_faults)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDegradation {
    pub component: Component,
    pub source: FaultSource,
    pub fallback_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyTelemetry {
    pub health: SystemHealth,
    pub active_faults: u8,
    pub lifetime_faults: u32,
    pub degraded_components: u8,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedundancyConfig {
    pub telemetry_interval_ticks: u32,
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_ticks: DEFAULT_TELEMETRY_INTERVAL_TICKS,
        }
    }
}

#[derive(Debug)]
pub struct RedundancyManager {
    faults: FaultTable,
    component_healthy: [bool; Component::COUNT],
    health: SystemHealth,
    config: RedundancyConfig,
    ticks: u32,
    now_ms: u64,
    table_full_drops: u32,
}

impl RedundancyManager {
    pub fn new(config: RedundancyConfig) -> Self {
        Self {
            faults: FaultTable::new(),
            component_healthy: [true; Component::COUNT],
            health: SystemHealth::Ok,
            config,
            ticks: 0,
            now_ms: 0,
            table_full_drops: 0,
        }
    }

    pub fn report_fault(
        &mut self,
        source: FaultSource,
        code: u32,
        severity: Severity,
        out: &mut EventQueue,
    ) -> Result<FaultOutcome, FaultError> {
        self.report_attributed(source, code, severity, None, out)
    }

    /// Records a fault that belongs to `component`. The component flag is
    /// not touched; that is [`Self::report_component_fault`]'s job.
    pub fn report_attributed(
        &mut self,
        source: FaultSource,
        code: u32,
        severity: Severity,
        component: Option<Component>,
        out: &mut EventQueue,
    ) -> Result<FaultOutcome, FaultError> {
        match self.faults.report(source, code, severity, component, self.now_ms) {
            Ok(FaultOutcome::New) => {
                info!(?source, code, ?severity, "fault raised");
                self.refresh_health(out);
                Ok(FaultOutcome::New)
            }
            Ok(outcome @ FaultOutcome::Repeated { count }) => {
                debug!(?source, code, count, "fault repeated");
                Ok(outcome)
            }
            Err(err) => {
                self.table_full_drops = self.table_full_drops.wrapping_add(1);
                warn!(?source, code, "fault table full, dropping report");
                out.publish(Event::FaultTableFull { source, code });
                Err(err)
            }
        }
    }

    /// Returns whether an active entry was cleared.
    pub fn clear_fault(&mut self, source: FaultSource, code: u32, out: &mut EventQueue) -> bool {
        let Some(cleared) = self.faults.clear(source, code) else {
            debug!(?source, code, "clear requested for inactive fault");
            return false;
        };
        info!(?source, code, "fault cleared");
        if let Some(component) = cleared.component {
            self.recover_if_unfaulted(component, out);
        }
        self.refresh_health(out);
        true
    }

    /// Operator override: deactivates every fault and forces health to Ok.
    pub fn clear_all(&mut self, out: &mut EventQueue) -> usize {
        let cleared = self.faults.clear_all();
        info!(cleared, "all faults cleared");
        for component in Component::ALL {
            self.recover_if_unfaulted(component, out);
        }
        self.refresh_health(out);
        cleared
    }

    pub fn evaluate_health(&self) -> SystemHealth {
        self.faults.evaluate_health()
    }

    pub fn report_component_fault(
        &mut self,
        component: Component,
        source: FaultSource,
        fallback_available: bool,
        out: &mut EventQueue,
    ) {
        let was_healthy = core::mem::replace(&mut self.component_healthy[component.index()], false);
        if was_healthy {
            warn!(?component, ?source, fallback_available, "component degraded");
        }
        out.publish(Event::ComponentDegraded(ComponentDegradation {
            component,
            source,
            fallback_available,
        }));
    }

    pub fn report_component_recovered(&mut self, component: Component, out: &mut EventQueue) {
        self.component_healthy[component.index()] = true;
        info!(?component, "component recovered");
        out.publish(Event::ComponentRecovered { component });
    }

    /// Line-level receive faults count against the channel's component.
    /// A report the full table refuses leaves the component untouched.
    pub fn on_line_error(&mut self, channel: ChannelId, error: LineError, out: &mut EventQueue) {
        let component = Component::for_channel(channel);
        let code = (u32::from(channel as u8) << 8) | u32::from(error as u8);
        if self
            .report_attributed(FaultSource::Uart, code, Severity::Degraded, Some(component), out)
            .is_err()
        {
            return;
        }

        let other = Component::for_channel(channel.other());
        let fallback_available = self.component_healthy[other.index()];
        self.report_component_fault(component, FaultSource::Uart, fallback_available, out);
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            health: self.health,
            active_faults: self.active_fault_count(),
            timestamp_ms: self.now_ms,
        }
    }

    pub fn component_status(&self, component: Component) -> ComponentStatus {
        ComponentStatus {
            component,
            healthy: self.component_healthy[component.index()],
            fault_source: self.faults.latest_for(component).map(|f| f.source),
        }
    }

    /// Paginates every active fault into chunks of [`FAULTS_PER_CHUNK`].
    /// An empty table yields a single empty chunk.
    pub fn fault_list_chunks(&self) -> impl Iterator<Item = FaultListChunk> + '_ {
        let total = self.active_fault_count();
        let chunk_count = usize::from(total).div_ceil(FAULTS_PER_CHUNK).max(1);
        (0..chunk_count).map(move |index| {
            let faults: Vec<FaultSummary, FAULTS_PER_CHUNK> = self
                .faults
                .active()
                .skip(index * FAULTS_PER_CHUNK)
                .take(FAULTS_PER_CHUNK)
                .map(FaultSummary::from)
                .collect();
            FaultListChunk {
                total_faults: total,
                chunk_index: index as u8,
                faults_in_chunk: faults.len() as u8,
                faults,
            }
        })
    }

    pub fn publish_fault_list(&self, out: &mut EventQueue) -> usize {
        let mut published = 0;
        for chunk in self.fault_list_chunks() {
            if out.publish(Event::FaultListResponse(chunk)) {
                published += 1;
            }
        }
        published
    }

    /// Per-tick housekeeping; publishes telemetry on its cadence.
    pub fn on_tick(&mut self, now_ms: u64, out: &mut EventQueue) {
        self.now_ms = now_ms;
        self.ticks = self.ticks.wrapping_add(1);
        if self.config.telemetry_interval_ticks != 0 && self.ticks % self.config.telemetry_interval_ticks == 0 {
            out.publish(Event::RedundancyTelemetry(self.telemetry()));
        }
    }

    pub fn telemetry(&self) -> RedundancyTelemetry {
        RedundancyTelemetry {
            health: self.health,
            active_faults: self.active_fault_count(),
            lifetime_faults: self.faults.lifetime_count(),
            degraded_components: self.degraded_bitmap(),
            timestamp_ms: self.now_ms,
        }
    }

    pub fn health(&self) -> SystemHealth {
        self.health
    }

    pub fn is_component_healthy(&self, component: Component) -> bool {
        self.component_healthy[component.index()]
    }

    pub fn degraded_bitmap(&self) -> u8 {
        Component::ALL
            .iter()
            .filter(|c| !self.component_healthy[c.index()])
            .fold(0, |acc, c| acc | c.bit())
    }

    pub fn faults(&self) -> &FaultTable {
        &self.faults
    }

    pub fn table_full_drops(&self) -> u32 {
        self.table_full_drops
    }

    fn active_fault_count(&self) -> u8 {
        self.faults.active_count() as u8
    }

    fn refresh_health(&mut self, out: &mut EventQueue) {
        let current = self.faults.evaluate_health();
        if current == self.health {
            return;
        }
        let previous = core::mem::replace(&mut self.health, current);
        info!(?previous, ?current, "system health changed");
        out.publish(Event::HealthChanged { previous, current });
    }

    fn recover_if_unfaulted(&mut self, component: Component, out: &mut EventQueue) {
        if !self.component_healthy[component.index()] && !self.faults.has_active_for(component) {
            self.report_component_recovered(component, out);
        }
    }
}

impl Default for RedundancyManager {
    fn default() -> Self {
        Self::new(RedundancyConfig::default())
    }
}
