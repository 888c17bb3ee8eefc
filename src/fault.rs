use crate::redundancy::Component;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_ACTIVE_FAULTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FaultSource {
    Battery = 0,
    Mppt = 1,
    Rail = 2,
    Sensor = 3,
    Uart = 4,
}

impl FaultSource {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Battery),
            1 => Some(Self::Mppt),
            2 => Some(Self::Rail),
            3 => Some(Self::Sensor),
            4 => Some(Self::Uart),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    Info = 0,
    Warning = 1,
    Degraded = 2,
    Critical = 3,
}

/// System-wide health, always derived from the active faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum SystemHealth {
    Ok = 0,
    Degraded = 1,
    Fault = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    pub source: FaultSource,
    pub code: u32,
    pub severity: Severity,
    pub first_seen_ms: u64,
    pub occurrence_count: u32,
    pub active: bool,
    pub component: Option<Component>,
}

impl Fault {
    pub fn matches(&self, source: FaultSource, code: u32) -> bool {
        self.source == source && self.code == code
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// First report of this `(source, code)` while inactive.
    New,
    /// Already active; the occurrence count was bumped.
    Repeated { count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    #[error("fault table full, dropped {fault_source:?}/{code:#x}")]
    TableFull { fault_source: FaultSource, code: u32 },
}

/// Fixed-capacity fault table keyed by `(source, code)`.
///
/// Inactive entries are kept in place and reused by the next new fault, so
/// the table never evicts an active fault to make room.
#[derive(Debug)]
pub struct FaultTable<const N: usize = MAX_ACTIVE_FAULTS> {
    entries: Vec<Fault, N>,
    lifetime_count: u32,
}

impl<const N: usize> FaultTable<N> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            lifetime_count: 0,
        }
    }

    pub fn report(
        &mut self,
        source: FaultSource,
        code: u32,
        severity: Severity,
        component: Option<Component>,
        now_ms: u64,
    ) -> Result<FaultOutcome, FaultError> {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|f| f.active && f.matches(source, code))
        {
            existing.occurrence_count = existing.occurrence_count.saturating_add(1);
            if existing.component.is_none() {
                existing.component = component;
            }
            return Ok(FaultOutcome::Repeated {
                count: existing.occurrence_count,
            });
        }

        let fault = Fault {
            source,
            code,
            severity,
            first_seen_ms: now_ms,
            occurrence_count: 1,
            active: true,
            component,
        };

        if let Some(slot) = self.entries.iter_mut().find(|f| !f.active) {
            *slot = fault;
        } else if self.entries.push(fault).is_err() {
            return Err(FaultError::TableFull {
                fault_source: source,
                code,
            });
        }

        self.lifetime_count = self.lifetime_count.wrapping_add(1);

        // NASA Rule 5: no duplicate active identities
        debug_assert!(
            self.entries
                .iter()
                .filter(|f| f.active && f.matches(source, code))
                .count()
                == 1,
            "duplicate active fault entry"
        );

        Ok(FaultOutcome::New)
    }

    /// Deactivates the matching active entry and returns it.
    pub fn clear(&mut self, source: FaultSource, code: u32) -> Option<Fault> {
        let entry = self
            .entries
            .iter_mut()
            .find(|f| f.active && f.matches(source, code))?;
        entry.active = false;
        Some(entry.clone())
    }

    /// Deactivates every entry, returning how many were active.
    pub fn clear_all(&mut self) -> usize {
        let mut cleared = 0;
        for entry in self.entries.iter_mut().filter(|f| f.active) {
            entry.active = false;
            cleared += 1;
        }
        cleared
    }

    /// Critical anywhere means `Fault`, Degraded anywhere means `Degraded`.
    pub fn evaluate_health(&self) -> SystemHealth {
        self.active()
            .map(|f| match f.severity {
                Severity::Critical => SystemHealth::Fault,
                Severity::Degraded => SystemHealth::Degraded,
                Severity::Info | Severity::Warning => SystemHealth::Ok,
            })
            .max()
            .unwrap_or(SystemHealth::Ok)
    }

    pub fn active(&self) -> impl Iterator<Item = &Fault> {
        self.entries.iter().filter(|f| f.active)
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn find(&self, source: FaultSource, code: u32) -> Option<&Fault> {
        self.active().find(|f| f.matches(source, code))
    }

    pub fn has_active_for(&self, component: Component) -> bool {
        self.active().any(|f| f.component == Some(component))
    }

    /// Most recent active fault attributed to `component`.
    pub fn latest_for(&self, component: Component) -> Option<&Fault> {
        self.active()
            .filter(|f| f.component == Some(component))
            .max_by_key(|f| f.first_seen_ms)
    }

    /// Distinct faults ever raised since boot.
    pub fn lifetime_count(&self) -> u32 {
        self.lifetime_count
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for FaultTable<N> {
    fn default() -> Self {
        Self::new()
    }
}
