//! Power profiles and the battery policy that picks between them.
//!
//! A profile is a named set of rails. Switching removes power from rails
//! that only the old set uses, then enables every rail of the new set.
//! Rails outside both sets are left alone.

use super::battery::BatteryStatus;
use super::rails::RailController;
use super::MAX_RAILS;
use crate::bus::{Event, EventQueue};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PowerProfile {
    Nominal = 0,
    Safe = 1,
}

impl PowerProfile {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Nominal),
            1 => Some(Self::Safe),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    /// OBC, radio, GPS and payload 1.
    pub nominal: Vec<u8, MAX_RAILS>,
    /// OBC only.
    pub safe: Vec<u8, MAX_RAILS>,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            nominal: [0, 1, 2, 3].into_iter().collect(),
            safe: [0].into_iter().collect(),
        }
    }
}

impl ProfilesConfig {
    pub fn rails(&self, profile: PowerProfile) -> &[u8] {
        match profile {
            PowerProfile::Nominal => &self.nominal,
            PowerProfile::Safe => &self.safe,
        }
    }
}

/// Tracks the active profile. The node boots with every rail powered, which
/// is a superset of the nominal set, so the initial profile is `Nominal`.
#[derive(Debug)]
pub struct PowerProfiles {
    config: ProfilesConfig,
    current: PowerProfile,
    switches: u32,
}

impl PowerProfiles {
    pub fn new(config: ProfilesConfig) -> Self {
        Self {
            config,
            current: PowerProfile::Nominal,
            switches: 0,
        }
    }

    /// Switches to `requested` and publishes the change. Returns `false`
    /// when it was already active.
    pub fn on_request(&mut self, requested: PowerProfile, rails: &mut RailController, out: &mut EventQueue) -> bool {
        if requested == self.current {
            debug!(profile = ?requested, "power profile already active");
            return false;
        }
        let previous = self.current;
        let keep = self.config.rails(requested);

        for &rail in self.config.rails(previous) {
            if keep.contains(&rail) {
                continue;
            }
            if let Err(err) = rails.disable(rail) {
                warn!(%err, profile = ?previous, "cannot shed rail");
            }
        }
        for &rail in keep {
            if let Err(err) = rails.enable(rail) {
                warn!(%err, profile = ?requested, "cannot power rail");
            }
        }

        self.current = requested;
        self.switches = self.switches.wrapping_add(1);
        info!(?previous, current = ?requested, "power profile switched");
        out.publish(Event::PowerProfileChanged {
            previous,
            current: requested,
        });
        true
    }

    pub fn current(&self) -> PowerProfile {
        self.current
    }

    pub fn switch_count(&self) -> u32 {
        self.switches
    }

    pub fn config(&self) -> &ProfilesConfig {
        &self.config
    }
}

impl Default for PowerProfiles {
    fn default() -> Self {
        Self::new(ProfilesConfig::default())
    }
}

/// Critical-low battery asks for the safe profile; a full charge asks for
/// nominal again.
#[derive(Debug, Default)]
pub struct PowerPolicy {
    requests: u32,
}

impl PowerPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, event: &Event, out: &mut EventQueue) -> Option<PowerProfile> {
        let profile = match event {
            Event::BatteryAlert {
                status: BatteryStatus::CriticalLow,
                ..
            } => PowerProfile::Safe,
            Event::BatteryFullyCharged { .. } => PowerProfile::Nominal,
            _ => return None,
        };
        self.requests = self.requests.wrapping_add(1);
        out.publish(Event::PowerProfileRequest(profile));
        Some(profile)
    }

    pub fn request_count(&self) -> u32 {
        self.requests
    }
}
