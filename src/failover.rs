//! Outbound channel selection.
//!
//! Follows component degradation/recovery of the primary serial channel:
//! a degraded primary with a healthy secondary moves outbound traffic to
//! the secondary; recovery of the primary moves it back without further
//! checks.

use crate::bus::Event;
use crate::link::{ChannelId, SerialLink};
use crate::packet::Packet;
use crate::redundancy::Component;
use crate::transport::Transport;
use tracing::{debug, info};

#[derive(Debug)]
pub struct FailoverPolicy {
    active: ChannelId,
    switch_count: u32,
}

impl FailoverPolicy {
    pub fn new() -> Self {
        Self {
            active: ChannelId::Primary,
            switch_count: 0,
        }
    }

    pub fn active(&self) -> ChannelId {
        self.active
    }

    pub fn switch_count(&self) -> u32 {
        self.switch_count
    }

    /// Reacts to component degradation/recovery events; other events are
    /// ignored. Returns `true` if the active channel changed.
    pub fn on_event(&mut self, event: &Event) -> bool {
        match event {
            Event::ComponentDegraded(d) if d.component == Component::UartPrimary => {
                if d.fallback_available && self.active == ChannelId::Primary {
                    info!(cause = ?d.source, "primary link degraded, failing over to secondary");
                    self.switch_to(ChannelId::Secondary)
                } else {
                    debug!(fallback = d.fallback_available, "primary degraded, staying on {:?}", self.active);
                    false
                }
            }
            Event::ComponentRecovered { component: Component::UartPrimary } => {
                if self.active == ChannelId::Primary {
                    false
                } else {
                    info!("primary link recovered, switching back");
                    self.switch_to(ChannelId::Primary)
                }
            }
            _ => false,
        }
    }

    fn switch_to(&mut self, channel: ChannelId) -> bool {
        self.active = channel;
        self.switch_count = self.switch_count.wrapping_add(1);
        true
    }

    /// The active link, if it can transmit right now.
    pub fn route<'a, T: Transport>(&self, links: &'a mut [SerialLink<T>; 2]) -> Option<&'a mut SerialLink<T>> {
        let link = &mut links[self.active.index()];
        if link.is_ready() {
            Some(link)
        } else {
            None
        }
    }

    pub fn is_route_ready<T: Transport>(&self, links: &[SerialLink<T>; 2]) -> bool {
        links[self.active.index()].is_ready()
    }

    /// Sends through the active link. Not-ready is a silent no-op that
    /// returns `false` so the caller keeps its data queued.
    pub fn send<T: Transport>(&self, links: &mut [SerialLink<T>; 2], packet: &Packet) -> bool {
        match self.route(links) {
            Some(link) => link.send_packet(packet),
            None => false,
        }
    }
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self::new()
    }
}
