//! Publish/subscribe event bus.
//!
//! Events are a tagged enum; subscribers register a plain function for an
//! [`EventKind`] and receive the typed service context `S`, the event, and
//! the queue so they can publish follow-up events. Dispatch is synchronous
//! and happens only inside [`EventBus::process`], on the main loop.

use crate::fault::{FaultSource, Severity, SystemHealth};
use crate::link::{ChannelId, LinkError};
use crate::logging::LogLevel;
use crate::packet::Packet;
use crate::redundancy::{
    Component, ComponentDegradation, ComponentStatus, FaultListChunk, HealthSnapshot, RedundancyTelemetry,
};
use crate::subsystems::battery::{BatteryStatus, BatteryTelemetry};
use crate::subsystems::mppt::{MpptStatus, MpptTelemetry};
use crate::subsystems::profiles::PowerProfile;
use crate::subsystems::rails::{RailStatus, RailTelemetry};
use heapless::{Deque, Vec};
use thiserror::Error;
use tracing::warn;

/// Room for both links' poll budgets plus a telemetry tick.
pub const EVENT_QUEUE_SIZE: usize = 64;
pub const MAX_SUBSCRIBERS: usize = 64;
/// Upper bound on dispatches per `process` call.
pub const MAX_DISPATCH_PER_PROCESS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Tick { now_ms: u64 },

    // Transport
    PacketReceived { channel: ChannelId, packet: Packet },
    TransportError { channel: ChannelId, error: LinkError },

    // Fault producers -> engine
    FaultReported {
        source: FaultSource,
        code: u32,
        severity: Severity,
        component: Option<Component>,
    },
    ComponentFaultReport(ComponentDegradation),
    ComponentRecoveryRequest { component: Component },

    // Engine -> consumers
    FaultTableFull { source: FaultSource, code: u32 },
    HealthChanged { previous: SystemHealth, current: SystemHealth },
    ComponentDegraded(ComponentDegradation),
    ComponentRecovered { component: Component },
    RedundancyTelemetry(RedundancyTelemetry),

    // Queries and their responses
    HealthRequest,
    ComponentStatusRequest { component_id: u8 },
    FaultListRequest,
    ClearFaultRequest { source_id: u8, code: u32 },
    ClearAllRequest,
    HealthResponse(HealthSnapshot),
    ComponentStatusResponse(ComponentStatus),
    ComponentNotFound { component_id: u8 },
    FaultListResponse(FaultListChunk),
    FaultClearResponse { source_id: u8, code: u32, cleared: bool },
    ClearAllResponse { cleared: u8 },

    // Rails and battery
    RailRequest { rail: u8, enable: bool },
    /// `enable` echoes the request; `enabled` is the rail's state afterwards.
    RailResponse { rail: u8, enable: bool, enabled: bool, accepted: bool },
    RailFault { rail: u8, status: RailStatus },
    RailTelemetry(RailTelemetry),
    BatteryAlert { status: BatteryStatus, voltage_mv: u16 },
    BatteryTelemetry(BatteryTelemetry),
    BatteryFullyCharged { voltage_mv: u16 },

    // Solar charge channels
    MpptRequest { channel: u8, enable: bool },
    MpptResponse { channel: u8, enable: bool, enabled: bool, accepted: bool },
    MpptFault { channel: u8, status: MpptStatus },
    MpptTelemetry(MpptTelemetry),

    // Power profiles
    PowerProfileRequest(PowerProfile),
    PowerProfileChanged { previous: PowerProfile, current: PowerProfile },

    // Flight log
    FlushLogsRequest,
    SetLogLevel(LogLevel),
}

/// Subscription key; one per [`Event`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Tick,
    PacketReceived,
    TransportError,
    FaultReported,
    ComponentFaultReport,
    ComponentRecoveryRequest,
    FaultTableFull,
    HealthChanged,
    ComponentDegraded,
    ComponentRecovered,
    RedundancyTelemetry,
    HealthRequest,
    ComponentStatusRequest,
    FaultListRequest,
    ClearFaultRequest,
    ClearAllRequest,
    HealthResponse,
    ComponentStatusResponse,
    ComponentNotFound,
    FaultListResponse,
    FaultClearResponse,
    ClearAllResponse,
    RailRequest,
    RailResponse,
    RailFault,
    RailTelemetry,
    BatteryAlert,
    BatteryTelemetry,
    BatteryFullyCharged,
    MpptRequest,
    MpptResponse,
    MpptFault,
    MpptTelemetry,
    PowerProfileRequest,
    PowerProfileChanged,
    FlushLogsRequest,
    SetLogLevel,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Tick { .. } => EventKind::Tick,
            Event::PacketReceived { .. } => EventKind::PacketReceived,
            Event::TransportError { .. } => EventKind::TransportError,
            Event::FaultReported { .. } => EventKind::FaultReported,
            Event::ComponentFaultReport(_) => EventKind::ComponentFaultReport,
            Event::ComponentRecoveryRequest { .. } => EventKind::ComponentRecoveryRequest,
            Event::FaultTableFull { .. } => EventKind::FaultTableFull,
            Event::HealthChanged { .. } => EventKind::HealthChanged,
            Event::ComponentDegraded(_) => EventKind::ComponentDegraded,
            Event::ComponentRecovered { .. } => EventKind::ComponentRecovered,
            Event::RedundancyTelemetry(_) => EventKind::RedundancyTelemetry,
            Event::HealthRequest => EventKind::HealthRequest,
            Event::ComponentStatusRequest { .. } => EventKind::ComponentStatusRequest,
            Event::FaultListRequest => EventKind::FaultListRequest,
            Event::ClearFaultRequest { .. } => EventKind::ClearFaultRequest,
            Event::ClearAllRequest => EventKind::ClearAllRequest,
            Event::HealthResponse(_) => EventKind::HealthResponse,
            Event::ComponentStatusResponse(_) => EventKind::ComponentStatusResponse,
            Event::ComponentNotFound { .. } => EventKind::ComponentNotFound,
            Event::FaultListResponse(_) => EventKind::FaultListResponse,
            Event::FaultClearResponse { .. } => EventKind::FaultClearResponse,
            Event::ClearAllResponse { .. } => EventKind::ClearAllResponse,
            Event::RailRequest { .. } => EventKind::RailRequest,
            Event::RailResponse { .. } => EventKind::RailResponse,
            Event::RailFault { .. } => EventKind::RailFault,
            Event::RailTelemetry(_) => EventKind::RailTelemetry,
            Event::BatteryAlert { .. } => EventKind::BatteryAlert,
            Event::BatteryTelemetry(_) => EventKind::BatteryTelemetry,
            Event::BatteryFullyCharged { .. } => EventKind::BatteryFullyCharged,
            Event::MpptRequest { .. } => EventKind::MpptRequest,
            Event::MpptResponse { .. } => EventKind::MpptResponse,
            Event::MpptFault { .. } => EventKind::MpptFault,
            Event::MpptTelemetry(_) => EventKind::MpptTelemetry,
            Event::PowerProfileRequest(_) => EventKind::PowerProfileRequest,
            Event::PowerProfileChanged { .. } => EventKind::PowerProfileChanged,
            Event::FlushLogsRequest => EventKind::FlushLogsRequest,
            Event::SetLogLevel(_) => EventKind::SetLogLevel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("subscriber registry full")]
    RegistryFull,
}

/// Bounded FIFO of pending events.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Deque<Event, EVENT_QUEUE_SIZE>,
    published: u32,
    dropped: u32,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `event`; returns `false` and counts a drop when full.
    pub fn publish(&mut self, event: Event) -> bool {
        let kind = event.kind();
        match self.events.push_back(event) {
            Ok(()) => {
                self.published = self.published.wrapping_add(1);
                true
            }
            Err(_) => {
                self.dropped = self.dropped.wrapping_add(1);
                warn!(?kind, dropped = self.dropped, "event queue full, dropping event");
                false
            }
        }
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.events.is_full()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn published(&self) -> u32 {
        self.published
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

pub type Handler<S> = fn(&mut S, &Event, &mut EventQueue);

/// Subscriber registry plus pending queue, parameterised by the service
/// context handed to every handler.
pub struct EventBus<S> {
    queue: EventQueue,
    subscribers: Vec<(EventKind, Handler<S>), MAX_SUBSCRIBERS>,
    dispatched: u32,
}

impl<S> EventBus<S> {
    pub fn new() -> Self {
        Self {
            queue: EventQueue::new(),
            subscribers: Vec::new(),
            dispatched: 0,
        }
    }

    /// Handlers for the same kind run in registration order.
    pub fn subscribe(&mut self, kind: EventKind, handler: Handler<S>) -> Result<(), BusError> {
        self.subscribers
            .push((kind, handler))
            .map_err(|_| BusError::RegistryFull)
    }

    pub fn publish(&mut self, event: Event) -> bool {
        self.queue.publish(event)
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut EventQueue {
        &mut self.queue
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn dispatched(&self) -> u32 {
        self.dispatched
    }

    /// Drains the queue, including events published by handlers while it
    /// runs. Returns the number of events dispatched.
    pub fn process(&mut self, ctx: &mut S) -> usize {
        let Self {
            queue,
            subscribers,
            dispatched,
        } = self;

        let mut count = 0;
        while count < MAX_DISPATCH_PER_PROCESS {
            let Some(event) = queue.pop() else {
                break;
            };
            let kind = event.kind();
            for (_, handler) in subscribers.iter().filter(|(k, _)| *k == kind) {
                handler(ctx, &event, queue);
            }
            count += 1;
        }

        if count == MAX_DISPATCH_PER_PROCESS && !queue.is_empty() {
            warn!(pending = queue.len(), "dispatch budget exhausted, deferring events");
        }

        *dispatched = dispatched.wrapping_add(count as u32);
        count
    }
}

impl<S> Default for EventBus<S> {
    fn default() -> Self {
        Self::new()
    }
}
