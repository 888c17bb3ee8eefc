//! EPS node: the cooperative main loop.
//!
//! [`EpsNode`] owns the event bus and every service. Services never call
//! each other; the handlers registered in [`EpsNode::new`] are the only
//! place where an event is routed to a service method. One [`EpsNode::tick`]
//! publishes a tick and runs the bus until it is quiet.

use crate::bus::{BusError, Event, EventBus, EventKind, EventQueue};
use crate::command::CommandDispatcher;
use crate::config::{ConfigError, EpsConfig};
use crate::failover::FailoverPolicy;
use crate::fault::FaultSource;
use crate::link::{ChannelId, LinkError, SerialLink};
use crate::logging::FlightLog;
use crate::redundancy::{Component, RedundancyManager};
use crate::subsystems::{BatteryMonitor, MpptController, PowerPolicy, PowerProfiles, RailController, Sensors};
use crate::transport::Transport;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("event bus: {0}")]
    Bus(#[from] BusError),
}

/// Everything a handler may touch.
pub struct Services<T: Transport, S: Sensors> {
    pub now_ms: u64,
    pub links: [SerialLink<T>; 2],
    pub redundancy: RedundancyManager,
    pub failover: FailoverPolicy,
    pub log: FlightLog,
    pub rails: RailController,
    pub battery: BatteryMonitor,
    pub mppt: MpptController,
    pub profiles: PowerProfiles,
    pub policy: PowerPolicy,
    pub commands: CommandDispatcher,
    pub sensors: S,
}

impl<T: Transport, S: Sensors> Services<T, S> {
    fn downlink(&mut self, event: &Event) -> bool {
        match self.commands.packet_for(event) {
            Some(packet) => self.failover.send(&mut self.links, &packet),
            None => false,
        }
    }
}

pub struct EpsNode<T: Transport, S: Sensors> {
    bus: EventBus<Services<T, S>>,
    services: Services<T, S>,
    tick_period_ms: u32,
    ticks: u64,
}

impl<T: Transport, S: Sensors> EpsNode<T, S> {
    pub fn new(config: EpsConfig, primary: T, secondary: T, sensors: S) -> Result<Self, NodeError> {
        config.validate()?;

        let mut rails = RailController::new(config.rails.clone());
        rails.enable_all();

        let services = Services {
            now_ms: 0,
            links: [
                SerialLink::new(ChannelId::Primary, primary),
                SerialLink::new(ChannelId::Secondary, secondary),
            ],
            redundancy: RedundancyManager::new(config.redundancy),
            failover: FailoverPolicy::new(),
            log: FlightLog::new(config.logging),
            rails,
            battery: BatteryMonitor::new(config.battery),
            mppt: MpptController::new(config.mppt),
            profiles: PowerProfiles::new(config.profiles),
            policy: PowerPolicy::new(),
            commands: CommandDispatcher::new(),
            sensors,
        };

        let mut node = Self {
            bus: EventBus::new(),
            services,
            tick_period_ms: config.tick_period_ms,
            ticks: 0,
        };
        node.wire()?;
        info!(subscribers = node.bus.subscriber_count(), "EPS node ready");
        Ok(node)
    }

    fn wire(&mut self) -> Result<(), BusError> {
        let bus = &mut self.bus;

        bus.subscribe(EventKind::Tick, on_tick::<T, S>)?;
        bus.subscribe(EventKind::PacketReceived, on_packet::<T, S>)?;
        bus.subscribe(EventKind::TransportError, on_transport_error::<T, S>)?;

        // Fault producers into the engine.
        bus.subscribe(EventKind::FaultReported, |ctx: &mut Services<T, S>, event, out| {
            if let Event::FaultReported {
                source,
                code,
                severity,
                component,
            } = *event
            {
                if let Err(err) = ctx.redundancy.report_attributed(source, code, severity, component, out) {
                    debug!(%err, "fault report not recorded");
                }
            }
        })?;
        // A degradation needs an active fault attributed to the component.
        bus.subscribe(EventKind::ComponentFaultReport, |ctx: &mut Services<T, S>, event, out| {
            if let Event::ComponentFaultReport(d) = *event {
                if ctx.redundancy.faults().has_active_for(d.component) {
                    ctx.redundancy
                        .report_component_fault(d.component, d.source, d.fallback_available, out);
                } else {
                    debug!(component = ?d.component, "degradation without a recorded fault ignored");
                }
            }
        })?;
        bus.subscribe(EventKind::ComponentRecoveryRequest, |ctx: &mut Services<T, S>, event, out| {
            if let Event::ComponentRecoveryRequest { component } = *event {
                ctx.redundancy.report_component_recovered(component, out);
            }
        })?;

        // Engine consumers.
        for kind in [EventKind::ComponentDegraded, EventKind::ComponentRecovered] {
            bus.subscribe(kind, |ctx: &mut Services<T, S>, event, _| {
                ctx.failover.on_event(event);
            })?;
        }

        // Queries.
        bus.subscribe(EventKind::HealthRequest, |ctx: &mut Services<T, S>, _, out| {
            out.publish(Event::HealthResponse(ctx.redundancy.health_snapshot()));
        })?;
        bus.subscribe(EventKind::ComponentStatusRequest, |ctx: &mut Services<T, S>, event, out| {
            if let Event::ComponentStatusRequest { component_id } = *event {
                let response = match Component::from_id(component_id) {
                    Some(component) => Event::ComponentStatusResponse(ctx.redundancy.component_status(component)),
                    None => Event::ComponentNotFound { component_id },
                };
                out.publish(response);
            }
        })?;
        bus.subscribe(EventKind::FaultListRequest, |ctx: &mut Services<T, S>, _, out| {
            ctx.redundancy.publish_fault_list(out);
        })?;
        bus.subscribe(EventKind::ClearFaultRequest, |ctx: &mut Services<T, S>, event, out| {
            if let Event::ClearFaultRequest { source_id, code } = *event {
                let cleared = FaultSource::from_id(source_id)
                    .is_some_and(|source| ctx.redundancy.clear_fault(source, code, out));
                out.publish(Event::FaultClearResponse {
                    source_id,
                    code,
                    cleared,
                });
            }
        })?;
        bus.subscribe(EventKind::ClearAllRequest, |ctx: &mut Services<T, S>, _, out| {
            let cleared = ctx.redundancy.clear_all(out);
            out.publish(Event::ClearAllResponse {
                cleared: u8::try_from(cleared).unwrap_or(u8::MAX),
            });
        })?;

        // Rails and flight log.
        bus.subscribe(EventKind::RailRequest, |ctx: &mut Services<T, S>, event, out| {
            if let Event::RailRequest { rail, enable } = *event {
                ctx.rails.on_request(rail, enable, out);
            }
        })?;
        bus.subscribe(EventKind::MpptRequest, |ctx: &mut Services<T, S>, event, out| {
            if let Event::MpptRequest { channel, enable } = *event {
                ctx.mppt.on_request(channel, enable, out);
            }
        })?;

        // Battery policy picks the power profile.
        for kind in [EventKind::BatteryAlert, EventKind::BatteryFullyCharged] {
            bus.subscribe(kind, |ctx: &mut Services<T, S>, event, out| {
                ctx.policy.on_event(event, out);
            })?;
        }
        bus.subscribe(EventKind::PowerProfileRequest, |ctx: &mut Services<T, S>, event, out| {
            if let Event::PowerProfileRequest(profile) = *event {
                ctx.profiles.on_request(profile, &mut ctx.rails, out);
            }
        })?;
        bus.subscribe(EventKind::FlushLogsRequest, |ctx: &mut Services<T, S>, _, _| {
            ctx.log.flush(&ctx.failover, &mut ctx.links);
        })?;
        bus.subscribe(EventKind::SetLogLevel, |ctx: &mut Services<T, S>, event, _| {
            if let Event::SetLogLevel(level) = *event {
                ctx.log.set_level(level);
            }
        })?;

        for kind in [
            EventKind::HealthChanged,
            EventKind::ComponentDegraded,
            EventKind::ComponentRecovered,
            EventKind::FaultTableFull,
            EventKind::FaultClearResponse,
            EventKind::ClearAllResponse,
            EventKind::TransportError,
            EventKind::RailFault,
            EventKind::RailResponse,
            EventKind::BatteryAlert,
            EventKind::BatteryFullyCharged,
            EventKind::MpptFault,
            EventKind::MpptResponse,
            EventKind::PowerProfileChanged,
        ] {
            bus.subscribe(kind, |ctx: &mut Services<T, S>, event, _| ctx.log.on_event(event))?;
        }

        // Downlink of responses and telemetry.
        for kind in [
            EventKind::HealthResponse,
            EventKind::ComponentStatusResponse,
            EventKind::ComponentNotFound,
            EventKind::FaultListResponse,
            EventKind::FaultClearResponse,
            EventKind::ClearAllResponse,
            EventKind::RailResponse,
            EventKind::RedundancyTelemetry,
            EventKind::RailTelemetry,
            EventKind::BatteryTelemetry,
            EventKind::MpptResponse,
            EventKind::MpptTelemetry,
            EventKind::PowerProfileChanged,
        ] {
            bus.subscribe(kind, |ctx: &mut Services<T, S>, event, _| {
                ctx.downlink(event);
            })?;
        }

        Ok(())
    }

    /// Advances time by one tick period and runs the bus to completion.
    /// Returns the number of events dispatched.
    pub fn tick(&mut self) -> usize {
        self.ticks = self.ticks.wrapping_add(1);
        self.services.now_ms = self.services.now_ms.wrapping_add(u64::from(self.tick_period_ms));
        self.bus.publish(Event::Tick {
            now_ms: self.services.now_ms,
        });
        self.bus.process(&mut self.services)
    }

    pub fn run_ticks(&mut self, count: u32) {
        for _ in 0..count {
            self.tick();
        }
    }

    /// Queues an event from outside the loop; it is dispatched on the next
    /// [`Self::process`] or [`Self::tick`].
    pub fn publish(&mut self, event: Event) -> bool {
        self.bus.publish(event)
    }

    pub fn process(&mut self) -> usize {
        self.bus.process(&mut self.services)
    }

    pub fn now_ms(&self) -> u64 {
        self.services.now_ms
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn services(&self) -> &Services<T, S> {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut Services<T, S> {
        &mut self.services
    }

    pub fn redundancy(&self) -> &RedundancyManager {
        &self.services.redundancy
    }

    pub fn failover(&self) -> &FailoverPolicy {
        &self.services.failover
    }

    pub fn log(&self) -> &FlightLog {
        &self.services.log
    }

    pub fn rails(&self) -> &RailController {
        &self.services.rails
    }

    pub fn battery(&self) -> &BatteryMonitor {
        &self.services.battery
    }

    pub fn mppt(&self) -> &MpptController {
        &self.services.mppt
    }

    pub fn profiles(&self) -> &PowerProfiles {
        &self.services.profiles
    }

    pub fn link(&self, channel: ChannelId) -> &SerialLink<T> {
        &self.services.links[channel.index()]
    }

    pub fn link_mut(&mut self, channel: ChannelId) -> &mut SerialLink<T> {
        &mut self.services.links[channel.index()]
    }

    pub fn sensors_mut(&mut self) -> &mut S {
        &mut self.services.sensors
    }

    pub fn bus(&self) -> &EventBus<Services<T, S>> {
        &self.bus
    }
}

fn on_tick<T: Transport, S: Sensors>(ctx: &mut Services<T, S>, event: &Event, out: &mut EventQueue) {
    let Event::Tick { now_ms } = *event else {
        return;
    };
    for link in &mut ctx.links {
        link.poll(out);
    }
    ctx.redundancy.on_tick(now_ms, out);
    ctx.rails.on_tick(&mut ctx.sensors, out);
    ctx.battery.on_tick(&mut ctx.sensors, out);
    ctx.mppt.on_tick(&mut ctx.sensors, out);
    if ctx.log.on_tick(now_ms) {
        ctx.log.flush(&ctx.failover, &mut ctx.links);
    }
}

fn on_packet<T: Transport, S: Sensors>(ctx: &mut Services<T, S>, event: &Event, out: &mut EventQueue) {
    let Event::PacketReceived { channel, packet } = event else {
        return;
    };
    debug!(?channel, command_id = packet.command_id, seq = packet.sequence, "inbound packet");
    if let Some(reply) = ctx.commands.on_packet(packet, out) {
        ctx.failover.send(&mut ctx.links, &reply);
    }
}

fn on_transport_error<T: Transport, S: Sensors>(ctx: &mut Services<T, S>, event: &Event, out: &mut EventQueue) {
    if let Event::TransportError {
        channel,
        error: LinkError::Line(line),
    } = *event
    {
        ctx.redundancy.on_line_error(channel, line, out);
    }
}
