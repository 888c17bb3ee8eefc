//! OBC command dispatcher.
//!
//! Turns `Command` packets addressed to the EPS into request events, and
//! response/telemetry events back into packets for the downlink. The
//! dispatcher never touches a link; the node sends whatever it returns
//! through the failover policy.
//!
//! Payload encodings (little-endian):
//!
//! | id   | request payload             | reply                                   |
//! |------|-----------------------------|-----------------------------------------|
//! | 0x01 | any (echoed)                | `Ack`                                   |
//! | 0x10 | -                           | health u8, active u8, ts u32            |
//! | 0x11 | component u8                | component u8, healthy u8, source u8     |
//! | 0x12 | -                           | one packet per chunk, see below         |
//! | 0x13 | source u8, code u32         | source u8, code u32, cleared u8         |
//! | 0x14 | -                           | cleared u8                              |
//! | 0x15 | component u8                | `Ack`, then a recovery event            |
//! | 0x20 | rail u8                     | rail u8, enabled u8, accepted u8        |
//! | 0x21 | rail u8                     | rail u8, enabled u8, accepted u8        |
//! | 0x22 | channel u8                  | channel u8, enabled u8, accepted u8     |
//! | 0x23 | channel u8                  | channel u8, enabled u8, accepted u8     |
//! | 0x24 | profile u8                  | `Ack`, then profile telemetry on change |
//! | 0x30 | -                           | `Ack`                                   |
//! | 0x31 | level u8                    | `Ack`                                   |
//!
//! A fault-list chunk is `total u8, index u8, count u8` followed by `count`
//! records of `source u8, severity u8, code u32, occurrences u16,
//! first_seen_ms u32`; the final chunk carries `is_last_chunk`.
//!
//! Telemetry 0x43 is one MPPT channel: `channel u8, status u8, input_mv u16,
//! output_mv u16, output_ma u16, power_mw u32`. Telemetry 0x44 is a profile
//! switch: `previous u8, current u8`.

use crate::bus::{Event, EventQueue};
use crate::fault::{FaultSource, Severity, SystemHealth};
use crate::logging::LogLevel;
use crate::packet::{MessageType, Packet, Payload, ADDR_EPS, ADDR_OBC, PROTOCOL_VERSION};
use crate::redundancy::{
    Component, ComponentStatus, FaultListChunk, FaultSummary, HealthSnapshot, RedundancyTelemetry, FAULTS_PER_CHUNK,
};
use crate::subsystems::{BatteryTelemetry, MpptTelemetry, PowerProfile, RailTelemetry};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CMD_PING: u8 = 0x01;
pub const CMD_GET_HEALTH: u8 = 0x10;
pub const CMD_GET_COMPONENT_STATUS: u8 = 0x11;
pub const CMD_GET_FAULT_LIST: u8 = 0x12;
pub const CMD_CLEAR_FAULT: u8 = 0x13;
pub const CMD_CLEAR_ALL_FAULTS: u8 = 0x14;
pub const CMD_RECOVER_COMPONENT: u8 = 0x15;
pub const CMD_ENABLE_RAIL: u8 = 0x20;
pub const CMD_DISABLE_RAIL: u8 = 0x21;
pub const CMD_ENABLE_MPPT: u8 = 0x22;
pub const CMD_DISABLE_MPPT: u8 = 0x23;
pub const CMD_SET_POWER_PROFILE: u8 = 0x24;
pub const CMD_FLUSH_LOGS: u8 = 0x30;
pub const CMD_SET_LOG_LEVEL: u8 = 0x31;

pub const TLM_REDUNDANCY: u8 = 0x40;
pub const TLM_RAIL: u8 = 0x41;
pub const TLM_BATTERY: u8 = 0x42;
pub const TLM_MPPT: u8 = 0x43;
pub const TLM_POWER_PROFILE: u8 = 0x44;

pub const FAULT_RECORD_LEN: usize = 12;
const NO_SOURCE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NackReason {
    UnknownCommand = 1,
    BadLength = 2,
    InvalidParameter = 3,
    WrongMessageType = 4,
}

impl NackReason {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::UnknownCommand),
            2 => Some(Self::BadLength),
            3 => Some(Self::InvalidParameter),
            4 => Some(Self::WrongMessageType),
            _ => None,
        }
    }
}

/// Decoded OBC request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    GetHealth,
    GetComponentStatus { component_id: u8 },
    GetFaultList,
    ClearFault { source_id: u8, code: u32 },
    ClearAllFaults,
    RecoverComponent { component: Component },
    EnableRail { rail: u8 },
    DisableRail { rail: u8 },
    EnableMppt { channel: u8 },
    DisableMppt { channel: u8 },
    SetPowerProfile { profile: PowerProfile },
    FlushLogs,
    SetLogLevel { level: LogLevel },
}

impl Command {
    pub fn parse(command_id: u8, payload: &[u8]) -> Result<Self, NackReason> {
        let expect = |len: usize| {
            if payload.len() == len {
                Ok(())
            } else {
                Err(NackReason::BadLength)
            }
        };
        match command_id {
            CMD_PING => Ok(Command::Ping),
            CMD_GET_HEALTH => expect(0).map(|()| Command::GetHealth),
            CMD_GET_COMPONENT_STATUS => {
                expect(1)?;
                Ok(Command::GetComponentStatus { component_id: payload[0] })
            }
            CMD_GET_FAULT_LIST => expect(0).map(|()| Command::GetFaultList),
            CMD_CLEAR_FAULT => {
                expect(5)?;
                Ok(Command::ClearFault {
                    source_id: payload[0],
                    code: u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]),
                })
            }
            CMD_CLEAR_ALL_FAULTS => expect(0).map(|()| Command::ClearAllFaults),
            CMD_RECOVER_COMPONENT => {
                expect(1)?;
                let component = Component::from_id(payload[0]).ok_or(NackReason::InvalidParameter)?;
                Ok(Command::RecoverComponent { component })
            }
            CMD_ENABLE_RAIL => {
                expect(1)?;
                Ok(Command::EnableRail { rail: payload[0] })
            }
            CMD_DISABLE_RAIL => {
                expect(1)?;
                Ok(Command::DisableRail { rail: payload[0] })
            }
            CMD_ENABLE_MPPT => {
                expect(1)?;
                Ok(Command::EnableMppt { channel: payload[0] })
            }
            CMD_DISABLE_MPPT => {
                expect(1)?;
                Ok(Command::DisableMppt { channel: payload[0] })
            }
            CMD_SET_POWER_PROFILE => {
                expect(1)?;
                let profile = PowerProfile::from_u8(payload[0]).ok_or(NackReason::InvalidParameter)?;
                Ok(Command::SetPowerProfile { profile })
            }
            CMD_FLUSH_LOGS => expect(0).map(|()| Command::FlushLogs),
            CMD_SET_LOG_LEVEL => {
                expect(1)?;
                let level = LogLevel::from_u8(payload[0]).ok_or(NackReason::InvalidParameter)?;
                Ok(Command::SetLogLevel { level })
            }
            _ => Err(NackReason::UnknownCommand),
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Command::Ping => CMD_PING,
            Command::GetHealth => CMD_GET_HEALTH,
            Command::GetComponentStatus { .. } => CMD_GET_COMPONENT_STATUS,
            Command::GetFaultList => CMD_GET_FAULT_LIST,
            Command::ClearFault { .. } => CMD_CLEAR_FAULT,
            Command::ClearAllFaults => CMD_CLEAR_ALL_FAULTS,
            Command::RecoverComponent { .. } => CMD_RECOVER_COMPONENT,
            Command::EnableRail { .. } => CMD_ENABLE_RAIL,
            Command::DisableRail { .. } => CMD_DISABLE_RAIL,
            Command::EnableMppt { .. } => CMD_ENABLE_MPPT,
            Command::DisableMppt { .. } => CMD_DISABLE_MPPT,
            Command::SetPowerProfile { .. } => CMD_SET_POWER_PROFILE,
            Command::FlushLogs => CMD_FLUSH_LOGS,
            Command::SetLogLevel { .. } => CMD_SET_LOG_LEVEL,
        }
    }

    /// Wire payload for this request; the inverse of [`Command::parse`].
    pub fn payload(&self) -> Vec<u8, 8> {
        let mut p = Vec::new();
        match *self {
            Command::GetComponentStatus { component_id } => {
                let _ = p.push(component_id);
            }
            Command::ClearFault { source_id, code } => {
                let _ = p.push(source_id);
                let _ = p.extend_from_slice(&code.to_le_bytes());
            }
            Command::RecoverComponent { component } => {
                let _ = p.push(component as u8);
            }
            Command::EnableRail { rail } | Command::DisableRail { rail } => {
                let _ = p.push(rail);
            }
            Command::EnableMppt { channel } | Command::DisableMppt { channel } => {
                let _ = p.push(channel);
            }
            Command::SetPowerProfile { profile } => {
                let _ = p.push(profile as u8);
            }
            Command::SetLogLevel { level } => {
                let _ = p.push(level as u8);
            }
            Command::Ping
            | Command::GetHealth
            | Command::GetFaultList
            | Command::ClearAllFaults
            | Command::FlushLogs => {}
        }
        p
    }

    /// Builds the request packet the OBC would send.
    pub fn to_packet(&self, sequence: u16) -> Packet {
        Packet {
            version: PROTOCOL_VERSION,
            destination: ADDR_EPS,
            source: ADDR_OBC,
            message_type: MessageType::Command,
            command_id: self.id(),
            sequence,
            is_last_chunk: true,
            payload: Payload::from_slice(&self.payload()).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStats {
    pub received: u32,
    pub rejected: u32,
    pub replies: u32,
}

#[derive(Debug, Default)]
pub struct CommandDispatcher {
    sequence: u16,
    stats: CommandStats,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &CommandStats {
        &self.stats
    }

    /// Handles an inbound packet. Publishes the request event, if any, and
    /// returns an immediate `Ack`/`Nack` to send.
    pub fn on_packet(&mut self, packet: &Packet, out: &mut EventQueue) -> Option<Packet> {
        if packet.destination != ADDR_EPS {
            debug!(destination = packet.destination, "ignoring packet for another node");
            return None;
        }
        self.stats.received = self.stats.received.wrapping_add(1);

        if packet.message_type != MessageType::Command {
            return Some(self.nack(packet, NackReason::WrongMessageType));
        }

        let command = match Command::parse(packet.command_id, &packet.payload) {
            Ok(command) => command,
            Err(reason) => {
                warn!(command_id = packet.command_id, ?reason, "rejecting command");
                return Some(self.nack(packet, reason));
            }
        };
        debug!(?command, seq = packet.sequence, "command accepted");

        let (request, ack) = match command {
            Command::Ping => (None, true),
            Command::GetHealth => (Some(Event::HealthRequest), false),
            Command::GetComponentStatus { component_id } => (Some(Event::ComponentStatusRequest { component_id }), false),
            Command::GetFaultList => (Some(Event::FaultListRequest), false),
            Command::ClearFault { source_id, code } => (Some(Event::ClearFaultRequest { source_id, code }), false),
            Command::ClearAllFaults => (Some(Event::ClearAllRequest), false),
            Command::RecoverComponent { component } => (Some(Event::ComponentRecoveryRequest { component }), true),
            Command::EnableRail { rail } => (Some(Event::RailRequest { rail, enable: true }), false),
            Command::DisableRail { rail } => (Some(Event::RailRequest { rail, enable: false }), false),
            Command::EnableMppt { channel } => (Some(Event::MpptRequest { channel, enable: true }), false),
            Command::DisableMppt { channel } => (Some(Event::MpptRequest { channel, enable: false }), false),
            Command::SetPowerProfile { profile } => (Some(Event::PowerProfileRequest(profile)), true),
            Command::FlushLogs => (Some(Event::FlushLogsRequest), true),
            Command::SetLogLevel { level } => (Some(Event::SetLogLevel(level)), true),
        };

        if let Some(event) = request {
            out.publish(event);
        }
        if ack {
            let echo: &[u8] = if command == Command::Ping { &packet.payload[..] } else { &[] };
            Some(self.reply(MessageType::Ack, packet.command_id, echo, true))
        } else {
            None
        }
    }

    /// Downlink packet for a response or telemetry event.
    pub fn packet_for(&mut self, event: &Event) -> Option<Packet> {
        let mut p = Payload::new();
        let (message_type, command_id, last) = match event {
            Event::HealthResponse(snapshot) => {
                encode_health(snapshot, &mut p);
                (MessageType::Response, CMD_GET_HEALTH, true)
            }
            Event::ComponentStatusResponse(status) => {
                encode_component_status(status, &mut p);
                (MessageType::Response, CMD_GET_COMPONENT_STATUS, true)
            }
            Event::ComponentNotFound { component_id } => {
                let _ = p.extend_from_slice(&[NackReason::InvalidParameter as u8, *component_id]);
                (MessageType::Nack, CMD_GET_COMPONENT_STATUS, true)
            }
            Event::FaultListResponse(chunk) => {
                encode_fault_chunk(chunk, &mut p);
                (MessageType::Response, CMD_GET_FAULT_LIST, chunk.is_last())
            }
            Event::FaultClearResponse { source_id, code, cleared } => {
                let _ = p.push(*source_id);
                let _ = p.extend_from_slice(&code.to_le_bytes());
                let _ = p.push(u8::from(*cleared));
                (MessageType::Response, CMD_CLEAR_FAULT, true)
            }
            Event::ClearAllResponse { cleared } => {
                let _ = p.push(*cleared);
                (MessageType::Response, CMD_CLEAR_ALL_FAULTS, true)
            }
            Event::RailResponse {
                rail,
                enable,
                enabled,
                accepted,
            } => {
                let _ = p.extend_from_slice(&[*rail, u8::from(*enabled), u8::from(*accepted)]);
                let id = if *enable { CMD_ENABLE_RAIL } else { CMD_DISABLE_RAIL };
                (MessageType::Response, id, true)
            }
            Event::MpptResponse {
                channel,
                enable,
                enabled,
                accepted,
            } => {
                let _ = p.extend_from_slice(&[*channel, u8::from(*enabled), u8::from(*accepted)]);
                let id = if *enable { CMD_ENABLE_MPPT } else { CMD_DISABLE_MPPT };
                (MessageType::Response, id, true)
            }
            Event::RedundancyTelemetry(t) => {
                encode_redundancy_telemetry(t, &mut p);
                (MessageType::Telemetry, TLM_REDUNDANCY, true)
            }
            Event::RailTelemetry(t) => {
                encode_rail_telemetry(t, &mut p);
                (MessageType::Telemetry, TLM_RAIL, true)
            }
            Event::BatteryTelemetry(t) => {
                encode_battery_telemetry(t, &mut p);
                (MessageType::Telemetry, TLM_BATTERY, true)
            }
            Event::MpptTelemetry(t) => {
                encode_mppt_telemetry(t, &mut p);
                (MessageType::Telemetry, TLM_MPPT, true)
            }
            Event::PowerProfileChanged { previous, current } => {
                let _ = p.extend_from_slice(&[*previous as u8, *current as u8]);
                (MessageType::Telemetry, TLM_POWER_PROFILE, true)
            }
            _ => return None,
        };
        Some(self.reply(message_type, command_id, &p, last))
    }

    fn nack(&mut self, request: &Packet, reason: NackReason) -> Packet {
        self.stats.rejected = self.stats.rejected.wrapping_add(1);
        self.reply(MessageType::Nack, request.command_id, &[reason as u8], true)
    }

    fn reply(&mut self, message_type: MessageType, command_id: u8, payload: &[u8], is_last_chunk: bool) -> Packet {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.stats.replies = self.stats.replies.wrapping_add(1);
        Packet {
            version: PROTOCOL_VERSION,
            destination: ADDR_OBC,
            source: ADDR_EPS,
            message_type,
            command_id,
            sequence,
            is_last_chunk,
            payload: Payload::from_slice(payload).unwrap_or_default(),
        }
    }
}

fn encode_health(snapshot: &HealthSnapshot, p: &mut Payload) {
    let _ = p.push(snapshot.health as u8);
    let _ = p.push(snapshot.active_faults);
    let _ = p.extend_from_slice(&(snapshot.timestamp_ms as u32).to_le_bytes());
}

fn encode_component_status(status: &ComponentStatus, p: &mut Payload) {
    let _ = p.push(status.component as u8);
    let _ = p.push(u8::from(status.healthy));
    let _ = p.push(status.fault_source.map_or(NO_SOURCE, |s| s as u8));
}

fn encode_fault_chunk(chunk: &FaultListChunk, p: &mut Payload) {
    let _ = p.extend_from_slice(&[chunk.total_faults, chunk.chunk_index, chunk.faults_in_chunk]);
    for f in &chunk.faults {
        let _ = p.push(f.source as u8);
        let _ = p.push(f.severity as u8);
        let _ = p.extend_from_slice(&f.code.to_le_bytes());
        let count = u16::try_from(f.occurrence_count).unwrap_or(u16::MAX);
        let _ = p.extend_from_slice(&count.to_le_bytes());
        let _ = p.extend_from_slice(&(f.first_seen_ms as u32).to_le_bytes());
    }
}

fn encode_redundancy_telemetry(t: &RedundancyTelemetry, p: &mut Payload) {
    let _ = p.push(t.health as u8);
    let _ = p.push(t.active_faults);
    let _ = p.extend_from_slice(&t.lifetime_faults.to_le_bytes());
    let _ = p.push(t.degraded_components);
    let _ = p.extend_from_slice(&(t.timestamp_ms as u32).to_le_bytes());
}

fn encode_rail_telemetry(t: &RailTelemetry, p: &mut Payload) {
    let _ = p.extend_from_slice(&[t.rail, u8::from(t.enabled), t.status as u8]);
    let _ = p.extend_from_slice(&t.voltage_mv.to_le_bytes());
    let _ = p.extend_from_slice(&t.current_ma.to_le_bytes());
}

fn encode_battery_telemetry(t: &BatteryTelemetry, p: &mut Payload) {
    let _ = p.push(t.status as u8);
    let _ = p.extend_from_slice(&t.voltage_mv.to_le_bytes());
    let _ = p.extend_from_slice(&t.current_ma.to_le_bytes());
    let deci_c = (t.temperature_c * 10.0) as i16;
    let _ = p.extend_from_slice(&deci_c.to_le_bytes());
    let _ = p.push(u8::from(t.charging));
    let _ = p.push(u8::from(t.protection));
}

fn encode_mppt_telemetry(t: &MpptTelemetry, p: &mut Payload) {
    let _ = p.extend_from_slice(&[t.channel, t.status as u8]);
    let _ = p.extend_from_slice(&t.input_mv.to_le_bytes());
    let _ = p.extend_from_slice(&t.output_mv.to_le_bytes());
    let _ = p.extend_from_slice(&t.output_ma.to_le_bytes());
    let _ = p.extend_from_slice(&t.power_mw.to_le_bytes());
}

fn health_from_u8(raw: u8) -> Option<SystemHealth> {
    match raw {
        0 => Some(SystemHealth::Ok),
        1 => Some(SystemHealth::Degraded),
        2 => Some(SystemHealth::Fault),
        _ => None,
    }
}

fn severity_from_u8(raw: u8) -> Option<Severity> {
    match raw {
        0 => Some(Severity::Info),
        1 => Some(Severity::Warning),
        2 => Some(Severity::Degraded),
        3 => Some(Severity::Critical),
        _ => None,
    }
}

pub fn decode_health(payload: &[u8]) -> Option<HealthSnapshot> {
    let [health, active, t0, t1, t2, t3] = *payload else {
        return None;
    };
    Some(HealthSnapshot {
        health: health_from_u8(health)?,
        active_faults: active,
        timestamp_ms: u64::from(u32::from_le_bytes([t0, t1, t2, t3])),
    })
}

pub fn decode_component_status(payload: &[u8]) -> Option<ComponentStatus> {
    let [component, healthy, source] = *payload else {
        return None;
    };
    Some(ComponentStatus {
        component: Component::from_id(component)?,
        healthy: healthy != 0,
        fault_source: FaultSource::from_id(source),
    })
}

pub fn decode_fault_chunk(payload: &[u8]) -> Option<FaultListChunk> {
    let (&[total, index, count], records) = payload.split_first_chunk::<3>()?;
    if usize::from(count) > FAULTS_PER_CHUNK || records.len() != usize::from(count) * FAULT_RECORD_LEN {
        return None;
    }
    let mut faults = Vec::new();
    for r in records.chunks_exact(FAULT_RECORD_LEN) {
        let summary = FaultSummary {
            source: FaultSource::from_id(r[0])?,
            severity: severity_from_u8(r[1])?,
            code: u32::from_le_bytes([r[2], r[3], r[4], r[5]]),
            occurrence_count: u32::from(u16::from_le_bytes([r[6], r[7]])),
            first_seen_ms: u64::from(u32::from_le_bytes([r[8], r[9], r[10], r[11]])),
        };
        faults.push(summary).ok()?;
    }
    Some(FaultListChunk {
        total_faults: total,
        chunk_index: index,
        faults_in_chunk: count,
        faults,
    })
}

pub fn decode_redundancy_telemetry(payload: &[u8]) -> Option<RedundancyTelemetry> {
    let [health, active, l0, l1, l2, l3, bitmap, t0, t1, t2, t3] = *payload else {
        return None;
    };
    Some(RedundancyTelemetry {
        health: health_from_u8(health)?,
        active_faults: active,
        lifetime_faults: u32::from_le_bytes([l0, l1, l2, l3]),
        degraded_components: bitmap,
        timestamp_ms: u64::from(u32::from_le_bytes([t0, t1, t2, t3])),
    })
}
