//! Flight log: structured entries buffered on board and downlinked to the
//! OBC in batched `Log` packets.
//!
//! This is mission data, separate from the `tracing` diagnostics the crate
//! emits for the host. Entries are recorded from bus events and flushed on
//! a tick cadence or on request, through whichever link the failover policy
//! has selected. Nothing is dropped from the buffer until it was handed to
//! a ready link.
//!
//! Entry wire format inside a log payload:
//! `timestamp_ms: u32 LE | level: u8 | component: u8 | len: u8 | message`.

use crate::bus::Event;
use crate::failover::FailoverPolicy;
use crate::link::{LinkError, SerialLink};
use crate::packet::{MessageType, Packet, Payload, ADDR_EPS, ADDR_OBC, PROTOCOL_VERSION};
use crate::transport::Transport;
use arrayvec::ArrayString;
use core::fmt::Write;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub const LOG_CAPACITY: usize = 64;
pub const LOG_MESSAGE_LEN: usize = 48;
pub const LOG_PACKET_MAX_PAYLOAD: usize = 200;
pub const DEFAULT_FLUSH_INTERVAL_TICKS: u32 = 600;
const ENTRY_HEADER_LEN: usize = 7;

/// Command id carried by log packets.
pub const LOG_COMMAND_ID: u8 = 0x00;

// Component tags used in flight log entries.
pub const COMPONENT_MAIN: u8 = 0x10;
pub const COMPONENT_RAIL: u8 = 0x11;
pub const COMPONENT_MPPT: u8 = 0x12;
pub const COMPONENT_POWER: u8 = 0x13;
pub const COMPONENT_CMD: u8 = 0x14;
pub const COMPONENT_COMMS: u8 = 0x15;
pub const COMPONENT_PROFILE: u8 = 0x17;
pub const COMPONENT_REDUNDANCY: u8 = 0x18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Fatal = 4,
}

impl LogLevel {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Debug),
            1 => Some(Self::Info),
            2 => Some(Self::Warn),
            3 => Some(Self::Error),
            4 => Some(Self::Fatal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp_ms: u32,
    pub level: LogLevel,
    pub component: u8,
    pub message: ArrayString<LOG_MESSAGE_LEN>,
}

impl LogEntry {
    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_LEN + self.message.len()
    }

    fn encode_into(&self, payload: &mut Payload) -> bool {
        let ts = self.timestamp_ms.to_le_bytes();
        payload.extend_from_slice(&ts).is_ok()
            && payload.push(self.level as u8).is_ok()
            && payload.push(self.component).is_ok()
            && payload.push(self.message.len() as u8).is_ok()
            && payload.extend_from_slice(self.message.as_bytes()).is_ok()
    }

    /// Decodes every entry in a log packet payload. Trailing garbage ends
    /// the walk.
    pub fn decode_all(payload: &[u8]) -> std::vec::Vec<LogEntry> {
        let mut entries = std::vec::Vec::new();
        let mut rest = payload;
        while rest.len() >= ENTRY_HEADER_LEN {
            let len = usize::from(rest[6]);
            let Some(text) = rest.get(ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + len) else {
                break;
            };
            let (Some(level), Ok(text)) = (LogLevel::from_u8(rest[4]), core::str::from_utf8(text)) else {
                break;
            };
            let Ok(message) = ArrayString::from(text) else {
                break;
            };
            entries.push(LogEntry {
                timestamp_ms: u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]),
                level,
                component: rest[5],
                message,
            });
            rest = &rest[ENTRY_HEADER_LEN + len..];
        }
        entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub min_level: LogLevel,
    pub flush_interval_ticks: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            flush_interval_ticks: DEFAULT_FLUSH_INTERVAL_TICKS,
        }
    }
}

#[derive(Debug)]
pub struct FlightLog {
    entries: Deque<LogEntry, LOG_CAPACITY>,
    min_level: LogLevel,
    flush_interval_ticks: u32,
    ticks: u32,
    now_ms: u64,
    sequence: u16,
    overwritten: u32,
}

impl FlightLog {
    pub fn new(config: LogConfig) -> Self {
        Self {
            entries: Deque::new(),
            min_level: config.min_level,
            flush_interval_ticks: config.flush_interval_ticks,
            ticks: 0,
            now_ms: 0,
            sequence: 0,
            overwritten: 0,
        }
    }

    /// Records an entry if it passes the level filter. A full buffer drops
    /// its oldest entry. Over-long messages are truncated.
    pub fn record(&mut self, level: LogLevel, component: u8, args: core::fmt::Arguments<'_>) -> bool {
        if level < self.min_level {
            return false;
        }
        let mut message = ArrayString::<LOG_MESSAGE_LEN>::new();
        let mut sink = Truncating(&mut message);
        let _ = sink.write_fmt(args);

        if self.entries.is_full() {
            self.entries.pop_front();
            self.overwritten = self.overwritten.wrapping_add(1);
        }
        let entry = LogEntry {
            timestamp_ms: self.now_ms as u32,
            level,
            component,
            message,
        };
        trace!(?level, component, message = entry.message.as_str(), "flight log");
        self.entries.push_back(entry).is_ok()
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    pub fn level(&self) -> LogLevel {
        self.min_level
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    pub fn overwritten(&self) -> u32 {
        self.overwritten
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Advances the flush cadence; returns `true` when a flush is due.
    pub fn on_tick(&mut self, now_ms: u64) -> bool {
        self.now_ms = now_ms;
        self.ticks = self.ticks.wrapping_add(1);
        self.flush_interval_ticks != 0 && self.ticks % self.flush_interval_ticks == 0
    }

    /// Packs buffered entries into log packets and sends them on the active
    /// link. Entries leave the buffer only once their packet was sent.
    /// Returns the number of entries flushed.
    pub fn flush<T: Transport>(&mut self, failover: &FailoverPolicy, links: &mut [SerialLink<T>; 2]) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        if !failover.is_route_ready(links) {
            debug!(pending = self.entries.len(), channel = ?failover.active(), "log flush deferred, link not ready");
            return 0;
        }

        let mut flushed = 0;
        while !self.entries.is_empty() {
            let (payload, count) = self.next_batch();
            if count == 0 {
                // An entry that cannot be encoded would block the queue.
                self.entries.pop_front();
                continue;
            }
            let packet = Packet {
                version: PROTOCOL_VERSION,
                destination: ADDR_OBC,
                source: ADDR_EPS,
                message_type: MessageType::Log,
                command_id: LOG_COMMAND_ID,
                sequence: self.sequence,
                is_last_chunk: count == self.entries.len(),
                payload,
            };
            if !failover.send(links, &packet) {
                break;
            }
            self.sequence = self.sequence.wrapping_add(1);
            for _ in 0..count {
                self.entries.pop_front();
            }
            flushed += count;
        }
        debug!(flushed, pending = self.entries.len(), "flight log flushed");
        flushed
    }

    fn next_batch(&self) -> (Payload, usize) {
        let mut payload = Payload::new();
        let mut count = 0;
        for entry in self.entries.iter() {
            if payload.len() + entry.encoded_len() > LOG_PACKET_MAX_PAYLOAD {
                break;
            }
            if !entry.encode_into(&mut payload) {
                break;
            }
            count += 1;
        }
        (payload, count)
    }

    /// Turns notable bus events into flight log entries.
    pub fn on_event(&mut self, event: &Event) {
        match event {
            Event::HealthChanged { previous, current } if previous != current => {
                self.record(LogLevel::Warn, COMPONENT_REDUNDANCY, format_args!("health {previous:?} -> {current:?}"));
            }
            Event::ComponentDegraded(d) => {
                self.record(
                    LogLevel::Error,
                    COMPONENT_REDUNDANCY,
                    format_args!("{:?} degraded by {:?} fb={}", d.component, d.source, d.fallback_available),
                );
            }
            Event::ComponentRecovered { component } => {
                self.record(LogLevel::Info, COMPONENT_REDUNDANCY, format_args!("{component:?} recovered"));
            }
            Event::FaultTableFull { source, code } => {
                self.record(LogLevel::Error, COMPONENT_REDUNDANCY, format_args!("fault table full {source:?}/{code:#x}"));
            }
            Event::FaultClearResponse { source_id, code, cleared } => {
                self.record(
                    LogLevel::Info,
                    COMPONENT_CMD,
                    format_args!("clear {source_id}/{code:#x} ok={cleared}"),
                );
            }
            Event::ClearAllResponse { cleared } => {
                self.record(LogLevel::Warn, COMPONENT_CMD, format_args!("operator cleared {cleared} faults"));
            }
            Event::TransportError { channel, error } => {
                let level = match error {
                    LinkError::Line(_) => LogLevel::Warn,
                    LinkError::Decode(_) => LogLevel::Debug,
                };
                self.record(level, COMPONENT_COMMS, format_args!("{channel:?}: {error}"));
            }
            Event::RailFault { rail, status } => {
                self.record(LogLevel::Error, COMPONENT_RAIL, format_args!("rail {rail} {status:?}, disabled"));
            }
            Event::RailResponse {
                rail,
                enable,
                enabled,
                accepted,
            } => {
                self.record(
                    LogLevel::Info,
                    COMPONENT_RAIL,
                    format_args!("rail {rail} enable={enable} now={enabled} accepted={accepted}"),
                );
            }
            Event::BatteryAlert { status, voltage_mv } => {
                self.record(LogLevel::Warn, COMPONENT_POWER, format_args!("battery {status:?} at {voltage_mv} mV"));
            }
            Event::BatteryFullyCharged { voltage_mv } => {
                self.record(LogLevel::Info, COMPONENT_POWER, format_args!("battery full at {voltage_mv} mV"));
            }
            Event::MpptFault { channel, status } => {
                self.record(LogLevel::Warn, COMPONENT_MPPT, format_args!("mppt {channel} {status:?}"));
            }
            Event::MpptResponse {
                channel,
                enable,
                enabled,
                accepted,
            } => {
                self.record(
                    LogLevel::Info,
                    COMPONENT_MPPT,
                    format_args!("mppt {channel} enable={enable} now={enabled} accepted={accepted}"),
                );
            }
            Event::PowerProfileChanged { previous, current } => {
                self.record(LogLevel::Warn, COMPONENT_PROFILE, format_args!("profile {previous:?} -> {current:?}"));
            }
            _ => {}
        }
    }
}

impl Default for FlightLog {
    fn default() -> Self {
        Self::new(LogConfig::default())
    }
}

/// Writer that keeps whatever fits and silently drops the rest.
struct Truncating<'a, const N: usize>(&'a mut ArrayString<N>);

impl<const N: usize> Write for Truncating<'_, N> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for c in s.chars() {
            if self.0.try_push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}
