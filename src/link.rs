//! Packet reassembly and per-channel serial links.
//!
//! [`ReassemblyContext`] rebuilds frames from an arbitrary byte stream one
//! byte at a time, so the result never depends on how the stream was
//! chunked. [`SerialLink`] drains its transport once per tick, feeds the
//! reassembler and publishes what comes out.
//!
//! There is no idle timeout: a frame that stalls mid-payload holds the
//! context in [`RxState::ReadPayload`] until more bytes complete it.
//!
//! A poll publishes at most [`POLL_EVENT_BUDGET`] events and never more
//! than the queue has room for. Bytes left over stay in the receive ring
//! for the next tick, so a burst is delayed rather than lost.

use crate::bus::{Event, EventQueue, EVENT_QUEUE_SIZE};
use crate::packet::{Packet, PacketError, FRAME_OVERHEAD, HEADER_LEN, MAX_FRAME_LEN, PAYLOAD_LEN_OFFSET, START_BYTE};
use crate::transport::{LineError, Transport, RX_RING_SIZE};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Sized for the largest legal frame, so every announced length fits.
pub const RX_BUFFER_SIZE: usize = MAX_FRAME_LEN;
pub const RX_POOL_SIZE: usize = 2;
/// Events one [`SerialLink::poll`] may publish.
pub const POLL_EVENT_BUDGET: usize = 8;

// A decoded buffer must not be the next one written.
const_assert!(RX_POOL_SIZE >= 2);
const_assert!(RX_BUFFER_SIZE >= MAX_FRAME_LEN);
const_assert!(POLL_EVENT_BUDGET < EVENT_QUEUE_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelId {
    Primary = 0,
    Secondary = 1,
}

impl ChannelId {
    pub fn other(self) -> Self {
        match self {
            ChannelId::Primary => ChannelId::Secondary,
            ChannelId::Secondary => ChannelId::Primary,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("frame rejected: {0}")]
    Decode(#[from] PacketError),
    #[error("line error: {0:?}")]
    Line(LineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    WaitStart,
    ReadHeader,
    ReadPayload,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub bytes_seen: u32,
    pub packets_decoded: u32,
    pub decode_failures: u32,
    pub guard_resets: u32,
    pub line_errors: u32,
    pub packets_sent: u32,
    pub send_dropped: u32,
}

/// Byte-at-a-time frame reassembler with a rotating buffer pool.
#[derive(Debug)]
pub struct ReassemblyContext {
    state: RxState,
    pool: [[u8; RX_BUFFER_SIZE]; RX_POOL_SIZE],
    active: usize,
    cursor: usize,
    expected_len: usize,
    last_decoded: Option<(usize, usize)>,
    stats: LinkStats,
}

impl ReassemblyContext {
    pub fn new() -> Self {
        Self {
            state: RxState::WaitStart,
            pool: [[0; RX_BUFFER_SIZE]; RX_POOL_SIZE],
            active: 0,
            cursor: 0,
            expected_len: 0,
            last_decoded: None,
            stats: LinkStats::default(),
        }
    }

    /// Advances the state machine by one byte. Returns `Some` when a frame
    /// completed, whether or not it decoded.
    pub fn push_byte(&mut self, byte: u8) -> Option<Result<Packet, LinkError>> {
        self.stats.bytes_seen = self.stats.bytes_seen.wrapping_add(1);

        match self.state {
            RxState::WaitStart => {
                if byte == START_BYTE {
                    self.pool[self.active][0] = byte;
                    self.cursor = 1;
                    self.state = RxState::ReadHeader;
                }
                None
            }
            RxState::ReadHeader => {
                if self.cursor >= RX_BUFFER_SIZE {
                    self.guard_reset();
                    return None;
                }
                self.pool[self.active][self.cursor] = byte;
                self.cursor += 1;

                if self.cursor == 1 + HEADER_LEN {
                    let payload_len = usize::from(self.pool[self.active][PAYLOAD_LEN_OFFSET]);
                    self.expected_len = FRAME_OVERHEAD + payload_len;
                    self.state = RxState::ReadPayload;
                }
                None
            }
            RxState::ReadPayload => {
                if self.cursor >= RX_BUFFER_SIZE {
                    self.guard_reset();
                    return None;
                }
                self.pool[self.active][self.cursor] = byte;
                self.cursor += 1;

                if self.cursor == self.expected_len {
                    Some(self.complete_frame())
                } else {
                    None
                }
            }
        }
    }

    fn complete_frame(&mut self) -> Result<Packet, LinkError> {
        let len = self.cursor;
        let result = Packet::unpack(&self.pool[self.active][..len]);
        match &result {
            Ok(_) => {
                self.stats.packets_decoded = self.stats.packets_decoded.wrapping_add(1);
                self.last_decoded = Some((self.active, len));
                self.active = (self.active + 1) % RX_POOL_SIZE;
            }
            Err(err) => {
                self.stats.decode_failures = self.stats.decode_failures.wrapping_add(1);
                debug!(%err, len, "dropping malformed frame");
            }
        }
        self.reset();
        result.map_err(LinkError::Decode)
    }

    fn guard_reset(&mut self) {
        warn!(cursor = self.cursor, expected = self.expected_len, "receive buffer guard tripped, resynchronising");
        self.stats.guard_resets = self.stats.guard_resets.wrapping_add(1);
        self.reset();
    }

    /// Abandons any partial frame and waits for the next start byte.
    pub fn reset(&mut self) {
        self.state = RxState::WaitStart;
        self.cursor = 0;
        self.expected_len = 0;
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Pool buffer currently being written.
    pub fn active_buffer(&self) -> usize {
        self.active
    }

    /// Raw bytes of the most recently decoded frame; stays intact while the
    /// next frame is assembled in the other pool buffer.
    pub fn last_frame(&self) -> Option<&[u8]> {
        self.last_decoded.map(|(buffer, len)| &self.pool[buffer][..len])
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut LinkStats {
        &mut self.stats
    }
}

impl Default for ReassemblyContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One physical serial channel: transport plus receive reassembly.
pub struct SerialLink<T: Transport> {
    channel: ChannelId,
    port: T,
    rx: ReassemblyContext,
    initialized: bool,
}

impl<T: Transport> SerialLink<T> {
    pub fn new(channel: ChannelId, port: T) -> Self {
        Self {
            channel,
            port,
            rx: ReassemblyContext::new(),
            initialized: true,
        }
    }

    /// Drains what the transport has buffered (at most one ring's worth) and
    /// publishes decoded packets and errors. Stops early once
    /// [`POLL_EVENT_BUDGET`] events are out or `out` is full; the rest waits
    /// in the ring. Returns the bytes consumed.
    pub fn poll(&mut self, out: &mut EventQueue) -> usize {
        let mut consumed = 0;
        let mut published = 0;
        for _ in 0..=RX_RING_SIZE {
            if published >= POLL_EVENT_BUDGET || out.is_full() {
                debug!(channel = ?self.channel, published, "poll budget spent, deferring rest");
                break;
            }
            match self.port.read() {
                Ok(byte) => {
                    consumed += 1;
                    match self.rx.push_byte(byte) {
                        Some(Ok(packet)) => {
                            trace!(channel = ?self.channel, seq = packet.sequence, "packet received");
                            out.publish(Event::PacketReceived {
                                channel: self.channel,
                                packet,
                            });
                            published += 1;
                        }
                        Some(Err(error)) => {
                            out.publish(Event::TransportError {
                                channel: self.channel,
                                error,
                            });
                            published += 1;
                        }
                        None => {}
                    }
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(line)) => {
                    self.on_line_error(line, out);
                    published += 1;
                }
            }
        }
        consumed
    }

    fn on_line_error(&mut self, error: LineError, out: &mut EventQueue) {
        warn!(channel = ?self.channel, ?error, "line error, re-arming receiver");
        let stats = self.rx.stats_mut();
        stats.line_errors = stats.line_errors.wrapping_add(1);
        self.rx.reset();
        self.port.rearm();
        out.publish(Event::TransportError {
            channel: self.channel,
            error: LinkError::Line(error),
        });
    }

    /// Packs and writes `packet`. A link that is not ready drops the send
    /// and returns `false`.
    pub fn send_packet(&mut self, packet: &Packet) -> bool {
        if !self.is_ready() {
            self.count_dropped_send();
            return false;
        }
        let mut frame = [0u8; MAX_FRAME_LEN];
        let written = match packet.pack(&mut frame) {
            Ok(len) => len,
            Err(err) => {
                warn!(channel = ?self.channel, %err, "refusing to send unencodable packet");
                self.count_dropped_send();
                return false;
            }
        };
        match self.port.write(&frame[..written]) {
            Ok(()) => {
                let stats = self.rx.stats_mut();
                stats.packets_sent = stats.packets_sent.wrapping_add(1);
                true
            }
            Err(err) => {
                warn!(channel = ?self.channel, %err, "transmit failed");
                self.count_dropped_send();
                false
            }
        }
    }

    fn count_dropped_send(&mut self) {
        let stats = self.rx.stats_mut();
        stats.send_dropped = stats.send_dropped.wrapping_add(1);
    }

    pub fn is_ready(&self) -> bool {
        self.initialized && self.port.is_ready()
    }

    pub fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn reassembly(&self) -> &ReassemblyContext {
        &self.rx
    }

    pub fn stats(&self) -> &LinkStats {
        self.rx.stats()
    }

    pub fn port(&self) -> &T {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut T {
        &mut self.port
    }
}
