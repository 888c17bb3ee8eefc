//! Serial transport seam.
//!
//! The interrupt side of a UART only ever touches an [`RxLine`]: received
//! bytes go into its ring, line faults latch into an atomic flag. The main
//! loop drains it through [`Transport::read`], which follows the `nb`
//! convention of `WouldBlock` when idle.

use crate::ring::ByteRing;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const RX_RING_SIZE: usize = 512;

/// Line-level receive faults reported by the UART peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LineError {
    Overrun = 1,
    Noise = 2,
    Framing = 3,
    Parity = 4,
    Unknown = 5,
}

impl LineError {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => None,
            1 => Some(Self::Overrun),
            2 => Some(Self::Noise),
            3 => Some(Self::Framing),
            4 => Some(Self::Parity),
            _ => Some(Self::Unknown),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport not initialized")]
    NotReady,
    #[error("transmit failed")]
    WriteFailed,
}

/// Hardware transport consumed by a serial link.
pub trait Transport {
    /// Queues `bytes` for transmission.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Next received byte. A latched line error is reported once, ahead of
    /// any further data.
    fn read(&mut self) -> nb::Result<u8, LineError>;

    fn is_ready(&self) -> bool;

    /// Re-enables reception after a line error.
    fn rearm(&mut self) {}
}

/// Receive path shared between interrupt and main-loop context.
pub struct RxLine<const N: usize = RX_RING_SIZE> {
    ring: ByteRing<N>,
    pending_error: AtomicU8,
}

impl<const N: usize> RxLine<N> {
    pub const fn new() -> Self {
        Self {
            ring: ByteRing::new(true),
            pending_error: AtomicU8::new(0),
        }
    }

    /// Receive interrupt. Same contract as [`ByteRing::push`].
    pub fn on_byte(&self, byte: u8) {
        self.ring.push(byte);
    }

    pub fn on_bytes(&self, bytes: &[u8]) {
        for &b in bytes {
            self.ring.push(b);
        }
    }

    /// Error interrupt. Latches the most recent line error.
    pub fn on_line_error(&self, error: LineError) {
        self.pending_error.store(error as u8, Ordering::Release);
    }

    pub fn take_error(&self) -> Option<LineError> {
        LineError::from_raw(self.pending_error.swap(0, Ordering::AcqRel))
    }

    pub fn pop(&self) -> Option<u8> {
        self.ring.pop()
    }

    pub fn ring(&self) -> &ByteRing<N> {
        &self.ring
    }
}

impl<const N: usize> Default for RxLine<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory serial port used by the host node and the tests.
///
/// The [`RxLine`] handle plays the role of the interrupt handler; the
/// transmit side is captured for inspection or forwarding.
#[derive(Clone)]
pub struct MemoryPort {
    rx: Arc<RxLine>,
    tx: Arc<Mutex<std::vec::Vec<u8>>>,
    ready: Arc<AtomicBool>,
    rearm_count: u32,
}

impl MemoryPort {
    pub fn new() -> Self {
        Self {
            rx: Arc::new(RxLine::new()),
            tx: Arc::new(Mutex::new(std::vec::Vec::new())),
            ready: Arc::new(AtomicBool::new(true)),
            rearm_count: 0,
        }
    }

    /// Handle for feeding received bytes and line errors.
    pub fn rx_line(&self) -> Arc<RxLine> {
        Arc::clone(&self.rx)
    }

    /// Takes everything written so far.
    pub fn take_tx(&self) -> std::vec::Vec<u8> {
        match self.tx.lock() {
            Ok(mut tx) => core::mem::take(&mut *tx),
            Err(poisoned) => core::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn rearm_count(&self) -> u32 {
        self.rearm_count
    }
}

impl Default for MemoryPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryPort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        let mut tx = self.tx.lock().map_err(|_| TransportError::WriteFailed)?;
        tx.extend_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self) -> nb::Result<u8, LineError> {
        if let Some(error) = self.rx.take_error() {
            return Err(nb::Error::Other(error));
        }
        self.rx.pop().ok_or(nb::Error::WouldBlock)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn rearm(&mut self) {
        self.rearm_count = self.rearm_count.wrapping_add(1);
    }
}
