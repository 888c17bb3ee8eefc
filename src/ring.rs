//! Interrupt-safe byte ring.
//!
//! [`ByteRing`] decouples the interrupt context (producer) from the
//! cooperative main loop (consumer). Both roles operate on shared
//! references; exclusivity of roles is expressed by [`ByteRing::split`],
//! which hands out exactly one [`Producer`] and one [`Consumer`].
//!
//! Overflow policy is fixed at construction. The receive path uses
//! overwrite-oldest: the producer evicts the oldest unread byte by racing
//! the consumer on the head index with a compare-exchange, so a full ring
//! never blocks the producer and never loses the newest byte.

use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

/// Bounded single-producer/single-consumer byte queue.
pub struct ByteRing<const N: usize> {
    slots: [AtomicU8; N],
    // Free-running indices; occupancy is `tail - head` (wrapping).
    head: AtomicUsize,
    tail: AtomicUsize,
    overwrite_on_full: bool,
    overwritten: AtomicU32,
    rejected: AtomicU32,
}

impl<const N: usize> ByteRing<N> {
    const CAPACITY_OK: () = assert!(N > 0, "ring capacity must be non-zero");

    pub const fn new(overwrite_on_full: bool) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;
        Self {
            slots: [const { AtomicU8::new(0) }; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overwrite_on_full,
            overwritten: AtomicU32::new(0),
            rejected: AtomicU32::new(0),
        }
    }

    /// Appends one byte. Producer role only.
    ///
    /// # Contract
    ///
    /// Callable from interrupt context: never blocks, never allocates,
    /// completes in bounded time. Returns `false` only when the ring is
    /// full and was built with `overwrite_on_full == false`.
    pub fn push(&self, byte: u8) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= N {
            if !self.overwrite_on_full {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            // A failed exchange means the consumer just freed a slot.
            if self
                .head
                .compare_exchange(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.overwritten.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.slots[tail % N].store(byte, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Removes the oldest byte. Consumer role only.
    pub fn pop(&self) -> Option<u8> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let byte = self.slots[head % N].load(Ordering::Relaxed);
            // Losing the exchange means the producer evicted this byte.
            if self
                .head
                .compare_exchange(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(byte);
            }
        }
    }

    /// Discards everything currently queued. Consumer role only.
    pub fn clear(&self) {
        let tail = self.tail.load(Ordering::Acquire);
        self.head.store(tail, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(N)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn overwrite_on_full(&self) -> bool {
        self.overwrite_on_full
    }

    /// Bytes evicted by overwrite-oldest since construction.
    pub fn overwritten(&self) -> u32 {
        self.overwritten.load(Ordering::Relaxed)
    }

    /// Bytes refused because the ring was full.
    pub fn rejected(&self) -> u32 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Splits the ring into its two roles.
    pub fn split(&mut self) -> (Producer<'_, N>, Consumer<'_, N>) {
        let ring: &Self = self;
        (Producer { ring }, Consumer { ring })
    }
}

impl<const N: usize> Default for ByteRing<N> {
    fn default() -> Self {
        Self::new(true)
    }
}

impl<const N: usize> core::fmt::Debug for ByteRing<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ByteRing")
            .field("capacity", &N)
            .field("len", &self.len())
            .field("overwrite_on_full", &self.overwrite_on_full)
            .field("overwritten", &self.overwritten())
            .field("rejected", &self.rejected())
            .finish()
    }
}

/// Write half of a [`ByteRing`]; safe to hand to an interrupt handler.
pub struct Producer<'a, const N: usize> {
    ring: &'a ByteRing<N>,
}

impl<const N: usize> Producer<'_, N> {
    /// See [`ByteRing::push`] for the interrupt-context contract.
    pub fn push(&self, byte: u8) -> bool {
        self.ring.push(byte)
    }
}

/// Read half of a [`ByteRing`]; owned by the main loop.
pub struct Consumer<'a, const N: usize> {
    ring: &'a ByteRing<N>,
}

impl<const N: usize> Consumer<'_, N> {
    pub fn pop(&self) -> Option<u8> {
        self.ring.pop()
    }

    pub fn clear(&self) {
        self.ring.clear();
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
