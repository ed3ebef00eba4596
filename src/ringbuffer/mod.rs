// src/ringbuffer/mod.rs
//! Cache-line ring buffer transport.
//!
//! A single page is laid out as `RING_CAPACITY` cells of one cache line
//! (64 bytes) each, followed by a trailing metadata cell holding the head,
//! tail and count bytes plus a spin lock word. The page lives in a frame
//! shared between two cores; after every insert and consume the touched
//! cells are written back to main memory so the peer observes the update.
//!
//! Framing on top of the raw cells: the first cell of a message carries an
//! 8-byte size prefix followed by up to 56 payload bytes, every subsequent
//! cell carries 64 payload bytes. A partially transmitted message blocks
//! the channel until completed.
//!
//! The lock serializes producer and consumer within one dispatcher; the
//! single-producer/single-consumer design is intended to be upgraded to a
//! lockless scheme later.

use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::arch::dcache_wb_range;
use crate::constants::{BASE_PAGE_SIZE, CACHE_LINE_SIZE};
use crate::errors::RingError;

/// Number of payload cells per page.
pub const RING_CAPACITY: usize = (BASE_PAGE_SIZE - 3) / CACHE_LINE_SIZE;

/// Byte offset of the trailing metadata cell.
const META_OFFSET: usize = RING_CAPACITY * CACHE_LINE_SIZE;

const META_HEAD: usize = META_OFFSET;
const META_TAIL: usize = META_OFFSET + 1;
const META_COUNT: usize = META_OFFSET + 2;
const META_LOCK: usize = META_OFFSET + 3;

const SIZE_PREFIX: usize = core::mem::size_of::<u64>();
const FIRST_CELL_PAYLOAD: usize = CACHE_LINE_SIZE - SIZE_PREFIX;

/// Largest message a single ring can carry without wrapping onto itself.
pub const RING_MAX_MSG: usize = RING_CAPACITY * CACHE_LINE_SIZE - SIZE_PREFIX;

const _: () = assert!(RING_CAPACITY == 63);
const _: () = assert!(META_LOCK < BASE_PAGE_SIZE);

#[inline]
const fn index(x: u8) -> usize {
    x as usize % RING_CAPACITY
}

/// View over one page-sized shared ring.
pub struct RingBuffer {
    base: NonNull<u8>,
}

// SAFETY: the ring itself is raw shared memory; the embedded lock plus the
// SPSC discipline make concurrent producer/consumer use sound.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Initialize a fresh ring over `buf` and return a view.
    ///
    /// # Safety
    ///
    /// `buf` must point to at least one page of writable memory that stays
    /// alive for the lifetime of every view attached to it.
    pub unsafe fn init(buf: NonNull<u8>) -> Result<Self, RingError> {
        // SAFETY: per the function contract
        let rb = unsafe { Self::attach(buf) }?;
        rb.write_meta(META_HEAD, 0);
        rb.write_meta(META_TAIL, 0);
        rb.write_meta(META_COUNT, 0);
        rb.lock_word().store(0, Ordering::Release);
        dcache_wb_range(buf.as_ptr() as usize + META_OFFSET, CACHE_LINE_SIZE);
        Ok(rb)
    }

    /// Attach to a ring some other party already initialized.
    ///
    /// # Safety
    ///
    /// Same as [`RingBuffer::init`], and the peer must have run `init`.
    pub unsafe fn attach(buf: NonNull<u8>) -> Result<Self, RingError> {
        if buf.as_ptr() as usize % BASE_PAGE_SIZE != 0 {
            return Err(RingError::Unaligned);
        }
        Ok(Self { base: buf })
    }

    fn read_meta(&self, off: usize) -> u8 {
        // SAFETY: off < BASE_PAGE_SIZE, buffer is at least one page
        unsafe { self.base.as_ptr().add(off).read_volatile() }
    }

    fn write_meta(&self, off: usize, val: u8) {
        // SAFETY: off < BASE_PAGE_SIZE, buffer is at least one page
        unsafe { self.base.as_ptr().add(off).write_volatile(val) };
    }

    fn lock_word(&self) -> &AtomicU8 {
        // SAFETY: META_LOCK is in bounds and AtomicU8 has alignment 1
        unsafe { &*(self.base.as_ptr().add(META_LOCK) as *const AtomicU8) }
    }

    fn lock(&self) {
        let word = self.lock_word();
        while word
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.lock_word().store(0, Ordering::Release);
    }

    /// Number of cells currently queued.
    pub fn len(&self) -> usize {
        self.read_meta(META_COUNT) as usize
    }

    /// Whether no cell is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert exactly one cache line.
    pub fn insert(&self, cell: &[u8; CACHE_LINE_SIZE]) -> Result<(), RingError> {
        self.lock();
        let count = self.read_meta(META_COUNT);
        if count as usize == RING_CAPACITY {
            self.unlock();
            return Err(RingError::Full);
        }
        let tail = self.read_meta(META_TAIL);
        let dst_off = index(tail) * CACHE_LINE_SIZE;
        // SAFETY: dst_off + 64 <= META_OFFSET, cell is exactly 64 bytes
        unsafe {
            core::ptr::copy_nonoverlapping(
                cell.as_ptr(),
                self.base.as_ptr().add(dst_off),
                CACHE_LINE_SIZE,
            );
        }
        self.write_meta(META_TAIL, index(tail + 1) as u8);
        self.write_meta(META_COUNT, count + 1);

        // Push the data and the metadata out to main memory for the peer.
        let base = self.base.as_ptr() as usize;
        dcache_wb_range(base + dst_off, CACHE_LINE_SIZE);
        dcache_wb_range(base + META_OFFSET, CACHE_LINE_SIZE);

        self.unlock();
        Ok(())
    }

    /// Consume exactly one cache line into `out`.
    pub fn consume(&self, out: &mut [u8; CACHE_LINE_SIZE]) -> Result<(), RingError> {
        self.lock();
        let count = self.read_meta(META_COUNT);
        if count == 0 {
            self.unlock();
            return Err(RingError::Empty);
        }
        let head = self.read_meta(META_HEAD);
        let src_off = index(head) * CACHE_LINE_SIZE;
        // SAFETY: src_off + 64 <= META_OFFSET
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(src_off),
                out.as_mut_ptr(),
                CACHE_LINE_SIZE,
            );
        }
        self.write_meta(META_HEAD, index(head + 1) as u8);
        self.write_meta(META_COUNT, count - 1);

        dcache_wb_range(self.base.as_ptr() as usize + META_OFFSET, CACHE_LINE_SIZE);

        self.unlock();
        Ok(())
    }
}

/// Sending half of a framed channel.
pub struct RingProducer {
    ring: RingBuffer,
}

impl RingProducer {
    /// Wrap an attached ring.
    pub fn new(ring: RingBuffer) -> Self {
        Self { ring }
    }

    /// Transmit a framed message, spinning while the ring is full.
    pub fn transmit(&self, payload: &[u8]) -> Result<(), RingError> {
        let size = payload.len();
        let mut tmp = [0u8; CACHE_LINE_SIZE];
        let mut offset = 0usize;
        let mut start = SIZE_PREFIX;

        loop {
            tmp.fill(0);
            if start == SIZE_PREFIX {
                tmp[..SIZE_PREFIX].copy_from_slice(&(size as u64).to_le_bytes());
            }
            let cap = CACHE_LINE_SIZE - start;
            let n = cap.min(size - offset);
            tmp[start..start + n].copy_from_slice(&payload[offset..offset + n]);

            loop {
                match self.ring.insert(&tmp) {
                    Ok(()) => break,
                    Err(RingError::Full) => core::hint::spin_loop(),
                    Err(e) => return Err(e),
                }
            }

            offset += cap;
            start = 0;
            if offset >= size {
                break;
            }
        }
        Ok(())
    }
}

/// Receiving half of a framed channel.
pub struct RingConsumer {
    ring: RingBuffer,
}

impl RingConsumer {
    /// Wrap an attached ring.
    pub fn new(ring: RingBuffer) -> Self {
        Self { ring }
    }

    /// Whether a message cell is pending.
    pub fn has_data(&self) -> bool {
        !self.ring.is_empty()
    }

    fn consume_blocking(&self, tmp: &mut [u8; CACHE_LINE_SIZE]) -> Result<(), RingError> {
        loop {
            match self.ring.consume(tmp) {
                Ok(()) => return Ok(()),
                Err(RingError::Empty) => core::hint::spin_loop(),
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive one framed message, spinning while the ring is empty.
    pub fn recv(&self) -> Result<Vec<u8>, RingError> {
        let mut tmp = [0u8; CACHE_LINE_SIZE];
        self.consume_blocking(&mut tmp)?;

        let size = u64::from_le_bytes(tmp[..SIZE_PREFIX].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; size];

        let first = FIRST_CELL_PAYLOAD.min(size);
        payload[..first].copy_from_slice(&tmp[SIZE_PREFIX..SIZE_PREFIX + first]);

        let mut offset = FIRST_CELL_PAYLOAD;
        while offset < size {
            self.consume_blocking(&mut tmp)?;
            let n = CACHE_LINE_SIZE.min(size - offset);
            payload[offset..offset + n].copy_from_slice(&tmp[..n]);
            offset += CACHE_LINE_SIZE;
        }
        Ok(payload)
    }
}
