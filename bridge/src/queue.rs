//! # Bounded ISR-to-Task Byte Queue
//!
//! A lock-free, statically-sized SPSC ring buffer connecting interrupt-context
//! byte arrival to a task-context consumer.
//!
//! ## Producer Policies
//!
//! The same queue supports two producer entry points, because one producer
//! (a USB rx interrupt) must never block while another (a TCP receive loop)
//! intentionally blocks as its backpressure mechanism:
//!
//! 1. [`ByteQueue::push`] — interrupt policy: accepts what fits, drops the
//!    remainder. Loss shows up in the return count and a dropped-byte log
//!    line; the full-flag transition is logged separately.
//! 2. [`ByteQueue::push_blocking`] — task policy (`std`): waits for space.
//!
//! ## Full-Flag Hysteresis
//!
//! The `full` flag latches when free space reaches zero and clears only once
//! free space has recovered to at least the hysteresis threshold `H` (one
//! maximum protocol packet). It does not flicker while free space sits in
//! `(0, H)`, so the producer side gets a stable "stop delivering" signal.
//!
//! ## Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ByteQueue<C>                         │
//! ├──────────────────────────────────────────────────────────┤
//! │ write_idx │ read_idx │ full │ ... ring data (C bytes)... │
//! │  (atomic) │ (atomic) │(latch)│                           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Cursors are free-running; occupancy is `write - read` in wrapping
//! arithmetic and the slot index is `cursor & (C - 1)`, so the full `C`
//! bytes are usable.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::warn;

#[cfg(feature = "std")]
use std::sync::{Condvar, Mutex, PoisonError};
#[cfg(feature = "std")]
use std::time::{Duration, Instant};

/// Bounded SPSC byte queue with a latched full flag.
///
/// `C` must be a power of two.
///
/// # Thread Safety
///
/// Safe for exactly one producer context and one consumer context, which is
/// the only configuration the bridge creates: either the USB rx callback or
/// the TCP receive loop produces (the transports are mutually exclusive by
/// design), and the protocol core task consumes.
pub struct ByteQueue<const C: usize> {
    data: UnsafeCell<[u8; C]>,

    /// Write cursor, advanced only by the producer
    write_idx: AtomicUsize,

    /// Read cursor, advanced only by the consumer
    read_idx: AtomicUsize,

    /// Latched full flag, see module docs
    full: AtomicBool,

    /// Free-space level at which the full latch clears
    hysteresis: usize,

    #[cfg(feature = "std")]
    lock: Mutex<()>,
    #[cfg(feature = "std")]
    data_ready: Condvar,
    #[cfg(feature = "std")]
    space_ready: Condvar,

    /// Latched by [`ByteQueue::wake`]; makes the next blocking pop return
    /// empty-handed instead of re-waiting.
    #[cfg(feature = "std")]
    woken: AtomicBool,
}

// The unsafe cell is only reached through the SPSC cursor discipline: the
// producer writes `[write, write + n)` before publishing `write + n`, the
// consumer reads `[read, read + n)` before publishing `read + n`, and the
// regions never overlap while unpublished.
unsafe impl<const C: usize> Sync for ByteQueue<C> {}

impl<const C: usize> ByteQueue<C> {
    /// Create an empty queue that clears its full latch once free space
    /// recovers to `hysteresis` bytes.
    ///
    /// # Panics
    ///
    /// If `C` is not a power of two or `hysteresis` is not in `1..=C`.
    pub fn new(hysteresis: usize) -> Self {
        assert!(C.is_power_of_two(), "queue capacity must be a power of two");
        assert!(hysteresis >= 1 && hysteresis <= C);
        Self {
            data: UnsafeCell::new([0u8; C]),
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            full: AtomicBool::new(false),
            hysteresis,
            #[cfg(feature = "std")]
            lock: Mutex::new(()),
            #[cfg(feature = "std")]
            data_ready: Condvar::new(),
            #[cfg(feature = "std")]
            space_ready: Condvar::new(),
            #[cfg(feature = "std")]
            woken: AtomicBool::new(false),
        }
    }

    /// Total capacity in bytes
    #[inline]
    pub const fn capacity(&self) -> usize {
        C
    }

    /// Number of bytes currently queued
    #[inline]
    pub fn len(&self) -> usize {
        let write = self.write_idx.load(Ordering::Acquire);
        let read = self.read_idx.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Check if the queue holds no data
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Instantaneous free space in bytes
    #[inline]
    pub fn free_space(&self) -> usize {
        C - self.len()
    }

    /// Latched full state; stays `true` until free space recovers to the
    /// hysteresis threshold, regardless of instantaneous free space.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Push from interrupt context. Never blocks: accepts as many bytes as
    /// fit and drops the rest. Latches the full flag when free space reaches
    /// zero (including an exact fill).
    ///
    /// Returns the number of bytes accepted.
    pub fn push(&self, bytes: &[u8]) -> usize {
        let accepted = bytes.len().min(self.free_space());
        if accepted > 0 {
            let write = self.write_idx.load(Ordering::Relaxed);
            // Safety: producer-owned region, see Sync impl note.
            unsafe { self.copy_in(write, &bytes[..accepted]) };
            self.write_idx
                .store(write.wrapping_add(accepted), Ordering::Release);
        }

        if self.free_space() == 0 && !self.full.swap(true, Ordering::AcqRel) {
            warn!("rx queue full");
        }
        let dropped = bytes.len() - accepted;
        if dropped > 0 {
            warn!("rx queue overflow, {dropped} bytes dropped");
        }

        #[cfg(feature = "std")]
        self.notify(&self.data_ready);

        accepted
    }

    /// Push from task context, waiting for space. This is the backpressure
    /// mechanism of the network receive path.
    #[cfg(feature = "std")]
    pub fn push_blocking(&self, bytes: &[u8]) {
        let mut offset = 0;
        while offset < bytes.len() {
            offset += self.push(&bytes[offset..]);
            if offset == bytes.len() {
                break;
            }
            let guard = self
                .lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.free_space() == 0 {
                drop(
                    self.space_ready
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner),
                );
            }
        }
    }

    /// Non-blocking drain of up to `buf.len()` bytes. Clears the full latch
    /// once free space recovers past the hysteresis threshold.
    ///
    /// Returns the number of bytes copied out.
    pub fn pop(&self, buf: &mut [u8]) -> usize {
        let read = self.read_idx.load(Ordering::Relaxed);
        let write = self.write_idx.load(Ordering::Acquire);
        let n = buf.len().min(write.wrapping_sub(read));
        if n > 0 {
            // Safety: consumer-owned region, see Sync impl note.
            unsafe { self.copy_out(read, &mut buf[..n]) };
            self.read_idx.store(read.wrapping_add(n), Ordering::Release);

            #[cfg(feature = "std")]
            self.notify(&self.space_ready);
        }
        self.maybe_clear_full();
        n
    }

    /// Blocking pop: waits up to `timeout` for at least one byte, then
    /// returns what is available up to `buf.len()`. Returns 0 on timeout.
    #[cfg(feature = "std")]
    pub fn pop_timeout(&self, buf: &mut [u8], timeout: Duration) -> usize {
        self.pop_deadline(buf, Some(Instant::now() + timeout))
    }

    /// Blocking pop without a timeout: waits forever for at least one byte.
    #[cfg(feature = "std")]
    pub fn pop_blocking(&self, buf: &mut [u8]) -> usize {
        self.pop_deadline(buf, None)
    }

    #[cfg(feature = "std")]
    fn pop_deadline(&self, buf: &mut [u8], deadline: Option<Instant>) -> usize {
        if buf.is_empty() {
            return 0;
        }
        loop {
            let n = self.pop(buf);
            if n > 0 {
                return n;
            }
            if self.woken.swap(false, Ordering::AcqRel) {
                return 0;
            }
            let guard = self
                .lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.is_empty() {
                continue;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return 0;
                    }
                    drop(
                        self.data_ready
                            .wait_timeout(guard, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner),
                    );
                }
                None => {
                    drop(
                        self.data_ready
                            .wait(guard)
                            .unwrap_or_else(PoisonError::into_inner),
                    );
                }
            }
        }
    }

    fn maybe_clear_full(&self) {
        if self.is_full()
            && self.free_space() >= self.hysteresis
            && self.full.swap(false, Ordering::AcqRel)
        {
            warn!("rx queue drained, accepting data again");
        }
    }

    /// Interrupt a consumer blocked in [`ByteQueue::pop_blocking`] or
    /// [`ByteQueue::pop_timeout`], e.g. when the owning transport
    /// disconnects. The blocked (or next blocking) pop returns 0 without
    /// data; the flag is consumed by that one return.
    #[cfg(feature = "std")]
    pub fn wake(&self) {
        self.woken.store(true, Ordering::Release);
        self.notify(&self.data_ready);
    }

    /// Take the pairing lock and notify, so a waiter between its emptiness
    /// check and its wait cannot miss the wakeup.
    #[cfg(feature = "std")]
    fn notify(&self, condvar: &Condvar) {
        drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
        condvar.notify_all();
    }

    unsafe fn copy_in(&self, cursor: usize, src: &[u8]) {
        let base = self.data.get() as *mut u8;
        let idx = cursor & (C - 1);
        let first = src.len().min(C - idx);
        core::ptr::copy_nonoverlapping(src.as_ptr(), base.add(idx), first);
        if first < src.len() {
            core::ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
        }
    }

    unsafe fn copy_out(&self, cursor: usize, dst: &mut [u8]) {
        let base = self.data.get() as *const u8;
        let idx = cursor & (C - 1);
        let first = dst.len().min(C - idx);
        core::ptr::copy_nonoverlapping(base.add(idx), dst.as_mut_ptr(), first);
        if first < dst.len() {
            core::ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }
}
