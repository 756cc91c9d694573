//! # CMSIS-DAP Command Ring Pipeline
//!
//! Two independent rings of fixed 64-byte slots connect the vendor-class
//! bulk endpoints to the external DAP interpreter: requests flow from the
//! OUT-transfer interrupt into the request ring, responses flow from the
//! interpreter task into the response ring and out of the IN endpoint.
//!
//! ## Command Coalescing
//!
//! Hosts batch probe commands by tagging packets `DAP_QueueCommands` (0x7E)
//! and terminating the group with any other command, typically
//! `DAP_ExecuteCommands` (0x7F). The consumer must never see a partial
//! batch: [`DapPipeline::acquire_request`] first peeks forward from the read
//! cursor to check that a terminating packet has actually arrived, and only
//! then rewrites the queued prefix to `DAP_ExecuteCommands` in place and
//! hands out the slot at the read cursor. `DAP_TransferAbort` (0x07) is
//! handled out-of-band at submit time and never enters the ring.
//!
//! ## Cursor Discipline
//!
//! Write and read cursors are free-running wrapping `u8` counters; the slot
//! index is `cursor % 8` and occupancy is `wp - rp` in wrapping arithmetic,
//! never exceeding the slot count. The request `wp` is advanced from
//! interrupt context and `rp` from the consumer task; the coalescing scan
//! works on a snapshot of `wp` taken at scan start and tolerates `wp`
//! advancing concurrently. On a USB bus reset the cursors and slot lengths
//! are zeroed while endpoint handles and buffers persist.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU8, Ordering};

/// CMSIS-DAP packet size in bytes (`P`)
pub const DAP_PACKET_SIZE: usize = 64;

/// Outstanding packets per direction (`K`)
pub const DAP_PACKET_COUNT: usize = 8;

/// `DAP_QueueCommands`: queue for later execution
pub const CMD_QUEUE_COMMANDS: u8 = 0x7E;

/// `DAP_ExecuteCommands`: execute the queued group now
pub const CMD_EXECUTE_COMMANDS: u8 = 0x7F;

/// `DAP_TransferAbort`: abort the transfer in progress, out-of-band
pub const CMD_TRANSFER_ABORT: u8 = 0x07;

/// Result of handing a completed OUT transfer to the request ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubmitOutcome {
    /// Stored and published to the consumer.
    Queued,
    /// `DAP_TransferAbort`: not queued, the caller invokes the abort hook.
    Abort,
    /// Empty transfer or no room. With correct endpoint arming this does not
    /// happen; the packet is lost.
    Dropped,
}

#[derive(Clone, Copy)]
struct Slot {
    len: u8,
    buf: [u8; DAP_PACKET_SIZE],
}

const EMPTY_SLOT: Slot = Slot {
    len: 0,
    buf: [0u8; DAP_PACKET_SIZE],
};

struct Ring {
    /// Write cursor, advanced only by the producer side
    wp: AtomicU8,
    /// Read cursor, advanced only by the consumer side
    rp: AtomicU8,
    slots: UnsafeCell<[Slot; DAP_PACKET_COUNT]>,
}

// Slot access follows the cursor discipline: the producer touches only the
// unpublished slot at `wp`, the consumer only published slots in `[rp, wp)`.
unsafe impl Sync for Ring {}

impl Ring {
    const fn new() -> Self {
        Self {
            wp: AtomicU8::new(0),
            rp: AtomicU8::new(0),
            slots: UnsafeCell::new([EMPTY_SLOT; DAP_PACKET_COUNT]),
        }
    }

    fn occupancy(&self) -> usize {
        let wp = self.wp.load(Ordering::Acquire);
        let rp = self.rp.load(Ordering::Acquire);
        wp.wrapping_sub(rp) as usize
    }

    fn space(&self) -> usize {
        DAP_PACKET_COUNT - self.occupancy()
    }

    fn slot_ptr(&self, cursor: u8) -> *mut Slot {
        let base = self.slots.get() as *mut Slot;
        base.wrapping_add(cursor as usize % DAP_PACKET_COUNT)
    }

    fn reset(&self) {
        self.wp.store(0, Ordering::Release);
        self.rp.store(0, Ordering::Release);
        for cursor in 0..DAP_PACKET_COUNT as u8 {
            // Safety: reset runs with no transfers in flight and no grants
            // outstanding (USB bus reset context).
            unsafe { (*self.slot_ptr(cursor)).len = 0 };
        }
    }
}

/// Pure coalescing scan over the first command byte of each occupied slot,
/// oldest first.
///
/// Returns the number of leading `DAP_QueueCommands` packets when a
/// terminating packet exists behind them, or `None` while the batch is
/// still incomplete.
pub fn coalesce_scan(commands: &[u8]) -> Option<usize> {
    let queued = commands
        .iter()
        .take_while(|&&c| c == CMD_QUEUE_COMMANDS)
        .count();
    if queued == commands.len() {
        None
    } else {
        Some(queued)
    }
}

/// Request/response slot rings between the vendor endpoints and the DAP
/// interpreter.
pub struct DapPipeline {
    request: Ring,
    response: Ring,
}

impl DapPipeline {
    pub const fn new() -> Self {
        Self {
            request: Ring::new(),
            response: Ring::new(),
        }
    }

    /// Free request slots; the glue re-arms the OUT endpoint while this is
    /// nonzero.
    pub fn request_space(&self) -> usize {
        self.request.space()
    }

    /// Store a completed OUT transfer (interrupt context, never blocks).
    ///
    /// An abort packet is reported but not queued; everything else is
    /// published to the consumer in arrival order.
    pub fn submit_request(&self, data: &[u8]) -> SubmitOutcome {
        if data.is_empty() {
            return SubmitOutcome::Dropped;
        }
        let wp = self.request.wp.load(Ordering::Acquire);
        let rp = self.request.rp.load(Ordering::Acquire);
        if wp.wrapping_sub(rp) as usize >= DAP_PACKET_COUNT {
            return SubmitOutcome::Dropped;
        }

        let len = data.len().min(DAP_PACKET_SIZE);
        // Safety: the slot at `wp` is unpublished and producer-owned.
        unsafe {
            let slot = self.request.slot_ptr(wp);
            (*slot).len = len as u8;
            (&mut (*slot).buf)[..len].copy_from_slice(&data[..len]);
        }
        if data[0] == CMD_TRANSFER_ABORT {
            return SubmitOutcome::Abort;
        }
        self.request.wp.store(wp.wrapping_add(1), Ordering::Release);
        SubmitOutcome::Queued
    }

    /// Next executable request, if a complete command group has arrived.
    ///
    /// Peeks forward from the read cursor (see module docs); when the group
    /// is terminated, rewrites the queued prefix to `DAP_ExecuteCommands`
    /// and returns the slot at the read cursor. Idempotent until the grant
    /// is released. Single consumer.
    pub fn acquire_request(&self) -> Option<RequestGrant<'_>> {
        let rp = self.request.rp.load(Ordering::Acquire);
        // Snapshot: packets arriving after this point are picked up by the
        // next acquire.
        let wp = self.request.wp.load(Ordering::Acquire);
        let occupancy = wp.wrapping_sub(rp) as usize;
        if occupancy == 0 {
            return None;
        }

        let mut commands = [0u8; DAP_PACKET_COUNT];
        for (i, command) in commands.iter_mut().take(occupancy).enumerate() {
            // Safety: slots in `[rp, wp)` are published and consumer-owned.
            *command = unsafe { (*self.request.slot_ptr(rp.wrapping_add(i as u8))).buf[0] };
        }
        let queued = coalesce_scan(&commands[..occupancy])?;

        // Upgrade the whole queued prefix to execute-now, in place.
        for i in 0..queued {
            // Safety: as above.
            unsafe {
                (*self.request.slot_ptr(rp.wrapping_add(i as u8))).buf[0] = CMD_EXECUTE_COMMANDS;
            }
        }

        // Safety: as above.
        let len = unsafe { (*self.request.slot_ptr(rp)).len } as usize;
        Some(RequestGrant {
            ring: &self.request,
            cursor: rp,
            len,
        })
    }

    /// Writable response slot, or `None` while all slots are in flight.
    /// Single writer (the interpreter task).
    pub fn acquire_response(&self) -> Option<ResponseGrant<'_>> {
        let wp = self.response.wp.load(Ordering::Acquire);
        let rp = self.response.rp.load(Ordering::Acquire);
        if wp.wrapping_sub(rp) as usize >= DAP_PACKET_COUNT {
            return None;
        }
        Some(ResponseGrant {
            ring: &self.response,
            cursor: wp,
        })
    }

    /// Dequeue the next committed response for the IN endpoint. `out` must
    /// hold at least [`DAP_PACKET_SIZE`] bytes. Called when the IN endpoint
    /// is idle; a completed IN transfer calls it again to chain sends.
    pub fn pop_transmission(&self, out: &mut [u8]) -> Option<usize> {
        let rp = self.response.rp.load(Ordering::Acquire);
        let wp = self.response.wp.load(Ordering::Acquire);
        if wp == rp {
            return None;
        }
        // Safety: slot at `rp` is published and stable until `rp` advances.
        let len = unsafe {
            let slot = self.response.slot_ptr(rp);
            let len = (*slot).len as usize;
            out[..len].copy_from_slice(&(&(*slot).buf)[..len]);
            len
        };
        self.response.rp.store(rp.wrapping_add(1), Ordering::Release);
        Some(len)
    }

    /// True while committed responses are waiting for the IN endpoint.
    pub fn response_pending(&self) -> bool {
        self.response.occupancy() > 0
    }

    /// USB bus reset: zero cursors and slot lengths on both rings. Endpoint
    /// handles and slot storage persist.
    pub fn bus_reset(&self) {
        self.request.reset();
        self.response.reset();
    }
}

impl Default for DapPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared view of the request slot at the read cursor. Dropping the grant
/// without [`RequestGrant::release`] leaves the slot queued; the next
/// acquire returns it again.
pub struct RequestGrant<'a> {
    ring: &'a Ring,
    cursor: u8,
    len: usize,
}

impl RequestGrant<'_> {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Consume the slot: advances the read cursor by exactly one. The glue
    /// re-arms the OUT endpoint afterwards.
    pub fn release(self) {
        let rp = self.ring.rp.load(Ordering::Acquire);
        debug_assert_eq!(rp, self.cursor);
        self.ring.rp.store(rp.wrapping_add(1), Ordering::Release);
    }
}

impl Deref for RequestGrant<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: the slot is published and the producer does not touch it
        // until the read cursor advances past it.
        unsafe { &(&(*self.ring.slot_ptr(self.cursor)).buf)[..self.len] }
    }
}

/// Exclusive view of the response slot at the write cursor; committing
/// publishes it to the IN endpoint side.
pub struct ResponseGrant<'a> {
    ring: &'a Ring,
    cursor: u8,
}

impl ResponseGrant<'_> {
    /// Record the response length and publish the slot.
    ///
    /// # Panics
    ///
    /// If `len` exceeds [`DAP_PACKET_SIZE`].
    pub fn commit(self, len: usize) {
        assert!(len <= DAP_PACKET_SIZE);
        // Safety: the slot is unpublished and writer-owned until the store
        // below.
        unsafe { (*self.ring.slot_ptr(self.cursor)).len = len as u8 };
        self.ring
            .wp
            .store(self.cursor.wrapping_add(1), Ordering::Release);
    }
}

impl Deref for ResponseGrant<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: unpublished, writer-owned slot.
        unsafe { &(*self.ring.slot_ptr(self.cursor)).buf }
    }
}

impl DerefMut for ResponseGrant<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: unpublished, writer-owned slot.
        unsafe { &mut (*self.ring.slot_ptr(self.cursor)).buf }
    }
}
