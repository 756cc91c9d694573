//! # Coalescing Tx Buffer
//!
//! The external RSP core emits replies one byte at a time through a
//! putchar-style primitive. Handing single bytes to the USB write queue or a
//! TCP socket wastes a transfer per byte, so the accumulator batches them
//! and hands the transport one transmission unit per flush.
//!
//! Flushing happens on an explicit request from the protocol core (end of
//! packet) or implicitly when the buffer fills. A flush of an empty buffer
//! transmits nothing; empty packets are never emitted.

use crate::traits::TransportTx;

/// Default accumulator capacity, one USB endpoint worth of bytes.
pub const TX_BUFFER_SIZE: usize = crate::USB_EP_SIZE;

/// Fixed-capacity byte accumulator, flushed as a whole to a [`TransportTx`].
pub struct TxAccumulator<const N: usize = TX_BUFFER_SIZE> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> TxAccumulator<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0u8; N],
            len: 0,
        }
    }

    /// Bytes currently buffered; never exceeds `N`.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one byte. Transmits the buffered bytes when the caller asks
    /// for a flush or the buffer is full, passing the caller's flush flag
    /// through to the transport.
    pub fn push_byte(&mut self, c: u8, flush: bool, tx: &(impl TransportTx + ?Sized)) {
        self.buf[self.len] = c;
        self.len += 1;

        if flush || self.len == N {
            tx.send(&self.buf[..self.len], flush);
            self.len = 0;
        }
    }

    /// Transmit whatever is buffered as one unit; no-op when empty.
    pub fn flush(&mut self, tx: &(impl TransportTx + ?Sized)) {
        if self.len > 0 {
            tx.send(&self.buf[..self.len], true);
            self.len = 0;
        }
    }
}

impl<const N: usize> Default for TxAccumulator<N> {
    fn default() -> Self {
        Self::new()
    }
}
