//! # GDB Transport Channel
//!
//! One shared channel sits between the transports (USB-CDC interrupt path,
//! TCP receive loop) and the external RSP core task. Incoming bytes from
//! either transport land in the bounded receive queue; outgoing bytes from
//! the RSP core pass through the coalescing accumulator and are routed to
//! whichever transport owns the session.
//!
//! ```text
//!  USB CDC ISR ──push──┐                        ┌──▶ USB write queue
//!                      ├──▶ rx queue ──▶ RSP ───┤
//!  TCP rx loop ──push──┘      core task         └──▶ TCP socket
//! ```
//!
//! The channel never interprets RSP framing; it moves raw bytes.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::queue::ByteQueue;
use crate::session::{GdbSession, SessionTracker};
use crate::traits::TransportTx;
use crate::txbuf::TxAccumulator;
use crate::{GDB_PACKET_SIZE, GDB_RX_CAPACITY};

/// Shared GDB byte channel with session-based transmit routing.
pub struct GdbChannel {
    rx: ByteQueue<GDB_RX_CAPACITY>,
    tx: Mutex<TxAccumulator>,
    session: SessionTracker,
    usb_tx: Arc<dyn TransportTx>,
    net_tx: Mutex<Option<Arc<dyn TransportTx>>>,
}

impl GdbChannel {
    /// The hysteresis threshold is one maximum RSP packet, so the receive
    /// queue reports not-full only once a whole packet fits again.
    pub fn new(usb_tx: Arc<dyn TransportTx>) -> Self {
        Self {
            rx: ByteQueue::new(GDB_PACKET_SIZE),
            tx: Mutex::new(TxAccumulator::new()),
            session: SessionTracker::new(),
            usb_tx,
            net_tx: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &SessionTracker {
        &self.session
    }

    /// Register the network transmit sink. Called when the TCP GDB server
    /// comes up; personalities without network GDB never call it.
    pub fn set_net_tx(&self, tx: Arc<dyn TransportTx>) {
        *self.net_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    /// Push received bytes from interrupt context. Never blocks; returns the
    /// number of bytes accepted.
    pub fn receive_from_isr(&self, bytes: &[u8]) -> usize {
        self.rx.push(bytes)
    }

    /// Push received bytes from task context, waiting for queue space. The
    /// TCP receive loop uses this as its backpressure mechanism.
    pub fn receive_blocking(&self, bytes: &[u8]) {
        self.rx.push_blocking(bytes)
    }

    /// Free receive-queue space in bytes.
    pub fn rx_free(&self) -> usize {
        self.rx.free_space()
    }

    /// Whether a full RSP packet worth of space is available.
    pub fn can_receive(&self) -> bool {
        self.rx.free_space() >= GDB_PACKET_SIZE
    }

    /// Next received byte, blocking until one arrives.
    pub fn getchar(&self) -> u8 {
        let mut byte = [0u8; 1];
        while self.rx.pop_blocking(&mut byte) == 0 {}
        byte[0]
    }

    /// Next received byte, or `None` if nothing arrives within `timeout`.
    pub fn getchar_timeout(&self, timeout: Duration) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.rx.pop_timeout(&mut byte, timeout) {
            0 => None,
            _ => Some(byte[0]),
        }
    }

    /// Drain up to `buf.len()` received bytes, blocking until at least one
    /// is available. Returns 0 only when interrupted by
    /// [`GdbChannel::wake_reader`].
    pub fn read_blocking(&self, buf: &mut [u8]) -> usize {
        self.rx.pop_blocking(buf)
    }

    /// Wake a consumer blocked in a receive call, e.g. on disconnect. The
    /// interrupted read returns empty-handed.
    pub fn wake_reader(&self) {
        self.rx.wake();
    }

    /// Append one reply byte, routed to the active transport. `flush` marks
    /// the end of an RSP transmission unit.
    pub fn putchar(&self, c: u8, flush: bool) {
        let sink = self.active_tx();
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_byte(c, flush, &*sink);
    }

    /// Transmit any buffered reply bytes to the active transport.
    pub fn flush(&self) {
        let sink = self.active_tx();
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush(&*sink);
    }

    /// Transmit sink for the current session. A network-active session with
    /// no registered network sink is a build/config mismatch, not a runtime
    /// fault, and aborts the process.
    fn active_tx(&self) -> Arc<dyn TransportTx> {
        match self.session.current() {
            GdbSession::ActiveOverNetwork => {
                match &*self.net_tx.lock().unwrap_or_else(PoisonError::into_inner) {
                    Some(tx) => Arc::clone(tx),
                    None => panic!("network GDB session active but no network transport configured"),
                }
            }
            // Idle replies (e.g. a late flush after disconnect) go to the
            // USB sink, whose driver discards writes while unconnected.
            GdbSession::ActiveOverUsb | GdbSession::Idle => Arc::clone(&self.usb_tx),
        }
    }
}

/// [`embedded_io`] view of a [`GdbChannel`], for protocol cores written
/// against the embedded I/O traits.
pub struct GdbIo<'a> {
    channel: &'a GdbChannel,
}

impl<'a> GdbIo<'a> {
    pub fn new(channel: &'a GdbChannel) -> Self {
        Self { channel }
    }
}

impl embedded_io::ErrorType for GdbIo<'_> {
    type Error = core::convert::Infallible;
}

impl embedded_io::Read for GdbIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        Ok(self.channel.read_blocking(buf))
    }
}

impl embedded_io::Write for GdbIo<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        for &byte in buf {
            self.channel.putchar(byte, false);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.channel.flush();
        Ok(())
    }
}
