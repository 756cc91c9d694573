//! # Debug Probe Protocol Bridge
//!
//! This crate is the portable core of a USB/network hardware debug probe:
//!
//! - **Bounded Byte Queue**: ISR-safe rx buffering with hysteresis
//!   backpressure signaling
//! - **Coalescing Tx Buffer**: batches single-byte writes into transport
//!   sized transmissions
//! - **DAP Ring Pipeline**: multi-slot CMSIS-DAP request/response rings with
//!   command coalescing across USB packet boundaries
//! - **Session Manager**: mutual exclusion between USB and network GDB
//!   sessions
//! - **Personality**: boot-time choice of USB identity (Dual-CDC vs DAP-Link)
//!
//! ## Architecture
//!
//! ```text
//! USB CDC ISR ──┐
//!               ├──► ByteQueue ──► GdbChannel ──► gdb_main (external)
//! TCP :2345 ────┘                      │
//!                                      ▼
//!                  active transport ◄── TxAccumulator ◄── putchar
//!
//! USB vendor ISR ──► DapPipeline ──► dap_process_request (external)
//!                         ▲                  │
//!                     OUT re-arm         response ring ──► IN endpoint
//! ```
//!
//! ## Execution Model
//!
//! A small fixed set of preemptive tasks plus interrupt handlers; no async
//! runtime. Interrupt-context producers never block (drop-on-overflow);
//! task-context producers and consumers block as their backpressure
//! mechanism. The protocol cores (`gdb_main`, `dap_process_request`), the
//! SWD/JTAG tap, configuration storage and status LEDs are external
//! collaborators behind the traits in [`traits`].

#![cfg_attr(not(feature = "std"), no_std)]

pub mod config;
pub mod dap;
pub mod personality;
pub mod queue;
pub mod session;
pub mod traits;
pub mod txbuf;

#[cfg(feature = "std")]
pub mod channel;
#[cfg(feature = "std")]
pub mod glue;
#[cfg(feature = "std")]
pub mod net;

// Re-export main types for convenience
pub use config::{ProbeConfig, WifiMode};
pub use dap::{DapPipeline, SubmitOutcome, DAP_PACKET_COUNT, DAP_PACKET_SIZE};
pub use personality::{DeviceMode, Personality};
pub use queue::ByteQueue;
pub use session::{GdbSession, SessionTracker};
pub use traits::{DapInterpreter, StatusSink, TransportTx, UartPort};
pub use txbuf::TxAccumulator;

#[cfg(feature = "std")]
pub use channel::{GdbChannel, GdbIo};
#[cfg(feature = "std")]
pub use glue::{RxOverflowPolicy, UsbGlue};
#[cfg(feature = "std")]
pub use net::{GdbServer, NetError, NetTx, UartServer};

/// Library version for diagnostics
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// TCP port of the network GDB server
pub const GDB_SERVER_PORT: u16 = 2345;

/// TCP port of the network UART passthrough server
pub const UART_SERVER_PORT: u16 = 4444;

/// Maximum GDB RSP packet size, matching the external RSP core's buffer
pub const GDB_PACKET_SIZE: usize = 1024;

/// USB bulk/CDC endpoint size
pub const USB_EP_SIZE: usize = 64;

/// Capacity of the GDB rx queue: two full RSP packets
pub const GDB_RX_CAPACITY: usize = 2 * GDB_PACKET_SIZE;
