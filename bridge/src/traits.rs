//! # Collaborator Interfaces
//!
//! The bridge consumes its surroundings through narrow traits, so every
//! state machine in this crate is testable on a host without USB hardware,
//! an SWD tap or an RTOS:
//!
//! - [`TransportTx`]: an outgoing byte transport (USB CDC write queue, TCP
//!   socket)
//! - [`DapInterpreter`]: the external CMSIS-DAP command interpreter
//! - [`StatusSink`]: fire-and-forget LED/status indication
//! - [`UartPort`]: the target-facing UART behind the passthrough CDC channel
//! - [`VendorDriver`]: the vendor-class endpoint pair the DAP pipeline arms

/// Outgoing byte transport.
///
/// `flush` marks the end of a logical unit (an RSP packet, a DAP response);
/// transports that batch internally use it to push data to the wire.
/// Transmission is fire-and-forget: a broken transport drops data and the
/// corresponding session ends through its own disconnect path.
pub trait TransportTx: Send + Sync {
    fn send(&self, data: &[u8], flush: bool);
}

/// External CMSIS-DAP command interpreter (`dap_process_request`).
pub trait DapInterpreter {
    /// Process one request packet, writing the reply into `response`.
    /// Returns the number of response bytes produced.
    fn process(&mut self, request: &[u8], response: &mut [u8]) -> usize;
}

/// Status/LED side effects on connect and disconnect. Not required for
/// correctness.
pub trait StatusSink: Send + Sync {
    fn connected(&self) {}
    fn disconnected(&self) {}
}

/// A [`StatusSink`] that does nothing.
pub struct NullStatus;

impl StatusSink for NullStatus {}

/// CDC line coding as delivered by the host, forwarded to the passthrough
/// UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineCoding {
    pub bit_rate: u32,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub data_bits: u8,
}

/// Stop bit count, CDC encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopBits {
    One,
    OneAndHalf,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::One),
            1 => Ok(Self::OneAndHalf),
            2 => Ok(Self::Two),
            _ => Err(()),
        }
    }
}

/// Parity mode, CDC encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl TryFrom<u8> for Parity {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Odd),
            2 => Ok(Self::Even),
            3 => Ok(Self::Mark),
            4 => Ok(Self::Space),
            _ => Err(()),
        }
    }
}

/// Target-facing UART behind the passthrough CDC channel and the network
/// UART service.
pub trait UartPort: Send {
    fn write(&mut self, data: &[u8]);

    /// Host changed the line coding on the passthrough channel.
    fn set_line_coding(&mut self, _coding: &LineCoding) {}

    /// Host toggled DTR/RTS. The reference hardware has neither pin wired,
    /// so the default ignores it.
    fn set_line_state(&mut self, _dtr: bool, _rts: bool) {}
}

/// Vendor-class bulk endpoint pair, as seen by the DAP pipeline glue.
///
/// The glue arms the OUT endpoint whenever the request ring has room and
/// starts IN transfers whenever a response is queued and the endpoint is
/// idle; completions come back through [`crate::glue::UsbGlue`].
pub trait VendorDriver: Send + Sync {
    /// True when no OUT transfer is currently armed.
    fn out_idle(&self) -> bool;

    /// Arm reception of the next OUT packet.
    fn arm_out(&self);

    /// True when no IN transfer is in flight.
    fn in_idle(&self) -> bool;

    /// Start an IN transfer with the given response payload.
    fn transmit(&self, data: &[u8]);
}
