//! # USB Device Personality
//!
//! The probe presents one of two USB identities, chosen once at boot from
//! stored configuration and immutable until restart:
//!
//! - **Dual CDC**: two CDC-ACM interfaces, GDB RSP on interface 0 and a raw
//!   UART passthrough on interface 1.
//! - **DAP-Link**: one CDC-ACM UART interface plus a vendor interface that
//!   feeds the CMSIS-DAP command ring.
//!
//! Each personality carries its own interface layout, so USB callback
//! routing is a match on the active variant rather than an index into a
//! handler table.

use serde::{Deserialize, Serialize};

/// Boot-time choice of USB identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeviceMode {
    DualCdc = 0,
    DapLink = 1,
}

impl DeviceMode {
    /// Decode a stored mode byte.
    pub fn from_stored(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::DualCdc),
            1 => Some(Self::DapLink),
            _ => None,
        }
    }
}

impl Default for DeviceMode {
    fn default() -> Self {
        Self::DualCdc
    }
}

/// What a CDC interface carries in the active personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CdcRole {
    /// GDB RSP byte stream
    Gdb,
    /// Raw UART passthrough
    Uart,
}

/// Device/string descriptor identity for one personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSet {
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: &'static str,
    pub product: &'static str,
}

const DUAL_CDC_DESCRIPTORS: DescriptorSet = DescriptorSet {
    vid: 0x303A,
    pid: 0x4001,
    manufacturer: "Flipper Devices Inc.",
    product: "Blackmagic ESP32",
};

const DAP_LINK_DESCRIPTORS: DescriptorSet = DescriptorSet {
    vid: 0x303A,
    pid: 0x4002,
    manufacturer: "Flipper Devices Inc.",
    product: "CMSIS-DAP ESP32S2 Device",
};

/// Interface layout of the dual-CDC identity.
#[derive(Debug, Clone, Copy)]
pub struct DualCdcHandlers {
    pub gdb_itf: u8,
    pub uart_itf: u8,
}

/// Interface layout of the DAP-Link identity.
#[derive(Debug, Clone, Copy)]
pub struct DapLinkHandlers {
    pub uart_itf: u8,
}

/// Active USB identity with its interface layout. Selected once, before the
/// USB stack comes up.
#[derive(Debug, Clone, Copy)]
pub enum Personality {
    DualCdc(DualCdcHandlers),
    DapLink(DapLinkHandlers),
}

impl Personality {
    pub fn select(mode: DeviceMode) -> Self {
        match mode {
            DeviceMode::DualCdc => Self::DualCdc(DualCdcHandlers {
                gdb_itf: 0,
                uart_itf: 1,
            }),
            DeviceMode::DapLink => Self::DapLink(DapLinkHandlers { uart_itf: 0 }),
        }
    }

    pub fn mode(&self) -> DeviceMode {
        match self {
            Self::DualCdc(_) => DeviceMode::DualCdc,
            Self::DapLink(_) => DeviceMode::DapLink,
        }
    }

    pub fn descriptors(&self) -> &'static DescriptorSet {
        match self {
            Self::DualCdc(_) => &DUAL_CDC_DESCRIPTORS,
            Self::DapLink(_) => &DAP_LINK_DESCRIPTORS,
        }
    }

    /// Role of a CDC interface index, `None` for interfaces the personality
    /// does not expose.
    pub fn cdc_role(&self, itf: u8) -> Option<CdcRole> {
        match self {
            Self::DualCdc(h) if itf == h.gdb_itf => Some(CdcRole::Gdb),
            Self::DualCdc(h) if itf == h.uart_itf => Some(CdcRole::Uart),
            Self::DapLink(h) if itf == h.uart_itf => Some(CdcRole::Uart),
            _ => None,
        }
    }

    /// Whether the vendor interface (CMSIS-DAP endpoints) is present.
    pub fn has_vendor_interface(&self) -> bool {
        matches!(self, Self::DapLink(_))
    }

    /// Whether GDB RSP is carried over a CDC interface (as opposed to TCP
    /// only).
    pub fn has_cdc_gdb(&self) -> bool {
        matches!(self, Self::DualCdc(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_mode_byte_round_trips() {
        assert_eq!(DeviceMode::from_stored(0), Some(DeviceMode::DualCdc));
        assert_eq!(DeviceMode::from_stored(1), Some(DeviceMode::DapLink));
        assert_eq!(DeviceMode::from_stored(2), None);
        assert_eq!(DeviceMode::from_stored(0xFF), None);
    }

    #[test]
    fn dual_cdc_routes_gdb_and_uart() {
        let p = Personality::select(DeviceMode::DualCdc);
        assert_eq!(p.cdc_role(0), Some(CdcRole::Gdb));
        assert_eq!(p.cdc_role(1), Some(CdcRole::Uart));
        assert_eq!(p.cdc_role(2), None);
        assert!(!p.has_vendor_interface());
        assert!(p.has_cdc_gdb());
    }

    #[test]
    fn dap_link_has_single_uart_cdc_and_vendor() {
        let p = Personality::select(DeviceMode::DapLink);
        assert_eq!(p.cdc_role(0), Some(CdcRole::Uart));
        assert_eq!(p.cdc_role(1), None);
        assert!(p.has_vendor_interface());
        assert!(!p.has_cdc_gdb());
    }

    #[test]
    fn descriptor_identity_follows_mode() {
        let dual = Personality::select(DeviceMode::DualCdc);
        assert_eq!(dual.descriptors().pid, 0x4001);
        assert_eq!(dual.descriptors().product, "Blackmagic ESP32");

        let dap = Personality::select(DeviceMode::DapLink);
        assert_eq!(dap.descriptors().pid, 0x4002);
        assert_eq!(dap.descriptors().vid, 0x303A);
    }
}
