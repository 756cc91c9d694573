//! # Probe Configuration
//!
//! Settings persisted in the device's non-volatile store: the boot-time USB
//! personality and the Wi-Fi credentials the network transports run on.
//! Records are serialized with `postcard` for compact, no_std-compatible
//! storage; the backing store itself is an external collaborator behind
//! [`ConfigStore`].
//!
//! A device with no stored record boots as a dual-CDC probe running a Wi-Fi
//! access point with well-known credentials, so it is reachable out of the
//! box.

use heapless::String;
use serde::{Deserialize, Serialize};

use crate::personality::DeviceMode;

/// Maximum SSID length (802.11 limit)
pub const SSID_MAX: usize = 32;
/// Maximum WPA2 passphrase length
pub const PASS_MAX: usize = 64;
/// Maximum mDNS hostname length
pub const HOSTNAME_MAX: usize = 32;

/// Serialized size ceiling for a [`ProbeConfig`] record.
pub const CONFIG_BLOB_MAX: usize = 256;

const DEFAULT_AP_SSID: &str = "blackmagic";
const DEFAULT_AP_PASS: &str = "iamwitcher";
const DEFAULT_HOSTNAME: &str = "blackmagic";

/// Wi-Fi operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WifiMode {
    /// Run a soft access point with the stored AP credentials
    Ap,
    /// Join an existing network with the stored station credentials
    Sta,
}

/// Wi-Fi settings for both operating modes. Both credential pairs are kept
/// so switching modes does not lose the other side's settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiConfig {
    pub mode: WifiMode,
    pub ap_ssid: String<SSID_MAX>,
    pub ap_pass: String<PASS_MAX>,
    pub sta_ssid: String<SSID_MAX>,
    pub sta_pass: String<PASS_MAX>,
    pub hostname: String<HOSTNAME_MAX>,
}

/// Persisted probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub usb_mode: DeviceMode,
    pub wifi: WifiConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        let mut ap_ssid = String::new();
        let mut ap_pass = String::new();
        let mut hostname = String::new();
        // Infallible: the defaults fit the capacities by construction.
        let _ = ap_ssid.push_str(DEFAULT_AP_SSID);
        let _ = ap_pass.push_str(DEFAULT_AP_PASS);
        let _ = hostname.push_str(DEFAULT_HOSTNAME);
        Self {
            usb_mode: DeviceMode::DualCdc,
            wifi: WifiConfig {
                mode: WifiMode::Ap,
                ap_ssid,
                ap_pass,
                sta_ssid: String::new(),
                sta_pass: String::new(),
                hostname,
            },
        }
    }
}

impl ProbeConfig {
    /// Serialize into a storage blob.
    pub fn to_blob<'a>(&self, buffer: &'a mut [u8]) -> Result<&'a [u8], postcard::Error> {
        postcard::to_slice(self, buffer).map(|blob| &*blob)
    }

    /// Decode a storage blob.
    pub fn from_blob(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }
}

/// Non-volatile record store. Implemented over NVS on the device and over a
/// plain map in tests.
pub trait ConfigStore {
    type Error;

    /// Read the stored record into `buffer`, returning the blob or `None`
    /// when no record exists.
    fn load<'a>(&self, buffer: &'a mut [u8]) -> Result<Option<&'a [u8]>, Self::Error>;

    /// Replace the stored record.
    fn save(&mut self, blob: &[u8]) -> Result<(), Self::Error>;
}

/// Load the stored configuration, falling back to [`ProbeConfig::default`]
/// when the store is empty or the record does not decode.
pub fn load_or_default<S: ConfigStore>(store: &S) -> Result<ProbeConfig, S::Error> {
    let mut buffer = [0u8; CONFIG_BLOB_MAX];
    match store.load(&mut buffer)? {
        Some(blob) => match ProbeConfig::from_blob(blob) {
            Ok(config) => Ok(config),
            Err(_) => {
                log::warn!("stored config does not decode, using defaults");
                Ok(ProbeConfig::default())
            }
        },
        None => Ok(ProbeConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemStore {
        blob: Option<Vec<u8>>,
    }

    impl ConfigStore for MemStore {
        type Error = ();

        fn load<'a>(&self, buffer: &'a mut [u8]) -> Result<Option<&'a [u8]>, ()> {
            match &self.blob {
                Some(blob) => {
                    buffer[..blob.len()].copy_from_slice(blob);
                    Ok(Some(&buffer[..blob.len()]))
                }
                None => Ok(None),
            }
        }

        fn save(&mut self, blob: &[u8]) -> Result<(), ()> {
            self.blob = Some(blob.to_vec());
            Ok(())
        }
    }

    #[test]
    fn defaults_match_factory_identity() {
        let config = ProbeConfig::default();
        assert_eq!(config.usb_mode, DeviceMode::DualCdc);
        assert_eq!(config.wifi.mode, WifiMode::Ap);
        assert_eq!(config.wifi.ap_ssid.as_str(), "blackmagic");
        assert_eq!(config.wifi.ap_pass.as_str(), "iamwitcher");
        assert!(config.wifi.sta_ssid.is_empty());
    }

    #[test]
    fn config_round_trips_through_blob() {
        let mut config = ProbeConfig::default();
        config.usb_mode = DeviceMode::DapLink;
        config.wifi.mode = WifiMode::Sta;
        config.wifi.sta_ssid.push_str("lab-net").unwrap();
        config.wifi.sta_pass.push_str("hunter22").unwrap();

        let mut buffer = [0u8; CONFIG_BLOB_MAX];
        let blob = config.to_blob(&mut buffer).unwrap();
        assert!(blob.len() <= CONFIG_BLOB_MAX);
        let decoded = ProbeConfig::from_blob(blob).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn empty_store_yields_defaults() {
        let store = MemStore { blob: None };
        let config = load_or_default(&store).unwrap();
        assert_eq!(config, ProbeConfig::default());
    }

    #[test]
    fn corrupt_record_falls_back_to_defaults() {
        let store = MemStore {
            blob: Some(vec![0xFF; 40]),
        };
        let config = load_or_default(&store).unwrap();
        assert_eq!(config, ProbeConfig::default());
    }

    #[test]
    fn saved_record_is_loaded_back() {
        let mut store = MemStore { blob: None };
        let mut config = ProbeConfig::default();
        config.usb_mode = DeviceMode::DapLink;

        let mut buffer = [0u8; CONFIG_BLOB_MAX];
        let blob = config.to_blob(&mut buffer).unwrap();
        store.save(blob).unwrap();

        assert_eq!(load_or_default(&store).unwrap(), config);
    }
}
