//! Plain data reported by the radio, decoded once at the link boundary.

use serde::{Deserialize, Serialize};

/// Identity and radio settings returned when the app session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfInfo {
    pub name: String,
    /// Lowercase hex, 64 characters.
    pub public_key: String,
    pub adv_type: u8,
    pub tx_power: u8,
    pub max_tx_power: u8,
    pub adv_lat: Option<f64>,
    pub adv_lon: Option<f64>,
    pub multi_acks: u8,
    pub advert_loc_policy: u8,
    pub telemetry_modes: u8,
    pub manual_add_contacts: bool,
    pub radio_freq_khz: u32,
    pub radio_bw_hz: u32,
    pub radio_sf: u8,
    pub radio_cr: u8,
}

/// A contact as stored on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceContact {
    pub public_key: String,
    pub adv_type: u8,
    pub flags: u8,
    /// -1 means no known route (flood).
    pub out_path_len: i8,
    pub out_path: Vec<u8>,
    pub name: String,
    pub last_advert: u32,
    pub adv_lat: Option<f64>,
    pub adv_lon: Option<f64>,
    pub lastmod: u32,
}

impl DeviceContact {
    pub fn out_path_hex(&self) -> String {
        if self.out_path_len <= 0 {
            return String::new();
        }
        let len = (self.out_path_len as usize).min(self.out_path.len());
        hex::encode(&self.out_path[..len])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryInfo {
    pub millivolts: u16,
    pub used_kb: Option<u32>,
    pub total_kb: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub firmware_version: u8,
    pub max_contacts: Option<u16>,
    pub max_channels: Option<u8>,
    pub ble_pin: Option<u32>,
    pub build_date: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub index: u8,
    pub name: String,
    /// 16 bytes, lowercase hex. All zeros means the slot is unused.
    pub secret: String,
}

impl ChannelInfo {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.secret.chars().all(|c| c == '0')
    }
}

/// Acknowledgement of a queued send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentInfo {
    pub flood: bool,
    /// 4-byte ack code, lowercase hex.
    pub expected_ack: String,
    pub suggested_timeout_ms: u32,
}
