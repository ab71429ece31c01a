//! Requests the bridge can put on the wire, and what comes back.

use serde::Serialize;
use std::time::Duration;

use super::events::DeviceEvent;
use super::types::{BatteryInfo, ChannelInfo, DeviceContact, DeviceInfo, SelfInfo, SentInfo};

/// Correlates a queued request with its response.
pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceRequest {
    /// Start the app session; answered with [`SelfInfo`].
    AppStart,
    DeviceQuery,
    GetContacts,
    SendChannelMessage {
        channel: u8,
        text: String,
        timestamp: u32,
    },
    SendDirectMessage {
        recipient_prefix: [u8; 6],
        text: String,
        timestamp: u32,
        attempt: u8,
    },
    /// Pull the next message from the device's waiting queue.
    SyncNextMessage,
    GetBattery,
    GetChannel(u8),
    SetChannel {
        index: u8,
        name: String,
        secret: [u8; 16],
    },
    SendAdvert {
        flood: bool,
    },
    AddUpdateContact(DeviceContact),
    RemoveContact([u8; 32]),
    SetOtherParams {
        manual_add_contacts: bool,
        telemetry_modes: u8,
        advert_loc_policy: u8,
        multi_acks: u8,
    },
    SetDeviceTime(u32),
}

impl DeviceRequest {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceRequest::AppStart => "app_start",
            DeviceRequest::DeviceQuery => "device_query",
            DeviceRequest::GetContacts => "get_contacts",
            DeviceRequest::SendChannelMessage { .. } => "send_channel_message",
            DeviceRequest::SendDirectMessage { .. } => "send_direct_message",
            DeviceRequest::SyncNextMessage => "sync_next_message",
            DeviceRequest::GetBattery => "get_battery",
            DeviceRequest::GetChannel(_) => "get_channel",
            DeviceRequest::SetChannel { .. } => "set_channel",
            DeviceRequest::SendAdvert { .. } => "send_advert",
            DeviceRequest::AddUpdateContact(_) => "add_update_contact",
            DeviceRequest::RemoveContact(_) => "remove_contact",
            DeviceRequest::SetOtherParams { .. } => "set_other_params",
            DeviceRequest::SetDeviceTime(_) => "set_device_time",
        }
    }

    /// Battery and device queries are cheap probes and get the short timeout.
    pub fn is_probe(&self) -> bool {
        matches!(self, DeviceRequest::GetBattery | DeviceRequest::DeviceQuery)
    }

    pub fn default_timeout(&self, timeouts: &CommandTimeouts) -> Duration {
        if self.is_probe() {
            timeouts.probe
        } else {
            timeouts.general
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeouts {
    pub general: Duration,
    pub probe: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            general: Duration::from_secs(30),
            probe: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DeviceResponse {
    Ok,
    SelfInfo(SelfInfo),
    Contacts(Vec<DeviceContact>),
    Sent(SentInfo),
    /// A message pulled off the waiting queue.
    Message(DeviceEvent),
    NoMoreMessages,
    Battery(BatteryInfo),
    DeviceInfo(DeviceInfo),
    Channel(ChannelInfo),
    CurrentTime(u32),
}

impl DeviceResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceResponse::Ok => "ok",
            DeviceResponse::SelfInfo(_) => "self_info",
            DeviceResponse::Contacts(_) => "contacts",
            DeviceResponse::Sent(_) => "sent",
            DeviceResponse::Message(_) => "message",
            DeviceResponse::NoMoreMessages => "no_more_messages",
            DeviceResponse::Battery(_) => "battery",
            DeviceResponse::DeviceInfo(_) => "device_info",
            DeviceResponse::Channel(_) => "channel",
            DeviceResponse::CurrentTime(_) => "current_time",
        }
    }
}
