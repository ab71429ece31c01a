//! MeshCore companion protocol payloads: request encoding and frame decoding.
//!
//! Only the commands, responses and pushes the gateway uses are covered.
//! Integers are little-endian; coordinates are signed micro-degrees; names
//! are NUL padded UTF-8.

use super::commands::DeviceRequest;
use super::events::{Advertisement, ChannelMessage, DeliveryAck, DeviceEvent, DirectMessage, PathUpdate};
use super::types::{BatteryInfo, ChannelInfo, DeviceContact, DeviceInfo, SelfInfo, SentInfo};
use thiserror::Error;

pub mod cmd {
    pub const APP_START: u8 = 1;
    pub const SEND_TXT_MSG: u8 = 2;
    pub const SEND_CHANNEL_TXT_MSG: u8 = 3;
    pub const GET_CONTACTS: u8 = 4;
    pub const SET_DEVICE_TIME: u8 = 6;
    pub const SEND_SELF_ADVERT: u8 = 7;
    pub const ADD_UPDATE_CONTACT: u8 = 9;
    pub const SYNC_NEXT_MESSAGE: u8 = 10;
    pub const REMOVE_CONTACT: u8 = 15;
    pub const GET_BATTERY: u8 = 20;
    pub const DEVICE_QUERY: u8 = 22;
    pub const GET_CHANNEL: u8 = 31;
    pub const SET_CHANNEL: u8 = 32;
    pub const SET_OTHER_PARAMS: u8 = 38;
}

pub mod resp {
    pub const OK: u8 = 0;
    pub const ERR: u8 = 1;
    pub const CONTACTS_START: u8 = 2;
    pub const CONTACT: u8 = 3;
    pub const END_OF_CONTACTS: u8 = 4;
    pub const SELF_INFO: u8 = 5;
    pub const SENT: u8 = 6;
    pub const CONTACT_MSG_RECV: u8 = 7;
    pub const CHANNEL_MSG_RECV: u8 = 8;
    pub const CURR_TIME: u8 = 9;
    pub const NO_MORE_MESSAGES: u8 = 10;
    pub const BATTERY: u8 = 12;
    pub const DEVICE_INFO: u8 = 13;
    pub const CONTACT_MSG_RECV_V3: u8 = 16;
    pub const CHANNEL_MSG_RECV_V3: u8 = 17;
    pub const CHANNEL_INFO: u8 = 18;
}

pub mod push {
    pub const ADVERT: u8 = 0x80;
    pub const PATH_UPDATED: u8 = 0x81;
    pub const SEND_CONFIRMED: u8 = 0x82;
    pub const MSG_WAITING: u8 = 0x83;
    pub const NEW_ADVERT: u8 = 0x8a;
}

/// App protocol version announced in APP_START / DEVICE_QUERY.
const APP_VERSION: u8 = 3;
const APP_NAME: &[u8] = b"meshgate";

const CONTACT_RECORD_LEN: usize = 147;
const NAME_FIELD_LEN: usize = 32;
const OUT_PATH_FIELD_LEN: usize = 64;
const TXT_TYPE_SIGNED: u8 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("{what} frame truncated: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Ok,
    Err(Option<u8>),
    ContactsStart(u32),
    Contact(DeviceContact),
    EndOfContacts(u32),
    SelfInfo(SelfInfo),
    Sent(SentInfo),
    Message(DeviceEvent),
    CurrentTime(u32),
    NoMoreMessages,
    Battery(BatteryInfo),
    DeviceInfo(DeviceInfo),
    Channel(ChannelInfo),
    Push(DeviceEvent),
    MessagesWaiting,
    Unknown(u8),
}

struct Reader<'a> {
    what: &'static str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(what: &'static str, data: &'a [u8]) -> Self {
        Self { what, data, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), FrameError> {
        if self.pos + n > self.data.len() {
            return Err(FrameError::Truncated {
                what: self.what,
                need: self.pos + n,
                have: self.data.len(),
            });
        }
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        self.need(n)?;
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.bytes(1)?[0])
    }

    fn i8(&mut self) -> Result<i8, FrameError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, FrameError> {
        Ok(self.u32()? as i32)
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        out
    }

    fn fixed_str(&mut self, n: usize) -> Result<String, FrameError> {
        Ok(nul_trimmed(self.bytes(n)?))
    }
}

fn nul_trimmed(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

fn coord(micro: i32) -> Option<f64> {
    if micro == 0 {
        None
    } else {
        Some(micro as f64 / 1_000_000.0)
    }
}

fn coord_to_micro(v: Option<f64>) -> i32 {
    v.map(|d| (d * 1_000_000.0).round() as i32).unwrap_or(0)
}

fn snr_from_byte(b: i8) -> f32 {
    b as f32 / 4.0
}

fn write_fixed(out: &mut Vec<u8>, s: &[u8], len: usize) {
    let take = s.len().min(len.saturating_sub(1));
    out.extend_from_slice(&s[..take]);
    out.extend(std::iter::repeat(0u8).take(len - take));
}

fn decode_contact(r: &mut Reader<'_>) -> Result<DeviceContact, FrameError> {
    r.need(CONTACT_RECORD_LEN)?;
    let public_key = hex::encode(r.bytes(32)?);
    let adv_type = r.u8()?;
    let flags = r.u8()?;
    let out_path_len = r.i8()?;
    let path_field = r.bytes(OUT_PATH_FIELD_LEN)?;
    let used = if out_path_len > 0 {
        (out_path_len as usize).min(OUT_PATH_FIELD_LEN)
    } else {
        0
    };
    let name = r.fixed_str(NAME_FIELD_LEN)?;
    let last_advert = r.u32()?;
    let adv_lat = coord(r.i32()?);
    let adv_lon = coord(r.i32()?);
    let lastmod = r.u32()?;
    Ok(DeviceContact {
        public_key,
        adv_type,
        flags,
        out_path_len,
        out_path: path_field[..used].to_vec(),
        name,
        last_advert,
        adv_lat,
        adv_lon,
        lastmod,
    })
}

fn encode_contact(out: &mut Vec<u8>, c: &DeviceContact) {
    let key = hex::decode(&c.public_key).unwrap_or_default();
    let mut key_field = [0u8; 32];
    let n = key.len().min(32);
    key_field[..n].copy_from_slice(&key[..n]);
    out.extend_from_slice(&key_field);
    out.push(c.adv_type);
    out.push(c.flags);
    out.push(c.out_path_len as u8);
    let mut path_field = [0u8; OUT_PATH_FIELD_LEN];
    let n = c.out_path.len().min(OUT_PATH_FIELD_LEN);
    path_field[..n].copy_from_slice(&c.out_path[..n]);
    out.extend_from_slice(&path_field);
    write_fixed(out, c.name.as_bytes(), NAME_FIELD_LEN);
    out.extend_from_slice(&c.last_advert.to_le_bytes());
    out.extend_from_slice(&coord_to_micro(c.adv_lat).to_le_bytes());
    out.extend_from_slice(&coord_to_micro(c.adv_lon).to_le_bytes());
}

fn decode_self_info(r: &mut Reader<'_>) -> Result<SelfInfo, FrameError> {
    r.need(57)?;
    let adv_type = r.u8()?;
    let tx_power = r.u8()?;
    let max_tx_power = r.u8()?;
    let public_key = hex::encode(r.bytes(32)?);
    let adv_lat = coord(r.i32()?);
    let adv_lon = coord(r.i32()?);
    let multi_acks = r.u8()?;
    let advert_loc_policy = r.u8()?;
    let telemetry_modes = r.u8()?;
    let manual_add_contacts = r.u8()? != 0;
    let radio_freq_khz = r.u32()?;
    let radio_bw_hz = r.u32()?;
    let radio_sf = r.u8()?;
    let radio_cr = r.u8()?;
    let name = nul_trimmed(r.rest());
    Ok(SelfInfo {
        name,
        public_key,
        adv_type,
        tx_power,
        max_tx_power,
        adv_lat,
        adv_lon,
        multi_acks,
        advert_loc_policy,
        telemetry_modes,
        manual_add_contacts,
        radio_freq_khz,
        radio_bw_hz,
        radio_sf,
        radio_cr,
    })
}

fn decode_contact_msg(r: &mut Reader<'_>, v3: bool, raw: &[u8]) -> Result<DeviceEvent, FrameError> {
    let snr = if v3 {
        let snr = snr_from_byte(r.i8()?);
        r.bytes(2)?;
        Some(snr)
    } else {
        None
    };
    let pubkey_prefix = hex::encode(r.bytes(6)?);
    let path_len = r.u8()?;
    let txt_type = r.u8()?;
    let sender_timestamp = r.u32()?;
    let signature = if txt_type == TXT_TYPE_SIGNED {
        Some(hex::encode(r.bytes(4)?))
    } else {
        None
    };
    let text = String::from_utf8_lossy(r.rest()).to_string();
    Ok(DeviceEvent::DirectMessage(DirectMessage {
        pubkey_prefix,
        path_len: (path_len != 0xff).then_some(path_len),
        txt_type,
        sender_timestamp,
        text,
        snr,
        signature,
        raw: Some(hex::encode(raw)),
    }))
}

fn decode_channel_msg(r: &mut Reader<'_>, v3: bool, raw: &[u8]) -> Result<DeviceEvent, FrameError> {
    let snr = if v3 {
        let snr = snr_from_byte(r.i8()?);
        r.bytes(2)?;
        Some(snr)
    } else {
        None
    };
    let channel_idx = r.u8()?;
    let path_len = r.u8()?;
    let txt_type = r.u8()?;
    let sender_timestamp = r.u32()?;
    let text = String::from_utf8_lossy(r.rest()).to_string();
    Ok(DeviceEvent::ChannelMessage(ChannelMessage {
        channel_idx,
        path_len: (path_len != 0xff).then_some(path_len),
        txt_type,
        sender_timestamp,
        text,
        snr,
        raw: Some(hex::encode(raw)),
    }))
}

fn decode_device_info(r: &mut Reader<'_>) -> Result<DeviceInfo, FrameError> {
    let firmware_version = r.u8()?;
    if firmware_version < 3 || r.remaining() < 79 {
        return Ok(DeviceInfo {
            firmware_version,
            max_contacts: None,
            max_channels: None,
            ble_pin: None,
            build_date: None,
            model: None,
            version: None,
        });
    }
    let max_contacts = r.u8()? as u16 * 2;
    let max_channels = r.u8()?;
    let ble_pin = r.u32()?;
    let build_date = r.fixed_str(12)?;
    let model = r.fixed_str(40)?;
    let version = r.fixed_str(20)?;
    Ok(DeviceInfo {
        firmware_version,
        max_contacts: Some(max_contacts),
        max_channels: Some(max_channels),
        ble_pin: Some(ble_pin),
        build_date: Some(build_date),
        model: Some(model),
        version: Some(version),
    })
}

/// Decode one inbound payload (framing already stripped).
pub fn decode(frame: &[u8]) -> Result<Decoded, FrameError> {
    let (&code, body) = frame.split_first().ok_or(FrameError::Empty)?;
    let decoded = match code {
        resp::OK => Decoded::Ok,
        resp::ERR => Decoded::Err(body.first().copied()),
        resp::CONTACTS_START => {
            let mut r = Reader::new("contacts_start", body);
            Decoded::ContactsStart(if r.remaining() >= 4 { r.u32()? } else { 0 })
        }
        resp::CONTACT => Decoded::Contact(decode_contact(&mut Reader::new("contact", body))?),
        resp::END_OF_CONTACTS => {
            let mut r = Reader::new("end_of_contacts", body);
            Decoded::EndOfContacts(if r.remaining() >= 4 { r.u32()? } else { 0 })
        }
        resp::SELF_INFO => Decoded::SelfInfo(decode_self_info(&mut Reader::new("self_info", body))?),
        resp::SENT => {
            let mut r = Reader::new("sent", body);
            let flood = r.u8()? != 0;
            let expected_ack = hex::encode(r.bytes(4)?);
            let suggested_timeout_ms = r.u32()?;
            Decoded::Sent(SentInfo {
                flood,
                expected_ack,
                suggested_timeout_ms,
            })
        }
        resp::CONTACT_MSG_RECV => {
            Decoded::Message(decode_contact_msg(&mut Reader::new("contact_msg", body), false, frame)?)
        }
        resp::CONTACT_MSG_RECV_V3 => {
            Decoded::Message(decode_contact_msg(&mut Reader::new("contact_msg_v3", body), true, frame)?)
        }
        resp::CHANNEL_MSG_RECV => {
            Decoded::Message(decode_channel_msg(&mut Reader::new("channel_msg", body), false, frame)?)
        }
        resp::CHANNEL_MSG_RECV_V3 => {
            Decoded::Message(decode_channel_msg(&mut Reader::new("channel_msg_v3", body), true, frame)?)
        }
        resp::CURR_TIME => Decoded::CurrentTime(Reader::new("curr_time", body).u32()?),
        resp::NO_MORE_MESSAGES => Decoded::NoMoreMessages,
        resp::BATTERY => {
            let mut r = Reader::new("battery", body);
            let millivolts = r.u16()?;
            let (used_kb, total_kb) = if r.remaining() >= 8 {
                (Some(r.u32()?), Some(r.u32()?))
            } else {
                (None, None)
            };
            Decoded::Battery(BatteryInfo {
                millivolts,
                used_kb,
                total_kb,
            })
        }
        resp::DEVICE_INFO => Decoded::DeviceInfo(decode_device_info(&mut Reader::new("device_info", body))?),
        resp::CHANNEL_INFO => {
            let mut r = Reader::new("channel_info", body);
            let index = r.u8()?;
            let name = r.fixed_str(NAME_FIELD_LEN)?;
            let secret = hex::encode(r.bytes(16)?);
            Decoded::Channel(ChannelInfo {
                index,
                name,
                secret,
            })
        }
        push::ADVERT => {
            let mut r = Reader::new("advert", body);
            Decoded::Push(DeviceEvent::Advertisement(Advertisement {
                public_key: hex::encode(r.bytes(32)?),
                name: None,
                adv_type: None,
                lat: None,
                lon: None,
                timestamp: None,
                snr: None,
            }))
        }
        push::PATH_UPDATED => {
            let mut r = Reader::new("path_updated", body);
            Decoded::Push(DeviceEvent::PathUpdate(PathUpdate {
                public_key: hex::encode(r.bytes(32)?),
                path: None,
                path_len: None,
                snr: None,
            }))
        }
        push::SEND_CONFIRMED => {
            let mut r = Reader::new("send_confirmed", body);
            let code = hex::encode(r.bytes(4)?);
            let round_trip_ms = if r.remaining() >= 4 { Some(r.u32()?) } else { None };
            Decoded::Push(DeviceEvent::DeliveryAck(DeliveryAck {
                code,
                round_trip_ms,
            }))
        }
        push::MSG_WAITING => Decoded::MessagesWaiting,
        push::NEW_ADVERT => Decoded::Push(DeviceEvent::NewContact(decode_contact(&mut Reader::new(
            "new_advert",
            body,
        ))?)),
        other => Decoded::Unknown(other),
    };
    Ok(decoded)
}

/// Encode a request payload (framing added by the caller).
pub fn encode(request: &DeviceRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    match request {
        DeviceRequest::AppStart => {
            out.push(cmd::APP_START);
            out.push(APP_VERSION);
            out.extend_from_slice(&[0u8; 6]);
            out.extend_from_slice(APP_NAME);
        }
        DeviceRequest::DeviceQuery => {
            out.push(cmd::DEVICE_QUERY);
            out.push(APP_VERSION);
        }
        DeviceRequest::GetContacts => out.push(cmd::GET_CONTACTS),
        DeviceRequest::SendChannelMessage {
            channel,
            text,
            timestamp,
        } => {
            out.push(cmd::SEND_CHANNEL_TXT_MSG);
            out.push(0);
            out.push(*channel);
            out.extend_from_slice(&timestamp.to_le_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        DeviceRequest::SendDirectMessage {
            recipient_prefix,
            text,
            timestamp,
            attempt,
        } => {
            out.push(cmd::SEND_TXT_MSG);
            out.push(0);
            out.push(*attempt);
            out.extend_from_slice(&timestamp.to_le_bytes());
            out.extend_from_slice(recipient_prefix);
            out.extend_from_slice(text.as_bytes());
        }
        DeviceRequest::SyncNextMessage => out.push(cmd::SYNC_NEXT_MESSAGE),
        DeviceRequest::GetBattery => out.push(cmd::GET_BATTERY),
        DeviceRequest::GetChannel(idx) => {
            out.push(cmd::GET_CHANNEL);
            out.push(*idx);
        }
        DeviceRequest::SetChannel {
            index,
            name,
            secret,
        } => {
            out.push(cmd::SET_CHANNEL);
            out.push(*index);
            write_fixed(&mut out, name.as_bytes(), NAME_FIELD_LEN);
            out.extend_from_slice(secret);
        }
        DeviceRequest::SendAdvert { flood } => {
            out.push(cmd::SEND_SELF_ADVERT);
            if *flood {
                out.push(1);
            }
        }
        DeviceRequest::AddUpdateContact(contact) => {
            out.push(cmd::ADD_UPDATE_CONTACT);
            encode_contact(&mut out, contact);
        }
        DeviceRequest::RemoveContact(key) => {
            out.push(cmd::REMOVE_CONTACT);
            out.extend_from_slice(key);
        }
        DeviceRequest::SetOtherParams {
            manual_add_contacts,
            telemetry_modes,
            advert_loc_policy,
            multi_acks,
        } => {
            out.push(cmd::SET_OTHER_PARAMS);
            out.push(u8::from(*manual_add_contacts));
            out.push(*telemetry_modes);
            out.push(*advert_loc_policy);
            out.push(*multi_acks);
        }
        DeviceRequest::SetDeviceTime(ts) => {
            out.push(cmd::SET_DEVICE_TIME);
            out.extend_from_slice(&ts.to_le_bytes());
        }
    }
    out
}

/// Response codes (besides `ERR`) that can answer `request`.
pub fn answer_codes(request: &DeviceRequest) -> &'static [u8] {
    match request {
        DeviceRequest::AppStart => &[resp::SELF_INFO],
        DeviceRequest::DeviceQuery => &[resp::DEVICE_INFO],
        DeviceRequest::GetContacts => &[resp::CONTACTS_START, resp::CONTACT, resp::END_OF_CONTACTS],
        DeviceRequest::SendChannelMessage { .. } => &[resp::OK, resp::SENT],
        DeviceRequest::SendDirectMessage { .. } => &[resp::SENT],
        DeviceRequest::SyncNextMessage => &[
            resp::CONTACT_MSG_RECV,
            resp::CHANNEL_MSG_RECV,
            resp::CONTACT_MSG_RECV_V3,
            resp::CHANNEL_MSG_RECV_V3,
            resp::NO_MORE_MESSAGES,
        ],
        DeviceRequest::GetBattery => &[resp::BATTERY],
        DeviceRequest::GetChannel(_) => &[resp::CHANNEL_INFO],
        DeviceRequest::SetChannel { .. }
        | DeviceRequest::SendAdvert { .. }
        | DeviceRequest::AddUpdateContact(_)
        | DeviceRequest::RemoveContact(_)
        | DeviceRequest::SetOtherParams { .. }
        | DeviceRequest::SetDeviceTime(_) => &[resp::OK],
    }
}

/// Whether a response frame with `code` can answer `request`. Used to tell a
/// late answer to an expired request from the answer to the current one.
pub fn answers(request: &DeviceRequest, code: u8) -> bool {
    code == resp::ERR || answer_codes(request).contains(&code)
}

/// Whether a late answer to `a` could be mistaken for the answer to `b`.
/// Frames carry no request id, so only the response code tells them apart.
pub fn share_answers(a: &DeviceRequest, b: &DeviceRequest) -> bool {
    let theirs = answer_codes(b);
    answer_codes(a).iter().any(|code| theirs.contains(code))
}

/// Human-readable text for a device error code.
pub fn error_text(code: Option<u8>) -> String {
    match code {
        Some(1) => "unsupported command".to_string(),
        Some(2) => "not found".to_string(),
        Some(3) => "table full".to_string(),
        Some(4) => "bad state".to_string(),
        Some(5) => "file i/o error".to_string(),
        Some(6) => "illegal argument".to_string(),
        Some(c) => format!("error code {}", c),
        None => "unspecified error".to_string(),
    }
}
