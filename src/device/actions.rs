//! Command methods exposed to the API layer.
//!
//! Every method fails fast when the radio is not connected, runs its request
//! through the [`CommandBridge`](super::bridge::CommandBridge), records the
//! result in storage and answers with a [`CommandOutcome`]. Errors become
//! `ok: false` outcomes; nothing here panics or returns `Err`.

use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value};

use super::commands::{DeviceRequest, DeviceResponse};
use super::ingest::contact_from_device;
use super::lifecycle::{DeviceManager, MANUAL_ADD_SETTING};
use super::types::DeviceContact;
use crate::error::{GatewayError, GatewayResult};
use crate::logutil::{escape_log, short_key, truncate_for_log};
use crate::storage::{blocking, ContactSource, Direction, NewChannelMessage, NewDirectMessage};
use crate::validation::{
    hashtag_channel_secret, normalize_key_prefix, normalize_public_key, parse_channel_secret,
    validate_channel_index, validate_channel_name, validate_message_text, KEY_PREFIX_BYTES,
};

/// Uniform result shape handed to the API layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub data: Value,
}

impl CommandOutcome {
    pub fn success(message: impl Into<String>, data: Value) -> Self {
        Self {
            ok: true,
            message: Some(message.into()),
            error: None,
            data,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: None,
            error: Some(error.into()),
            data: Value::Null,
        }
    }
}

impl From<GatewayError> for CommandOutcome {
    fn from(e: GatewayError) -> Self {
        CommandOutcome::failure(e.to_string())
    }
}

fn settle(result: GatewayResult<CommandOutcome>) -> CommandOutcome {
    result.unwrap_or_else(|e| {
        warn!("Command failed: {}", e);
        CommandOutcome::from(e)
    })
}

fn unexpected(command: &str, response: &DeviceResponse) -> GatewayError {
    GatewayError::DeviceRejected(format!(
        "unexpected {} response to {}",
        response.kind(),
        command
    ))
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl DeviceManager {
    fn ensure_connected(&self) -> GatewayResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    async fn call(&self, request: DeviceRequest) -> GatewayResult<DeviceResponse> {
        self.ensure_connected()?;
        self.bridge().call(request).await
    }

    pub async fn send_channel_message(&self, channel: u8, text: &str) -> CommandOutcome {
        settle(self.try_send_channel_message(channel, text).await)
    }

    async fn try_send_channel_message(&self, channel: u8, text: &str) -> GatewayResult<CommandOutcome> {
        self.ensure_connected()?;
        validate_channel_index(channel, self.config.max_channels)?;
        let text = validate_message_text(text)?;
        let now = Utc::now().timestamp();
        self.call(DeviceRequest::SendChannelMessage {
            channel,
            text: text.to_string(),
            timestamp: now as u32,
        })
        .await?;

        let sender = self
            .status()
            .device_name
            .unwrap_or_else(|| self.config.device_name.clone());
        let row = NewChannelMessage {
            channel_idx: channel,
            sender,
            content: text.to_string(),
            timestamp: now,
            sender_timestamp: Some(now),
            is_own: true,
            txt_type: 0,
            snr: None,
            path_len: None,
            pkt_payload: None,
        };
        let id = blocking(|| self.store.insert_channel_message(&row))?;
        info!("Sent on ch{}: {}", channel, truncate_for_log(text, 80));
        Ok(CommandOutcome::success(
            format!("Message sent on channel {}", channel),
            json!({ "id": id, "timestamp": now }),
        ))
    }

    /// Resolve a recipient given as full key, contact name or key prefix.
    fn resolve_recipient(&self, recipient: &str) -> GatewayResult<String> {
        if let Ok(key) = normalize_public_key(recipient) {
            return Ok(key);
        }
        if let Some(contact) = self.store.find_contact_by_name(recipient)? {
            return Ok(contact.public_key);
        }
        if let Ok(prefix) = normalize_key_prefix(recipient) {
            if let Some(contact) = self.store.find_contact_by_prefix(&prefix)? {
                return Ok(contact.public_key);
            }
        }
        Err(GatewayError::InvalidInput(format!(
            "unknown recipient '{}'",
            escape_log(recipient)
        )))
    }

    pub async fn send_dm(&self, recipient: &str, text: &str) -> CommandOutcome {
        settle(self.try_send_dm(recipient, text).await)
    }

    async fn try_send_dm(&self, recipient: &str, text: &str) -> GatewayResult<CommandOutcome> {
        self.ensure_connected()?;
        let text = validate_message_text(text)?;
        let key = self.resolve_recipient(recipient)?;
        let mut prefix = [0u8; KEY_PREFIX_BYTES];
        let decoded = hex::decode(&key[..KEY_PREFIX_BYTES * 2])
            .map_err(|e| GatewayError::InvalidInput(format!("bad recipient key: {}", e)))?;
        prefix.copy_from_slice(&decoded);

        let now = Utc::now().timestamp();
        let response = self
            .call(DeviceRequest::SendDirectMessage {
                recipient_prefix: prefix,
                text: text.to_string(),
                timestamp: now as u32,
                attempt: 0,
            })
            .await?;
        let sent = match response {
            DeviceResponse::Sent(sent) => Some(sent),
            DeviceResponse::Ok => None,
            other => return Err(unexpected("send_direct_message", &other)),
        };
        let expected_ack = sent.as_ref().map(|s| s.expected_ack.clone());

        let row = NewDirectMessage {
            contact_pubkey: key.clone(),
            direction: Direction::Out,
            content: text.to_string(),
            timestamp: now,
            sender_timestamp: Some(now),
            txt_type: 0,
            snr: None,
            path_len: None,
            expected_ack: expected_ack.clone(),
            signature: None,
            pkt_payload: None,
        };
        let id = blocking(|| self.store.insert_direct_message(&row))?;
        info!("Sent DM to {}: {}", short_key(&key), truncate_for_log(text, 80));
        Ok(CommandOutcome::success(
            "Direct message sent",
            json!({
                "id": id,
                "timestamp": now,
                "expected_ack": expected_ack,
                "suggested_timeout_ms": sent.map(|s| s.suggested_timeout_ms),
            }),
        ))
    }

    pub async fn get_channel(&self, index: u8) -> CommandOutcome {
        settle(self.try_get_channel(index).await)
    }

    async fn try_get_channel(&self, index: u8) -> GatewayResult<CommandOutcome> {
        validate_channel_index(index, self.config.max_channels)?;
        match self.call(DeviceRequest::GetChannel(index)).await? {
            DeviceResponse::Channel(channel) => Ok(CommandOutcome::success(
                format!("Channel {}", index),
                to_json(&channel),
            )),
            other => Err(unexpected("get_channel", &other)),
        }
    }

    /// Configure a slot. Without an explicit secret, `#name` channels get
    /// their name-derived key and anything else a random one.
    pub async fn set_channel(&self, index: u8, name: &str, secret: Option<&str>) -> CommandOutcome {
        settle(self.try_set_channel(index, name, secret).await)
    }

    async fn try_set_channel(
        &self,
        index: u8,
        name: &str,
        secret: Option<&str>,
    ) -> GatewayResult<CommandOutcome> {
        self.ensure_connected()?;
        validate_channel_index(index, self.config.max_channels)?;
        let name = validate_channel_name(name)?;
        let secret = match secret.map(str::trim).filter(|s| !s.is_empty()) {
            Some(hex_secret) => parse_channel_secret(hex_secret)?,
            None => hashtag_channel_secret(name).unwrap_or_else(rand::random::<[u8; 16]>),
        };
        self.call(DeviceRequest::SetChannel {
            index,
            name: name.to_string(),
            secret,
        })
        .await?;
        let secret_hex = hex::encode(secret);
        blocking(|| self.store.upsert_channel(index, name, Some(&secret_hex)))?;
        info!("Channel {} set to {}", index, escape_log(name));
        Ok(CommandOutcome::success(
            format!("Channel {} configured", index),
            json!({ "index": index, "name": name, "secret": secret_hex }),
        ))
    }

    pub async fn add_channel(&self, name: &str, secret: Option<&str>) -> CommandOutcome {
        settle(self.try_add_channel(name, secret).await)
    }

    async fn try_add_channel(&self, name: &str, secret: Option<&str>) -> GatewayResult<CommandOutcome> {
        self.ensure_connected()?;
        validate_channel_name(name)?;
        for index in 1..self.config.max_channels {
            match self.call(DeviceRequest::GetChannel(index)).await {
                Ok(DeviceResponse::Channel(slot)) if slot.is_empty() => {
                    return self.try_set_channel(index, name, secret).await;
                }
                Ok(_) => continue,
                // The device has fewer slots than configured.
                Err(GatewayError::DeviceRejected(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Err(GatewayError::InvalidInput("no free channel slots".to_string()))
    }

    pub async fn remove_channel(&self, index: u8) -> CommandOutcome {
        settle(self.try_remove_channel(index).await)
    }

    async fn try_remove_channel(&self, index: u8) -> GatewayResult<CommandOutcome> {
        if index == 0 {
            return Err(GatewayError::InvalidInput(
                "Cannot remove Public channel".to_string(),
            ));
        }
        self.ensure_connected()?;
        validate_channel_index(index, self.config.max_channels)?;
        self.call(DeviceRequest::SetChannel {
            index,
            name: String::new(),
            secret: [0u8; 16],
        })
        .await?;
        blocking(|| self.store.delete_channel(index))?;
        info!("Channel {} removed", index);
        Ok(CommandOutcome::success(
            format!("Channel {} removed", index),
            json!({ "index": index }),
        ))
    }

    pub async fn send_advert(&self, flood: bool) -> CommandOutcome {
        settle(self.try_send_advert(flood).await)
    }

    async fn try_send_advert(&self, flood: bool) -> GatewayResult<CommandOutcome> {
        self.call(DeviceRequest::SendAdvert { flood }).await?;
        let kind = if flood { "flood" } else { "zero-hop" };
        info!("Sent {} advert", kind);
        Ok(CommandOutcome::success(
            format!("Sent {} advert", kind),
            json!({ "flood": flood }),
        ))
    }

    pub async fn get_device_info(&self) -> CommandOutcome {
        settle(self.try_get_device_info().await)
    }

    async fn try_get_device_info(&self) -> GatewayResult<CommandOutcome> {
        match self.call(DeviceRequest::DeviceQuery).await? {
            DeviceResponse::DeviceInfo(info) => Ok(CommandOutcome::success(
                "Device info",
                json!({ "device": info, "self_info": self.status().self_info }),
            )),
            other => Err(unexpected("device_query", &other)),
        }
    }

    pub async fn get_battery(&self) -> CommandOutcome {
        settle(self.try_get_battery().await)
    }

    async fn try_get_battery(&self) -> GatewayResult<CommandOutcome> {
        match self.call(DeviceRequest::GetBattery).await? {
            DeviceResponse::Battery(battery) => Ok(CommandOutcome::success(
                format!("Battery {} mV", battery.millivolts),
                to_json(&battery),
            )),
            other => Err(unexpected("get_battery", &other)),
        }
    }

    /// Refresh the contacts table from the device.
    pub async fn get_contacts_from_device(&self) -> CommandOutcome {
        settle(self.try_get_contacts_from_device().await)
    }

    async fn try_get_contacts_from_device(&self) -> GatewayResult<CommandOutcome> {
        let contacts = match self.call(DeviceRequest::GetContacts).await? {
            DeviceResponse::Contacts(list) => list,
            other => return Err(unexpected("get_contacts", &other)),
        };
        blocking(|| {
            contacts.iter().try_for_each(|contact| {
                self.store
                    .upsert_contact(&contact_from_device(contact, ContactSource::Device))
            })
        })?;
        Ok(CommandOutcome::success(
            format!("Synced {} contacts", contacts.len()),
            json!({ "count": contacts.len() }),
        ))
    }

    pub fn pending_contacts(&self) -> Vec<DeviceContact> {
        self.pending.list()
    }

    pub async fn approve_pending_contact(&self, public_key: &str) -> CommandOutcome {
        settle(self.try_approve_pending_contact(public_key).await)
    }

    async fn try_approve_pending_contact(&self, public_key: &str) -> GatewayResult<CommandOutcome> {
        self.ensure_connected()?;
        let key = normalize_public_key(public_key)?;
        let contact = self.pending.take(&key).ok_or_else(|| {
            GatewayError::InvalidInput(format!("no pending contact {}", short_key(&key)))
        })?;
        if let Err(e) = self
            .call(DeviceRequest::AddUpdateContact(contact.clone()))
            .await
        {
            self.pending.restore(contact);
            return Err(e);
        }
        blocking(|| {
            self.store
                .upsert_contact(&contact_from_device(&contact, ContactSource::Device))
        })?;
        info!("Approved contact {} ({})", short_key(&key), escape_log(&contact.name));
        Ok(CommandOutcome::success(
            format!("Contact {} approved", contact.name),
            json!({ "public_key": key, "name": contact.name }),
        ))
    }

    /// Switch manual contact approval on the device and remember the choice.
    pub async fn set_manual_add_contacts(&self, enabled: bool) -> CommandOutcome {
        settle(self.try_set_manual_add_contacts(enabled).await)
    }

    async fn try_set_manual_add_contacts(&self, enabled: bool) -> GatewayResult<CommandOutcome> {
        self.ensure_connected()?;
        let info = self.status().self_info.ok_or(GatewayError::NotConnected)?;
        self.call(DeviceRequest::SetOtherParams {
            manual_add_contacts: enabled,
            telemetry_modes: info.telemetry_modes,
            advert_loc_policy: info.advert_loc_policy,
            multi_acks: info.multi_acks,
        })
        .await?;
        blocking(|| {
            self.store
                .set_setting(MANUAL_ADD_SETTING, if enabled { "true" } else { "false" })
        })?;
        self.pending.set_enabled(enabled);
        info!(
            "Manual contact approval {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(CommandOutcome::success(
            format!(
                "Manual contact approval {}",
                if enabled { "enabled" } else { "disabled" }
            ),
            json!({ "manual_add_contacts": enabled }),
        ))
    }

    /// Remove a contact from the device and from storage. Protected
    /// contacts are refused.
    pub async fn delete_contact(&self, public_key: &str) -> CommandOutcome {
        settle(self.try_delete_contact(public_key).await)
    }

    async fn try_delete_contact(&self, public_key: &str) -> GatewayResult<CommandOutcome> {
        self.ensure_connected()?;
        let key = normalize_public_key(public_key)?;
        if let Some(contact) = blocking(|| self.store.get_contact(&key))? {
            if contact.is_protected {
                return Err(GatewayError::InvalidInput(format!(
                    "contact {} is protected",
                    short_key(&key)
                )));
            }
        }
        let mut raw = [0u8; 32];
        let bytes = hex::decode(&key)
            .map_err(|e| GatewayError::InvalidInput(format!("bad public key: {}", e)))?;
        raw.copy_from_slice(&bytes);
        match self.call(DeviceRequest::RemoveContact(raw)).await {
            Ok(_) => {}
            Err(GatewayError::DeviceRejected(reason)) => {
                warn!("Device did not remove {}: {}", short_key(&key), reason);
            }
            Err(e) => return Err(e),
        }
        let removed = blocking(|| self.store.delete_contact(&key))?;
        info!("Deleted contact {}", short_key(&key));
        Ok(CommandOutcome::success(
            format!("Contact {} deleted", short_key(&key)),
            json!({ "public_key": key, "removed": removed }),
        ))
    }

    /// Storage only; works while disconnected.
    pub fn set_contact_protected(&self, public_key: &str, protected: bool) -> CommandOutcome {
        settle(self.try_set_contact_protected(public_key, protected))
    }

    fn try_set_contact_protected(&self, public_key: &str, protected: bool) -> GatewayResult<CommandOutcome> {
        let key = normalize_public_key(public_key)?;
        if !self.store.set_contact_protected(&key, protected)? {
            return Err(GatewayError::InvalidInput(format!(
                "unknown contact {}",
                short_key(&key)
            )));
        }
        Ok(CommandOutcome::success(
            format!(
                "Contact {} {}",
                short_key(&key),
                if protected { "protected" } else { "unprotected" }
            ),
            json!({ "public_key": key, "is_protected": protected }),
        ))
    }

    /// Delivery state for outgoing DM ack codes. Storage only.
    pub fn delivery_status(&self, codes: &[String]) -> CommandOutcome {
        settle(self.try_delivery_status(codes))
    }

    fn try_delivery_status(&self, codes: &[String]) -> GatewayResult<CommandOutcome> {
        let mut statuses = serde_json::Map::new();
        for code in codes {
            let code = code.trim().to_ascii_lowercase();
            let entry = match self.store.get_ack_for_code(&code)? {
                Some(ack) => json!({
                    "delivered": true,
                    "round_trip_ms": ack.round_trip_ms,
                    "received_at": ack.received_at,
                    "dm_id": ack.dm_id,
                }),
                None => json!({ "delivered": false }),
            };
            statuses.insert(code, entry);
        }
        Ok(CommandOutcome::success(
            format!("{} code(s) checked", codes.len()),
            Value::Object(statuses),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_without_empty_fields() {
        let ok = CommandOutcome::success("done", json!({"id": 4}));
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(v["data"]["id"], 4);
        assert!(v.get("error").is_none());

        let failed = CommandOutcome::from(GatewayError::NotConnected);
        assert!(!failed.ok);
        assert_eq!(failed.error.as_deref(), Some("device not connected"));
        assert_eq!(failed.data, Value::Null);
    }
}
