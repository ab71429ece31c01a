//! Input validation for values that end up on the radio or in the contact table.

use sha2::{Digest, Sha256};

/// Longest text payload the companion firmware accepts in one message.
pub const MAX_TEXT_BYTES: usize = 160;
/// Channel names are stored in a fixed 32-byte field, NUL terminated.
pub const MAX_CHANNEL_NAME_BYTES: usize = 31;
/// Public keys are 32 bytes, 64 hex characters.
pub const PUBLIC_KEY_HEX_LEN: usize = 64;
/// Direct messages address the recipient by a 6-byte key prefix.
pub const KEY_PREFIX_BYTES: usize = 6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("public key must be {PUBLIC_KEY_HEX_LEN} hex characters")]
    BadPublicKey,

    #[error("key prefix must be an even number of hex characters (at least 2)")]
    BadKeyPrefix,

    #[error("channel index {index} out of range (0-{max})")]
    ChannelOutOfRange { index: u8, max: u8 },

    #[error("channel secret must be 32 hex characters")]
    BadChannelSecret,

    #[error("channel name must be 1-{MAX_CHANNEL_NAME_BYTES} bytes")]
    BadChannelName,

    #[error("message text is empty")]
    EmptyText,

    #[error("message text too long (max {MAX_TEXT_BYTES} bytes)")]
    TextTooLong,
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Lowercase and check a full public key.
pub fn normalize_public_key(key: &str) -> Result<String, ValidationError> {
    let key = key.trim();
    if key.len() != PUBLIC_KEY_HEX_LEN || !is_hex(key) {
        return Err(ValidationError::BadPublicKey);
    }
    Ok(key.to_ascii_lowercase())
}

/// Lowercase and check a key prefix (any even length up to a full key).
pub fn normalize_key_prefix(prefix: &str) -> Result<String, ValidationError> {
    let prefix = prefix.trim();
    if prefix.len() < 2
        || prefix.len() % 2 != 0
        || prefix.len() > PUBLIC_KEY_HEX_LEN
        || !is_hex(prefix)
    {
        return Err(ValidationError::BadKeyPrefix);
    }
    Ok(prefix.to_ascii_lowercase())
}

pub fn validate_channel_index(index: u8, max_channels: u8) -> Result<u8, ValidationError> {
    if index >= max_channels {
        return Err(ValidationError::ChannelOutOfRange {
            index,
            max: max_channels.saturating_sub(1),
        });
    }
    Ok(index)
}

pub fn validate_channel_name(name: &str) -> Result<&str, ValidationError> {
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_CHANNEL_NAME_BYTES {
        return Err(ValidationError::BadChannelName);
    }
    Ok(name)
}

/// Decode a 16-byte channel secret given as 32 hex characters.
pub fn parse_channel_secret(secret_hex: &str) -> Result<[u8; 16], ValidationError> {
    let secret_hex = secret_hex.trim();
    if secret_hex.len() != 32 {
        return Err(ValidationError::BadChannelSecret);
    }
    let bytes = hex::decode(secret_hex).map_err(|_| ValidationError::BadChannelSecret)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Hashtag channels (`#name`) share a key derived from the name itself:
/// the first 16 bytes of SHA-256 over the full name including `#`.
pub fn hashtag_channel_secret(name: &str) -> Option<[u8; 16]> {
    if !name.starts_with('#') {
        return None;
    }
    let digest = Sha256::digest(name.as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    Some(out)
}

pub fn validate_message_text(text: &str) -> Result<&str, ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyText);
    }
    if text.len() > MAX_TEXT_BYTES {
        return Err(ValidationError::TextTooLong);
    }
    Ok(text)
}
