use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::MAX_USERNAME_LEN;

/// Plaintext carried inside every sealed envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub body: MessageBody,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Sent once per epoch right after the handshake completes.
    Joined,
    Text(String),
    /// Sealed into the close frame when a key is available.
    Leaving,
}

impl ChatMessage {
    pub fn text(sender: &str, text: &str) -> Self {
        ChatMessage {
            sender: sender.to_string(),
            body: MessageBody::Text(text.to_string()),
        }
    }

    pub fn joined(sender: &str) -> Self {
        ChatMessage {
            sender: sender.to_string(),
            body: MessageBody::Joined,
        }
    }

    pub fn leaving(sender: &str) -> Self {
        ChatMessage {
            sender: sender.to_string(),
            body: MessageBody::Leaving,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChatError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChatError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Display names are limited to 16 characters (not bytes).
pub fn validate_username(name: &str) -> Result<(), ChatError> {
    let length = name.chars().count();
    if length > MAX_USERNAME_LEN {
        return Err(ChatError::InvalidUsername(format!(
            "must be at most {} characters, got {}",
            MAX_USERNAME_LEN, length
        )));
    }
    Ok(())
}
