//! Error types shared by the relay and the chat peers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    /// Truncated or inconsistent frame header/length.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    /// The envelope's authentication tag did not verify under the current key.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    /// The relay or peer socket closed unexpectedly.
    #[error("Connection lost")]
    ConnectionLost,

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for ChatError {
    fn from(e: bincode::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}
