use std::time::Duration;

pub mod commands;
pub mod cryptography;
pub mod error;
pub mod frame;
pub mod key_exchange;
pub mod networking;
pub mod relay_utils;
pub mod session;
pub mod utils;

pub use error::ChatError;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;
pub const ENVELOPE_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// close flag (1) + key flag (1) + big-endian payload length (4)
pub const HEADER_LEN: usize = 6;
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

pub const MAX_USERNAME_LEN: usize = 16;
pub const CLOSE_COMMAND: &str = "close()";

pub const KEY_RETRY_INTERVAL: Duration = Duration::from_millis(10);
pub const CHANNEL_CAPACITY: usize = 100;

/// Frames queued per relay client before it counts as stalled.
pub const OUTBOX_CAPACITY: usize = 32;
/// Longest a single frame write may block before the connection is given up.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Budget for the best-effort close frame when a session shuts down.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
