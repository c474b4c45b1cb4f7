//! # Commands Module
//!
//! Command handlers for ferry:
//!
//! ## `chat`
//! Runs one chat peer:
//! - Prompts for a display name (at most 16 characters)
//! - Connects to the relay and performs the key exchange
//! - Encrypts typed lines and prints decrypted messages from the peer
//! - Re-keys automatically when the peer leaves and someone new joins
//!
//! ## `relay`
//! Runs the relay server:
//! - Accepts client connections
//! - Forwards every frame to all other clients without decrypting it
//! - Drops clients that send a close frame or disconnect

pub mod chat;
pub mod relay;
