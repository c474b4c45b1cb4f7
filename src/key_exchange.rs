//! Key-exchange handshake run by each peer.
//!
//! ```text
//! IDLE --start--> AWAITING_PEER_KEY --peer key frame--> KEYED
//!                        |                                |
//!                   close frame                      close frame
//!                        v                                v
//!                     CLOSED                            IDLE
//! ```
//!
//! There is no session identifier: whichever key frame is processed first while
//! awaiting becomes "the" peer for the epoch. With more than two clients on the
//! relay the pairing is therefore arbitrary, and nothing binds a public point
//! to a person, so a relay that rewrites key frames can sit in the middle.

use std::mem;

use futures::{Sink, Stream, StreamExt};
use log::{debug, info};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cryptography::{KeyPair, SharedKey};
use crate::error::ChatError;
use crate::frame::Frame;
use crate::networking::send_unless_cancelled;
use crate::KEY_RETRY_INTERVAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingPeerKey,
    Keyed,
    Closed,
}

enum HandshakeState {
    Idle,
    AwaitingPeerKey(KeyPair),
    Keyed(SharedKey),
    Closed,
}

/// What a received frame did to the handshake.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The peer's point arrived and the epoch key is ready.
    Keyed(SharedKey),
    /// The peer left; the state is now `Closed` (mid-handshake) or `Idle` (after keying).
    PeerClosed,
    /// Duplicate key frame or a chat frame that is not the handshake's business.
    Ignored,
}

pub struct KeyExchange {
    state: HandshakeState,
}

impl KeyExchange {
    pub fn new() -> Self {
        KeyExchange {
            state: HandshakeState::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            HandshakeState::Idle => Phase::Idle,
            HandshakeState::AwaitingPeerKey(_) => Phase::AwaitingPeerKey,
            HandshakeState::Keyed(_) => Phase::Keyed,
            HandshakeState::Closed => Phase::Closed,
        }
    }

    pub fn shared_key(&self) -> Option<&SharedKey> {
        match &self.state {
            HandshakeState::Keyed(key) => Some(key),
            _ => None,
        }
    }

    /// Begin a new epoch with a fresh key pair and return the key frame to
    /// retransmit until the peer answers. Any previous key is dropped.
    pub fn start(&mut self) -> Frame {
        let pair = KeyPair::generate();
        let frame = Frame::key_exchange(pair.public_key());
        self.state = HandshakeState::AwaitingPeerKey(pair);
        frame
    }

    pub fn handle_frame(&mut self, frame: &Frame) -> Result<Outcome, ChatError> {
        let peer_public = if frame.is_key() {
            Some(frame.peer_public_key()?)
        } else {
            None
        };

        let current = mem::replace(&mut self.state, HandshakeState::Idle);
        let (next, outcome) = match (current, peer_public) {
            (HandshakeState::AwaitingPeerKey(_), _) if frame.is_close() => {
                (HandshakeState::Closed, Outcome::PeerClosed)
            }
            (HandshakeState::AwaitingPeerKey(pair), Some(peer_public)) => {
                let key = pair.derive_shared_key(&peer_public);
                (HandshakeState::Keyed(key.clone()), Outcome::Keyed(key))
            }
            (HandshakeState::Keyed(_), _) if frame.is_close() => {
                (HandshakeState::Idle, Outcome::PeerClosed)
            }
            (state, _) => (state, Outcome::Ignored),
        };

        self.state = next;
        Ok(outcome)
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeResult {
    Keyed(SharedKey),
    /// A close frame arrived before any peer key.
    PeerClosed,
    /// Local termination was requested.
    Cancelled,
}

/// Drive `exchange` to completion over a framed connection.
///
/// Our key frame is sent immediately and then every [`KEY_RETRY_INTERVAL`]
/// while the reader is polled for the peer's frame. Once the peer key arrives
/// our key frame is sent one final time, so a peer that joined the relay after
/// our last retransmission still receives it.
pub async fn perform_key_exchange<R, W>(
    exchange: &mut KeyExchange,
    reader: &mut R,
    writer: &Mutex<W>,
    shutdown: &CancellationToken,
) -> Result<HandshakeResult, ChatError>
where
    R: Stream<Item = Result<Frame, ChatError>> + Unpin,
    W: Sink<Frame, Error = ChatError> + Unpin,
{
    let key_frame = exchange.start();
    debug!("Starting key exchange");

    let mut retry = tokio::time::interval(KEY_RETRY_INTERVAL);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => return Ok(HandshakeResult::Cancelled),

            next = reader.next() => {
                let frame = match next {
                    Some(frame) => frame?,
                    None => return Err(ChatError::ConnectionLost),
                };

                match exchange.handle_frame(&frame)? {
                    Outcome::Keyed(key) => {
                        if !send_unless_cancelled(writer, key_frame, shutdown).await? {
                            return Ok(HandshakeResult::Cancelled);
                        }
                        info!("Key exchange complete");
                        return Ok(HandshakeResult::Keyed(key));
                    }
                    Outcome::PeerClosed => {
                        info!("Peer left during key exchange");
                        return Ok(HandshakeResult::PeerClosed);
                    }
                    Outcome::Ignored => {
                        debug!("Dropping {}-byte frame received while awaiting peer key", frame.length());
                    }
                }
            }

            _ = retry.tick() => {
                if !send_unless_cancelled(writer, key_frame.clone(), shutdown).await? {
                    return Ok(HandshakeResult::Cancelled);
                }
            }
        }
    }
}
