//! A chat peer: one connection to the relay, a send worker and a receive worker.
//!
//! The receive worker owns the read half and runs every handshake. The send
//! worker owns the user's input. Both write through the same mutex-guarded
//! sink so whole frames never interleave, and both stop on a shared
//! [`CancellationToken`].
//!
//! The epoch key lives behind an `RwLock<Option<SharedKey>>`. It is cleared
//! when the peer leaves and replaced when the next handshake completes, so the
//! send worker sees the old key, no key, or the new key but never a mix.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::cryptography::{open, seal, SharedKey};
use crate::error::ChatError;
use crate::frame::Frame;
use crate::key_exchange::{perform_key_exchange, HandshakeResult, KeyExchange, Outcome};
use crate::networking::{
    establish_connection, send_unless_cancelled, split_framed, FrameSink, FrameStream,
};
use crate::utils::{validate_username, ChatMessage, MessageBody};
use crate::{CLOSE_COMMAND, CLOSE_TIMEOUT};

/// What the session reports back to whoever renders the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A handshake finished and a new epoch key is in use.
    Keyed,
    Joined(String),
    Message { sender: String, text: String },
    /// A chat frame failed to authenticate under the current key.
    DecryptionFailed,
    /// The peer left (name is known if its close frame could be opened).
    PeerDisconnected(Option<String>),
    /// Text typed while no key was established; it was not sent.
    Undelivered(String),
    ConnectionLost,
    Closed,
}

type SharedSink = Arc<Mutex<FrameSink>>;
type KeySlot = Arc<RwLock<Option<SharedKey>>>;

pub struct Session {
    username: String,
    reader: FrameStream,
    writer: SharedSink,
    key: KeySlot,
    shutdown: CancellationToken,
}

impl Session {
    pub async fn connect(relay_addr: &str, username: &str) -> Result<Self, ChatError> {
        validate_username(username)?;
        let stream = establish_connection(relay_addr).await?;
        Ok(Self::new(stream, username))
    }

    pub fn new(stream: TcpStream, username: &str) -> Self {
        let (reader, writer) = split_framed(stream);
        Session {
            username: username.to_string(),
            reader,
            writer: Arc::new(Mutex::new(writer)),
            key: Arc::new(RwLock::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that ends the session from outside (same effect as the close command).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the send and receive workers until the user closes the session or
    /// the relay connection is lost.
    ///
    /// `input` carries the user's lines; [`CLOSE_COMMAND`] or the end of the
    /// channel terminates the session. Events are delivered on `events`.
    pub async fn run(
        self,
        input: mpsc::Receiver<String>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<(), ChatError> {
        let Session {
            username,
            reader,
            writer,
            key,
            shutdown,
        } = self;

        let sender = SendWorker {
            username: username.clone(),
            writer: writer.clone(),
            key: key.clone(),
            shutdown: shutdown.clone(),
            events: events.clone(),
        };
        let receiver = ReceiveWorker {
            username,
            reader,
            writer,
            key,
            shutdown: shutdown.clone(),
            events: events.clone(),
        };

        let send_token = shutdown.clone();
        let send_handle = tokio::spawn(async move {
            let result = sender.run(input).await;
            send_token.cancel();
            result
        });
        let receive_token = shutdown.clone();
        let receive_handle = tokio::spawn(async move {
            let result = receiver.run().await;
            receive_token.cancel();
            result
        });

        let (send_result, receive_result) = tokio::join!(send_handle, receive_handle);
        let send_result = send_result?;
        let receive_result = receive_result?;

        if let Some(e) = receive_result.as_ref().err().or(send_result.as_ref().err()) {
            warn!("Session worker stopped: {}", e);
            notify(&events, SessionEvent::ConnectionLost).await;
        }
        notify(&events, SessionEvent::Closed).await;

        send_result.and(receive_result)
    }
}

async fn notify(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if events.send(event).await.is_err() {
        debug!("Event receiver dropped");
    }
}

struct SendWorker {
    username: String,
    writer: SharedSink,
    key: KeySlot,
    shutdown: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
}

impl SendWorker {
    async fn run(self, mut input: mpsc::Receiver<String>) -> Result<(), ChatError> {
        loop {
            let line = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Send worker stopping");
                    return self.close().await;
                }
                line = input.recv() => line,
            };

            match line {
                Some(line) if line != CLOSE_COMMAND => self.send_text(line).await?,
                _ => return self.close().await,
            }
        }
    }

    async fn send_text(&self, text: String) -> Result<(), ChatError> {
        let current = self.key.read().await.clone();
        let Some(key) = current else {
            notify(&self.events, SessionEvent::Undelivered(text)).await;
            return Ok(());
        };

        let plaintext = ChatMessage::text(&self.username, &text).to_bytes()?;
        let envelope = seal(key.as_bytes(), &plaintext)?;
        if !send_unless_cancelled(&*self.writer, Frame::chat(envelope)?, &self.shutdown).await? {
            debug!("Shutdown interrupted an outgoing message");
        }
        Ok(())
    }

    /// Signal the receive worker first, then make one bounded attempt to get
    /// the close frame out.
    async fn close(&self) -> Result<(), ChatError> {
        self.shutdown.cancel();

        let current = self.key.read().await.clone();
        let payload = match current {
            Some(key) => seal(key.as_bytes(), &ChatMessage::leaving(&self.username).to_bytes()?)?,
            None => Vec::new(),
        };
        let frame = Frame::close(payload)?;

        let goodbye = async {
            let mut writer = self.writer.lock().await;
            writer.send(frame).await?;
            writer.close().await
        };
        match timeout(CLOSE_TIMEOUT, goodbye).await {
            Ok(Ok(())) => info!("Session closed"),
            Ok(Err(e)) => debug!("Close frame not delivered: {}", e),
            Err(_) => warn!("Relay did not accept the close frame within {:?}", CLOSE_TIMEOUT),
        }
        Ok(())
    }
}

struct ReceiveWorker {
    username: String,
    reader: FrameStream,
    writer: SharedSink,
    key: KeySlot,
    shutdown: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
}

impl ReceiveWorker {
    async fn run(mut self) -> Result<(), ChatError> {
        let mut exchange = KeyExchange::new();

        loop {
            let epoch_key = match perform_key_exchange(
                &mut exchange,
                &mut self.reader,
                &*self.writer,
                &self.shutdown,
            )
            .await?
            {
                HandshakeResult::Keyed(key) => key,
                HandshakeResult::PeerClosed => {
                    notify(&self.events, SessionEvent::PeerDisconnected(None)).await;
                    continue;
                }
                HandshakeResult::Cancelled => return Ok(()),
            };

            *self.key.write().await = Some(epoch_key.clone());
            notify(&self.events, SessionEvent::Keyed).await;
            self.announce(&epoch_key).await?;

            if !self.receive_epoch(&mut exchange, &epoch_key).await? {
                return Ok(());
            }
        }
    }

    async fn announce(&self, key: &SharedKey) -> Result<(), ChatError> {
        let plaintext = ChatMessage::joined(&self.username).to_bytes()?;
        let envelope = seal(key.as_bytes(), &plaintext)?;
        send_unless_cancelled(&*self.writer, Frame::chat(envelope)?, &self.shutdown).await?;
        Ok(())
    }

    /// Handle traffic for one epoch. Returns `false` once the session is
    /// shutting down, `true` when the peer left and a new handshake is due.
    async fn receive_epoch(
        &mut self,
        exchange: &mut KeyExchange,
        key: &SharedKey,
    ) -> Result<bool, ChatError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(false),
                next = self.reader.next() => next,
            };
            let frame = match next {
                Some(frame) => frame?,
                None if self.shutdown.is_cancelled() => return Ok(false),
                None => return Err(ChatError::ConnectionLost),
            };

            if frame.is_close() || frame.is_key() {
                if exchange.handle_frame(&frame)? == Outcome::PeerClosed {
                    *self.key.write().await = None;
                    let name = departing_peer(key, &frame);
                    info!("Peer disconnected, starting a new key exchange");
                    notify(&self.events, SessionEvent::PeerDisconnected(name)).await;
                    return Ok(true);
                }
                debug!("Ignoring duplicate key frame");
                continue;
            }

            let event = match open(key.as_bytes(), frame.payload())
                .and_then(|plaintext| ChatMessage::from_bytes(&plaintext))
            {
                Ok(message) => match message.body {
                    MessageBody::Joined => SessionEvent::Joined(message.sender),
                    MessageBody::Text(text) => SessionEvent::Message {
                        sender: message.sender,
                        text,
                    },
                    MessageBody::Leaving => {
                        debug!("Leaving notice outside a close frame");
                        continue;
                    }
                },
                Err(ChatError::DecryptionFailed) | Err(ChatError::Serialization(_)) => {
                    SessionEvent::DecryptionFailed
                }
                Err(e) => return Err(e),
            };
            notify(&self.events, event).await;
        }
    }
}

/// Best effort: the relay's synthetic close frames are empty.
fn departing_peer(key: &SharedKey, frame: &Frame) -> Option<String> {
    if frame.payload().is_empty() {
        return None;
    }
    let plaintext = open(key.as_bytes(), frame.payload()).ok()?;
    match ChatMessage::from_bytes(&plaintext).ok()? {
        ChatMessage {
            sender,
            body: MessageBody::Leaving,
        } => Some(sender),
        _ => None,
    }
}
