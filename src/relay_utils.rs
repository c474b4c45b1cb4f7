use std::net::SocketAddr;

use futures::{Sink, SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::time::timeout;

use crate::error::ChatError;
use crate::frame::Frame;
use crate::networking::{split_framed, FrameStream};
use crate::{CHANNEL_CAPACITY, OUTBOX_CAPACITY, WRITE_TIMEOUT};

pub type ConnectionId = u64;

/// A registered client. Frames reach its socket through `outbox`, which is
/// drained by the client's own writer task.
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub outbox: Sender<Frame>,
}

/// Active connections in connect order. Ids are never reused.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Vec<Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: Vec::new(),
        }
    }

    /// Returns `false` (and drops `connection`) if the id is already registered.
    pub fn insert(&mut self, connection: Connection) -> bool {
        if self.contains(connection.id) {
            return false;
        }
        self.connections.push(connection);
        true
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let index = self.connections.iter().position(|c| c.id == id)?;
        Some(self.connections.remove(index))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.iter().any(|c| c.id == id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|c| c.id).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Queue `frame` unchanged for every connection except `from`.
    ///
    /// Never waits on a socket. A client whose outbox is full (it stopped
    /// reading) or whose writer has already stopped is returned as failed;
    /// delivery to the rest is unaffected.
    pub fn broadcast(&self, from: ConnectionId, frame: &Frame) -> Vec<ConnectionId> {
        let mut failed = Vec::new();

        for connection in self.connections.iter().filter(|c| c.id != from) {
            match connection.outbox.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Client {} ({}) is not reading, {} frames queued",
                        connection.id, connection.addr, OUTBOX_CAPACITY
                    );
                    failed.push(connection.id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Writer for client {} has already stopped", connection.id);
                    failed.push(connection.id);
                }
            }
        }

        failed
    }
}

pub struct NewConnection {
    pub stream: TcpStream,
    pub addr: SocketAddr,
}

pub enum Message {
    NewConnection(NewConnection),
    Frame(ConnectionId, Frame),
    /// The connection ended without sending a close frame, or its writes failed.
    Disconnected(ConnectionId),
}

/// Sole owner of the registry. Connection tasks and the acceptor talk to it
/// over `receiver_channel`, so the registry is never iterated mid-removal.
/// The manager itself never awaits a socket.
pub struct ConnectionManager {
    registry: ConnectionRegistry,
    next_id: ConnectionId,
    sender_channel: Sender<Message>,
    receiver_channel: Receiver<Message>,
}

impl ConnectionManager {
    pub fn new(sender_channel: Sender<Message>, receiver_channel: Receiver<Message>) -> Self {
        ConnectionManager {
            registry: ConnectionRegistry::new(),
            next_id: 0,
            sender_channel,
            receiver_channel,
        }
    }

    fn register(&mut self, connection: NewConnection) {
        let id = self.next_id;
        self.next_id += 1;

        let NewConnection { stream, addr } = connection;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }
        let (reader, writer) = split_framed(stream);
        let (outbox, queued) = mpsc::channel(OUTBOX_CAPACITY);
        tokio::spawn(read_connection(id, reader, self.sender_channel.clone()));
        tokio::spawn(write_connection(id, writer, queued, self.sender_channel.clone()));

        self.registry.insert(Connection { id, addr, outbox });
        info!("Client {} connected from {} ({} active)", id, addr, self.registry.len());
    }

    fn relay_frame(&mut self, from: ConnectionId, frame: Frame) {
        if !self.registry.contains(from) {
            debug!("Dropping frame from removed client {}", from);
            return;
        }

        let failed = self.registry.broadcast(from, &frame);
        if frame.is_close() {
            // the writer task flushes what is queued, then closes our half
            self.registry.remove(from);
            info!("Client {} disconnected ({} active)", from, self.registry.len());
        }
        self.drop_connections(failed);
    }

    /// Remove connections that vanished without a close frame or stopped
    /// reading, and tell the remaining clients so they re-key with whoever
    /// connects next.
    fn drop_connections(&mut self, mut pending: Vec<ConnectionId>) {
        while let Some(id) = pending.pop() {
            if self.registry.remove(id).is_none() {
                continue;
            }
            info!("Client {} dropped ({} active)", id, self.registry.len());

            match Frame::close(Vec::new()) {
                Ok(notice) => pending.extend(self.registry.broadcast(id, &notice)),
                Err(e) => warn!("Could not build disconnect notice: {}", e),
            }
        }
    }
}

/// Process connection events until the last registered client leaves.
pub async fn relay_manager(mut manager: ConnectionManager) {
    while let Some(message) = manager.receiver_channel.recv().await {
        let removal = match message {
            Message::NewConnection(connection) => {
                manager.register(connection);
                false
            }
            Message::Frame(from, frame) => {
                let close = frame.is_close();
                manager.relay_frame(from, frame);
                close
            }
            Message::Disconnected(id) => {
                manager.drop_connections(vec![id]);
                true
            }
        };

        if removal && manager.registry.is_empty() {
            info!("No clients left, relay manager exiting");
            return;
        }
    }
}

/// Read frames from one client and hand them to the manager, in stream order.
pub async fn read_connection(
    id: ConnectionId,
    mut reader: FrameStream,
    manager_channel: Sender<Message>,
) {
    while let Some(next) = reader.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping client {}: {}", id, e);
                break;
            }
        };

        let close = frame.is_close();
        if manager_channel.send(Message::Frame(id, frame)).await.is_err() {
            debug!("Relay manager gone, stopping reader for client {}", id);
            return;
        }
        if close {
            return;
        }
    }

    debug!("Client {} left without a close frame", id);
    if manager_channel.send(Message::Disconnected(id)).await.is_err() {
        debug!("Relay manager gone, client {} disconnect not reported", id);
    }
}

/// Drain one client's outbox onto its socket.
///
/// A write that fails, or blocks longer than [`WRITE_TIMEOUT`], reports the
/// client as disconnected. Once the manager drops the outbox the remaining
/// frames are flushed and the write half is closed.
pub async fn write_connection<W>(
    id: ConnectionId,
    mut writer: W,
    mut outbox: Receiver<Frame>,
    manager_channel: Sender<Message>,
) where
    W: Sink<Frame, Error = ChatError> + Unpin,
{
    while let Some(frame) = outbox.recv().await {
        let failure = match timeout(WRITE_TIMEOUT, writer.send(frame)).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("write blocked for {:?}", WRITE_TIMEOUT),
        };

        warn!("Dropping client {}: {}", id, failure);
        if manager_channel.send(Message::Disconnected(id)).await.is_err() {
            debug!("Relay manager gone, client {} disconnect not reported", id);
        }
        return;
    }

    match timeout(WRITE_TIMEOUT, writer.close()).await {
        Ok(Ok(())) => debug!("Closed connection to client {}", id),
        Ok(Err(e)) => debug!("Error closing connection to client {}: {}", id, e),
        Err(_) => debug!("Gave up closing connection to client {}", id),
    }
}

/// Accept clients on `listener` and relay frames between them.
///
/// Returns once the relay manager exits, i.e. after the last client leaves.
pub async fn serve(listener: TcpListener) -> Result<(), ChatError> {
    let (sender_channel, receiver_channel) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let manager = ConnectionManager::new(sender_channel.clone(), receiver_channel);
    let mut manager_handle = tokio::spawn(relay_manager(manager));

    loop {
        tokio::select! {
            finished = &mut manager_handle => {
                finished?;
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    let message = Message::NewConnection(NewConnection { stream, addr });
                    if sender_channel.send(message).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
        }
    }
}
