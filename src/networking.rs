use futures::{Sink, SinkExt};
use log::debug;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::frame::{Frame, FrameCodec};

pub type FrameStream = FramedRead<OwnedReadHalf, FrameCodec>;
pub type FrameSink = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// Connect to the relay server.
pub async fn establish_connection(relay_addr: &str) -> Result<TcpStream, ChatError> {
    let stream = TcpStream::connect(relay_addr).await?;
    // chat frames are small; don't let Nagle hold them back
    stream.set_nodelay(true)?;
    debug!("Connected to relay server at {}", relay_addr);
    Ok(stream)
}

/// Split a connection into independently owned frame reader and writer halves.
pub fn split_framed(stream: TcpStream) -> (FrameStream, FrameSink) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, FrameCodec),
        FramedWrite::new(write_half, FrameCodec),
    )
}

/// Write `frame` through a shared sink unless `shutdown` fires first.
///
/// Returns `Ok(false)` if cancelled. The pending write is abandoned and the
/// lock released, so a peer that stopped reading cannot hold up shutdown.
pub async fn send_unless_cancelled<W>(
    writer: &Mutex<W>,
    frame: Frame,
    shutdown: &CancellationToken,
) -> Result<bool, ChatError>
where
    W: Sink<Frame, Error = ChatError> + Unpin,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Ok(false),
        sent = async { writer.lock().await.send(frame).await } => sent.map(|()| true),
    }
}
