//! Wire frames exchanged between peers and the relay.
//!
//! Every frame is a 6-byte header followed by the payload:
//!
//! ```text
//! byte 0      close flag   (0 or 1)
//! byte 1      key flag     (0 or 1)
//! bytes 2-5   payload length, big-endian u32
//! bytes 6..   payload      (32-byte curve point when the key flag is set,
//!                           otherwise nonce(16) || tag(16) || ciphertext)
//! ```
//!
//! TCP is a byte stream, so a single read may hold half a frame or several
//! frames at once. [`FrameCodec`] buffers until a whole frame is available and
//! is what every reader in the crate goes through.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use x25519_dalek::PublicKey;

use crate::error::ChatError;
use crate::{HEADER_LEN, KEY_SIZE, MAX_PAYLOAD_LEN};

/// One immutable protocol frame. The length field is always the payload length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    close: bool,
    key: bool,
    payload: Bytes,
}

impl Frame {
    /// Build a frame, enforcing the same header rules the decoder applies.
    pub fn new(close: bool, key: bool, payload: impl Into<Bytes>) -> Result<Self, ChatError> {
        let payload = payload.into();
        check_length(key, payload.len())?;
        Ok(Frame { close, key, payload })
    }

    /// Key-exchange frame carrying the fixed-width encoding of a public point.
    pub fn key_exchange(public_key: &PublicKey) -> Self {
        Frame {
            close: false,
            key: true,
            payload: Bytes::copy_from_slice(public_key.as_bytes()),
        }
    }

    pub fn chat(envelope: impl Into<Bytes>) -> Result<Self, ChatError> {
        Self::new(false, false, envelope)
    }

    pub fn close(payload: impl Into<Bytes>) -> Result<Self, ChatError> {
        Self::new(true, false, payload)
    }

    pub fn is_close(&self) -> bool {
        self.close
    }

    pub fn is_key(&self) -> bool {
        self.key
    }

    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the peer's public point out of a key-exchange frame.
    pub fn peer_public_key(&self) -> Result<PublicKey, ChatError> {
        let bytes: [u8; KEY_SIZE] = self.payload.as_ref().try_into().map_err(|_| {
            ChatError::MalformedFrame(format!(
                "key frame carries {} bytes, expected {}",
                self.payload.len(),
                KEY_SIZE
            ))
        })?;
        Ok(PublicKey::from(bytes))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode one complete frame from the front of `src`.
    ///
    /// Fails with [`ChatError::MalformedFrame`] if `src` holds fewer than
    /// `6 + length` bytes. Stream readers should use [`FrameCodec`] instead,
    /// which waits for more bytes rather than failing.
    pub fn decode(src: &[u8]) -> Result<Frame, ChatError> {
        let header = Header::parse(src)?.ok_or_else(|| {
            ChatError::MalformedFrame(format!(
                "truncated header: {} of {} bytes",
                src.len(),
                HEADER_LEN
            ))
        })?;

        let available = src.len() - HEADER_LEN;
        if available < header.length {
            return Err(ChatError::MalformedFrame(format!(
                "truncated payload: {} of {} bytes",
                available, header.length
            )));
        }

        Ok(Frame {
            close: header.close,
            key: header.key,
            payload: Bytes::copy_from_slice(&src[HEADER_LEN..HEADER_LEN + header.length]),
        })
    }

    fn encode_into(&self, dst: &mut BytesMut) {
        dst.put_u8(self.close as u8);
        dst.put_u8(self.key as u8);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }
}

struct Header {
    close: bool,
    key: bool,
    length: usize,
}

impl Header {
    /// `Ok(None)` until all six header bytes are present.
    fn parse(src: &[u8]) -> Result<Option<Header>, ChatError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let close = parse_flag(src[0], "close")?;
        let key = parse_flag(src[1], "key")?;
        let length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
        check_length(key, length)?;

        Ok(Some(Header { close, key, length }))
    }
}

fn parse_flag(byte: u8, name: &str) -> Result<bool, ChatError> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ChatError::MalformedFrame(format!(
            "{} flag must be 0 or 1, got {}",
            name, other
        ))),
    }
}

fn check_length(key: bool, length: usize) -> Result<(), ChatError> {
    if length > MAX_PAYLOAD_LEN {
        return Err(ChatError::MalformedFrame(format!(
            "payload of {} bytes exceeds limit of {}",
            length, MAX_PAYLOAD_LEN
        )));
    }
    if key && length != KEY_SIZE {
        return Err(ChatError::MalformedFrame(format!(
            "key frame length must be {}, got {}",
            KEY_SIZE, length
        )));
    }
    Ok(())
}

/// Length-delimited reassembly of [`Frame`]s on a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ChatError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ChatError> {
        let header = match Header::parse(src)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let frame_len = HEADER_LEN + header.length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(header.length).freeze();
        Ok(Some(Frame {
            close: header.close,
            key: header.key,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ChatError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ChatError> {
        dst.reserve(HEADER_LEN + frame.payload.len());
        frame.encode_into(dst);
        Ok(())
    }
}
