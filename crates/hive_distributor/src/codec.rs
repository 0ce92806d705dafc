//! Frame codec — length-prefixed binary frames carrying one [`Message`].
//!
//! Layout (big-endian):
//!
//! ```text
//! [u32 frame length][u32 magic][u128 message id][u32 addr-len][addr bytes][u32 port][payload]
//! ```
//!
//! `frame length` covers everything after itself. Any decoding failure is
//! fatal to the connection; frames are not resynchronised.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::address::{read_address, write_address};
use crate::error::EncodingError;
use crate::message::Message;
use crate::serializer::Serializer;

/// Marks the start of every frame.
pub const FRAME_MAGIC: u32 = 0xFA45_27D8;

/// Largest frame body accepted unless configured otherwise (1 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

const LENGTH_FIELD: usize = 4;
/// Magic plus message id.
const HEADER_LEN: usize = 4 + 16;

/// Encoder/decoder for [`Message`] frames, delegating the payload to a
/// [`Serializer`].
pub struct FrameCodec<E> {
    serializer: Arc<dyn Serializer<E>>,
    max_frame_length: usize,
}

impl<E> FrameCodec<E> {
    pub fn new(serializer: Arc<dyn Serializer<E>>) -> Self {
        Self {
            serializer,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Append one encoded frame to `dst`. On error `dst` is left as it was.
    pub fn encode_message(&self, message: &Message<E>, dst: &mut BytesMut) -> Result<(), EncodingError> {
        let start = dst.len();
        let result = self.write_frame(message, dst);
        if result.is_err() {
            dst.truncate(start);
        }
        result
    }

    fn write_frame(&self, message: &Message<E>, dst: &mut BytesMut) -> Result<(), EncodingError> {
        let source = message
            .source()
            .ok_or(EncodingError::MissingSource(message.id()))?;

        let start = dst.len();
        dst.put_u32(0);
        dst.put_u32(FRAME_MAGIC);
        dst.put_u128(message.id().as_u128());
        write_address(dst, &source);
        {
            let mut writer = (&mut *dst).writer();
            self.serializer.serialize(&mut writer, message.payload())?;
        }

        let length = dst.len() - start - LENGTH_FIELD;
        if length > self.max_frame_length {
            return Err(EncodingError::FrameTooLarge {
                length,
                max: self.max_frame_length,
            });
        }
        // Bounded by max_frame_length, which is configured well below u32::MAX.
        let length = u32::try_from(length).map_err(|_| EncodingError::FrameTooLarge {
            length,
            max: self.max_frame_length,
        })?;
        dst[start..start + LENGTH_FIELD].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }

    fn decode_body(&self, mut frame: BytesMut) -> Result<Message<E>, EncodingError> {
        if frame.len() < HEADER_LEN {
            return Err(EncodingError::Truncated {
                needed: HEADER_LEN,
                available: frame.len(),
            });
        }

        let magic = frame.get_u32();
        if magic != FRAME_MAGIC {
            return Err(EncodingError::BadMagic(magic));
        }

        let id = Uuid::from_u128(frame.get_u128());
        let source = read_address(&mut frame)?;
        let payload = self.serializer.deserialize(&mut frame.reader())?;
        Ok(Message::incoming(id, source, payload))
    }
}

impl<E> Clone for FrameCodec<E> {
    fn clone(&self) -> Self {
        Self {
            serializer: Arc::clone(&self.serializer),
            max_frame_length: self.max_frame_length,
        }
    }
}

impl<E> fmt::Debug for FrameCodec<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_frame_length", &self.max_frame_length)
            .finish_non_exhaustive()
    }
}

impl<E> Decoder for FrameCodec<E> {
    type Item = Message<E>;
    type Error = EncodingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_FIELD {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_FIELD];
        length_bytes.copy_from_slice(&src[..LENGTH_FIELD]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_length {
            return Err(EncodingError::FrameTooLarge {
                length,
                max: self.max_frame_length,
            });
        }

        if src.len() < LENGTH_FIELD + length {
            src.reserve(LENGTH_FIELD + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD);
        let frame = src.split_to(length);
        self.decode_body(frame).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(message) => Ok(Some(message)),
            None if buf.is_empty() => Ok(None),
            None => Err(EncodingError::Truncated {
                needed: LENGTH_FIELD.max(peek_length(buf) + LENGTH_FIELD),
                available: buf.len(),
            }),
        }
    }
}

impl<E> Encoder<Message<E>> for FrameCodec<E> {
    type Error = EncodingError;

    fn encode(&mut self, message: Message<E>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_message(&message, dst)
    }
}

fn peek_length(buf: &BytesMut) -> usize {
    if buf.len() < LENGTH_FIELD {
        return 0;
    }
    let mut length_bytes = [0u8; LENGTH_FIELD];
    length_bytes.copy_from_slice(&buf[..LENGTH_FIELD]);
    u32::from_be_bytes(length_bytes) as usize
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
