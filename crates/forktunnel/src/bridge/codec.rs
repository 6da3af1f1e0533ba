//! Framed codec for the bridge.
//!
//! Fixed binary layout, big-endian throughout:
//!
//! ```text
//! event_name_len : u16
//! event_name     : event_name_len bytes (UTF-8)
//! payload_len    : u32
//! payload        : payload_len bytes (opaque serialized event)
//! dispatcher     : u16
//! ```
//!
//! Encoding is byte-exact: identical envelopes produce identical bytes, which
//! is the interoperability contract between the two process-local codecs.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{DispatcherIndex, Envelope};

const NAME_LEN_BYTES: usize = 2;
const PAYLOAD_LEN_BYTES: usize = 4;
const INDEX_BYTES: usize = 2;

/// Codec for one [`Envelope`] per frame.
///
/// `decode` returns `Ok(None)` while the buffer holds less than one whole
/// frame; the relay decides whether that means "no data yet" (empty buffer at
/// a frame boundary) or desynchronization (a partial frame that can never
/// complete, since a write always finishes before the peer is notified).
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < NAME_LEN_BYTES {
            return Ok(None);
        }
        let name_len = u16::from_be_bytes([src[0], src[1]]) as usize;

        let payload_len_at = NAME_LEN_BYTES + name_len;
        if src.len() < payload_len_at + PAYLOAD_LEN_BYTES {
            return Ok(None);
        }
        let payload_len = u32::from_be_bytes([
            src[payload_len_at],
            src[payload_len_at + 1],
            src[payload_len_at + 2],
            src[payload_len_at + 3],
        ]) as usize;

        let total = payload_len_at + PAYLOAD_LEN_BYTES + payload_len + INDEX_BYTES;
        if src.len() < total {
            return Ok(None);
        }

        src.advance(NAME_LEN_BYTES);
        let name_bytes = src.split_to(name_len);
        let event_name = std::str::from_utf8(&name_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .to_string();
        src.advance(PAYLOAD_LEN_BYTES);
        let payload = src.split_to(payload_len).freeze();
        let dispatcher = DispatcherIndex::new(src.get_u16());

        Ok(Some(Envelope {
            event_name,
            payload,
            dispatcher,
        }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let name = item.event_name.as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "event name exceeds wire limit")
        })?;
        let payload_len = u32::try_from(item.payload.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds wire limit")
        })?;

        dst.reserve(
            NAME_LEN_BYTES + name.len() + PAYLOAD_LEN_BYTES + item.payload.len() + INDEX_BYTES,
        );
        dst.put_u16(name_len);
        dst.put_slice(name);
        dst.put_u32(payload_len);
        dst.put_slice(&item.payload);
        dst.put_u16(item.dispatcher.as_u16());
        Ok(())
    }
}
