//! Length-prefixed framing for Kerberos over stream transports.
//!
//! Every message on a stream transport is `[4-byte big-endian length][DER
//! bytes]` ([RFC 4120 7.2.2](https://www.rfc-editor.org/rfc/rfc4120#section-7.2.2)).
//! The codec carries raw DER frames; message parsing stays with the caller.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{Error, ErrorKind, Result};

/// Upper bound on a single Kerberos message, on the wire or in a datagram.
///
/// Tickets carrying authorization data run to tens of kilobytes. Anything
/// beyond this is treated as a framing error rather than buffered.
pub const MAX_MESSAGE_LEN: usize = 128 * 1024;

const PREFIX_LEN: usize = 4;

/// Codec for the 4-byte big-endian length framing used by both the client
/// stream transport and the KDC acceptor.
#[derive(Debug, Clone)]
pub struct KrbStreamCodec {
    max_frame_len: usize,
}

impl Default for KrbStreamCodec {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_MESSAGE_LEN,
        }
    }
}

impl KrbStreamCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Decoder for KrbStreamCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let mut declared = [0_u8; PREFIX_LEN];
        declared.copy_from_slice(&src[0..PREFIX_LEN]);
        let frame_len = u32::from_be_bytes(declared) as usize;

        if frame_len == 0 {
            return Err(Error::new(ErrorKind::FrameMismatch, "peer sent an empty frame"));
        }

        if frame_len > self.max_frame_len {
            return Err(Error::new(
                ErrorKind::FrameMismatch,
                format!(
                    "declared frame length {} exceeds the {} byte limit",
                    frame_len, self.max_frame_len
                ),
            ));
        }

        if src.len() < PREFIX_LEN + frame_len {
            src.reserve(PREFIX_LEN + frame_len - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        Ok(Some(src.split_to(frame_len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::new(
                ErrorKind::FrameMismatch,
                format!("stream closed mid-frame with {} bytes pending", src.len()),
            )),
        }
    }
}

impl Encoder<Vec<u8>> for KrbStreamCodec {
    type Error = Error;

    fn encode(&mut self, message: Vec<u8>, dst: &mut BytesMut) -> Result<()> {
        self.encode(message.as_slice(), dst)
    }
}

impl Encoder<&[u8]> for KrbStreamCodec {
    type Error = Error;

    fn encode(&mut self, message: &[u8], dst: &mut BytesMut) -> Result<()> {
        if message.is_empty() || message.len() > self.max_frame_len {
            return Err(Error::new(
                ErrorKind::FrameMismatch,
                format!("refusing to send a {} byte frame", message.len()),
            ));
        }

        dst.reserve(PREFIX_LEN + message.len());
        dst.put_u32(message.len() as u32);
        dst.extend_from_slice(message);
        Ok(())
    }
}
