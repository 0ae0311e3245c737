//! Length-prefixed frame codec.
//!
//! Every message on a peer stream is framed as:
//!
//! ```text
//! +----------------+------------------+
//! |  Length        |  Payload         |
//! |  4 bytes (LE)  |  (Length bytes)  |
//! +----------------+------------------+
//! ```
//!
//! The payload is opaque at this layer; the envelope inside is decoded by
//! [`crate::message`]. Writes are flushed by the framed transport before the
//! send completes.

use crate::error::StreamError;
use crate::MAX_FRAME_BYTES;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length prefix.
const LEN_BYTES: usize = 4;

/// Frame codec enforcing the maximum message size in both directions.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    /// Create a codec with the default 20 MiB frame cap.
    pub fn new() -> Self {
        Self {
            max_frame: MAX_FRAME_BYTES,
        }
    }

    /// Create a codec with a custom frame cap.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_BYTES {
            return Ok(None);
        }

        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame {
            return Err(StreamError::FrameTooLarge {
                size: length,
                max: self.max_frame,
            });
        }

        let total = LEN_BYTES + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LEN_BYTES);
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            // EOF in the middle of a frame (or its length prefix).
            None if !src.is_empty() => Err(StreamError::ShortRead),
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = StreamError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame {
            return Err(StreamError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame,
            });
        }
        dst.reserve(LEN_BYTES + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from_static(b"hello stream");

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..4], &(payload.len() as u32).to_le_bytes());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"abcdef"), &mut buf).unwrap();

        let mut partial = buf.split_to(7);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert_eq!(
            codec.decode(&mut partial).unwrap().unwrap(),
            Bytes::from_static(b"abcdef")
        );
    }

    #[test]
    fn test_oversize_rejected_on_encode() {
        let mut codec = FrameCodec::with_max_frame(8);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Bytes::from(vec![0u8; 9]), &mut buf)
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::FrameTooLarge { size: 9, max: 8 }
        ));
    }

    #[test]
    fn test_oversize_rejected_on_decode() {
        let mut codec = FrameCodec::with_max_frame(8);
        let mut buf = BytesMut::new();
        buf.put_u32_le(9);
        buf.put_slice(&[0u8; 9]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            StreamError::FrameTooLarge { size: 9, max: 8 }
        ));
    }

    #[test]
    fn test_truncated_frame_is_short_read() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32_le(10);
        buf.put_slice(&[1, 2, 3]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, StreamError::ShortRead));
    }
}
