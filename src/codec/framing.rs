//! Mode-switchable framing codec for `tokio_util::codec::Framed`.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::chunked::{encode_chunked, ChunkDecoder};
use super::{
    FramingError, FramingMode, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_OUTBOUND_CHUNK_SIZE, EOM_DELIMITER,
};

/// NETCONF framing codec.
///
/// Decodes inbound bytes into complete message spans and encodes outbound
/// messages, using one [`FramingMode`] for both directions.
#[derive(Debug)]
pub struct FramingCodec {
    mode: FramingMode,
    max_message_size: usize,
    outbound_chunk_size: usize,
    /// Offset up to which the read buffer has been searched for `]]>]]>`.
    eom_scanned: usize,
    chunks: ChunkDecoder,
    failed: bool,
}

impl FramingCodec {
    /// Create codec in end-of-message mode with the given message limit.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            mode: FramingMode::EndOfMessage,
            max_message_size,
            outbound_chunk_size: DEFAULT_OUTBOUND_CHUNK_SIZE,
            eom_scanned: 0,
            chunks: ChunkDecoder::new(DEFAULT_MAX_CHUNK_SIZE, max_message_size),
            failed: false,
        }
    }

    /// Set the maximum accepted size of one incoming chunk.
    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.chunks = ChunkDecoder::new(max_chunk_size, self.max_message_size);
        self
    }

    /// Set the size outgoing messages are split into in chunked mode.
    pub fn with_outbound_chunk_size(mut self, size: usize) -> Self {
        self.outbound_chunk_size = size.max(1);
        self
    }

    /// Current framing mode.
    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Switch framing mode.
    ///
    /// Only valid between messages, which is where the hello exchange
    /// leaves the stream. Bytes already buffered stay in the read buffer
    /// and are decoded with the new mode.
    pub fn set_mode(&mut self, mode: FramingMode) {
        if self.mode != mode {
            tracing::debug!("Framing switched from {} to {}", self.mode, mode);
        }
        self.mode = mode;
        self.eom_scanned = 0;
    }

    /// Whether a framing error already occurred.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn decode_eom(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        // Resume a few bytes back so a delimiter split across reads is found.
        let start = self.eom_scanned.saturating_sub(EOM_DELIMITER.len() - 1);
        if let Some(pos) = find(&src[start..], EOM_DELIMITER) {
            let end = start + pos;
            if end > self.max_message_size {
                return Err(FramingError::MessageTooLarge {
                    limit: self.max_message_size,
                });
            }
            let message = src.split_to(end).freeze();
            let _ = src.split_to(EOM_DELIMITER.len());
            self.eom_scanned = 0;
            return Ok(Some(message));
        }

        if src.len() > self.max_message_size + EOM_DELIMITER.len() {
            return Err(FramingError::MessageTooLarge {
                limit: self.max_message_size,
            });
        }
        self.eom_scanned = src.len();
        Ok(None)
    }
}

impl Default for FramingCodec {
    fn default() -> Self {
        Self::new(super::DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for FramingCodec {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.failed {
            return Err(FramingError::Poisoned);
        }
        let result = match self.mode {
            FramingMode::EndOfMessage => self.decode_eom(src),
            FramingMode::Chunked => self.chunks.decode(src),
        };
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        let chunk_pending = match self.mode {
            FramingMode::Chunked if !self.chunks.is_idle() => self.chunks.pending().max(1),
            _ => 0,
        };
        let trailing = src.iter().all(u8::is_ascii_whitespace);
        if chunk_pending == 0 && trailing {
            src.clear();
            return Ok(None);
        }
        self.failed = true;
        Err(FramingError::Truncated {
            pending: src.len() + chunk_pending,
        })
    }
}

impl Encoder<Bytes> for FramingCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.mode {
            FramingMode::EndOfMessage => {
                dst.reserve(item.len() + EOM_DELIMITER.len());
                dst.put_slice(&item);
                dst.put_slice(EOM_DELIMITER);
                Ok(())
            },
            FramingMode::Chunked => encode_chunked(&item, self.outbound_chunk_size, dst),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(codec: &mut FramingCodec, msg: &[u8]) -> BytesMut {
        let mut dst = BytesMut::new();
        codec.encode(Bytes::copy_from_slice(msg), &mut dst).unwrap();
        dst
    }

    #[test]
    fn test_eom_decode_single() {
        let mut codec = FramingCodec::default();
        let mut src = BytesMut::from(&b"<hello/>]]>]]>"[..]);
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&msg[..], b"<hello/>");
        assert!(src.is_empty());
    }

    #[test]
    fn test_eom_delimiter_split_across_reads() {
        let mut codec = FramingCodec::default();
        let mut src = BytesMut::from(&b"<rpc/>]]>"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(b"]]");
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(b">next");
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&msg[..], b"<rpc/>");
        assert_eq!(&src[..], b"next");
    }

    #[test]
    fn test_eom_too_large() {
        let mut codec = FramingCodec::new(8);
        let mut src = BytesMut::from(&b"0123456789abcdef"[..]);
        let err = codec.decode(&mut src).unwrap_err();
        assert!(matches!(err, FramingError::MessageTooLarge { limit: 8 }));
        // Poisoned from here on
        assert!(matches!(
            codec.decode(&mut BytesMut::from(&b"x]]>]]>"[..])),
            Err(FramingError::Poisoned)
        ));
    }

    #[test]
    fn test_eom_complete_message_over_limit() {
        let mut codec = FramingCodec::new(4);
        let mut src = BytesMut::from(&b"123456]]>]]>"[..]);
        assert!(codec.decode(&mut src).is_err());
        assert!(codec.is_failed());
    }

    #[test]
    fn test_mode_switch_keeps_buffered_bytes() {
        let mut codec = FramingCodec::default();
        let mut src = BytesMut::from(&b"<hello/>]]>]]>\n#6\n<rpc/>\n##\n"[..]);
        let hello = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&hello[..], b"<hello/>");

        codec.set_mode(FramingMode::Chunked);
        let rpc = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&rpc[..], b"<rpc/>");
    }

    #[test]
    fn test_encode_modes() {
        let mut codec = FramingCodec::default();
        assert_eq!(&encode(&mut codec, b"<ok/>")[..], b"<ok/>]]>]]>");

        codec.set_mode(FramingMode::Chunked);
        assert_eq!(&encode(&mut codec, b"<ok/>")[..], b"\n#5\n<ok/>\n##\n");
    }

    #[test]
    fn test_eof_with_trailing_whitespace_is_clean() {
        let mut codec = FramingCodec::default();
        let mut src = BytesMut::from(&b"\r\n "[..]);
        assert!(codec.decode_eof(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_eof_mid_message_is_truncated() {
        let mut codec = FramingCodec::default();
        let mut src = BytesMut::from(&b"<rpc message-id"[..]);
        let err = codec.decode_eof(&mut src).unwrap_err();
        assert!(matches!(err, FramingError::Truncated { pending: 15 }));
    }

    #[test]
    fn test_eof_mid_chunk_is_truncated() {
        let mut codec = FramingCodec::default();
        codec.set_mode(FramingMode::Chunked);
        let mut src = BytesMut::from(&b"\n#10\nabc"[..]);
        assert!(matches!(
            codec.decode_eof(&mut src),
            Err(FramingError::Truncated { .. })
        ));
    }

    #[tokio::test]
    async fn test_framed_read_across_split_delimiter() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let io = tokio_test::io::Builder::new()
            .read(b"<hello/>]]>")
            .read(b"]]><rpc/>]]")
            .read(b">]]>")
            .build();
        let mut frames = FramedRead::new(io, FramingCodec::default());

        assert_eq!(&frames.next().await.unwrap().unwrap()[..], b"<hello/>");
        assert_eq!(&frames.next().await.unwrap().unwrap()[..], b"<rpc/>");
        assert!(frames.next().await.is_none());
    }
}
