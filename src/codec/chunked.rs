//! Chunked framing (RFC 6242 §4.2).
//!
//! ```text
//! chunked-message = 1*chunk end-of-chunks
//! chunk           = LF HASH chunk-size LF chunk-data
//! chunk-size      = 1*DIGIT1 0*DIGIT
//! end-of-chunks   = LF HASH HASH LF
//! ```
//!
//! The decoder is an explicit byte-level state machine. It only ever stops
//! at a buffer boundary, never at a chunk boundary, so the same message
//! decodes identically regardless of how the transport split the bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{FramingError, MAX_CHUNK_SIZE_LIMIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// `\n` opening a chunk header or the end-of-chunks marker.
    HeaderLf,
    /// `#` after the opening newline.
    HeaderHash,
    /// First size digit, or a second `#` for end-of-chunks.
    SizeOrEnd,
    /// Further size digits, terminated by `\n`.
    Size,
    /// Chunk payload bytes.
    Data,
    /// Final `\n` of `\n##\n`.
    EndLf,
}

/// Incremental chunked-framing decoder.
#[derive(Debug)]
pub struct ChunkDecoder {
    state: State,
    chunk_size: u64,
    remaining: usize,
    chunks: usize,
    message: BytesMut,
    max_chunk_size: usize,
    max_message_size: usize,
}

impl ChunkDecoder {
    /// Create decoder with the given chunk and message limits.
    pub fn new(max_chunk_size: usize, max_message_size: usize) -> Self {
        Self {
            state: State::HeaderLf,
            chunk_size: 0,
            remaining: 0,
            chunks: 0,
            message: BytesMut::new(),
            max_chunk_size,
            max_message_size,
        }
    }

    /// Bytes of the current message consumed so far.
    pub fn pending(&self) -> usize {
        self.message.len()
    }

    /// Whether the decoder sits between messages.
    pub fn is_idle(&self) -> bool {
        self.state == State::HeaderLf && self.chunks == 0 && self.message.is_empty()
    }

    /// Consume bytes from `src` until a full message is assembled or the
    /// buffer runs dry.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        loop {
            if self.state == State::Data {
                let take = self.remaining.min(src.len());
                if take == 0 {
                    return Ok(None);
                }
                self.message.extend_from_slice(&src.split_to(take));
                self.remaining -= take;
                if self.remaining == 0 {
                    self.chunks += 1;
                    self.state = State::HeaderLf;
                }
                continue;
            }

            if !src.has_remaining() {
                return Ok(None);
            }
            let byte = src.get_u8();
            if let Some(message) = self.step(byte)? {
                return Ok(Some(message));
            }
        }
    }

    fn step(&mut self, byte: u8) -> Result<Option<Bytes>, FramingError> {
        match self.state {
            State::HeaderLf => {
                expect(byte, b'\n', "header", "'\\n'")?;
                self.state = State::HeaderHash;
            },
            State::HeaderHash => {
                expect(byte, b'#', "header", "'#'")?;
                self.state = State::SizeOrEnd;
            },
            State::SizeOrEnd => match byte {
                b'1'..=b'9' => {
                    self.chunk_size = u64::from(byte - b'0');
                    self.state = State::Size;
                },
                b'#' if self.chunks > 0 => self.state = State::EndLf,
                _ => {
                    return Err(FramingError::MalformedChunk {
                        context: "header length",
                        found: byte,
                        expected: if self.chunks > 0 { "[1-9] or '#'" } else { "[1-9]" },
                    })
                },
            },
            State::Size => match byte {
                b'0'..=b'9' => {
                    self.chunk_size = self.chunk_size * 10 + u64::from(byte - b'0');
                    self.check_chunk_size()?;
                },
                b'\n' => {
                    self.check_chunk_size()?;
                    let size = self.chunk_size as usize;
                    if self.message.len() + size > self.max_message_size {
                        return Err(FramingError::MessageTooLarge {
                            limit: self.max_message_size,
                        });
                    }
                    self.message.reserve(size);
                    self.remaining = size;
                    self.state = State::Data;
                },
                _ => {
                    return Err(FramingError::MalformedChunk {
                        context: "header length",
                        found: byte,
                        expected: "[0-9] or '\\n'",
                    })
                },
            },
            State::EndLf => {
                expect(byte, b'\n', "footer", "'\\n'")?;
                self.state = State::HeaderLf;
                self.chunks = 0;
                return Ok(Some(self.message.split().freeze()));
            },
            State::Data => unreachable!("data bytes are consumed in bulk"),
        }
        Ok(None)
    }

    fn check_chunk_size(&self) -> Result<(), FramingError> {
        if self.chunk_size > MAX_CHUNK_SIZE_LIMIT || self.chunk_size > self.max_chunk_size as u64 {
            return Err(FramingError::ChunkTooLarge {
                size: self.chunk_size,
                limit: self.max_chunk_size,
            });
        }
        Ok(())
    }
}

fn expect(
    found: u8,
    wanted: u8,
    context: &'static str,
    expected: &'static str,
) -> Result<(), FramingError> {
    if found == wanted {
        Ok(())
    } else {
        Err(FramingError::MalformedChunk {
            context,
            found,
            expected,
        })
    }
}

/// Append `message` to `dst` in chunked framing, splitting it into chunks of
/// at most `chunk_size` bytes.
pub fn encode_chunked(
    message: &[u8],
    chunk_size: usize,
    dst: &mut BytesMut,
) -> Result<(), FramingError> {
    if message.is_empty() {
        return Err(FramingError::EmptyMessage);
    }
    for chunk in message.chunks(chunk_size.max(1)) {
        dst.put_slice(format!("\n#{}\n", chunk.len()).as_bytes());
        dst.put_slice(chunk);
    }
    dst.put_slice(b"\n##\n");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> ChunkDecoder {
        ChunkDecoder::new(1024, 4096)
    }

    #[test]
    fn test_single_chunk() {
        let mut src = BytesMut::from(&b"\n#5\nhello\n##\n"[..]);
        let msg = decoder().decode(&mut src).unwrap().unwrap();
        assert_eq!(&msg[..], b"hello");
        assert!(src.is_empty());
    }

    #[test]
    fn test_multi_chunk_concatenated_in_order() {
        let mut src = BytesMut::from(&b"\n#4\n<rpc\n#17\n message-id=\"1\"/>\n##\n"[..]);
        let msg = decoder().decode(&mut src).unwrap().unwrap();
        assert_eq!(&msg[..], b"<rpc message-id=\"1\"/>");
    }

    #[test]
    fn test_rfc_example() {
        // RFC 6242 §4.2 example, chunk sizes 4 and 18
        let wire = b"\n#4\n<rpc\n#18\n message-id=\"102\"\n\n##\n";
        let mut src = BytesMut::from(&wire[..]);
        let msg = decoder().decode(&mut src).unwrap().unwrap();
        assert_eq!(msg.len(), 22);
    }

    #[test]
    fn test_partial_input_resumes() {
        let mut dec = decoder();
        let mut src = BytesMut::from(&b"\n#11\nhel"[..]);
        assert!(dec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(b"lo worl");
        assert!(dec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(b"d\n#");
        assert!(dec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(b"#\n");
        let msg = dec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&msg[..], b"hello world");
        assert!(dec.is_idle());
    }

    #[test]
    fn test_non_numeric_length_is_malformed() {
        let mut src = BytesMut::from(&b"\n#abc\n"[..]);
        let err = decoder().decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            FramingError::MalformedChunk {
                context: "header length",
                found: b'a',
                ..
            }
        ));
    }

    #[test]
    fn test_leading_zero_is_malformed() {
        let mut src = BytesMut::from(&b"\n#05\nhello"[..]);
        assert!(decoder().decode(&mut src).is_err());
    }

    #[test]
    fn test_end_marker_without_chunk_is_malformed() {
        let mut src = BytesMut::from(&b"\n##\n"[..]);
        assert!(decoder().decode(&mut src).is_err());
    }

    #[test]
    fn test_missing_footer_newline() {
        let mut src = BytesMut::from(&b"\n#2\nok\n##x"[..]);
        let err = decoder().decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            FramingError::MalformedChunk {
                context: "footer",
                ..
            }
        ));
    }

    #[test]
    fn test_chunk_too_large() {
        let mut src = BytesMut::from(&b"\n#2048\n"[..]);
        let err = decoder().decode(&mut src).unwrap_err();
        assert!(matches!(err, FramingError::ChunkTooLarge { size: 2048, .. }));
    }

    #[test]
    fn test_message_too_large_across_chunks() {
        let mut dec = ChunkDecoder::new(1024, 1500);
        let mut wire = BytesMut::new();
        encode_chunked(&[b'x'; 2000], 1000, &mut wire).unwrap();
        let err = dec.decode(&mut wire).unwrap_err();
        assert!(matches!(err, FramingError::MessageTooLarge { limit: 1500 }));
    }

    #[test]
    fn test_encode_splits_into_chunks() {
        let mut dst = BytesMut::new();
        encode_chunked(b"abcdefgh", 3, &mut dst).unwrap();
        assert_eq!(&dst[..], b"\n#3\nabc\n#3\ndef\n#2\ngh\n##\n");
    }

    #[test]
    fn test_encode_empty_rejected() {
        let mut dst = BytesMut::new();
        assert!(matches!(
            encode_chunked(b"", 8, &mut dst),
            Err(FramingError::EmptyMessage)
        ));
    }

    #[test]
    fn test_back_to_back_messages() {
        let mut wire = BytesMut::new();
        encode_chunked(b"first", 8, &mut wire).unwrap();
        encode_chunked(b"second", 8, &mut wire).unwrap();
        let mut dec = decoder();
        assert_eq!(&dec.decode(&mut wire).unwrap().unwrap()[..], b"first");
        assert_eq!(&dec.decode(&mut wire).unwrap().unwrap()[..], b"second");
        assert!(dec.decode(&mut wire).unwrap().is_none());
    }
}
