//! Property tests for the framing codec.
//!
//! Chunked decoding must reconstruct every message exactly, however the
//! transport happens to split the byte stream across reads.

use bytes::BytesMut;
use netconf::codec::{encode_chunked, FramingCodec, FramingMode};
use proptest::prelude::*;
use tokio_util::codec::Decoder;

/// Feed `wire` to a chunked-mode codec in pieces cut at `cuts` (taken
/// modulo the remaining length) and collect every decoded message.
fn decode_split(wire: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut codec = FramingCodec::new(1 << 20);
    codec.set_mode(FramingMode::Chunked);
    let mut buffer = BytesMut::new();
    let mut decoded = Vec::new();
    let mut rest = wire;

    let mut feed = |piece: &[u8], buffer: &mut BytesMut, decoded: &mut Vec<Vec<u8>>| {
        buffer.extend_from_slice(piece);
        while let Some(message) = codec.decode(buffer).unwrap() {
            decoded.push(message.to_vec());
        }
    };

    for cut in cuts {
        if rest.is_empty() {
            break;
        }
        let at = 1 + cut % rest.len();
        let (piece, tail) = rest.split_at(at);
        feed(piece, &mut buffer, &mut decoded);
        rest = tail;
    }
    if !rest.is_empty() {
        feed(rest, &mut buffer, &mut decoded);
    }
    assert!(buffer.is_empty());
    decoded
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: a chunk-encoded message decodes to the same bytes for any
    /// chunk size and any read granularity.
    #[test]
    fn prop_chunked_split_independent(
        message in prop::collection::vec(any::<u8>(), 1..2048),
        chunk_size in 1usize..600,
        cuts in prop::collection::vec(any::<usize>(), 0..40),
    ) {
        let mut wire = BytesMut::new();
        encode_chunked(&message, chunk_size, &mut wire).unwrap();

        let decoded = decode_split(&wire, &cuts);
        prop_assert_eq!(decoded, vec![message]);
    }

    /// Property: back-to-back messages come out separately and in order.
    #[test]
    fn prop_chunked_message_sequence(
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..256), 1..6),
        chunk_size in 1usize..64,
        cuts in prop::collection::vec(any::<usize>(), 0..60),
    ) {
        let mut wire = BytesMut::new();
        for message in &messages {
            encode_chunked(message, chunk_size, &mut wire).unwrap();
        }

        prop_assert_eq!(decode_split(&wire, &cuts), messages);
    }
}
