//! Wire envelopes: how a typed message becomes bytes.
//!
//! Every frame on the wire is a single MessagePack value:
//!
//! ```text
//! +--------------------------------+------------------------------+
//! | element 0: PacketInfo          | element 1: payload           |
//! | [id: u64, req_id: u64,         | [field 0, field 1, ...]      |
//! |  is_response: bool]            | (declaration order)          |
//! +--------------------------------+------------------------------+
//!          a MessagePack array of exactly 2 elements
//! ```
//!
//! The header is enough to route the frame: `id` selects the handler on
//! the receiving side, `req_id` correlates a response with the pending
//! request that asked for it, and `is_response` picks between the two
//! flows. The payload stays an opaque [`rmpv::Value`] until routing has
//! decided which concrete type to decode it into.
//!
//! Decoding is restartable: [`EnvelopeDecoder`] buffers partial input
//! across reads and yields complete envelopes as they become available,
//! so the read loop can feed it whatever chunk sizes the transport
//! produces.

use crate::error::Error;
use crate::message::Message;
use rmpv::Value;
use serde::{Deserialize, Serialize};

/// The three-field routing header carried as the first element of every
/// envelope. Serialized positionally, so it appears on the wire as an
/// array of 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketInfo {
    /// Type hash of the message in the payload.
    pub id: u64,
    /// Correlation id. 0 for fire-and-forget sends; the originator's
    /// allocated id for requests and their responses.
    pub req_id: u64,
    /// Distinguishes a response (routed to the pending-request table)
    /// from a request (routed to a registered handler).
    pub is_response: bool,
}

/// Encodes one `[PacketInfo, message]` envelope into a contiguous buffer.
pub fn encode<M: Message>(info: &PacketInfo, message: &M) -> Result<Vec<u8>, Error> {
    Ok(rmp_serde::to_vec(&(info, message))?)
}

/// Validates envelope shape and splits a decoded value into its header
/// and opaque payload.
///
/// Anything that is not an array of exactly 2 with a convertible header
/// is `BadMessageFormat`; the frame is dropped and the session lives on.
pub fn split(value: Value) -> Result<(PacketInfo, Value), Error> {
    let Value::Array(mut items) = value else {
        return Err(Error::BadMessageFormat);
    };
    if items.len() != 2 {
        return Err(Error::BadMessageFormat);
    }
    let payload = items.pop().expect("length checked");
    let header = items.pop().expect("length checked");
    let info: PacketInfo =
        rmpv::ext::from_value(header).map_err(|_| Error::BadMessageFormat)?;
    Ok((info, payload))
}

/// Decodes a payload into its concrete message type.
pub fn unpack<M: Message>(payload: Value) -> Result<M, Error> {
    rmpv::ext::from_value(payload).map_err(|e| Error::Unpack(e.to_string()))
}

/// A restartable MessagePack frame decoder.
///
/// Bytes go in via [`feed`](Self::feed) in whatever chunks the transport
/// delivers; complete top-level values come out of [`next`](Self::next).
/// Incomplete input is retained until more bytes arrive. Input that can
/// never parse discards the buffer (the sender never splits a frame
/// across compression blocks, so the next block starts clean) and
/// surfaces `BadMessageFormat`.
#[derive(Default)]
pub struct EnvelopeDecoder {
    buf: Vec<u8>,
    pos: usize,
}

impl EnvelopeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of raw bytes to the decode buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pulls the next complete value out of the buffer.
    ///
    /// Returns `Ok(None)` when the buffered input ends mid-value; feed
    /// more bytes and call again.
    pub fn next(&mut self) -> Result<Option<Value>, Error> {
        if self.pos >= self.buf.len() {
            self.buf.clear();
            self.pos = 0;
            return Ok(None);
        }

        let mut slice = &self.buf[self.pos..];
        let before = slice.len();
        match rmpv::decode::read_value(&mut slice) {
            Ok(value) => {
                self.pos += before - slice.len();
                Ok(Some(value))
            }
            Err(err) if is_incomplete(&err) => {
                // Keep the partial tail, drop the consumed prefix.
                self.buf.drain(..self.pos);
                self.pos = 0;
                Ok(None)
            }
            Err(_) => {
                self.buf.clear();
                self.pos = 0;
                Err(Error::BadMessageFormat)
            }
        }
    }
}

/// Whether a decode error means "ran out of bytes" rather than "the
/// bytes are wrong".
fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(e)
        | rmpv::decode::Error::InvalidDataRead(e) => {
            e.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_type;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Hello {
        msg: String,
        count: u32,
    }

    message_type!(Hello);

    fn hello() -> Hello {
        Hello {
            msg: "Hello World!".to_string(),
            count: 7,
        }
    }

    fn info(req_id: u64, is_response: bool) -> PacketInfo {
        PacketInfo {
            id: Hello::type_hash(),
            req_id,
            is_response,
        }
    }

    #[test]
    fn encode_produces_two_element_array_with_three_element_header() {
        let bytes = encode(&info(3, false), &hello()).unwrap();

        let value: Value = rmp_serde::from_slice(&bytes).unwrap();
        let Value::Array(items) = value else {
            panic!("expected top-level array");
        };
        assert_eq!(items.len(), 2);

        let Value::Array(header) = &items[0] else {
            panic!("expected header array");
        };
        assert_eq!(header.len(), 3);
        assert_eq!(header[0].as_u64(), Some(Hello::type_hash()));
        assert_eq!(header[1].as_u64(), Some(3));
        assert_eq!(header[2].as_bool(), Some(false));
    }

    #[test]
    fn decode_roundtrip() {
        let bytes = encode(&info(42, true), &hello()).unwrap();

        let mut decoder = EnvelopeDecoder::new();
        decoder.feed(&bytes);
        let value = decoder.next().unwrap().expect("one complete frame");

        let (decoded_info, payload) = split(value).unwrap();
        assert_eq!(decoded_info, info(42, true));
        assert_eq!(unpack::<Hello>(payload).unwrap(), hello());

        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn decoder_handles_one_byte_at_a_time() {
        let bytes = encode(&info(0, false), &hello()).unwrap();

        let mut decoder = EnvelopeDecoder::new();
        let mut frames = Vec::new();
        for byte in &bytes {
            decoder.feed(std::slice::from_ref(byte));
            while let Some(value) = decoder.next().unwrap() {
                frames.push(value);
            }
        }

        assert_eq!(frames.len(), 1);
        let (_, payload) = split(frames.pop().unwrap()).unwrap();
        assert_eq!(unpack::<Hello>(payload).unwrap(), hello());
    }

    #[test]
    fn decoder_drains_multiple_frames_from_one_feed() {
        let mut bytes = Vec::new();
        for req_id in 0..5 {
            bytes.extend_from_slice(&encode(&info(req_id, false), &hello()).unwrap());
        }

        let mut decoder = EnvelopeDecoder::new();
        decoder.feed(&bytes);

        let mut req_ids = Vec::new();
        while let Some(value) = decoder.next().unwrap() {
            let (info, _) = split(value).unwrap();
            req_ids.push(info.req_id);
        }
        assert_eq!(req_ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn three_element_envelope_is_bad_format() {
        let bytes = rmp_serde::to_vec(&(info(1, false), hello(), 99u8)).unwrap();

        let mut decoder = EnvelopeDecoder::new();
        decoder.feed(&bytes);
        let value = decoder.next().unwrap().unwrap();

        assert!(matches!(split(value), Err(Error::BadMessageFormat)));
    }

    #[test]
    fn non_array_envelope_is_bad_format() {
        let bytes = rmp_serde::to_vec(&"not an envelope").unwrap();

        let mut decoder = EnvelopeDecoder::new();
        decoder.feed(&bytes);
        let value = decoder.next().unwrap().unwrap();

        assert!(matches!(split(value), Err(Error::BadMessageFormat)));
    }

    #[test]
    fn garbage_input_resets_the_decoder() {
        let mut decoder = EnvelopeDecoder::new();
        // 0xc1 is the one marker MessagePack reserves as never-used.
        decoder.feed(&[0xc1, 0x00, 0x01]);
        assert!(matches!(decoder.next(), Err(Error::BadMessageFormat)));

        // The buffer was discarded; a fresh frame decodes cleanly.
        let bytes = encode(&info(9, false), &hello()).unwrap();
        decoder.feed(&bytes);
        let (info, _) = split(decoder.next().unwrap().unwrap()).unwrap();
        assert_eq!(info.req_id, 9);
    }

    #[test]
    fn payload_type_mismatch_is_unpack_error() {
        let bytes = encode(&info(0, false), &hello()).unwrap();
        let mut decoder = EnvelopeDecoder::new();
        decoder.feed(&bytes);
        let (_, payload) = split(decoder.next().unwrap().unwrap()).unwrap();

        #[derive(Debug, Serialize, Deserialize)]
        struct Wrong {
            a: u64,
            b: u64,
            c: u64,
        }
        message_type!(Wrong);

        assert!(matches!(unpack::<Wrong>(payload), Err(Error::Unpack(_))));
    }
}
