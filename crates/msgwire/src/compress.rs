//! Per-connection LZ4 stream compression.
//!
//! Each direction of a peer session owns one [`Compressor`] or
//! [`Decompressor`] for its whole lifetime. Blocks are coded with the
//! last 64 KiB of that direction's plaintext as an external dictionary,
//! so repeated message shapes compress better and better as a session
//! ages. The price is ordering: both sides update their dictionary after
//! every block, so blocks must be processed in exactly the order they
//! were emitted. Mid-stream restart is not possible.
//!
//! On the wire, one compressed block travels as one length-prefixed
//! record:
//!
//! ```text
//! +-------------------+------------------------------+
//! | Length (4 bytes)  | LZ4 block                    |
//! | big-endian u32    | (variable length)            |
//! +-------------------+------------------------------+
//! ```
//!
//! One `send` produces exactly one record, and a plaintext frame never
//! spans two records. A frame that does not fit the 8 KiB block is
//! rejected at `send` and the session stays healthy.

use crate::error::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Plaintext capacity of one compression block.
pub const BLOCK_BYTES: usize = 8 * 1024;

/// How much trailing plaintext each direction keeps as its dictionary.
const DICT_BYTES: usize = 64 * 1024;

/// Upper bound on a compressed block, and therefore on a record length.
pub fn max_block_bytes() -> usize {
    lz4_flex::block::get_maximum_output_size(BLOCK_BYTES)
}

/// Appends a block's plaintext to a dictionary, keeping the tail 64 KiB.
/// Both directions of both peers apply this identically after every
/// block, which is what keeps the dictionaries in lockstep.
fn push_dict(dict: &mut Vec<u8>, plain: &[u8]) {
    dict.extend_from_slice(plain);
    if dict.len() > DICT_BYTES {
        dict.drain(..dict.len() - DICT_BYTES);
    }
}

/// Send-side LZ4 state for one peer. Lives inside the write lane and is
/// never touched anywhere else.
pub struct Compressor {
    dict: Vec<u8>,
    scratch: Vec<u8>,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor {
    pub fn new() -> Self {
        Self {
            dict: Vec::new(),
            scratch: vec![0u8; max_block_bytes()],
        }
    }

    /// Compresses one plaintext frame into one block, advancing the
    /// dictionary. The returned slice borrows this compressor's scratch
    /// buffer and is valid until the next call.
    pub fn compress(&mut self, frame: &[u8]) -> Result<&[u8], Error> {
        if frame.len() > BLOCK_BYTES {
            return Err(Error::PacketTooLarge { size: frame.len() });
        }
        let written = if self.dict.is_empty() {
            lz4_flex::block::compress_into(frame, &mut self.scratch)
        } else {
            lz4_flex::block::compress_into_with_dict(frame, &mut self.scratch, &self.dict)
        }
        .map_err(|_| Error::Compress)?;
        if written == 0 {
            return Err(Error::Compress);
        }
        push_dict(&mut self.dict, frame);
        Ok(&self.scratch[..written])
    }
}

/// Receive-side LZ4 state for one peer. Lives inside the read loop and
/// is never touched anywhere else. The scratch buffer is exactly one
/// block: a record that inflates past it is a corrupt stream.
pub struct Decompressor {
    dict: Vec<u8>,
    scratch: Vec<u8>,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decompressor {
    pub fn new() -> Self {
        Self {
            dict: Vec::new(),
            scratch: vec![0u8; BLOCK_BYTES],
        }
    }

    /// Decompresses one block, advancing the dictionary. The returned
    /// slice borrows this decompressor's scratch buffer and is valid
    /// until the next call.
    pub fn decompress(&mut self, block: &[u8]) -> Result<&[u8], Error> {
        let written = if self.dict.is_empty() {
            lz4_flex::block::decompress_into(block, &mut self.scratch)
        } else {
            lz4_flex::block::decompress_into_with_dict(block, &mut self.scratch, &self.dict)
        }
        .map_err(|_| Error::Decompress)?;
        if written == 0 {
            return Err(Error::Decompress);
        }
        push_dict(&mut self.dict, &self.scratch[..written]);
        Ok(&self.scratch[..written])
    }
}

/// Writes one compressed block as a length-prefixed record.
pub(crate) async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    block: &[u8],
) -> std::io::Result<()> {
    let len = block.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(block).await?;
    writer.flush().await
}

/// Reads one length-prefixed record.
///
/// Returns `Ok(None)` on a clean end of stream at a record boundary. A
/// length outside `1..=max_block_bytes()` means the stream is out of
/// sync and cannot be recovered.
pub(crate) async fn read_record<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max_block_bytes() {
        return Err(Error::Decompress);
    }

    let mut block = vec![0u8; len];
    reader.read_exact(&mut block).await.map_err(Error::Io)?;
    Ok(Some(block))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_single_block() {
        let mut tx = Compressor::new();
        let mut rx = Decompressor::new();

        let frame = b"Hello World!".repeat(10);
        let block = tx.compress(&frame).unwrap().to_vec();
        assert_eq!(rx.decompress(&block).unwrap(), &frame[..]);
    }

    #[test]
    fn roundtrip_full_session_in_order() {
        let mut tx = Compressor::new();
        let mut rx = Decompressor::new();

        // Enough traffic to roll the 64 KiB dictionary over several times.
        for i in 0..100u32 {
            let frame = format!("frame number {i} with some repeated payload text")
                .into_bytes()
                .repeat(1 + (i as usize % 20));
            assert!(frame.len() <= BLOCK_BYTES);
            let block = tx.compress(&frame).unwrap().to_vec();
            assert_eq!(rx.decompress(&block).unwrap(), &frame[..], "block {i}");
        }
    }

    #[test]
    fn dictionary_pays_off_for_repeated_frames() {
        let mut tx = Compressor::new();
        let frame = vec![0xabu8; 4096];

        let first = tx.compress(&frame).unwrap().len();
        let second = tx.compress(&frame).unwrap().len();
        // The second identical frame is one long dictionary match.
        assert!(second <= first);
    }

    #[test]
    fn oversized_frame_is_rejected_and_state_survives() {
        let mut tx = Compressor::new();
        let mut rx = Decompressor::new();

        let too_big = vec![1u8; BLOCK_BYTES + 1];
        assert!(matches!(
            tx.compress(&too_big),
            Err(Error::PacketTooLarge { size }) if size == BLOCK_BYTES + 1
        ));

        // The rejected frame never entered the dictionary, so the stream
        // continues unharmed.
        let frame = b"still alive".to_vec();
        let block = tx.compress(&frame).unwrap().to_vec();
        assert_eq!(rx.decompress(&block).unwrap(), &frame[..]);
    }

    #[test]
    fn corrupt_block_is_a_decompress_error() {
        let mut rx = Decompressor::new();
        assert!(matches!(rx.decompress(&[0xff]), Err(Error::Decompress)));
    }

    #[test]
    fn block_inflating_past_scratch_is_a_decompress_error() {
        let mut tx = Compressor::new();
        let mut rx = Decompressor::new();

        // Compress a full block, then shrink the receiver's scratch so the
        // inflated output cannot fit.
        let frame = vec![7u8; BLOCK_BYTES];
        let block = tx.compress(&frame).unwrap().to_vec();
        rx.scratch = vec![0u8; 16];
        assert!(matches!(rx.decompress(&block), Err(Error::Decompress)));
    }

    #[tokio::test]
    async fn record_roundtrip_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_record(&mut a, b"first block").await.unwrap();
        write_record(&mut a, b"second block").await.unwrap();
        drop(a);

        assert_eq!(read_record(&mut b).await.unwrap().unwrap(), b"first block");
        assert_eq!(read_record(&mut b).await.unwrap().unwrap(), b"second block");
        assert!(read_record(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_arriving_one_byte_at_a_time_still_decodes() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(5u32).to_be_bytes());
        bytes.extend_from_slice(b"drip!");

        let writer = tokio::spawn(async move {
            for byte in bytes {
                a.write_all(&[byte]).await.unwrap();
                a.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            drop(a);
        });

        assert_eq!(read_record(&mut b).await.unwrap().unwrap(), b"drip!");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_record_length_is_a_decompress_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let bogus = (max_block_bytes() as u32 + 1).to_be_bytes();
        a.write_all(&bogus).await.unwrap();
        a.flush().await.unwrap();

        assert!(matches!(read_record(&mut b).await, Err(Error::Decompress)));
    }

    #[tokio::test]
    async fn truncated_record_is_an_io_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        a.write_all(&(10u32).to_be_bytes()).await.unwrap();
        a.write_all(b"only4").await.unwrap();
        drop(a);

        assert!(matches!(read_record(&mut b).await, Err(Error::Io(_))));
    }
}
