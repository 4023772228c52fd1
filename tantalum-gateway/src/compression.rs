//! Zlib decompression for gateway messages.
//!
//! The gateway supports two compression schemes. Transport compression
//! (`compress=zlib-stream`) runs a single zlib context across the whole
//! connection; each logical message ends with the SYNC_FLUSH suffix
//! (0x00 0x00 0xFF 0xFF). Payload compression is negotiated during IDENTIFY
//! and compresses each binary message as an independent zlib stream.

use flate2::{Decompress, FlushDecompress, Status};

use crate::error::GatewayError;

/// Zlib suffix indicating the end of a transport-compressed message.
pub(crate) const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Reusable output chunk size for decompression.
const SCRATCH_CAPACITY: usize = 32 * 1024;

/// How inbound binary messages are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression; binary messages are only expected with ETF encoding.
    #[default]
    None,
    /// Per-message zlib streams, negotiated during IDENTIFY.
    Payload,
    /// One zlib context for the whole connection (`compress=zlib-stream`).
    TransportStream,
}

/// Long-lived inflater for transport compression.
///
/// The zlib dictionary spans messages, so exactly one of these exists per TCP
/// connection. It must never be recreated between messages; only
/// [`reset`](Self::reset) when a new connection is established.
pub struct TransportInflator {
    decompress: Decompress,
    scratch: Vec<u8>,
}

impl TransportInflator {
    pub(crate) fn new() -> Self {
        Self {
            // true = expect the zlib header, which Discord sends.
            decompress: Decompress::new(true),
            scratch: Vec::with_capacity(SCRATCH_CAPACITY),
        }
    }

    /// Inflate one suffix-terminated message, preserving the shared context.
    ///
    /// The caller has already verified that `data` ends with [`ZLIB_SUFFIX`].
    pub(crate) fn inflate(&mut self, data: &[u8]) -> Result<Vec<u8>, GatewayError> {
        inflate_with(&mut self.decompress, &mut self.scratch, data)
    }

    /// Discard the dictionary state for a fresh connection.
    pub(crate) fn reset(&mut self) {
        self.decompress.reset(true);
        self.scratch.clear();
    }
}

/// One-shot decompression for payload-compressed messages.
pub(crate) fn inflate_payload(data: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let mut decompress = Decompress::new(true);
    let mut scratch = Vec::with_capacity(SCRATCH_CAPACITY);
    inflate_with(&mut decompress, &mut scratch, data)
}

fn inflate_with(
    decompress: &mut Decompress,
    scratch: &mut Vec<u8>,
    data: &[u8],
) -> Result<Vec<u8>, GatewayError> {
    let mut inflated = Vec::with_capacity(data.len().saturating_mul(2));
    let start = decompress.total_in();
    let mut consumed = 0usize;

    loop {
        scratch.clear();

        let status = decompress
            .decompress_vec(&data[consumed..], scratch, FlushDecompress::Sync)
            .map_err(|source| GatewayError::Decompress(source.to_string()))?;

        consumed = (decompress.total_in() - start) as usize;
        inflated.extend_from_slice(scratch);

        // Done once the input is drained and zlib has flushed all pending
        // output (a full scratch buffer means more is waiting).
        if matches!(status, Status::StreamEnd)
            || (consumed >= data.len() && scratch.len() < scratch.capacity())
        {
            break;
        }
    }

    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression as Level, FlushCompress};

    /// Compress `data` as one sync-flushed chunk of a shared zlib stream.
    fn sync_chunk(compress: &mut Compress, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 256);
        compress
            .compress_vec(data, &mut out, FlushCompress::Sync)
            .unwrap();
        assert!(out.ends_with(&ZLIB_SUFFIX));
        out
    }

    #[test]
    fn test_transport_inflate_round_trip() {
        let message = br#"{"op":10,"d":{"heartbeat_interval":41250}}"#;

        let mut compress = Compress::new(Level::default(), true);
        let chunk = sync_chunk(&mut compress, message);

        let mut inflator = TransportInflator::new();
        let inflated = inflator.inflate(&chunk).unwrap();
        assert_eq!(inflated, message);
    }

    #[test]
    fn test_transport_context_spans_messages() {
        let first = br#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let second = br#"{"op":0,"s":1,"t":"READY","d":{"session_id":"aaa"}}"#;

        // Both messages share one compression context; the second depends on
        // the dictionary built by the first.
        let mut compress = Compress::new(Level::default(), true);
        let chunk_one = sync_chunk(&mut compress, first);
        let chunk_two = sync_chunk(&mut compress, second);

        let mut inflator = TransportInflator::new();
        assert_eq!(inflator.inflate(&chunk_one).unwrap(), first);
        assert_eq!(inflator.inflate(&chunk_two).unwrap(), second);
    }

    #[test]
    fn test_payload_inflate_is_independent() {
        let message = br#"{"op":9,"d":false}"#;

        let mut compress = Compress::new(Level::default(), true);
        let chunk = sync_chunk(&mut compress, message);

        assert_eq!(inflate_payload(&chunk).unwrap(), message);
        // A second message compressed from scratch also inflates on its own.
        let mut compress = Compress::new(Level::default(), true);
        let chunk = sync_chunk(&mut compress, message);
        assert_eq!(inflate_payload(&chunk).unwrap(), message);
    }

    #[test]
    fn test_garbage_input_is_an_error() {
        let mut inflator = TransportInflator::new();
        assert!(inflator.inflate(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
