//! Systematic Reed–Solomon codes over GF(2^8)
//!
//! Every header field and (optionally) every 128-byte body sub-chunk is
//! protected by its own code. A codeword is the `k` data bytes followed by
//! `n − k` parity bytes; up to `⌊(n − k) / 2⌋` corrupted bytes anywhere in
//! the codeword can be corrected.

use reed_solomon::{Decoder, Encoder};
use thiserror::Error;

/// Decoding failed: more byte errors than the code can correct.
///
/// `best_effort` carries the uncorrected systematic prefix so callers that
/// force decoding (the "keep" option) can still produce output.
#[derive(Debug, Error)]
#[error("reed-solomon ({data_len},{total_len}) code: too many byte errors to correct")]
pub struct RsDecodeError {
    pub data_len: usize,
    pub total_len: usize,
    pub best_effort: Vec<u8>,
}

/// A fixed (data, total) Reed–Solomon code.
pub struct RsCode {
    data_len: usize,
    total_len: usize,
    encoder: Encoder,
    decoder: Decoder,
}

impl RsCode {
    /// Build an RS code producing `total_len`-byte codewords from
    /// `data_len` data bytes. `total_len` must not exceed 255.
    pub fn new(data_len: usize, total_len: usize) -> Self {
        debug_assert!(data_len > 0 && data_len < total_len && total_len <= 255);
        let parity = total_len - data_len;
        Self {
            data_len,
            total_len,
            encoder: Encoder::new(parity),
            decoder: Decoder::new(parity),
        }
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Encode `data` (exactly `data_len` bytes) into a full codeword.
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        debug_assert_eq!(data.len(), self.data_len);
        self.encoder.encode(data).to_vec()
    }

    /// Decode a codeword back to its data bytes, correcting up to
    /// `(total_len − data_len) / 2` byte errors.
    pub fn decode(&self, codeword: &[u8]) -> Result<Vec<u8>, RsDecodeError> {
        if codeword.len() != self.total_len {
            // A truncated codeword cannot be fed to the decoder; surface
            // whatever systematic prefix exists.
            let take = codeword.len().min(self.data_len);
            return Err(RsDecodeError {
                data_len: self.data_len,
                total_len: self.total_len,
                best_effort: codeword[..take].to_vec(),
            });
        }
        match self.decoder.correct(codeword, None) {
            Ok(buffer) => Ok(buffer.data().to_vec()),
            Err(_) => Err(RsDecodeError {
                data_len: self.data_len,
                total_len: self.total_len,
                best_effort: codeword[..self.data_len].to_vec(),
            }),
        }
    }
}
