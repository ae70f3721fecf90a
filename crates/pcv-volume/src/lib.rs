//! pcv-volume: the Picocrypt volume format and streaming engine
//!
//! On-disk layout (raw bytes, every field Reed–Solomon encoded):
//! ```text
//! version(15) · comment-len(15) · comment(3·C) · flags(15) ·
//! argon-salt(48) · hkdf-salt(96) · serpent-iv(48) · nonce(72) ·
//! key-hash(192) · keyfile-hash(96) · auth-tag(192) · body…
//! ```
//!
//! The body is the XChaCha20 ciphertext (with an optional Serpent-CTR layer
//! underneath in paranoid mode), authenticated by a running keyed MAC and
//! optionally interleaved with RS(128,136) parity. Processing is streaming
//! over 1 MiB plaintext units with a rekey of both ciphers every 60 GiB.

pub mod error;
pub mod header;
pub mod pipeline;
pub mod scan;
pub mod split;

pub use error::{PcvError, PcvResult};
pub use header::{Header, HeaderFlags, ParsedHeader, VolumeInfo};
pub use pipeline::{
    decrypt, encrypt, CancelFlag, DecryptParams, EncryptParams, Outcome, ProgressFn,
};
pub use scan::{scan_inputs, Mode, ScanResult};
pub use split::{recombine, split, SplitSpec, SplitUnit};

/// Plaintext unit size for streaming.
pub const MIB: usize = 1 << 20;

/// Version tag written to (and accepted from) volume headers.
pub const VERSION: &str = "v1.29";

/// Extension carried by encrypted volumes.
pub const VOLUME_EXT: &str = "pcv";

/// Data bytes per body RS sub-chunk.
pub const RS_DATA_LEN: usize = 128;

/// Encoded bytes per body RS sub-chunk.
pub const RS_TOTAL_LEN: usize = 136;

/// On-disk size of one fully RS-encoded 1 MiB unit (1,114,112 bytes).
pub const ENCODED_MIB: usize = MIB / RS_DATA_LEN * RS_TOTAL_LEN;

/// Default rekey boundary: both stream ciphers receive fresh nonce material
/// from the subkey schedule every 60 GiB of processed data.
pub const REKEY_INTERVAL: u64 = 60 * (1 << 30);
