//! pcv-crypto: cryptographic building blocks for Picocrypt volumes
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, Argon2id from password)
//!   ⊕ Keyfile Key (SHA3-256 of keyfiles, concatenated or XOR-combined)
//!   ├── XChaCha20 body cipher (key=combined, nonce from header, rekeyed per 60 GiB)
//!   └── HKDF-SHA3-256 stream (salt from header)
//!         ├── 32 B MAC key   → keyed BLAKE2b-512 or HMAC-SHA3-512
//!         ├── 32 B Serpent key → Serpent-CTR outer layer (paranoid only)
//!         └── 24 B + 16 B per rekey → fresh XChaCha20 nonce + Serpent IV
//! ```
//!
//! Verifiers stored in the header: SHA3-512 of the pre-XOR master key and
//! SHA3-256 of the keyfile key, both compared in constant time on decrypt.

pub mod kdf;
pub mod keyfile;
pub mod rs;
pub mod schedule;

pub use kdf::{derive_master_key, KdfProfile, MasterKey};
pub use keyfile::{digest_keyfiles, KeyfileDigest};
pub use rs::{RsCode, RsDecodeError};
pub use schedule::{Authenticator, CipherStack, OuterCipher, SubkeySchedule};

/// Size of the master key and every derived cipher key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the Argon2id salt
pub const SALT_SIZE: usize = 16;

/// Size of the HKDF salt
pub const HKDF_SALT_SIZE: usize = 32;

/// Size of the Serpent-CTR IV
pub const SERPENT_IV_SIZE: usize = 16;

/// Size of an XChaCha20 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of the authentication tag (BLAKE2b-512 / HMAC-SHA3-512)
pub const TAG_SIZE: usize = 64;
