//! HKDF-SHA3 subkey schedule, MAC selection, and the outer cipher slot
//!
//! The schedule is a sequential read over the HKDF-SHA3-256 output stream:
//! 32 bytes of MAC key, then 32 bytes of Serpent key, then 24 + 16 bytes of
//! fresh nonce material at every rekey boundary. Both sides of a volume must
//! consume the stream in exactly this order.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha3::{Sha3_256, Sha3_512};
use zeroize::Zeroize;

use crate::{KEY_SIZE, SERPENT_IV_SIZE, TAG_SIZE};

type HmacSha3_256 = Hmac<Sha3_256>;
type HmacSha3_512 = Hmac<Sha3_512>;
type SerpentCtr = ctr::Ctr128BE<serpent::Serpent>;

const BLOCK_SIZE: usize = 32;

/// Incremental reader over the RFC 5869 HKDF-SHA3-256 output stream.
///
/// The `hkdf` crate only offers one-shot expansion, but the schedule needs
/// an open-ended stream (the number of rekey events depends on the volume
/// size), so expansion blocks are chained here on top of the extracted PRK.
/// The stream is capped at 255 blocks per RFC 5869, bounding volumes at
/// roughly 12 TiB between full rekeys of the schedule itself.
pub struct SubkeySchedule {
    prk: [u8; BLOCK_SIZE],
    block: [u8; BLOCK_SIZE],
    counter: u8,
    unread: usize,
}

impl SubkeySchedule {
    pub fn new(ikm: &[u8; KEY_SIZE], salt: &[u8; KEY_SIZE]) -> Self {
        let (prk, _) = Hkdf::<Sha3_256>::extract(Some(salt), ikm);
        Self {
            prk: prk.into(),
            block: [0u8; BLOCK_SIZE],
            counter: 0,
            unread: 0,
        }
    }

    /// Read the next `out.len()` bytes of the expansion stream.
    pub fn read(&mut self, out: &mut [u8]) -> anyhow::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.unread == 0 {
                self.next_block()?;
            }
            let start = BLOCK_SIZE - self.unread;
            let take = self.unread.min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&self.block[start..start + take]);
            self.unread -= take;
            filled += take;
        }
        Ok(())
    }

    /// Read a fixed-size array from the stream.
    pub fn read_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        let mut out = [0u8; N];
        self.read(&mut out)?;
        Ok(out)
    }

    // T(i) = HMAC(PRK, T(i-1) || info || i), with an empty info string.
    fn next_block(&mut self) -> anyhow::Result<()> {
        let counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("HKDF output stream exhausted (255 blocks)"))?;
        let mut mac = HmacSha3_256::new_from_slice(&self.prk)
            .map_err(|e| anyhow::anyhow!("HKDF expand: {e}"))?;
        if counter > 1 {
            mac.update(&self.block);
        }
        mac.update(&[counter]);
        self.block = mac.finalize().into_bytes().into();
        self.counter = counter;
        self.unread = BLOCK_SIZE;
        Ok(())
    }
}

impl Drop for SubkeySchedule {
    fn drop(&mut self) {
        self.prk.zeroize();
        self.block.zeroize();
    }
}

/// The keyed MAC over the body ciphertext.
///
/// Normal volumes use keyed BLAKE2b-512; paranoid volumes use HMAC-SHA3-512.
/// Both produce 64-byte tags. The instance is never reset across rekeys.
pub enum Authenticator {
    Blake2(Box<blake2::Blake2bMac512>),
    HmacSha3(Box<HmacSha3_512>),
}

impl Authenticator {
    pub fn new(paranoid: bool, key: &[u8; KEY_SIZE]) -> anyhow::Result<Self> {
        if paranoid {
            let mac = HmacSha3_512::new_from_slice(key)
                .map_err(|e| anyhow::anyhow!("HMAC-SHA3 init: {e}"))?;
            Ok(Authenticator::HmacSha3(Box::new(mac)))
        } else {
            let mac = blake2::Blake2bMac512::new_from_slice(key)
                .map_err(|e| anyhow::anyhow!("BLAKE2b init: {e}"))?;
            Ok(Authenticator::Blake2(Box::new(mac)))
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Authenticator::Blake2(mac) => mac.update(data),
            Authenticator::HmacSha3(mac) => mac.update(data),
        }
    }

    pub fn finalize(self) -> [u8; TAG_SIZE] {
        let bytes = match self {
            Authenticator::Blake2(mac) => mac.finalize().into_bytes(),
            Authenticator::HmacSha3(mac) => mac.finalize().into_bytes(),
        };
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&bytes);
        tag
    }
}

/// The optional Serpent-CTR layer applied under XChaCha20 in paranoid mode.
///
/// The Serpent key is fixed for the volume; only the IV changes at rekey
/// boundaries, so the key is retained for re-initialization.
pub enum OuterCipher {
    Disabled,
    Serpent { key: [u8; KEY_SIZE], ctr: SerpentCtr },
}

impl OuterCipher {
    pub fn disabled() -> Self {
        OuterCipher::Disabled
    }

    pub fn serpent(key: [u8; KEY_SIZE], iv: &[u8; SERPENT_IV_SIZE]) -> Self {
        use cipher::KeyIvInit;
        let ctr = SerpentCtr::new(&key.into(), iv.into());
        OuterCipher::Serpent { key, ctr }
    }

    /// XOR the running keystream into `buf`. No-op when disabled.
    pub fn apply(&mut self, buf: &mut [u8]) {
        use cipher::StreamCipher;
        if let OuterCipher::Serpent { ctr, .. } = self {
            ctr.apply_keystream(buf);
        }
    }

    /// Restart the CTR stream with a fresh IV at a rekey boundary.
    pub fn rekey(&mut self, iv: &[u8; SERPENT_IV_SIZE]) {
        use cipher::KeyIvInit;
        if let OuterCipher::Serpent { key, ctr } = self {
            *ctr = SerpentCtr::new(&(*key).into(), iv.into());
        }
    }
}

impl Drop for OuterCipher {
    fn drop(&mut self) {
        if let OuterCipher::Serpent { key, .. } = self {
            key.zeroize();
        }
    }
}

/// The composed body cipher: XChaCha20 over the optional Serpent-CTR layer.
///
/// Encryption applies Serpent first and XChaCha20 second; decryption
/// reverses the order. Rekeying replaces both keystreams with fresh nonce
/// material while keeping the keys, and leaves the MAC untouched.
pub struct CipherStack {
    key: [u8; KEY_SIZE],
    chacha: chacha20::XChaCha20,
    outer: OuterCipher,
}

impl CipherStack {
    pub fn new(
        key: &[u8; KEY_SIZE],
        nonce: &[u8; crate::NONCE_SIZE],
        outer: OuterCipher,
    ) -> Self {
        use cipher::KeyIvInit;
        Self {
            key: *key,
            chacha: chacha20::XChaCha20::new(key.into(), nonce.into()),
            outer,
        }
    }

    pub fn encrypt(&mut self, buf: &mut [u8]) {
        use cipher::StreamCipher;
        self.outer.apply(buf);
        self.chacha.apply_keystream(buf);
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        use cipher::StreamCipher;
        self.chacha.apply_keystream(buf);
        self.outer.apply(buf);
    }

    /// Restart both keystreams at a rekey boundary with nonce material
    /// drawn from the subkey schedule.
    pub fn rekey(
        &mut self,
        nonce: &[u8; crate::NONCE_SIZE],
        iv: &[u8; SERPENT_IV_SIZE],
    ) {
        use cipher::KeyIvInit;
        self.chacha = chacha20::XChaCha20::new(&self.key.into(), nonce.into());
        self.outer.rekey(iv);
    }
}

impl Drop for CipherStack {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
