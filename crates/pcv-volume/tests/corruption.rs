//! Corruption, tamper detection, and forced-decrypt behavior.

use std::path::PathBuf;

use secrecy::SecretString;
use tempfile::TempDir;

use pcv_volume::{
    decrypt, encrypt, CancelFlag, DecryptParams, EncryptParams, Outcome, PcvError, MIB,
    RS_TOTAL_LEN,
};

const HEADER_BASE: u64 = 789;

fn enc_params(password: &str) -> EncryptParams {
    EncryptParams::new(SecretString::from(password))
}

fn dec_params(password: &str) -> DecryptParams {
    DecryptParams::new(SecretString::from(password))
}

fn test_bytes(len: usize, mut seed: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
        out.push((seed >> 24) as u8);
    }
    out
}

struct Fixture {
    _dir: TempDir,
    volume: PathBuf,
    restored: PathBuf,
    data: Vec<u8>,
}

fn encrypted_fixture(len: usize, params: EncryptParams) -> Fixture {
    let dir = TempDir::new().unwrap();
    let data = test_bytes(len, 101);
    let input = dir.path().join("plain.bin");
    std::fs::write(&input, &data).unwrap();
    let volume = dir.path().join("plain.bin.pcv");
    encrypt(&input, &volume, &params, None, &CancelFlag::new()).unwrap();
    let restored = dir.path().join("restored.bin");
    Fixture {
        _dir: dir,
        volume,
        restored,
        data,
    }
}

fn flip(path: &std::path::Path, offsets: &[u64]) {
    let mut bytes = std::fs::read(path).unwrap();
    for &offset in offsets {
        bytes[offset as usize] ^= 0xA5;
    }
    std::fs::write(path, bytes).unwrap();
}

#[test]
fn test_version_byte_corruption_is_corrected() {
    let fx = encrypted_fixture(4096, enc_params("pw"));
    // Byte 0 sits in the (5,15) version field; RS absorbs the flip.
    flip(&fx.volume, &[0]);

    let outcome = decrypt(
        &fx.volume,
        &fx.restored,
        &dec_params("pw"),
        None,
        &CancelFlag::new(),
    )
    .unwrap();
    assert_eq!(outcome, Outcome::Clean);
    assert_eq!(std::fs::read(&fx.restored).unwrap(), fx.data);
}

#[test]
fn test_header_field_beyond_capacity() {
    let fx = encrypted_fixture(4096, enc_params("pw"));
    // The Argon2 salt field (16,48) starts at 45 and corrects 16 errors;
    // 20 flips push it past capacity.
    let offsets: Vec<u64> = (45..65).collect();
    flip(&fx.volume, &offsets);

    let err = decrypt(
        &fx.volume,
        &fx.restored,
        &dec_params("pw"),
        None,
        &CancelFlag::new(),
    )
    .unwrap_err();
    assert!(matches!(err, PcvError::HeaderDamaged));
    assert!(!fx.restored.exists());

    // Forcing through with keep derives from the mangled salt and keeps
    // whatever comes out.
    let params = DecryptParams {
        keep: true,
        ..dec_params("pw")
    };
    let outcome = decrypt(&fx.volume, &fx.restored, &params, None, &CancelFlag::new()).unwrap();
    assert_eq!(outcome, Outcome::Kept);
    assert!(fx.restored.exists());
}

#[test]
fn test_ciphertext_tamper_is_detected() {
    let fx = encrypted_fixture(100_000, enc_params("pw"));
    // No body parity: a single ciphertext flip must fail authentication.
    flip(&fx.volume, &[HEADER_BASE + 50_000]);

    let err = decrypt(
        &fx.volume,
        &fx.restored,
        &dec_params("pw"),
        None,
        &CancelFlag::new(),
    )
    .unwrap_err();
    assert!(matches!(err, PcvError::IntegrityFailed));
    assert!(!fx.restored.exists(), "failed decrypt must remove its output");

    let params = DecryptParams {
        keep: true,
        ..dec_params("pw")
    };
    let outcome = decrypt(&fx.volume, &fx.restored, &params, None, &CancelFlag::new()).unwrap();
    assert_eq!(outcome, Outcome::Kept);
    let restored = std::fs::read(&fx.restored).unwrap();
    assert_eq!(restored.len(), fx.data.len());
    assert_ne!(restored, fx.data);
}

#[test]
fn test_rs_body_flips_are_repaired() {
    let params = EncryptParams {
        reed_solomon: true,
        ..enc_params("pw")
    };
    let fx = encrypted_fixture(2 * MIB + 500, params);
    // Four flips inside one codeword of the middle unit: within capacity.
    // The fast pass misses them, fails the MAC, and the corrective pass
    // repairs them.
    let codeword = HEADER_BASE + 1_000_000 / RS_TOTAL_LEN as u64 * RS_TOTAL_LEN as u64;
    flip(
        &fx.volume,
        &[codeword + 3, codeword + 40, codeword + 80, codeword + 130],
    );

    let outcome = decrypt(
        &fx.volume,
        &fx.restored,
        &dec_params("pw"),
        None,
        &CancelFlag::new(),
    )
    .unwrap();
    assert_eq!(outcome, Outcome::Clean);
    assert_eq!(std::fs::read(&fx.restored).unwrap(), fx.data);
}

#[test]
fn test_rs_body_beyond_capacity() {
    let params = EncryptParams {
        reed_solomon: true,
        ..enc_params("pw")
    };
    let fx = encrypted_fixture(MIB / 2, params);
    // Six flips in one codeword exceed the 4-error capacity of (128,136).
    let codeword = HEADER_BASE + 10 * RS_TOTAL_LEN as u64;
    let offsets: Vec<u64> = (0..6).map(|i| codeword + i * 20).collect();
    flip(&fx.volume, &offsets);

    // Past capacity the decoder either reports the damage or miscorrects
    // into a wrong codeword that the MAC then rejects.
    let err = decrypt(
        &fx.volume,
        &fx.restored,
        &dec_params("pw"),
        None,
        &CancelFlag::new(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        PcvError::BodyIrrecoverable | PcvError::IntegrityFailed
    ));
    assert!(!fx.restored.exists());

    let params = DecryptParams {
        keep: true,
        ..dec_params("pw")
    };
    let outcome = decrypt(&fx.volume, &fx.restored, &params, None, &CancelFlag::new()).unwrap();
    assert_eq!(outcome, Outcome::Kept);
}

#[test]
fn test_auth_tag_field_corruption_is_corrected() {
    let fx = encrypted_fixture(32 * 1024, enc_params("pw"));
    // The auth tag field is RS(64,192); a handful of flips inside it must
    // not break verification. It is the last 192 header bytes.
    let tag_start = HEADER_BASE - 192;
    flip(
        &fx.volume,
        &[tag_start, tag_start + 50, tag_start + 100, tag_start + 191],
    );

    let outcome = decrypt(
        &fx.volume,
        &fx.restored,
        &dec_params("pw"),
        None,
        &CancelFlag::new(),
    )
    .unwrap();
    assert_eq!(outcome, Outcome::Clean);
    assert_eq!(std::fs::read(&fx.restored).unwrap(), fx.data);
}

#[test]
fn test_truncated_body_with_rs() {
    let params = EncryptParams {
        reed_solomon: true,
        ..enc_params("pw")
    };
    let fx = encrypted_fixture(MIB / 4, params);
    // Chop 100 bytes off the end: the final codeword turns ragged.
    let bytes = std::fs::read(&fx.volume).unwrap();
    std::fs::write(&fx.volume, &bytes[..bytes.len() - 100]).unwrap();

    let err = decrypt(
        &fx.volume,
        &fx.restored,
        &dec_params("pw"),
        None,
        &CancelFlag::new(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        PcvError::BodyIrrecoverable | PcvError::IntegrityFailed
    ));
}
