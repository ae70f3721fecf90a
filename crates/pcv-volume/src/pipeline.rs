//! Streaming encrypt/decrypt pipeline
//!
//! The body is processed in 1 MiB plaintext units. Encryption composes
//! Serpent-CTR (paranoid only) under XChaCha20, feeds the ciphertext to the
//! running MAC, and optionally interleaves RS(128,136) parity. Decryption
//! reverses the chain; when the body carries parity the first pass skips
//! correction entirely and relies on the MAC, re-running with correction
//! only if authentication fails.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pcv_crypto::{
    derive_master_key, digest_keyfiles, Authenticator, CipherStack, KdfProfile, MasterKey,
    OuterCipher, RsCode, SubkeySchedule,
};
use secrecy::SecretString;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{PcvError, PcvResult};
use crate::header::{self, Header, HeaderFlags, ParsedHeader};
use crate::{ENCODED_MIB, MIB, REKEY_INTERVAL, RS_DATA_LEN, RS_TOTAL_LEN};

/// Progress callback type (bytes_done, bytes_total, stage)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

/// Cooperative cancellation flag, polled at unit and sub-chunk boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How an operation finished when it did not error out.
///
/// `Kept` means the keep option forced completion past header damage, a
/// verifier mismatch, body damage, or an authentication failure; the output
/// exists but must be treated with suspicion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Clean,
    Kept,
}

impl Outcome {
    pub fn is_kept(self) -> bool {
        matches!(self, Outcome::Kept)
    }
}

/// Immutable inputs to [`encrypt`].
pub struct EncryptParams {
    pub password: SecretString,
    pub keyfiles: Vec<PathBuf>,
    pub keyfiles_ordered: bool,
    pub paranoid: bool,
    pub reed_solomon: bool,
    pub comment: String,
    /// Rekey boundary in bytes; lowered only by tests.
    pub rekey_interval: u64,
}

impl EncryptParams {
    pub fn new(password: SecretString) -> Self {
        Self {
            password,
            keyfiles: Vec::new(),
            keyfiles_ordered: false,
            paranoid: false,
            reed_solomon: false,
            comment: String::new(),
            rekey_interval: REKEY_INTERVAL,
        }
    }
}

/// Immutable inputs to [`decrypt`].
pub struct DecryptParams {
    pub password: SecretString,
    pub keyfiles: Vec<PathBuf>,
    /// Force decryption past damage and mismatches, reporting `Kept`.
    pub keep: bool,
    pub rekey_interval: u64,
}

impl DecryptParams {
    pub fn new(password: SecretString) -> Self {
        Self {
            password,
            keyfiles: Vec::new(),
            keep: false,
            rekey_interval: REKEY_INTERVAL,
        }
    }
}

// Removes a partially written output unless disarmed by success.
pub(crate) struct OutputGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> OutputGuard<'a> {
    pub(crate) fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OutputGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(self.path);
        }
    }
}

fn report(progress: Option<&ProgressFn>, done: u64, total: u64, stage: &str) {
    if let Some(callback) = progress {
        callback(done, total, stage);
    }
}

// Read until the buffer is full or EOF.
pub(crate) fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// PKCS#7 to a full 128-byte block; an empty remainder yields a block of
// pure padding.
fn pad_block(data: &[u8]) -> [u8; RS_DATA_LEN] {
    debug_assert!(data.len() < RS_DATA_LEN);
    let pad = (RS_DATA_LEN - data.len()) as u8;
    let mut block = [pad; RS_DATA_LEN];
    block[..data.len()].copy_from_slice(data);
    block
}

fn unpad_block(block: &[u8]) -> Option<&[u8]> {
    if block.len() != RS_DATA_LEN {
        return None;
    }
    let pad = block[RS_DATA_LEN - 1] as usize;
    if (1..=RS_DATA_LEN).contains(&pad) {
        Some(&block[..RS_DATA_LEN - pad])
    } else {
        None
    }
}

/// Encrypt `input` into a volume at `output`.
pub fn encrypt(
    input: &Path,
    output: &Path,
    params: &EncryptParams,
    progress: Option<&ProgressFn>,
    cancel: &CancelFlag,
) -> PcvResult<Outcome> {
    let mut fin = File::open(input).map_err(PcvError::InputAccess)?;
    let total = fin.metadata().map_err(PcvError::InputAccess)?.len();

    let flags = HeaderFlags {
        paranoid: params.paranoid,
        keyfiles_used: !params.keyfiles.is_empty(),
        keyfiles_ordered: !params.keyfiles.is_empty() && params.keyfiles_ordered,
        reed_solomon: params.reed_solomon,
        tail_padded: total % MIB as u64 >= (MIB - RS_DATA_LEN) as u64,
    };
    let hdr = Header::generate(params.comment.clone(), flags)?;

    let mut fout = File::create(output).map_err(PcvError::OutputAccess)?;
    let guard = OutputGuard::new(output);
    hdr.write_placeholders(&mut fout)
        .map_err(PcvError::InsufficientSpace)?;

    report(progress, 0, total, "deriving key");
    let profile = if params.paranoid {
        KdfProfile::Paranoid
    } else {
        KdfProfile::Normal
    };
    let master = derive_master_key(&params.password, &hdr.argon_salt, profile)?;
    let key_hash = master.verifier();

    let (key, keyfile_hash) = if flags.keyfiles_used {
        let digest = digest_keyfiles(&params.keyfiles, flags.keyfiles_ordered)?;
        (master.xor(&digest.key), digest.verifier)
    } else {
        (master, [0u8; 32])
    };

    let mut schedule = SubkeySchedule::new(key.as_bytes(), &hdr.hkdf_salt);
    let mut mac_key: [u8; 32] = schedule.read_array()?;
    let mut serpent_key: [u8; 32] = schedule.read_array()?;
    let mut mac = Authenticator::new(flags.paranoid, &mac_key)?;
    mac_key.zeroize();
    let outer = if flags.paranoid {
        OuterCipher::serpent(serpent_key, &hdr.serpent_iv)
    } else {
        OuterCipher::disabled()
    };
    serpent_key.zeroize();
    let mut ciphers = CipherStack::new(key.as_bytes(), &hdr.nonce, outer);

    let body_code = flags
        .reed_solomon
        .then(|| RsCode::new(RS_DATA_LEN, RS_TOTAL_LEN));

    let mut buf = vec![0u8; MIB];
    let mut done: u64 = 0;
    let mut counter: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(PcvError::Cancelled);
        }
        let n = read_full(&mut fin, &mut buf).map_err(PcvError::InputAccess)?;
        if n == 0 {
            break;
        }
        let chunk = &mut buf[..n];
        ciphers.encrypt(chunk);
        mac.update(chunk);

        if let Some(code) = &body_code {
            let encoded = encode_body_unit(code, chunk, cancel)?;
            fout.write_all(&encoded)
                .map_err(PcvError::InsufficientSpace)?;
        } else {
            fout.write_all(chunk).map_err(PcvError::InsufficientSpace)?;
        }

        done += n as u64;
        counter += MIB as u64;
        report(progress, done, total, "encrypting");

        if counter >= params.rekey_interval {
            let nonce: [u8; 24] = schedule.read_array()?;
            let iv: [u8; 16] = schedule.read_array()?;
            ciphers.rekey(&nonce, &iv);
            counter = 0;
            tracing::debug!(bytes_done = done, "rekeyed stream ciphers");
        }
    }

    let tag = mac.finalize();
    hdr.write_verifiers(&mut fout, &key_hash, &keyfile_hash, &tag)
        .map_err(PcvError::InsufficientSpace)?;
    fout.flush().map_err(PcvError::InsufficientSpace)?;

    guard.disarm();
    Ok(Outcome::Clean)
}

fn encode_body_unit(code: &RsCode, chunk: &[u8], cancel: &CancelFlag) -> PcvResult<Vec<u8>> {
    let mut out = Vec::with_capacity(ENCODED_MIB);
    if chunk.len() == MIB {
        for sub in chunk.chunks_exact(RS_DATA_LEN) {
            if cancel.is_cancelled() {
                return Err(PcvError::Cancelled);
            }
            out.extend_from_slice(&code.encode(sub));
        }
    } else {
        // Final partial unit: encode the whole sub-chunks, then pad the
        // remainder (possibly empty) to a full block.
        let full = chunk.len() / RS_DATA_LEN * RS_DATA_LEN;
        for sub in chunk[..full].chunks_exact(RS_DATA_LEN) {
            if cancel.is_cancelled() {
                return Err(PcvError::Cancelled);
            }
            out.extend_from_slice(&code.encode(sub));
        }
        out.extend_from_slice(&code.encode(&pad_block(&chunk[full..])));
    }
    Ok(out)
}

/// Decrypt a volume at `input` into `output`.
///
/// With an RS-encoded body the first pass runs fast (no correction); an
/// authentication failure then triggers exactly one corrective re-run with
/// both files reopened from scratch.
pub fn decrypt(
    input: &Path,
    output: &Path,
    params: &DecryptParams,
    progress: Option<&ProgressFn>,
    cancel: &CancelFlag,
) -> PcvResult<Outcome> {
    let mut fin = File::open(input).map_err(PcvError::InputAccess)?;
    let file_len = fin.metadata().map_err(PcvError::InputAccess)?.len();
    let hdr = header::read_header(&mut fin)?;
    drop(fin);

    let mut kept = false;
    if hdr.damaged {
        if params.keep {
            kept = true;
        } else {
            return Err(PcvError::HeaderDamaged);
        }
    }

    let keyfile_digest = if hdr.flags.keyfiles_used {
        if params.keyfiles.is_empty() {
            if params.keep {
                kept = true;
                None
            } else if hdr.flags.keyfiles_ordered {
                return Err(PcvError::WrongKeyfileOrder);
            } else {
                return Err(PcvError::WrongKeyfiles);
            }
        } else {
            Some(digest_keyfiles(&params.keyfiles, hdr.flags.keyfiles_ordered)?)
        }
    } else {
        None
    };

    report(progress, 0, 0, "deriving key");
    let profile = if hdr.flags.paranoid {
        KdfProfile::Paranoid
    } else {
        KdfProfile::Normal
    };
    let master = derive_master_key(&params.password, &hdr.argon_salt, profile)?;

    let key_ok: bool = master.verifier().ct_eq(&hdr.key_hash).into();
    let provided_keyfile_hash = keyfile_digest
        .as_ref()
        .map(|d| d.verifier)
        .unwrap_or([0u8; 32]);
    let keyfile_ok: bool = provided_keyfile_hash.ct_eq(&hdr.keyfile_hash).into();

    if !key_ok || (hdr.flags.keyfiles_used && !keyfile_ok) {
        if params.keep {
            kept = true;
        } else if !key_ok {
            return Err(PcvError::WrongPassword);
        } else if hdr.flags.keyfiles_ordered {
            return Err(PcvError::WrongKeyfileOrder);
        } else {
            return Err(PcvError::WrongKeyfiles);
        }
    }

    let key = match &keyfile_digest {
        Some(digest) => master.xor(&digest.key),
        None => master,
    };

    let header_len = hdr.encoded_len();
    let total_body = file_len.saturating_sub(header_len);

    let guard = OutputGuard::new(output);
    let mut fast = hdr.flags.reed_solomon;
    loop {
        let pass = run_decrypt_pass(
            input,
            output,
            &hdr,
            &key,
            header_len,
            total_body,
            fast,
            params,
            progress,
            cancel,
        )?;
        kept |= pass.kept;
        if pass.mac_ok {
            break;
        }
        if fast {
            // The fast path skipped correction; give RS a chance to repair
            // whatever broke the tag.
            tracing::debug!("authentication failed on fast pass; re-running with correction");
            fast = false;
            continue;
        }
        if params.keep {
            kept = true;
            break;
        }
        return Err(PcvError::IntegrityFailed);
    }

    guard.disarm();
    Ok(if kept { Outcome::Kept } else { Outcome::Clean })
}

struct PassResult {
    mac_ok: bool,
    kept: bool,
}

#[allow(clippy::too_many_arguments)]
fn run_decrypt_pass(
    input: &Path,
    output: &Path,
    hdr: &ParsedHeader,
    key: &MasterKey,
    header_len: u64,
    total_body: u64,
    fast: bool,
    params: &DecryptParams,
    progress: Option<&ProgressFn>,
    cancel: &CancelFlag,
) -> PcvResult<PassResult> {
    let mut fin = File::open(input).map_err(PcvError::InputAccess)?;
    fin.seek(SeekFrom::Start(header_len))?;
    let mut fout = File::create(output).map_err(PcvError::OutputAccess)?;

    let mut schedule = SubkeySchedule::new(key.as_bytes(), &hdr.hkdf_salt);
    let mut mac_key: [u8; 32] = schedule.read_array()?;
    let mut serpent_key: [u8; 32] = schedule.read_array()?;
    let mut mac = Authenticator::new(hdr.flags.paranoid, &mac_key)?;
    mac_key.zeroize();
    let outer = if hdr.flags.paranoid {
        OuterCipher::serpent(serpent_key, &hdr.serpent_iv)
    } else {
        OuterCipher::disabled()
    };
    serpent_key.zeroize();
    let mut ciphers = CipherStack::new(key.as_bytes(), &hdr.nonce, outer);

    let body_code = hdr
        .flags
        .reed_solomon
        .then(|| RsCode::new(RS_DATA_LEN, RS_TOTAL_LEN));
    let unit_len = if hdr.flags.reed_solomon {
        ENCODED_MIB
    } else {
        MIB
    };
    let stage = if hdr.flags.reed_solomon && !fast {
        "repairing"
    } else {
        "decrypting"
    };

    let mut buf = vec![0u8; unit_len];
    let mut kept = false;
    let mut done: u64 = 0;
    let mut counter: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(PcvError::Cancelled);
        }
        let n = read_full(&mut fin, &mut buf).map_err(PcvError::InputAccess)?;
        if n == 0 {
            break;
        }

        if let Some(code) = &body_code {
            let last_unit = done + ENCODED_MIB as u64 >= total_body;
            let mut plain = decode_body_unit(
                code,
                &buf[..n],
                fast,
                last_unit && hdr.flags.tail_padded,
                params.keep,
                &mut kept,
                cancel,
            )?;
            mac.update(&plain);
            ciphers.decrypt(&mut plain);
            fout.write_all(&plain).map_err(PcvError::InsufficientSpace)?;
        } else {
            let chunk = &mut buf[..n];
            mac.update(chunk);
            ciphers.decrypt(chunk);
            fout.write_all(chunk).map_err(PcvError::InsufficientSpace)?;
        }

        done += n as u64;
        counter += MIB as u64;
        report(progress, done, total_body, stage);

        if counter >= params.rekey_interval {
            let nonce: [u8; 24] = schedule.read_array()?;
            let iv: [u8; 16] = schedule.read_array()?;
            ciphers.rekey(&nonce, &iv);
            counter = 0;
            tracing::debug!(bytes_done = done, "rekeyed stream ciphers");
        }
    }
    fout.flush().map_err(PcvError::InsufficientSpace)?;

    let tag = mac.finalize();
    let mac_ok: bool = tag.ct_eq(&hdr.auth_tag).into();
    Ok(PassResult { mac_ok, kept })
}

fn decode_sub(
    code: &RsCode,
    sub: &[u8],
    fast: bool,
    keep: bool,
    kept: &mut bool,
) -> PcvResult<Vec<u8>> {
    if fast {
        return Ok(sub[..RS_DATA_LEN].to_vec());
    }
    match code.decode(sub) {
        Ok(data) => Ok(data),
        Err(err) => {
            if keep {
                *kept = true;
                Ok(err.best_effort)
            } else {
                Err(PcvError::BodyIrrecoverable)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_body_unit(
    code: &RsCode,
    unit: &[u8],
    fast: bool,
    unpad_tail: bool,
    keep: bool,
    kept: &mut bool,
    cancel: &CancelFlag,
) -> PcvResult<Vec<u8>> {
    let mut plain = Vec::with_capacity(MIB);

    let remainder = unit.len() % RS_TOTAL_LEN;
    if remainder != 0 {
        // A well-formed body is a whole number of 136-byte codewords; a
        // ragged tail means truncation or growth.
        if !keep {
            return Err(PcvError::BodyIrrecoverable);
        }
        *kept = true;
    }

    let sub_count = unit.len() / RS_TOTAL_LEN;
    let full_unit = unit.len() == ENCODED_MIB;
    for (idx, sub) in unit.chunks_exact(RS_TOTAL_LEN).enumerate() {
        if cancel.is_cancelled() {
            return Err(PcvError::Cancelled);
        }
        let data = decode_sub(code, sub, fast, keep, kept)?;

        let is_last = idx == sub_count - 1 && remainder == 0;
        // A full-size unit unpads only when it is the padded tail of the
        // body; a short unit always carries padding in its last sub-chunk.
        let needs_unpad = if full_unit {
            is_last && unpad_tail
        } else {
            is_last
        };
        if needs_unpad {
            match unpad_block(&data) {
                Some(stripped) => plain.extend_from_slice(stripped),
                None => {
                    if !keep {
                        return Err(PcvError::BodyIrrecoverable);
                    }
                    *kept = true;
                    plain.extend_from_slice(&data);
                }
            }
        } else {
            plain.extend_from_slice(&data);
        }
    }

    if remainder != 0 {
        // Salvage whatever systematic prefix the ragged tail still has.
        let tail = &unit[unit.len() - remainder..];
        plain.extend_from_slice(&tail[..tail.len().min(RS_DATA_LEN)]);
    }

    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_unpad_roundtrip() {
        let data = [9u8; 37];
        let block = pad_block(&data);
        assert_eq!(block.len(), RS_DATA_LEN);
        assert_eq!(block[RS_DATA_LEN - 1], (RS_DATA_LEN - 37) as u8);
        assert_eq!(unpad_block(&block).unwrap(), &data);
    }

    #[test]
    fn test_pad_empty_remainder_is_full_block() {
        let block = pad_block(&[]);
        assert!(block.iter().all(|&b| b == RS_DATA_LEN as u8));
        assert_eq!(unpad_block(&block).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_unpad_rejects_invalid_pad_byte() {
        let mut block = [0u8; RS_DATA_LEN];
        block[RS_DATA_LEN - 1] = 0;
        assert!(unpad_block(&block).is_none());
        block[RS_DATA_LEN - 1] = (RS_DATA_LEN + 1) as u8;
        assert!(unpad_block(&block).is_none());
    }

    #[test]
    fn test_encode_decode_body_unit_partial() {
        let code = RsCode::new(RS_DATA_LEN, RS_TOTAL_LEN);
        let cancel = CancelFlag::new();
        let chunk: Vec<u8> = (0..300u32).map(|i| i as u8).collect();

        let encoded = encode_body_unit(&code, &chunk, &cancel).unwrap();
        // 2 full sub-chunks plus a padded third.
        assert_eq!(encoded.len(), 3 * RS_TOTAL_LEN);

        let mut kept = false;
        let decoded =
            decode_body_unit(&code, &encoded, false, false, false, &mut kept, &cancel).unwrap();
        assert!(!kept);
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_decode_body_unit_fast_matches_slow_when_clean() {
        let code = RsCode::new(RS_DATA_LEN, RS_TOTAL_LEN);
        let cancel = CancelFlag::new();
        let chunk = vec![0xA7u8; 1000];
        let encoded = encode_body_unit(&code, &chunk, &cancel).unwrap();

        let mut kept = false;
        let slow =
            decode_body_unit(&code, &encoded, false, false, false, &mut kept, &cancel).unwrap();
        let fast =
            decode_body_unit(&code, &encoded, true, false, false, &mut kept, &cancel).unwrap();
        assert_eq!(slow, fast);
        assert!(!kept);
    }

    #[test]
    fn test_decode_body_unit_corrects_flips() {
        let code = RsCode::new(RS_DATA_LEN, RS_TOTAL_LEN);
        let cancel = CancelFlag::new();
        let chunk = vec![0x3Cu8; 500];
        let mut encoded = encode_body_unit(&code, &chunk, &cancel).unwrap();
        // Four flips inside the second sub-chunk stay within capacity.
        for offset in [RS_TOTAL_LEN + 1, RS_TOTAL_LEN + 40, RS_TOTAL_LEN + 90, RS_TOTAL_LEN + 135] {
            encoded[offset] ^= 0xFF;
        }

        let mut kept = false;
        let decoded =
            decode_body_unit(&code, &encoded, false, false, false, &mut kept, &cancel).unwrap();
        assert_eq!(decoded, chunk);
        assert!(!kept);
    }

    #[test]
    fn test_decode_body_unit_past_capacity() {
        let code = RsCode::new(RS_DATA_LEN, RS_TOTAL_LEN);
        let cancel = CancelFlag::new();
        let chunk = vec![0x3Cu8; 500];
        let mut encoded = encode_body_unit(&code, &chunk, &cancel).unwrap();
        for offset in 0..10 {
            encoded[offset] ^= 0x55;
        }

        let mut kept = false;
        let err = decode_body_unit(&code, &encoded, false, false, false, &mut kept, &cancel)
            .unwrap_err();
        assert!(matches!(err, PcvError::BodyIrrecoverable));

        // Under keep the damaged bytes pass through and the flag is raised;
        // the clean padded tail still unpads, so the length is preserved.
        let mut kept = false;
        let decoded =
            decode_body_unit(&code, &encoded, false, false, true, &mut kept, &cancel).unwrap();
        assert!(kept);
        assert_eq!(decoded.len(), chunk.len());
    }

    #[test]
    fn test_cancel_flag_shared_across_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
