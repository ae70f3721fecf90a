//! Volume splitting and recombination
//!
//! A finished volume can be sliced into numbered chunks `name.0 .. name.k-1`
//! for transport, and such a chunk series can be concatenated back into one
//! volume before decryption. The first missing index is the end sentinel.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PcvError, PcvResult};
use crate::pipeline::{read_full, CancelFlag, OutputGuard, ProgressFn};
use crate::MIB;

/// Units a split size can be expressed in. `Total` means "this many chunks"
/// rather than a byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitUnit {
    KiB,
    MiB,
    GiB,
    TiB,
    Total,
}

/// A split request: a value and its unit, e.g. `512 KiB` or `4 Total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSpec {
    pub value: u64,
    pub unit: SplitUnit,
}

impl SplitSpec {
    /// Resolve to a chunk size in bytes for a volume of `volume_size`.
    pub fn chunk_size(&self, volume_size: u64) -> PcvResult<u64> {
        if self.value == 0 {
            return Err(PcvError::InvalidSplitSize);
        }
        let size = match self.unit {
            SplitUnit::KiB => self.value << 10,
            SplitUnit::MiB => self.value << 20,
            SplitUnit::GiB => self.value << 30,
            SplitUnit::TiB => self.value << 40,
            SplitUnit::Total => volume_size.div_ceil(self.value),
        };
        if size == 0 {
            return Err(PcvError::InvalidSplitSize);
        }
        Ok(size)
    }
}

impl FromStr for SplitSpec {
    type Err = PcvError;

    /// Parse strings like `512KiB`, `2GiB`, or `4Total`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
        let unit = match s[digits.len()..].trim() {
            "KiB" => SplitUnit::KiB,
            "MiB" => SplitUnit::MiB,
            "GiB" => SplitUnit::GiB,
            "TiB" => SplitUnit::TiB,
            "Total" => SplitUnit::Total,
            _ => return Err(PcvError::InvalidSplitSize),
        };
        let value = digits.parse().map_err(|_| PcvError::InvalidSplitSize)?;
        Ok(SplitSpec { value, unit })
    }
}

/// `volume` with a numeric suffix appended: `vol.pcv` → `vol.pcv.3`.
pub fn numbered(volume: &Path, index: usize) -> PathBuf {
    let mut name = OsString::from(volume.as_os_str());
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

// Removes every chunk written so far unless disarmed by success.
struct ChunksGuard {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl ChunksGuard {
    fn new() -> Self {
        Self {
            paths: Vec::new(),
            armed: true,
        }
    }

    fn disarm(mut self) -> Vec<PathBuf> {
        self.armed = false;
        std::mem::take(&mut self.paths)
    }
}

impl Drop for ChunksGuard {
    fn drop(&mut self) {
        if self.armed {
            for path in &self.paths {
                let _ = fs::remove_file(path);
            }
        }
    }
}

fn report(progress: Option<&ProgressFn>, done: u64, total: u64, stage: &str) {
    if let Some(callback) = progress {
        callback(done, total, stage);
    }
}

/// Slice `volume` into numbered chunks of at most `spec` bytes each.
///
/// The source volume is left in place; callers that want Picocrypt's
/// split-and-discard behavior remove it after this returns. On any error or
/// cancellation all chunks written so far are deleted.
pub fn split(
    volume: &Path,
    spec: &SplitSpec,
    progress: Option<&ProgressFn>,
    cancel: &CancelFlag,
) -> PcvResult<Vec<PathBuf>> {
    let size = fs::metadata(volume).map_err(PcvError::InputAccess)?.len();
    let chunk_size = spec.chunk_size(size)?;
    let chunk_count = size.div_ceil(chunk_size).max(1);

    let mut fin = File::open(volume).map_err(PcvError::InputAccess)?;
    let mut guard = ChunksGuard::new();
    let mut buf = vec![0u8; MIB];
    let mut total_done: u64 = 0;

    for index in 0..chunk_count {
        let path = numbered(volume, index as usize);
        let mut fout = File::create(&path).map_err(PcvError::OutputAccess)?;
        guard.paths.push(path);

        let mut done: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(PcvError::Cancelled);
            }
            // Shrink the copy buffer near the chunk boundary so a chunk
            // never overshoots its size.
            let mut want = buf.len();
            while done + want as u64 > chunk_size && want > 1 {
                want = want.div_ceil(2);
            }
            if done + want as u64 > chunk_size {
                break;
            }
            let n = read_full(&mut fin, &mut buf[..want]).map_err(PcvError::InputAccess)?;
            if n == 0 {
                break;
            }
            fout.write_all(&buf[..n])
                .map_err(PcvError::InsufficientSpace)?;
            done += n as u64;
            total_done += n as u64;
            report(progress, total_done, size, "splitting");
            if done >= chunk_size {
                break;
            }
        }
        fout.flush().map_err(PcvError::InsufficientSpace)?;
    }

    Ok(guard.disarm())
}

/// Count the contiguous chunk series `base.0 ..`; the first missing index
/// ends the series.
pub fn chunk_count(base: &Path) -> usize {
    let mut count = 0;
    while numbered(base, count).is_file() {
        count += 1;
    }
    count
}

/// Concatenate the chunk series of `base` into a single volume at `output`.
///
/// Returns the recombined size. Fails with [`PcvError::IncompleteVolume`]
/// when `base.0` does not exist.
pub fn recombine(
    base: &Path,
    output: &Path,
    progress: Option<&ProgressFn>,
    cancel: &CancelFlag,
) -> PcvResult<u64> {
    let count = chunk_count(base);
    if count == 0 {
        return Err(PcvError::IncompleteVolume(numbered(base, 0)));
    }

    let total: u64 = (0..count)
        .map(|i| {
            fs::metadata(numbered(base, i))
                .map(|m| m.len())
                .map_err(PcvError::InputAccess)
        })
        .sum::<PcvResult<u64>>()?;

    let mut fout = File::create(output).map_err(PcvError::OutputAccess)?;
    let guard = OutputGuard::new(output);
    let mut buf = vec![0u8; MIB];
    let mut done: u64 = 0;

    for index in 0..count {
        let path = numbered(base, index);
        let mut fin = File::open(&path).map_err(PcvError::InputAccess)?;
        loop {
            if cancel.is_cancelled() {
                return Err(PcvError::Cancelled);
            }
            let n = read_full(&mut fin, &mut buf).map_err(PcvError::InputAccess)?;
            if n == 0 {
                break;
            }
            fout.write_all(&buf[..n])
                .map_err(PcvError::InsufficientSpace)?;
            done += n as u64;
            report(progress, done, total, "recombining");
        }
    }
    fout.flush().map_err(PcvError::InsufficientSpace)?;

    guard.disarm();
    Ok(done)
}
