//! Input scanning and mode detection
//!
//! Mirrors the drop conventions of the volume format:
//! - a single `.pcv` file decrypts in place;
//! - a single `name.pcv.<n>` chunk recombines its series, then decrypts;
//! - any other single file encrypts to `<name>.pcv`;
//! - a folder or multiple items are zip-staged and encrypt to
//!   `Encrypted.zip.pcv`.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::error::{PcvError, PcvResult};
use crate::header::{self, VolumeInfo};
use crate::split;
use crate::VOLUME_EXT;

/// What the scan decided to do with the dropped inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Encrypt {
        /// Inputs must be aggregated into a staging zip first.
        stage_zip: bool,
    },
    Decrypt {
        /// The input is a chunk series that must be recombined first.
        recombine: bool,
    },
}

/// Result of scanning the dropped inputs.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub mode: Mode,
    /// The stream fed to the pipeline: the file itself, the chunk-series
    /// base for recombination, or the staging zip yet to be written.
    pub input: PathBuf,
    /// Where the pipeline output lands.
    pub output: PathBuf,
    /// Total input size (all chunks for a series, all files for a zip).
    pub total_size: u64,
    /// Header info of the decrypt target, for comment display and the
    /// keyfile requirement.
    pub volume: Option<VolumeInfo>,
}

/// Decide the mode and paths for a set of dropped inputs.
pub fn scan_inputs(inputs: &[PathBuf]) -> PcvResult<ScanResult> {
    let first = inputs.first().ok_or_else(|| anyhow::anyhow!("no inputs given"))?;

    if inputs.len() == 1 && first.is_file() {
        if let Some(base) = chunk_series_base(first) {
            // name.pcv.3 → recombine name.pcv.0.. then decrypt
            let count = split::chunk_count(&base);
            if count == 0 {
                return Err(PcvError::IncompleteVolume(split::numbered(&base, 0)));
            }
            let total_size = (0..count)
                .map(|i| {
                    std::fs::metadata(split::numbered(&base, i))
                        .map(|m| m.len())
                        .map_err(PcvError::InputAccess)
                })
                .sum::<PcvResult<u64>>()?;
            let volume = header::peek(&split::numbered(&base, 0))?;
            return Ok(ScanResult {
                mode: Mode::Decrypt { recombine: true },
                output: strip_volume_ext(&base),
                input: base,
                total_size,
                volume: Some(volume),
            });
        }

        if first.extension().and_then(|e| e.to_str()) == Some(VOLUME_EXT) {
            let total_size = std::fs::metadata(first)
                .map_err(PcvError::InputAccess)?
                .len();
            let volume = header::peek(first)?;
            return Ok(ScanResult {
                mode: Mode::Decrypt { recombine: false },
                input: first.clone(),
                output: strip_volume_ext(first),
                total_size,
                volume: Some(volume),
            });
        }

        // A lone non-volume file encrypts next to itself.
        let total_size = std::fs::metadata(first)
            .map_err(PcvError::InputAccess)?
            .len();
        let mut output = first.as_os_str().to_os_string();
        output.push(".pcv");
        return Ok(ScanResult {
            mode: Mode::Encrypt { stage_zip: false },
            input: first.clone(),
            output: PathBuf::from(output),
            total_size,
            volume: None,
        });
    }

    // Folders or multiple items: aggregate into a staging zip beside the
    // first input.
    let mut total_size = 0;
    for input in inputs {
        if input.is_dir() {
            total_size += collect_files(input)
                .map_err(PcvError::Other)?
                .iter()
                .map(|(_, size)| size)
                .sum::<u64>();
        } else {
            total_size += std::fs::metadata(input)
                .map_err(PcvError::InputAccess)?
                .len();
        }
    }

    let staging = first
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("Encrypted.zip");
    let mut output = staging.as_os_str().to_os_string();
    output.push(".pcv");
    Ok(ScanResult {
        mode: Mode::Encrypt { stage_zip: true },
        input: staging,
        output: PathBuf::from(output),
        total_size,
        volume: None,
    })
}

/// For `name.pcv.<digits>`, the `name.pcv` series base.
fn chunk_series_base(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let (stem, digits) = name.rsplit_once('.')?;
    if !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && stem.ends_with(&format!(".{VOLUME_EXT}"))
    {
        Some(path.with_file_name(stem))
    } else {
        None
    }
}

fn strip_volume_ext(path: &Path) -> PathBuf {
    path.with_extension("")
}

/// Recursively walk a directory, returning (path, size) pairs for every
/// regular file.
pub fn collect_files(dir: &Path) -> anyhow::Result<Vec<(PathBuf, u64)>> {
    let mut results = Vec::new();
    collect_files_inner(dir, &mut results)?;
    Ok(results)
}

fn collect_files_inner(current: &Path, results: &mut Vec<(PathBuf, u64)>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(current)
        .with_context(|| format!("reading directory {}", current.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files_inner(&path, results)?;
        } else if path.is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            results.push((path, size));
        }
    }
    Ok(())
}
