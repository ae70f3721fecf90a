//! Zip staging for folder and multi-file inputs
//!
//! Aggregation happens outside the crypto core: the inputs are archived
//! (stored by default, deflated with `--compress`) into a staging zip that
//! the pipeline then consumes as an opaque byte stream. The staging file is
//! always deleted afterwards, success or not.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// A read-only byte source that tees the number of bytes read into an
/// atomic counter, so a progress reader can observe archive progress
/// without threading callbacks through the zip writer.
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, count: Arc<AtomicU64>) -> Self {
        Self { inner, count }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Build the staging zip at `dest` from the dropped inputs.
///
/// Entry names are relative to the parent directory of the first input, so
/// a dropped folder keeps its own name as the top-level directory inside
/// the archive. `tick` is called with the running byte count after every
/// copied block.
pub fn build_zip(
    inputs: &[PathBuf],
    dest: &Path,
    compress: bool,
    tick: impl Fn(u64),
) -> anyhow::Result<()> {
    let root = inputs
        .first()
        .and_then(|p| p.parent())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let mut entries: Vec<(String, PathBuf)> = Vec::new();
    for input in inputs {
        if input.is_dir() {
            for (path, _) in pcv_volume::scan::collect_files(input)? {
                entries.push((entry_name(&root, &path), path));
            }
        } else {
            entries.push((entry_name(&root, input), input.clone()));
        }
    }

    let method = if compress {
        CompressionMethod::Deflated
    } else {
        CompressionMethod::Stored
    };
    let options = SimpleFileOptions::default()
        .compression_method(method)
        .large_file(true);

    let file = File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut writer = ZipWriter::new(file);
    let count = Arc::new(AtomicU64::new(0));
    let mut buf = vec![0u8; 1 << 20];

    for (name, path) in entries {
        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("adding {name} to archive"))?;
        let fin = File::open(&path).with_context(|| format!("reading {}", path.display()))?;
        let mut reader = CountingReader::new(fin, count.clone());
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
            tick(count.load(Ordering::Relaxed));
        }
    }

    writer.finish().context("finishing archive")?;
    Ok(())
}

fn entry_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "/")
}
