use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use tempfile::NamedTempFile;

use crate::config::defs::FASTQ_EXTS;

/// Resolves a user-supplied path against the working directory.
/// `scheme://` locations (S3 buckets, URLs) that the local file system cannot see.
pub fn is_remote(raw: &str) -> bool {
    raw.contains("://")
}

pub fn resolve_path(raw: &str, cwd: &Path) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

/// Builds `<dir>/<prefix><delim><base><delim><suffix>`, skipping absent parts.
///
/// # Arguments
///
/// * `base` - Core of the file name, usually a sample id.
/// * `dir` - Optional parent directory.
/// * `prefix` - Optional prefix joined before `base`.
/// * `suffix` - Optional suffix joined after `base`.
/// * `delimiter` - Separator between the parts.
///
/// # Returns
/// PathBuf of the assembled name.
pub fn file_path_manipulator(
    base: &str,
    dir: Option<&Path>,
    prefix: Option<&str>,
    suffix: Option<&str>,
    delimiter: &str,
) -> PathBuf {
    let mut name = String::new();
    if let Some(prefix) = prefix {
        name.push_str(prefix);
        name.push_str(delimiter);
    }
    name.push_str(base);
    if let Some(suffix) = suffix {
        name.push_str(delimiter);
        name.push_str(suffix);
    }
    match dir {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// File name with any FASTQ extension removed, e.g. `barcode01.fastq.gz` -> `barcode01`.
pub fn fastq_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    FASTQ_EXTS
        .iter()
        .find_map(|ext| name.strip_suffix(&format!(".{}", ext)).map(str::to_string))
}

pub fn is_fastq(path: &Path) -> bool {
    path.is_file() && fastq_stem(path).is_some()
}

/// Concatenates `parts` into `dest` through a temp file in the same directory, so
/// `dest` either holds the full concatenation or does not exist.
/// Gzip members concatenate into a valid gzip stream.
pub fn concatenate_files(parts: &[PathBuf], dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("No parent directory for {}", dest.display()))?;
    fs::create_dir_all(parent)?;
    let mut staged = NamedTempFile::new_in(parent)?;
    for part in parts {
        let mut reader = File::open(part).map_err(|e| anyhow!("Failed to open {}: {}", part.display(), e))?;
        io::copy(&mut reader, staged.as_file_mut())?;
    }
    staged.as_file_mut().flush()?;
    staged
        .persist(dest)
        .map_err(|e| anyhow!("Failed to persist {}: {}", dest.display(), e.error))?;
    Ok(())
}

/// Writes `contents` to `dest` atomically.
pub fn write_atomic(dest: &Path, contents: &str) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("No parent directory for {}", dest.display()))?;
    fs::create_dir_all(parent)?;
    let mut staged = NamedTempFile::new_in(parent)?;
    staged.write_all(contents.as_bytes())?;
    staged
        .persist(dest)
        .map_err(|e| anyhow!("Failed to persist {}: {}", dest.display(), e.error))?;
    Ok(())
}
