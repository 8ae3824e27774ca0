// src/utils/discovery.rs
//! Turns a stage's output directory into a typed list of read files. Listing happens
//! once, after the producing task has finished; the scheduler only sees the result.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::{debug, warn};

use crate::config::defs::UNCLASSIFIED_TAG;
use crate::utils::file::{concatenate_files, fastq_stem, is_fastq, is_gzipped};
use crate::utils::samplesheet::normalize_barcode;

const MAX_DEPTH: usize = 3;
const FAILED_READS_DIR: &str = "fail";

/// One barcode's reads after demultiplexing.
#[derive(Debug, Clone, PartialEq)]
pub struct DemuxFastq {
    pub barcode: String,
    pub fastq: PathBuf,
}

/// Every FASTQ below `dir`, skipping reads the basecaller failed and the staging
/// directory merged files are written to.
fn list_fastqs(dir: &Path, skip: &Path, depth: usize, found: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| anyhow!("Failed to list {}: {}", dir.display(), e))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            if path == skip {
                continue;
            }
            let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            if depth < MAX_DEPTH && name != FAILED_READS_DIR {
                list_fastqs(&path, skip, depth + 1, found)?;
            }
        } else if is_fastq(&path) {
            found.push(path);
        }
    }
    Ok(())
}

/// Barcode a read file belongs to: its directory (`barcode01/chunk_0.fastq.gz`) or
/// its own name (`barcode01.fastq`).
fn barcode_of(path: &Path) -> Option<String> {
    let parent = path.parent().and_then(|p| p.file_name()).map(|n| n.to_string_lossy().to_string());
    parent
        .as_deref()
        .and_then(normalize_barcode)
        .or_else(|| fastq_stem(path).as_deref().and_then(normalize_barcode))
}

fn merged_name(stem: &str, parts: &[PathBuf]) -> Result<String> {
    let mut gzipped = None;
    for part in parts {
        let gz = is_gzipped(part)?;
        match gzipped {
            None => gzipped = Some(gz),
            Some(prev) if prev != gz => {
                return Err(anyhow!("Mixed compressed and plain reads for {}", stem));
            }
            Some(_) => {}
        }
    }
    Ok(if gzipped.unwrap_or(false) {
        format!("{}.fastq.gz", stem)
    } else {
        format!("{}.fastq", stem)
    })
}

/// Groups demultiplexed reads by barcode and concatenates each group into
/// `<staging>/<barcode>.fastq[.gz]`. Unclassified reads are dropped.
///
/// # Arguments
///
/// * `dir` - Output directory of the basecaller or demultiplexer.
/// * `staging` - Directory receiving one merged file per barcode.
///
/// # Returns
/// Vec<DemuxFastq> sorted by barcode.
pub fn discover_barcodes(dir: &Path, staging: &Path) -> Result<Vec<DemuxFastq>> {
    let mut files = Vec::new();
    list_fastqs(dir, staging, 0, &mut files)?;
    files.sort();

    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut unassigned = 0usize;
    for file in files {
        match barcode_of(&file) {
            Some(barcode) => groups.entry(barcode).or_default().push(file),
            None => {
                if !file.components().any(|c| c.as_os_str() == UNCLASSIFIED_TAG) {
                    debug!("No barcode in {}", file.display());
                }
                unassigned += 1;
            }
        }
    }
    if unassigned > 0 {
        debug!("Discarded {} unclassified read file(s)", unassigned);
    }
    if groups.is_empty() {
        warn!("No barcoded reads found in {}", dir.display());
    }

    let mut discovered = Vec::with_capacity(groups.len());
    for (barcode, parts) in groups {
        let merged = staging.join(merged_name(&barcode, &parts)?);
        concatenate_files(&parts, &merged)?;
        discovered.push(DemuxFastq { barcode, fastq: merged });
    }
    Ok(discovered)
}

/// Concatenates every read file below `dir` into `<staging>/<sample_id>.fastq[.gz]`.
pub fn discover_pooled(dir: &Path, staging: &Path, sample_id: &str) -> Result<PathBuf> {
    let mut files = Vec::new();
    list_fastqs(dir, staging, 0, &mut files)?;
    if files.is_empty() {
        return Err(anyhow!("No reads found in {}", dir.display()));
    }
    files.sort();
    let merged = staging.join(merged_name(sample_id, &files)?);
    concatenate_files(&files, &merged)?;
    Ok(merged)
}
