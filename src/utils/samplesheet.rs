// src/utils/samplesheet.rs
//! Samplesheet parsing: header-keyed CSV rows become immutable sample records, with
//! genome fields resolved to reference FASTA paths.

use std::fs;
use std::path::{Path, PathBuf};

use fxhash::FxHashSet;
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

use crate::config::defs::PipelineError;
use crate::config::genomes::symbolic_fasta;
use crate::config::plan::{ExecutionPlan, StageId};
use crate::utils::file::{is_remote, resolve_path};

lazy_static! {
    static ref BARCODE_RE: Regex = Regex::new(r"(?i)^(?:barcode|bc|nb)?0*(\d+)$").unwrap();
}

/// Canonical barcode key: `1`, `01`, `BC01` and `barcode1` all become `barcode01`.
pub fn normalize_barcode(raw: &str) -> Option<String> {
    let caps = BARCODE_RE.captures(raw.trim())?;
    let number: u32 = caps[1].parse().ok()?;
    Some(format!("barcode{:02}", number))
}

/// A reference genome as named in the samplesheet. `identity` is the join key that
/// reunites reference-derived artifacts with samples.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenomeReference {
    pub identity: String,
    pub fasta: PathBuf,
}

impl GenomeReference {
    /// File-system safe name for artifacts derived from this genome, unique per identity.
    /// Identities that need escaping (`human/genome.fa`) carry a hash of the raw identity
    /// so that `human/genome.fa` and `human_genome.fa` stay apart.
    pub fn label(&self) -> String {
        let escaped: String = self
            .identity
            .trim_start_matches("./")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect();
        let escaped = escaped.trim_start_matches(['_', '.']);
        if escaped == self.identity {
            escaped.to_string()
        } else {
            format!("{}-{:08x}", escaped, fxhash::hash32(&self.identity))
        }
    }
}

/// One validated samplesheet row.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub sample_id: String,
    pub barcode: Option<String>,
    pub fastq: Option<PathBuf>,
    pub genome: Option<GenomeReference>,
}

/// Reads ready for QC and alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct FastqSample {
    pub sample_id: String,
    pub fastq: PathBuf,
    pub genome: Option<GenomeReference>,
}

/// Sample metadata waiting for its demultiplexed reads.
#[derive(Debug, Clone, PartialEq)]
pub struct BarcodedSample {
    pub sample_id: String,
    pub barcode: String,
    pub genome: Option<GenomeReference>,
}

impl BarcodedSample {
    pub fn with_reads(self, fastq: PathBuf) -> FastqSample {
        FastqSample {
            sample_id: self.sample_id,
            fastq,
            genome: self.genome,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleCatalog {
    records: Vec<SampleRecord>,
}

const STAGE: &str = "samplesheet_check";

impl SampleCatalog {
    pub fn load(plan: &ExecutionPlan) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(&plan.input)
            .map_err(|e| PipelineError::InvalidSamplesheet(format!("{}: {}", plan.input.display(), e)))?;
        let base = plan.input.parent().unwrap_or_else(|| Path::new("."));
        let catalog = Self::parse(&text, base, plan)?;
        info!("Samplesheet lists {} sample(s)", catalog.records.len());
        Ok(catalog)
    }

    /// Parses samplesheet text. Relative paths resolve against `base`.
    ///
    /// # Arguments
    ///
    /// * `text` - CSV with a header naming at least the `sample` column.
    /// * `base` - Directory holding the samplesheet.
    /// * `plan` - Decides which columns are required and which paths must exist.
    ///
    /// # Returns
    /// SampleCatalog in samplesheet order.
    pub fn parse(text: &str, base: &Path, plan: &ExecutionPlan) -> Result<Self, PipelineError> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let (_, header) = lines
            .next()
            .ok_or_else(|| PipelineError::InvalidSamplesheet("Samplesheet is empty".to_string()))?;
        let columns: Vec<String> = header.split(',').map(|c| c.trim().to_lowercase()).collect();
        let column = |name: &str| columns.iter().position(|c| c == name);
        let sample_col = column("sample")
            .ok_or_else(|| PipelineError::InvalidSamplesheet("Samplesheet header lacks a 'sample' column".to_string()))?;
        let (fastq_col, barcode_col, genome_col) = (column("fastq"), column("barcode"), column("genome"));

        let needs_fastq = !plan.basecalling() && !plan.demultiplexing();
        let needs_barcode = plan.demultiplexing();
        let check_genomes = plan.is_active(StageId::Align);

        let mut records = Vec::new();
        for (index, line) in lines {
            let row = index + 1;
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() > columns.len() {
                return Err(PipelineError::InvalidSamplesheet(format!(
                    "Line {} has {} fields, header has {}",
                    row,
                    fields.len(),
                    columns.len()
                )));
            }
            let field = |col: Option<usize>| col.and_then(|c| fields.get(c)).copied().filter(|v| !v.is_empty());

            let sample_id = field(Some(sample_col))
                .ok_or_else(|| PipelineError::InvalidSamplesheet(format!("Line {}: sample name is empty", row)))?
                .replace(' ', "_");

            let barcode = match field(barcode_col) {
                Some(raw) if needs_barcode => Some(normalize_barcode(raw).ok_or_else(|| {
                    PipelineError::InvalidSamplesheet(format!("Line {}: invalid barcode '{}'", row, raw))
                })?),
                Some(_) => None,
                None if needs_barcode => {
                    return Err(PipelineError::InvalidSamplesheet(format!(
                        "Line {}: a barcode is required when demultiplexing",
                        row
                    )));
                }
                None => None,
            };

            let fastq = match field(fastq_col) {
                Some(raw) if needs_fastq => {
                    let path = resolve_path(raw, base);
                    if !path.is_file() {
                        return Err(PipelineError::MissingInput { stage: STAGE.to_string(), path });
                    }
                    Some(path)
                }
                Some(_) => None,
                None if needs_fastq => {
                    return Err(PipelineError::InvalidSamplesheet(format!(
                        "Line {}: a FASTQ file is required when basecalling is skipped",
                        row
                    )));
                }
                None => None,
            };

            let genome = field(genome_col)
                .map(|raw| resolve_genome(raw, base, &plan.igenomes_base, check_genomes))
                .transpose()?;

            records.push(SampleRecord { sample_id, barcode, fastq, genome });
        }

        if records.is_empty() {
            return Err(PipelineError::InvalidSamplesheet("Samplesheet has no samples".to_string()));
        }
        let catalog = SampleCatalog { records };
        catalog.check_uniqueness(plan)?;
        Ok(catalog)
    }

    fn check_uniqueness(&self, plan: &ExecutionPlan) -> Result<(), PipelineError> {
        // A basecalled run without demultiplexing is a single sample; extra rows are ignored.
        if plan.basecalling() && !plan.demultiplexing() {
            if self.records.len() > 1 {
                warn!(
                    "Demultiplexing is off: all reads are named after '{}', {} other row(s) ignored",
                    self.records[0].sample_id,
                    self.records.len() - 1
                );
            }
            return Ok(());
        }
        let mut ids = FxHashSet::default();
        let mut barcodes = FxHashSet::default();
        for record in &self.records {
            if !ids.insert(record.sample_id.as_str()) {
                return Err(PipelineError::InvalidSamplesheet(format!(
                    "Duplicate sample name: {}",
                    record.sample_id
                )));
            }
            if let Some(barcode) = &record.barcode {
                if !barcodes.insert(barcode.as_str()) {
                    return Err(PipelineError::InvalidSamplesheet(format!("Duplicate barcode: {}", barcode)));
                }
            }
        }
        Ok(())
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    /// Sample naming the basecaller's concatenated output when demultiplexing is off.
    pub fn representative(&self) -> &SampleRecord {
        &self.records[0]
    }

    pub fn fastq_samples(&self) -> Vec<FastqSample> {
        self.records
            .iter()
            .filter_map(|r| {
                r.fastq.clone().map(|fastq| FastqSample {
                    sample_id: r.sample_id.clone(),
                    fastq,
                    genome: r.genome.clone(),
                })
            })
            .collect()
    }

    pub fn barcoded_samples(&self) -> Vec<BarcodedSample> {
        self.records
            .iter()
            .filter_map(|r| {
                r.barcode.clone().map(|barcode| BarcodedSample {
                    sample_id: r.sample_id.clone(),
                    barcode,
                    genome: r.genome.clone(),
                })
            })
            .collect()
    }

    /// Normalised samplesheet: resolved paths and canonical barcodes.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("sample,fastq,barcode,genome\n");
        for r in &self.records {
            let fastq = r.fastq.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
            let barcode = r.barcode.clone().unwrap_or_default();
            let genome = r.genome.as_ref().map(|g| g.fasta.display().to_string()).unwrap_or_default();
            out.push_str(&format!("{},{},{},{}\n", r.sample_id, fastq, barcode, genome));
        }
        out
    }
}

/// Symbolic names resolve below the iGenomes root, anything else is a path.
/// Remote roots cannot be checked locally.
fn resolve_genome(raw: &str, base: &Path, igenomes_base: &str, check: bool) -> Result<GenomeReference, PipelineError> {
    let fasta = match symbolic_fasta(raw) {
        Some(relative) => PathBuf::from(format!("{}/{}", igenomes_base.trim_end_matches('/'), relative)),
        None => resolve_path(raw, base),
    };
    if check && !is_remote(&fasta.to_string_lossy()) && !fasta.is_file() {
        return Err(PipelineError::MissingInput { stage: STAGE.to_string(), path: fasta });
    }
    Ok(GenomeReference { identity: raw.to_string(), fasta })
}
