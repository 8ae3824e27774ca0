use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use crate::cli::Arguments;
use crate::config::plan::ExecutionPlan;

// External software
pub const GUPPY_TAG: &str = "guppy_basecaller";
pub const QCAT_TAG: &str = "qcat";
pub const PYCOQC_TAG: &str = "pycoQC";
pub const NANOPLOT_TAG: &str = "NanoPlot";
pub const FASTQC_TAG: &str = "fastqc";
pub const MINIMAP2_TAG: &str = "minimap2";
pub const GRAPHMAP2_TAG: &str = "graphmap2";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const BEDTOOLS_TAG: &str = "bedtools";
pub const BEDGRAPH_TO_BIGWIG_TAG: &str = "bedGraphToBigWig";
pub const BED_TO_BIGBED_TAG: &str = "bedToBigBed";
pub const MULTIQC_TAG: &str = "multiqc";

/// Every external tool the pipeline can invoke, in manifest order.
pub const ALL_TOOLS: &[&str] = &[
    GUPPY_TAG,
    QCAT_TAG,
    PYCOQC_TAG,
    NANOPLOT_TAG,
    FASTQC_TAG,
    MINIMAP2_TAG,
    GRAPHMAP2_TAG,
    SAMTOOLS_TAG,
    BEDTOOLS_TAG,
    BEDGRAPH_TO_BIGWIG_TAG,
    BED_TO_BIGBED_TAG,
    MULTIQC_TAG,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Faidx,
    View,
    Sort,
    Index,
    Flagstat,
    Idxstats,
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BedtoolsSubcommand {
    Genomecov,
    Bamtobed,
}

// Output layout
pub const GUPPY_DIR: &str = "guppy";
pub const QCAT_DIR: &str = "qcat";
pub const PYCOQC_DIR: &str = "pycoqc";
pub const NANOPLOT_DIR: &str = "nanoplot";
pub const FASTQC_DIR: &str = "fastqc";
pub const BIGWIG_DIR: &str = "bigwig";
pub const BIGBED_DIR: &str = "bigbed";
pub const SAMTOOLS_STATS_DIR: &str = "samtools_stats";
pub const MULTIQC_DIR: &str = "multiqc";
pub const PIPELINE_INFO_DIR: &str = "pipeline_info";
pub const REFERENCE_DIR: &str = "reference_genome";

// Static Filenames
pub const VALID_SAMPLESHEET: &str = "samplesheet.valid.csv";
pub const VERSIONS_CSV: &str = "software_versions.csv";
pub const VERSIONS_MQC_YAML: &str = "software_versions_mqc.yaml";
pub const RUN_REPORT: &str = "run_report.txt";
pub const EXECUTION_TRACE: &str = "execution_trace.txt";
pub const PIPELINE_REPORT_TXT: &str = "pipeline_report.txt";
pub const PIPELINE_REPORT_HTML: &str = "pipeline_report.html";
pub const SEQUENCING_SUMMARY: &str = "sequencing_summary.txt";
pub const MULTIQC_REPORT: &str = "multiqc_report.html";

// Static Parameters
pub const FASTQ_EXTS: &[&'static str] = &["fastq.gz", "fq.gz", "fastq", "fq"];
pub const UNCLASSIFIED_TAG: &str = "unclassified";
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;


/// Run-level error taxonomy. Every variant renders as one specific line.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{message} (--{flag})")]
    ConfigValidation { flag: String, message: String },

    #[error("{stage}: required input does not exist: {}", .path.display())]
    MissingInput { stage: String, path: PathBuf },

    #[error("{stage} [{tag}] exited with status {code}: {stderr_tail}")]
    StageExecution {
        stage: String,
        tag: String,
        code: i32,
        stderr_tail: String,
    },

    #[error("{tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("invalid samplesheet: {0}")]
    InvalidSamplesheet(String),

    #[error("I/O error: {0}")]
    IOError(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn config(flag: &str, message: impl Into<String>) -> Self {
        PipelineError::ConfigValidation {
            flag: flag.to_string(),
            message: message.into(),
        }
    }

    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::StageExecution { code, .. } if *code > 0 => *code,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


#[derive(Debug)]
pub struct RunConfig {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub args: Arguments,
    pub plan: Arc<ExecutionPlan>,
}
