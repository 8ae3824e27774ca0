// src/config/plan.rs: resolves raw arguments into the immutable execution plan

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::cli::Arguments;
use crate::config::defs::{
    PipelineError, BEDGRAPH_TO_BIGWIG_TAG, BEDTOOLS_TAG, BED_TO_BIGBED_TAG, FASTQC_TAG, GRAPHMAP2_TAG, GUPPY_TAG,
    MINIMAP2_TAG, MULTIQC_TAG, NANOPLOT_TAG, PYCOQC_TAG, QCAT_TAG, SAMTOOLS_TAG,
};
use crate::utils::file::{is_remote, resolve_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Dna,
    Cdna,
    DirectRna,
}

impl Protocol {
    pub const VALID: &'static str = "'DNA', 'cDNA', 'directRNA'";

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DNA" => Some(Protocol::Dna),
            "cDNA" => Some(Protocol::Cdna),
            "directRNA" => Some(Protocol::DirectRna),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Dna => "DNA",
            Protocol::Cdna => "cDNA",
            Protocol::DirectRna => "directRNA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aligner {
    Minimap2,
    Graphmap,
}

impl Aligner {
    pub const VALID: &'static str = "'minimap2', 'graphmap'";

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "minimap2" => Some(Aligner::Minimap2),
            "graphmap" => Some(Aligner::Graphmap),
            _ => None,
        }
    }

    /// Output subdirectory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Aligner::Minimap2 => "minimap2",
            Aligner::Graphmap => "graphmap",
        }
    }

    pub fn tool(&self) -> &'static str {
        match self {
            Aligner::Minimap2 => MINIMAP2_TAG,
            Aligner::Graphmap => GRAPHMAP2_TAG,
        }
    }
}

/// Every node the graph builder knows about, in topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageId {
    SamplesheetCheck,
    Basecall,
    Demultiplex,
    PycoQc,
    NanoPlotSummary,
    NanoPlotFastq,
    FastQc,
    ChromSizes,
    Index,
    Align,
    SortIndex,
    BedGraph,
    BigWig,
    Bed12,
    BigBed,
    MultiQc,
    Versions,
    Report,
}

impl StageId {
    pub const ALL: [StageId; 18] = [
        StageId::SamplesheetCheck,
        StageId::Basecall,
        StageId::Demultiplex,
        StageId::PycoQc,
        StageId::NanoPlotSummary,
        StageId::NanoPlotFastq,
        StageId::FastQc,
        StageId::ChromSizes,
        StageId::Index,
        StageId::Align,
        StageId::SortIndex,
        StageId::BedGraph,
        StageId::BigWig,
        StageId::Bed12,
        StageId::BigBed,
        StageId::MultiQc,
        StageId::Versions,
        StageId::Report,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageId::SamplesheetCheck => "samplesheet_check",
            StageId::Basecall => "basecall",
            StageId::Demultiplex => "demultiplex",
            StageId::PycoQc => "pycoqc",
            StageId::NanoPlotSummary => "nanoplot_summary",
            StageId::NanoPlotFastq => "nanoplot_fastq",
            StageId::FastQc => "fastqc",
            StageId::ChromSizes => "chrom_sizes",
            StageId::Index => "index",
            StageId::Align => "align",
            StageId::SortIndex => "sort_index",
            StageId::BedGraph => "bedgraph",
            StageId::BigWig => "bigwig",
            StageId::Bed12 => "bed12",
            StageId::BigBed => "bigbed",
            StageId::MultiQc => "multiqc",
            StageId::Versions => "versions",
            StageId::Report => "report",
        }
    }

    /// External tool wrapped by this stage; `None` for internal stages.
    /// Index and Align depend on the aligner and are resolved by the plan.
    fn fixed_tool(&self) -> Option<&'static str> {
        match self {
            StageId::Basecall => Some(GUPPY_TAG),
            StageId::Demultiplex => Some(QCAT_TAG),
            StageId::PycoQc => Some(PYCOQC_TAG),
            StageId::NanoPlotSummary | StageId::NanoPlotFastq => Some(NANOPLOT_TAG),
            StageId::FastQc => Some(FASTQC_TAG),
            StageId::ChromSizes | StageId::SortIndex => Some(SAMTOOLS_TAG),
            StageId::BedGraph | StageId::Bed12 => Some(BEDTOOLS_TAG),
            StageId::BigWig => Some(BEDGRAPH_TO_BIGWIG_TAG),
            StageId::BigBed => Some(BED_TO_BIGBED_TAG),
            StageId::MultiQc => Some(MULTIQC_TAG),
            StageId::Index | StageId::Align => None,
            StageId::SamplesheetCheck | StageId::Versions | StageId::Report => None,
        }
    }

    fn tier(&self) -> ResourceTier {
        match self {
            StageId::Basecall | StageId::Index | StageId::Align => ResourceTier::High,
            StageId::Demultiplex
            | StageId::FastQc
            | StageId::SortIndex
            | StageId::BedGraph
            | StageId::BigWig
            | StageId::Bed12
            | StageId::BigBed => ResourceTier::Medium,
            _ => ResourceTier::Low,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceTier {
    Low,
    Medium,
    High,
}

impl ResourceTier {
    pub const ALL: [ResourceTier; 3] = [ResourceTier::Low, ResourceTier::Medium, ResourceTier::High];

    pub fn cpus(&self) -> usize {
        match self {
            ResourceTier::Low => 2,
            ResourceTier::Medium => 6,
            ResourceTier::High => 12,
        }
    }

    pub fn memory_gb(&self) -> u64 {
        match self {
            ResourceTier::Low => 14,
            ResourceTier::Medium => 42,
            ResourceTier::High => 84,
        }
    }
}

/// Machine-wide ceiling that every tier reservation is clamped to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceCeiling {
    pub max_cpus: usize,
    pub max_memory_gb: u64,
}

impl ResourceCeiling {
    pub fn cpus_for(&self, tier: ResourceTier) -> usize {
        tier.cpus().min(self.max_cpus).max(1)
    }

    pub fn memory_for(&self, tier: ResourceTier) -> u64 {
        tier.memory_gb().min(self.max_memory_gb).max(1)
    }

    /// How many reservations of `tier` fit side by side under the ceiling.
    pub fn concurrency_for(&self, tier: ResourceTier) -> usize {
        let by_cpu = self.max_cpus / self.cpus_for(tier);
        let by_mem = (self.max_memory_gb / self.memory_for(tier)) as usize;
        by_cpu.min(by_mem).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageParams {
    pub active: bool,
    pub tier: ResourceTier,
    pub cpus: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BasecallerModel {
    ConfigFile(PathBuf),
    FlowcellKit { flowcell: String, kit: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuSettings {
    pub device: String,
    pub runners_per_device: usize,
    pub cpu_threads_per_caller: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasecallPlan {
    pub run_dir: PathBuf,
    pub model: BasecallerModel,
    pub gpu: Option<GpuSettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentPlan {
    pub aligner: Aligner,
    pub protocol: Protocol,
    pub stranded: bool,
    pub save_intermediates: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailurePolicy {
    Terminate,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NotificationPlan {
    pub email: Option<String>,
    pub email_on_fail: Option<String>,
    pub max_attachment_size: u64,
}

impl NotificationPlan {
    pub fn from_args(args: &Arguments) -> Self {
        NotificationPlan {
            email: args.email.clone(),
            email_on_fail: args.email_on_fail.clone(),
            max_attachment_size: args.max_multiqc_email_size,
        }
    }
}

/// Immutable description of one run. Built once by [`ExecutionPlan::resolve`] and
/// only ever handed out by reference.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub run_name: String,
    pub input: PathBuf,
    pub out_dir: PathBuf,
    pub igenomes_base: String,
    pub basecall: Option<BasecallPlan>,
    pub barcode_kit: Option<String>,
    /// Pooled reads handed to the standalone demultiplexer.
    pub pooled_fastq: Option<PathBuf>,
    pub alignment: Option<AlignmentPlan>,
    pub ceiling: ResourceCeiling,
    pub failure_policy: FailurePolicy,
    pub notification: NotificationPlan,
    stages: BTreeMap<StageId, StageParams>,
}

impl ExecutionPlan {
    /// Validates `args` and derives the plan. Fails fast with the first violated
    /// constraint; performs no I/O beyond existence checks.
    ///
    /// # Arguments
    ///
    /// * `args` - Parsed command-line arguments.
    /// * `cwd` - Directory relative paths are resolved against.
    /// * `ceiling` - Detected or user-capped machine resources.
    ///
    /// # Returns
    /// ExecutionPlan, or PipelineError::ConfigValidation naming the offending flag.
    pub fn resolve(args: &Arguments, cwd: &Path, ceiling: ResourceCeiling) -> Result<Self, PipelineError> {
        let input = match &args.input {
            Some(input) => resolve_path(input, cwd),
            None => return Err(PipelineError::config("input", "Samplesheet file not specified!")),
        };
        if !input.is_file() {
            return Err(PipelineError::config(
                "input",
                format!("Samplesheet file does not exist: {}", input.display()),
            ));
        }

        let basecall = if args.skip_basecalling {
            None
        } else {
            Some(resolve_basecall(args, cwd)?)
        };

        // A missing barcode kit quietly turns demultiplexing off.
        let barcode_kit = if args.skip_demultiplexing {
            None
        } else {
            args.barcode_kit.clone().filter(|kit| !kit.is_empty())
        };

        let pooled_fastq = if basecall.is_none() && barcode_kit.is_some() {
            let path = match &args.input_path {
                Some(path) => resolve_path(path, cwd),
                None => {
                    return Err(PipelineError::config(
                        "input-path",
                        "Please specify the pooled FASTQ file to demultiplex!",
                    ));
                }
            };
            if !path.is_file() {
                return Err(PipelineError::config(
                    "input-path",
                    format!("Pooled FASTQ file does not exist: {}", path.display()),
                ));
            }
            Some(path)
        } else {
            None
        };

        let alignment = if args.skip_alignment {
            None
        } else {
            let aligner = Aligner::parse(&args.aligner).ok_or_else(|| {
                PipelineError::config(
                    "aligner",
                    format!("Invalid aligner option: {}. Valid options: {}", args.aligner, Aligner::VALID),
                )
            })?;
            let protocol = Protocol::parse(&args.protocol).ok_or_else(|| {
                PipelineError::config(
                    "protocol",
                    format!("Invalid protocol option: {}. Valid options: {}", args.protocol, Protocol::VALID),
                )
            })?;
            Some(AlignmentPlan {
                aligner,
                protocol,
                stranded: args.stranded || protocol == Protocol::DirectRna,
                save_intermediates: args.save_align_intermeds,
            })
        };

        if args.awsbatch {
            if args.awsqueue.as_deref().unwrap_or("").is_empty() {
                return Err(PipelineError::config("awsqueue", "Specify the AWS Batch job queue for awsbatch runs"));
            }
            if !args.out_dir.starts_with("s3:") {
                return Err(PipelineError::config(
                    "outdir",
                    format!("Outdir not on S3 - specify an S3 bucket to run on AWS Batch: {}", args.out_dir),
                ));
            }
        }
        if is_remote(&args.out_dir) {
            return Err(PipelineError::config(
                "outdir",
                format!("Remote outdir {} cannot be written by local task execution", args.out_dir),
            ));
        }

        let mut plan = ExecutionPlan {
            run_name: args.run_name.clone(),
            input,
            out_dir: resolve_path(&args.out_dir, cwd),
            igenomes_base: args.igenomes_base.clone(),
            basecall,
            barcode_kit,
            pooled_fastq,
            alignment,
            ceiling,
            failure_policy: if args.ignore_task_errors { FailurePolicy::Ignore } else { FailurePolicy::Terminate },
            notification: NotificationPlan::from_args(args),
            stages: BTreeMap::new(),
        };
        plan.stages = StageId::ALL
            .iter()
            .map(|&id| {
                let tier = id.tier();
                let params = StageParams {
                    active: plan.activation(id, args),
                    tier,
                    cpus: ceiling.cpus_for(tier),
                };
                (id, params)
            })
            .collect();
        Ok(plan)
    }

    fn activation(&self, id: StageId, args: &Arguments) -> bool {
        let qc = !args.skip_qc;
        let align = self.alignment.is_some();
        match id {
            StageId::SamplesheetCheck | StageId::Versions | StageId::Report => true,
            StageId::Basecall => self.basecalling(),
            StageId::Demultiplex => !self.basecalling() && self.demultiplexing(),
            StageId::PycoQc => self.basecalling() && qc && !args.skip_pycoqc,
            StageId::NanoPlotSummary => self.basecalling() && qc && !args.skip_nanoplot,
            StageId::NanoPlotFastq => !self.basecalling() && qc && !args.skip_nanoplot,
            StageId::FastQc => qc && !args.skip_fastqc,
            StageId::ChromSizes | StageId::Index | StageId::Align | StageId::SortIndex => align,
            StageId::BedGraph | StageId::BigWig => align && !args.skip_bigwig,
            StageId::Bed12 | StageId::BigBed => align && !args.skip_bigbed,
            StageId::MultiQc => qc && !args.skip_multiqc,
        }
    }

    pub fn basecalling(&self) -> bool {
        self.basecall.is_some()
    }

    pub fn demultiplexing(&self) -> bool {
        self.barcode_kit.is_some()
    }

    pub fn is_active(&self, id: StageId) -> bool {
        self.params(id).active
    }

    pub fn params(&self, id: StageId) -> StageParams {
        self.stages[&id]
    }

    pub fn active_stages(&self) -> impl Iterator<Item = StageId> + '_ {
        self.stages.iter().filter(|(_, p)| p.active).map(|(id, _)| *id)
    }

    /// Tool run by `id` under this plan, if any.
    pub fn tool_for(&self, id: StageId) -> Option<&'static str> {
        match id {
            StageId::Index | StageId::Align => self.alignment.as_ref().map(|a| a.aligner.tool()),
            other => other.fixed_tool(),
        }
    }

    /// Root of the alignment subtree, e.g. `<outdir>/minimap2`.
    pub fn aligner_dir(&self) -> Option<PathBuf> {
        self.alignment.as_ref().map(|a| self.out_dir.join(a.aligner.as_str()))
    }
}

fn resolve_basecall(args: &Arguments, cwd: &Path) -> Result<BasecallPlan, PipelineError> {
    let run_dir = match &args.run_dir {
        Some(dir) => resolve_path(dir, cwd),
        None => return Err(PipelineError::config("run-dir", "Please specify a valid run directory!")),
    };
    if !run_dir.is_dir() {
        return Err(PipelineError::config(
            "run-dir",
            format!("Run directory does not exist: {}", run_dir.display()),
        ));
    }

    let model = match (&args.guppy_config, &args.flowcell, &args.kit) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
            return Err(PipelineError::config(
                "guppy-config",
                "A basecaller config file cannot be combined with --flowcell/--kit",
            ));
        }
        (Some(config), None, None) => {
            let path = resolve_path(config, cwd);
            if !path.is_file() {
                return Err(PipelineError::config(
                    "guppy-config",
                    format!("Basecaller config file does not exist: {}", path.display()),
                ));
            }
            BasecallerModel::ConfigFile(path)
        }
        (None, None, _) => {
            return Err(PipelineError::config(
                "flowcell",
                "Please specify a valid flowcell identifier for basecalling!",
            ));
        }
        (None, Some(_), None) => {
            return Err(PipelineError::config("kit", "Please specify a valid kit identifier for basecalling!"));
        }
        (None, Some(flowcell), Some(kit)) => BasecallerModel::FlowcellKit {
            flowcell: flowcell.clone(),
            kit: kit.clone(),
        },
    };

    let gpu = args.guppy_gpu.then(|| GpuSettings {
        device: args.gpu_device.clone(),
        runners_per_device: args.guppy_gpu_runners,
        cpu_threads_per_caller: args.guppy_cpu_threads,
    });

    Ok(BasecallPlan { run_dir, model, gpu })
}
