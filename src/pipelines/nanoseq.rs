// src/pipelines/nanoseq.rs
//! Nanopore run: basecalling or pre-supplied reads, QC, alignment and tracks.
//!
//! Every stage is wired unconditionally; the plan decides which ones run. Inactive
//! stages hand an empty channel downstream and the aggregators at the bottom of the
//! graph treat that as "nothing happened".

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, info, warn};

use crate::config::defs::{
    BedtoolsSubcommand, PipelineError, RunConfig, SamtoolsSubcommand, BEDGRAPH_TO_BIGWIG_TAG, BEDTOOLS_TAG,
    BED_TO_BIGBED_TAG, BIGBED_DIR, BIGWIG_DIR, FASTQC_DIR, FASTQC_TAG, GRAPHMAP2_TAG, GUPPY_DIR, GUPPY_TAG,
    MINIMAP2_TAG, MULTIQC_DIR, MULTIQC_REPORT, MULTIQC_TAG, NANOPLOT_DIR, NANOPLOT_TAG, PIPELINE_INFO_DIR, PYCOQC_DIR,
    PYCOQC_TAG, QCAT_DIR, QCAT_TAG, REFERENCE_DIR, SAMTOOLS_STATS_DIR, SAMTOOLS_TAG, SEQUENCING_SUMMARY,
    VALID_SAMPLESHEET,
};
use crate::config::plan::{Aligner, AlignmentPlan, ExecutionPlan, StageId};
use crate::engine::aggregate::{aggregate_versions, write_report, Artifact, ReportInput};
use crate::engine::scheduler::{Dag, RunSummary};
use crate::engine::stage::{Executor, Invocation, ToolCommand, ToolRunner};
use crate::utils::command::bedtools::Strand;
use crate::utils::command::samtools::SamtoolsConfig;
use crate::utils::command::{bedtools, fastqc, graphmap2, guppy, minimap2, multiqc, nanoplot, pycoqc, qcat, samtools, ucsc};
use crate::utils::discovery::{discover_barcodes, discover_pooled, DemuxFastq};
use crate::utils::file::{fastq_stem, file_path_manipulator, write_atomic};
use crate::utils::samplesheet::{BarcodedSample, FastqSample, GenomeReference, SampleCatalog};
use crate::utils::streams::Channel;

/// Merged per-sample reads land here, inside the producing stage's directory.
const STAGED_FASTQ_DIR: &str = "fastq";
const NANOPLOT_REPORT: &str = "NanoPlot-report.html";
const PYCOQC_REPORT: &str = "pycoQC_output.html";
const RUN_TAG: &str = "run";

#[derive(Debug, Clone)]
enum BasecalledReads {
    Barcoded(Vec<DemuxFastq>),
    Pooled(PathBuf),
}

#[derive(Debug, Clone)]
struct BasecallOutput {
    reads: BasecalledReads,
    summary: PathBuf,
}

/// Everything derived from one genome, built once and shared by its samples.
#[derive(Debug, Clone)]
struct ReferenceBundle {
    genome: GenomeReference,
    index: PathBuf,
    chrom_sizes: PathBuf,
}

#[derive(Debug, Clone)]
struct AlignedSample {
    sample_id: String,
    chrom_sizes: PathBuf,
    sam: PathBuf,
}

#[derive(Debug, Clone)]
struct SortedBam {
    sample_id: String,
    bam: PathBuf,
    chrom_sizes: PathBuf,
    artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone)]
struct CoverageTracks {
    sample_id: String,
    chrom_sizes: PathBuf,
    bedgraphs: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
struct SplicedBed {
    sample_id: String,
    chrom_sizes: PathBuf,
    bed12: PathBuf,
}

fn artifacts_of(sample: Option<&str>, invocation: &Invocation) -> Vec<Artifact> {
    invocation
        .outputs
        .iter()
        .map(|path| Artifact::new(invocation.stage, sample, path.clone()))
        .collect()
}

fn alignment_of(plan: &ExecutionPlan) -> Result<&AlignmentPlan, PipelineError> {
    plan.alignment
        .as_ref()
        .ok_or_else(|| PipelineError::Other(anyhow!("Alignment stage reached without an alignment plan")))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_intermediate(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Could not remove intermediate {}: {}", path.display(), e);
    }
}

fn index_path(reference_dir: &Path, aligner: Aligner, genome: &GenomeReference) -> PathBuf {
    let ext = match aligner {
        Aligner::Minimap2 => "mmi",
        Aligner::Graphmap => "gmidx",
    };
    file_path_manipulator(&genome.label(), Some(reference_dir), None, Some(ext), ".")
}

fn chrom_sizes_path(reference_dir: &Path, genome: &GenomeReference) -> PathBuf {
    file_path_manipulator(&genome.label(), Some(reference_dir), None, Some("sizes"), ".")
}

/// Demultiplexed reads reunited with their samplesheet rows by barcode.
fn join_barcodes(demuxed: Channel<DemuxFastq>, samples: Vec<BarcodedSample>) -> Channel<FastqSample> {
    demuxed
        .join_by(
            Channel::of(samples),
            "barcode",
            |reads: &DemuxFastq| reads.barcode.clone(),
            |sample: &BarcodedSample| sample.barcode.clone(),
        )
        .map(|(_, reads, sample)| sample.with_reads(reads.fastq))
}

/// Runs the whole graph.
///
/// # Arguments
///
/// * `run_config` - Resolved plan and output location.
/// * `runner` - Executes the external tools.
///
/// # Returns
/// The run summary (absent when the samplesheet is rejected before any stage starts)
/// and the first fatal error, if any.
pub async fn run(
    run_config: Arc<RunConfig>,
    runner: Arc<dyn ToolRunner>,
) -> (Option<RunSummary>, Result<(), PipelineError>) {
    println!("\n-------------\n nanoseq\n-------------\n");
    debug!("Arguments: {:?}", run_config.args);

    let plan = run_config.plan.clone();
    let out_dir = run_config.out_dir.clone();

    let catalog = match SampleCatalog::load(&plan) {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => return (None, Err(e)),
    };

    let executor = Arc::new(Executor::new(runner, &plan));
    let mut dag = Dag::new(plan.clone(), executor.clone());

    // Samplesheet
    let valid_sheet = {
        let catalog = catalog.clone();
        let path = out_dir.join(PIPELINE_INFO_DIR).join(VALID_SAMPLESHEET);
        dag.internal(StageId::SamplesheetCheck, async move {
            write_atomic(&path, &catalog.to_csv())?;
            Ok::<_, PipelineError>(vec![Artifact::new(StageId::SamplesheetCheck, None, path)])
        })
    };

    // Basecalling
    let guppy_dir = out_dir.join(GUPPY_DIR);
    let basecalled = {
        let plan = plan.clone();
        let finish_plan = plan.clone();
        let representative = catalog.representative().sample_id.clone();
        let cpus = plan.params(StageId::Basecall).cpus;
        dag.node(
            StageId::Basecall,
            Channel::of(vec![guppy_dir]),
            move |dir: &PathBuf| {
                let basecall = plan
                    .basecall
                    .as_ref()
                    .ok_or_else(|| PipelineError::Other(anyhow!("Basecall stage reached without a basecall plan")))?;
                let args = guppy::arg_generator(basecall, plan.barcode_kit.as_deref(), dir, cpus);
                Ok(Invocation::new(StageId::Basecall, RUN_TAG, dir.clone())
                    .command(ToolCommand::new(GUPPY_TAG, args))
                    .input(&basecall.run_dir)
                    .output(dir.join(SEQUENCING_SUMMARY)))
            },
            move |dir, _| {
                let staging = dir.join(STAGED_FASTQ_DIR);
                let reads = if finish_plan.demultiplexing() {
                    BasecalledReads::Barcoded(discover_barcodes(&dir, &staging)?)
                } else {
                    BasecalledReads::Pooled(discover_pooled(&dir, &staging, &representative)?)
                };
                Ok(BasecallOutput {
                    reads,
                    summary: dir.join(SEQUENCING_SUMMARY),
                })
            },
        )
    };
    let [basecalled_pooled, basecalled_barcoded, basecalled_summary] = basecalled.fork();

    let pooled_reads = {
        let representative = catalog.representative().clone();
        basecalled_pooled.flat_map(move |output| match output.reads {
            BasecalledReads::Pooled(fastq) => vec![FastqSample {
                sample_id: representative.sample_id.clone(),
                fastq,
                genome: representative.genome.clone(),
            }],
            BasecalledReads::Barcoded(_) => Vec::new(),
        })
    };
    let basecalled_barcoded = basecalled_barcoded.flat_map(|output| match output.reads {
        BasecalledReads::Barcoded(reads) => reads,
        BasecalledReads::Pooled(_) => Vec::new(),
    });

    // Standalone demultiplexing of pre-supplied pooled reads
    let qcat_dir = out_dir.join(QCAT_DIR);
    let demultiplexed = {
        let plan = plan.clone();
        let work_dir = qcat_dir.clone();
        dag.node(
            StageId::Demultiplex,
            Channel::of(plan.pooled_fastq.clone().into_iter().collect()),
            move |pooled: &PathBuf| {
                let kit = plan
                    .barcode_kit
                    .as_deref()
                    .ok_or_else(|| PipelineError::Other(anyhow!("Demultiplex stage reached without a barcode kit")))?;
                Ok(Invocation::new(StageId::Demultiplex, RUN_TAG, work_dir.clone())
                    .command(ToolCommand::new(QCAT_TAG, qcat::arg_generator(pooled, &work_dir, kit)))
                    .input(pooled))
            },
            move |_, _| Ok(discover_barcodes(&qcat_dir, &qcat_dir.join(STAGED_FASTQ_DIR))?),
        )
    }
    .flatten();

    let reads = Channel::mix(vec![
        Channel::of(catalog.fastq_samples()),
        pooled_reads,
        join_barcodes(Channel::mix(vec![basecalled_barcoded, demultiplexed]), catalog.barcoded_samples()),
    ]);
    let [qc_reads, plot_reads, align_reads, sample_reads] = reads.fork();

    // Read QC
    let summaries = basecalled_summary.map(|output| output.summary);
    let [pycoqc_summaries, nanoplot_summaries, summary_artifacts] = summaries.fork();
    let summary_artifacts = summary_artifacts.map(|path| vec![Artifact::new(StageId::Basecall, None, path)]);

    let pycoqc_reports = {
        let dir = out_dir.join(PYCOQC_DIR);
        dag.node(
            StageId::PycoQc,
            pycoqc_summaries,
            move |summary: &PathBuf| {
                let html = dir.join(PYCOQC_REPORT);
                Ok(Invocation::new(StageId::PycoQc, RUN_TAG, dir.clone())
                    .command(ToolCommand::new(PYCOQC_TAG, pycoqc::arg_generator(summary, &html)))
                    .input(summary)
                    .output(html))
            },
            |_, invocation| Ok(artifacts_of(None, invocation)),
        )
    };

    let nanoplot_summary_reports = {
        let dir = out_dir.join(NANOPLOT_DIR).join("summary");
        let cpus = plan.params(StageId::NanoPlotSummary).cpus;
        dag.node(
            StageId::NanoPlotSummary,
            nanoplot_summaries,
            move |summary: &PathBuf| {
                Ok(Invocation::new(StageId::NanoPlotSummary, RUN_TAG, dir.clone())
                    .command(ToolCommand::new(NANOPLOT_TAG, nanoplot::summary_args(summary, &dir, cpus)))
                    .input(summary)
                    .output(dir.join(NANOPLOT_REPORT)))
            },
            |_, invocation| Ok(artifacts_of(None, invocation)),
        )
    };

    let nanoplot_fastq_reports = {
        let root = out_dir.join(NANOPLOT_DIR).join("fastq");
        let cpus = plan.params(StageId::NanoPlotFastq).cpus;
        dag.node(
            StageId::NanoPlotFastq,
            plot_reads,
            move |sample: &FastqSample| {
                let dir = root.join(&sample.sample_id);
                Ok(Invocation::new(StageId::NanoPlotFastq, &sample.sample_id, dir.clone())
                    .command(ToolCommand::new(NANOPLOT_TAG, nanoplot::fastq_args(&sample.fastq, &dir, cpus)))
                    .input(&sample.fastq)
                    .output(dir.join(NANOPLOT_REPORT)))
            },
            |sample, invocation| Ok(artifacts_of(Some(&sample.sample_id), invocation)),
        )
    };

    let fastqc_reports = {
        let root = out_dir.join(FASTQC_DIR);
        let cpus = plan.params(StageId::FastQc).cpus;
        dag.node(
            StageId::FastQc,
            qc_reads,
            move |sample: &FastqSample| {
                let dir = root.join(&sample.sample_id);
                let stem = fastq_stem(&sample.fastq).unwrap_or_else(|| sample.sample_id.clone());
                Ok(Invocation::new(StageId::FastQc, &sample.sample_id, dir.clone())
                    .command(ToolCommand::new(FASTQC_TAG, fastqc::arg_generator(&sample.fastq, &dir, cpus)))
                    .input(&sample.fastq)
                    .output(file_path_manipulator(&stem, Some(&dir), None, Some("fastqc.html"), "_"))
                    .output(file_path_manipulator(&stem, Some(&dir), None, Some("fastqc.zip"), "_")))
            },
            |sample, invocation| Ok(artifacts_of(Some(&sample.sample_id), invocation)),
        )
    };

    // Reference genomes: one build per distinct genome identity
    let aligner_dir = plan.aligner_dir().unwrap_or_else(|| out_dir.join("alignment"));
    let reference_dir = aligner_dir.join(REFERENCE_DIR);
    let [genome_reads, cross_reads] = align_reads.filter(|sample| sample.genome.is_some()).fork();
    let genomes = genome_reads
        .flat_map(|sample| sample.genome.into_iter().collect::<Vec<_>>())
        .unique_by(|genome: &GenomeReference| genome.identity.clone());
    let [sizes_genomes, index_genomes] = genomes.fork();

    let chrom_sizes = {
        let dir = reference_dir.clone();
        let finish_dir = reference_dir.clone();
        dag.node(
            StageId::ChromSizes,
            sizes_genomes,
            move |genome: &GenomeReference| {
                let fai = file_path_manipulator(&genome.label(), Some(&dir), None, Some("fai"), ".");
                let sizes = chrom_sizes_path(&dir, genome);
                let faidx = samtools::arg_generator(&SamtoolsConfig {
                    subcommand: SamtoolsSubcommand::Faidx,
                    input: &genome.fasta,
                    output: Some(fai.as_path()),
                    cpus: 1,
                });
                let cut = vec!["-f".to_string(), "1,2".to_string(), fai.to_string_lossy().to_string()];
                Ok(Invocation::new(StageId::ChromSizes, &genome.label(), dir.clone())
                    .command(ToolCommand::new(SAMTOOLS_TAG, faidx))
                    .command(ToolCommand::new("cut", cut).stdout_to(sizes.clone()))
                    .input(&genome.fasta)
                    .output(fai)
                    .output(sizes))
            },
            move |genome, _| {
                let sizes = chrom_sizes_path(&finish_dir, &genome);
                Ok((genome, sizes))
            },
        )
    };

    let indices = {
        let plan = plan.clone();
        let finish_plan = plan.clone();
        let dir = reference_dir.clone();
        let finish_dir = reference_dir.clone();
        let cpus = plan.params(StageId::Index).cpus;
        dag.node(
            StageId::Index,
            index_genomes,
            move |genome: &GenomeReference| {
                let alignment = alignment_of(&plan)?;
                let index = index_path(&dir, alignment.aligner, genome);
                let command = match alignment.aligner {
                    Aligner::Minimap2 => {
                        ToolCommand::new(MINIMAP2_TAG, minimap2::index_args(alignment, &genome.fasta, &index, cpus))
                    }
                    Aligner::Graphmap => {
                        ToolCommand::new(GRAPHMAP2_TAG, graphmap2::index_args(&genome.fasta, &index, cpus))
                    }
                };
                Ok(Invocation::new(StageId::Index, &genome.label(), dir.clone())
                    .command(command)
                    .input(&genome.fasta)
                    .output(index))
            },
            move |genome, _| {
                let aligner = alignment_of(&finish_plan)?.aligner;
                let index = index_path(&finish_dir, aligner, &genome);
                Ok((genome, index))
            },
        )
    };

    let bundles = indices
        .join_by(
            chrom_sizes,
            "reference",
            |(genome, _): &(GenomeReference, PathBuf)| genome.identity.clone(),
            |(genome, _): &(GenomeReference, PathBuf)| genome.identity.clone(),
        )
        .map(|(_, (genome, index), (_, chrom_sizes))| ReferenceBundle { genome, index, chrom_sizes });

    // Alignment: every bundle fans out to the samples sharing its genome
    let pairs = bundles.cross_by(
        cross_reads,
        |bundle: &ReferenceBundle| bundle.genome.identity.clone(),
        |sample: &FastqSample| sample.genome.as_ref().map(|g| g.identity.clone()).unwrap_or_default(),
    );

    let aligned = {
        let plan = plan.clone();
        let dir = aligner_dir.clone();
        let cpus = plan.params(StageId::Align).cpus;
        dag.node(
            StageId::Align,
            pairs,
            move |(bundle, sample): &(ReferenceBundle, FastqSample)| {
                let alignment = alignment_of(&plan)?;
                let sam = file_path_manipulator(&sample.sample_id, Some(&dir), None, Some("sam"), ".");
                let command = match alignment.aligner {
                    Aligner::Minimap2 => ToolCommand::new(
                        MINIMAP2_TAG,
                        minimap2::align_args(alignment, &bundle.index, &sample.fastq, cpus),
                    )
                    .stdout_to(sam.clone()),
                    Aligner::Graphmap => ToolCommand::new(
                        GRAPHMAP2_TAG,
                        graphmap2::align_args(&bundle.genome.fasta, &bundle.index, &sample.fastq, &sam, cpus),
                    ),
                };
                Ok(Invocation::new(StageId::Align, &sample.sample_id, dir.clone())
                    .command(command)
                    .input(&sample.fastq)
                    .input(&bundle.index)
                    .output(sam))
            },
            |(bundle, sample), invocation| {
                Ok(AlignedSample {
                    sample_id: sample.sample_id,
                    chrom_sizes: bundle.chrom_sizes,
                    sam: invocation.outputs[0].clone(),
                })
            },
        )
    };

    let sorted = {
        let finish_plan = plan.clone();
        let dir = aligner_dir.clone();
        let stats_dir = aligner_dir.join(SAMTOOLS_STATS_DIR);
        let cpus = plan.params(StageId::SortIndex).cpus;
        dag.node(
            StageId::SortIndex,
            aligned,
            move |sample: &AlignedSample| {
                let bam = file_path_manipulator(&sample.sample_id, Some(&dir), None, Some("bam"), ".");
                let sorted = file_path_manipulator(&sample.sample_id, Some(&dir), None, Some("sorted.bam"), ".");
                let samtools_cmd = |subcommand, input: &Path, output: Option<&Path>| {
                    ToolCommand::new(
                        SAMTOOLS_TAG,
                        samtools::arg_generator(&SamtoolsConfig { subcommand, input, output, cpus }),
                    )
                };
                let stats_file = |ext: &str| {
                    file_path_manipulator(&sample.sample_id, Some(&stats_dir), None, Some(format!("sorted.bam.{}", ext).as_str()), ".")
                };
                let (flagstat, idxstats, stats) = (stats_file("flagstat"), stats_file("idxstats"), stats_file("stats"));
                Ok(Invocation::new(StageId::SortIndex, &sample.sample_id, dir.clone())
                    .command(samtools_cmd(SamtoolsSubcommand::View, &sample.sam, Some(bam.as_path())))
                    .command(samtools_cmd(SamtoolsSubcommand::Sort, &bam, Some(sorted.as_path())))
                    .command(samtools_cmd(SamtoolsSubcommand::Index, &sorted, None))
                    .command(samtools_cmd(SamtoolsSubcommand::Flagstat, &sorted, None).stdout_to(flagstat.clone()))
                    .command(samtools_cmd(SamtoolsSubcommand::Idxstats, &sorted, None).stdout_to(idxstats.clone()))
                    .command(samtools_cmd(SamtoolsSubcommand::Stats, &sorted, None).stdout_to(stats.clone()))
                    .input(&sample.sam)
                    .output(sorted.clone())
                    .output(with_suffix(&sorted, ".bai"))
                    .output(flagstat)
                    .output(idxstats)
                    .output(stats))
            },
            move |sample, invocation| {
                if !alignment_of(&finish_plan)?.save_intermediates {
                    remove_intermediate(&sample.sam);
                    remove_intermediate(&sample.sam.with_extension("bam"));
                }
                Ok(SortedBam {
                    sample_id: sample.sample_id.clone(),
                    bam: invocation.outputs[0].clone(),
                    chrom_sizes: sample.chrom_sizes,
                    artifacts: artifacts_of(Some(&sample.sample_id), invocation),
                })
            },
        )
    };
    let [coverage_bams, bed_bams, bam_artifacts] = sorted.fork();
    let bam_artifacts = bam_artifacts.map(|sorted| sorted.artifacts);

    // Coverage tracks
    let bigwig_dir = aligner_dir.join(BIGWIG_DIR);
    let bedgraphs = {
        let plan = plan.clone();
        let dir = bigwig_dir.clone();
        dag.node(
            StageId::BedGraph,
            coverage_bams,
            move |sorted: &SortedBam| {
                let strands = if alignment_of(&plan)?.stranded {
                    vec![Some(Strand::Plus), Some(Strand::Minus)]
                } else {
                    vec![None]
                };
                let mut invocation = Invocation::new(StageId::BedGraph, &sorted.sample_id, dir.clone()).input(&sorted.bam);
                for strand in strands {
                    let name = match strand {
                        Some(strand) => format!("{}.{}", sorted.sample_id, strand.label()),
                        None => sorted.sample_id.clone(),
                    };
                    let bedgraph = file_path_manipulator(&name, Some(&dir), None, Some("bedGraph"), ".");
                    let unsorted = with_suffix(&bedgraph, ".unsorted");
                    invocation = invocation
                        .command(
                            ToolCommand::new(
                                BEDTOOLS_TAG,
                                bedtools::arg_generator(BedtoolsSubcommand::Genomecov, &sorted.bam, strand),
                            )
                            .stdout_to(unsorted.clone()),
                        )
                        .command(ToolCommand::new(BEDTOOLS_TAG, bedtools::sort_args(&unsorted)).stdout_to(bedgraph.clone()))
                        .output(bedgraph);
                }
                Ok(invocation)
            },
            |sorted, invocation| {
                for bedgraph in &invocation.outputs {
                    remove_intermediate(&with_suffix(bedgraph, ".unsorted"));
                }
                Ok(CoverageTracks {
                    sample_id: sorted.sample_id,
                    chrom_sizes: sorted.chrom_sizes,
                    bedgraphs: invocation.outputs.clone(),
                })
            },
        )
    };

    let bigwigs = dag.node(
        StageId::BigWig,
        bedgraphs,
        move |tracks: &CoverageTracks| {
            let mut invocation = Invocation::new(StageId::BigWig, &tracks.sample_id, bigwig_dir.clone())
                .input(&tracks.chrom_sizes);
            for bedgraph in &tracks.bedgraphs {
                let bigwig = bedgraph.with_extension("bigWig");
                invocation = invocation
                    .command(ToolCommand::new(
                        BEDGRAPH_TO_BIGWIG_TAG,
                        ucsc::arg_generator(bedgraph, &tracks.chrom_sizes, &bigwig),
                    ))
                    .input(bedgraph)
                    .output(bigwig);
            }
            Ok(invocation)
        },
        |tracks, invocation| Ok(artifacts_of(Some(&tracks.sample_id), invocation)),
    );

    // Spliced-alignment tracks
    let bigbed_dir = aligner_dir.join(BIGBED_DIR);
    let bed12s = {
        let dir = bigbed_dir.clone();
        dag.node(
            StageId::Bed12,
            bed_bams,
            move |sorted: &SortedBam| {
                let bed12 = file_path_manipulator(&sorted.sample_id, Some(&dir), None, Some("bed12"), ".");
                let unsorted = with_suffix(&bed12, ".unsorted");
                Ok(Invocation::new(StageId::Bed12, &sorted.sample_id, dir.clone())
                    .command(
                        ToolCommand::new(
                            BEDTOOLS_TAG,
                            bedtools::arg_generator(BedtoolsSubcommand::Bamtobed, &sorted.bam, None),
                        )
                        .stdout_to(unsorted.clone()),
                    )
                    .command(ToolCommand::new(BEDTOOLS_TAG, bedtools::sort_args(&unsorted)).stdout_to(bed12.clone()))
                    .input(&sorted.bam)
                    .output(bed12))
            },
            |sorted, invocation| {
                let bed12 = invocation.outputs[0].clone();
                remove_intermediate(&with_suffix(&bed12, ".unsorted"));
                Ok(SplicedBed {
                    sample_id: sorted.sample_id,
                    chrom_sizes: sorted.chrom_sizes,
                    bed12,
                })
            },
        )
    };

    let bigbeds = dag.node(
        StageId::BigBed,
        bed12s,
        move |bed: &SplicedBed| {
            let bigbed = bed.bed12.with_extension("bigBed");
            Ok(Invocation::new(StageId::BigBed, &bed.sample_id, bigbed_dir.clone())
                .command(ToolCommand::new(
                    BED_TO_BIGBED_TAG,
                    ucsc::arg_generator(&bed.bed12, &bed.chrom_sizes, &bigbed),
                ))
                .input(&bed.bed12)
                .input(&bed.chrom_sizes)
                .output(bigbed))
        },
        |bed, invocation| Ok(artifacts_of(Some(&bed.sample_id), invocation)),
    );

    // Aggregation. The version channel closes once every node above has finished.
    let version_reports = dag.take_versions();
    let versions = {
        let plan = plan.clone();
        let runner = executor.runner().clone();
        dag.internal(StageId::Versions, async move {
            let (_, yaml) = aggregate_versions(version_reports, &plan, runner.as_ref()).await?;
            Ok::<_, PipelineError>(vec![Artifact::new(StageId::Versions, None, yaml)])
        })
    };

    let [mqc_artifacts, report_artifacts] = Channel::mix(vec![
        valid_sheet,
        summary_artifacts,
        pycoqc_reports,
        nanoplot_summary_reports,
        nanoplot_fastq_reports,
        fastqc_reports,
        bam_artifacts,
        bigwigs,
        bigbeds,
        versions,
    ])
    .flatten()
    .fork();

    let multiqc_report = {
        let dir = out_dir.join(MULTIQC_DIR);
        let title = plan.run_name.clone();
        dag.gather(
            StageId::MultiQc,
            mqc_artifacts,
            move |artifacts: &[Artifact]| {
                let mut search_dirs: Vec<PathBuf> = artifacts
                    .iter()
                    .filter(|a| {
                        matches!(
                            a.stage,
                            StageId::PycoQc
                                | StageId::NanoPlotSummary
                                | StageId::NanoPlotFastq
                                | StageId::FastQc
                                | StageId::Versions
                        ) || a.is_alignment_stats()
                    })
                    .filter_map(|a| a.path.parent().map(Path::to_path_buf))
                    .collect();
                search_dirs.sort();
                search_dirs.dedup();
                if search_dirs.is_empty() {
                    return Ok(None);
                }
                let report = dir.join(MULTIQC_REPORT);
                Ok(Some(
                    Invocation::new(StageId::MultiQc, RUN_TAG, dir.clone())
                        .command(ToolCommand::new(MULTIQC_TAG, multiqc::arg_generator(&title, &dir, &search_dirs)))
                        .output(report),
                ))
            },
            |_, invocation| Ok(artifacts_of(None, invocation)),
        )
    };

    let report_inputs = {
        let artifacts = Channel::mix(vec![report_artifacts, multiqc_report.flatten()]);
        let samples = sample_reads.map(|sample| sample.sample_id);
        dag.internal(StageId::Report, async move {
            let (samples, artifacts) = tokio::join!(samples.collect(), artifacts.collect());
            Ok::<_, PipelineError>((samples, artifacts))
        })
    };
    let report_inputs = tokio::spawn(report_inputs.first());

    let (summary, result) = dag.finish().await;
    let (samples, artifacts) = match report_inputs.await {
        Ok(Some(inputs)) => inputs,
        _ => (Vec::new(), Vec::new()),
    };
    let report = ReportInput {
        plan: &plan,
        samples: &samples,
        artifacts: &artifacts,
        stages: &summary.stages,
        tally: summary.tally,
    };
    let written = write_report(&report, &summary.trace);
    info!(
        "Tasks: {} succeeded, {} ignored, {} failed",
        summary.tally.succeeded, summary.tally.ignored, summary.tally.failed
    );
    let result = result.and(written.map(|_| ()));
    (Some(summary), result)
}
