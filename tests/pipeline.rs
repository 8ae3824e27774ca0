use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::time::timeout;

use nanoseq_pipelines::cli::Arguments;
use nanoseq_pipelines::config::defs::{PipelineError, RunConfig, RUN_REPORT, VERSIONS_CSV};
use nanoseq_pipelines::config::plan::{ExecutionPlan, ResourceCeiling, StageId};
use nanoseq_pipelines::engine::scheduler::{RunSummary, StageState};
use nanoseq_pipelines::engine::stage::{ToolCommand, ToolOutput, ToolRunner};
use nanoseq_pipelines::pipelines::nanoseq;
use nanoseq_pipelines::utils::file::fastq_stem;

const CEILING: ResourceCeiling = ResourceCeiling { max_cpus: 8, max_memory_gb: 64 };
const READ: &str = "@r\nACGT\n+\nIIII\n";

/// Stands in for every external tool: records the call and leaves behind the files
/// the real tool would have written.
#[derive(Default)]
struct ScriptedRunner {
    calls: Mutex<Vec<ToolCommand>>,
    failing: Vec<(&'static str, &'static str)>,
}

impl ScriptedRunner {
    fn failing(program: &'static str, arg: &'static str) -> Self {
        ScriptedRunner { failing: vec![(program, arg)], ..Default::default() }
    }

    fn calls_to(&self, program: &str) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().iter().filter(|c| c.program == program).cloned().collect()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn touch(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

fn after(args: &[String], flag: &str) -> Option<PathBuf> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).map(PathBuf::from)
}

fn last(args: &[String]) -> Result<PathBuf> {
    args.last().map(PathBuf::from).ok_or_else(|| anyhow!("no arguments"))
}

fn simulate(command: &ToolCommand) -> Result<()> {
    let args = &command.args;
    let has = |flag: &str| args.iter().any(|a| a == flag);
    match command.program.as_str() {
        "guppy_basecaller" => {
            let save = after(args, "--save_path").ok_or_else(|| anyhow!("no save path"))?;
            touch(&save.join("sequencing_summary.txt"), "read_id\n")?;
            if has("--barcode_kits") {
                for barcode in ["barcode01", "barcode02", "unclassified"] {
                    touch(&save.join("pass").join(barcode).join("chunk_0.fastq"), READ)?;
                }
            } else {
                touch(&save.join("pass/reads_0.fastq"), "@a\n")?;
                touch(&save.join("pass/reads_1.fastq"), "@b\n")?;
            }
        }
        "qcat" => {
            let out = after(args, "-b").ok_or_else(|| anyhow!("no output dir"))?;
            for name in ["barcode01", "barcode02", "barcode03", "none"] {
                touch(&out.join(format!("{}.fastq", name)), READ)?;
            }
        }
        "pycoQC" => touch(&after(args, "-o").ok_or_else(|| anyhow!("no html"))?, "<html/>")?,
        "NanoPlot" => {
            let out = after(args, "-o").ok_or_else(|| anyhow!("no output dir"))?;
            touch(&out.join("NanoPlot-report.html"), "<html/>")?;
        }
        "fastqc" => {
            let out = after(args, "-o").ok_or_else(|| anyhow!("no output dir"))?;
            let stem = fastq_stem(&last(args)?).ok_or_else(|| anyhow!("not a fastq"))?;
            touch(&out.join(format!("{}_fastqc.html", stem)), "<html/>")?;
            touch(&out.join(format!("{}_fastqc.zip", stem)), "zip")?;
        }
        "minimap2" => {
            if let Some(index) = after(args, "-d") {
                touch(&index, "mmi")?;
            }
        }
        "graphmap2" => {
            if has("-I") {
                touch(&after(args, "-i").ok_or_else(|| anyhow!("no index"))?, "gmidx")?;
            } else {
                touch(&after(args, "-o").ok_or_else(|| anyhow!("no sam"))?, "@HD\n")?;
            }
        }
        "samtools" => match args.first().map(String::as_str) {
            Some("faidx") => touch(&after(args, "--fai-idx").ok_or_else(|| anyhow!("no fai"))?, "chr1\t1000\t6\t60\t61\n")?,
            Some("view") | Some("sort") => touch(&after(args, "-o").ok_or_else(|| anyhow!("no bam"))?, "BAM")?,
            Some("index") => {
                let bam = last(args)?;
                touch(&PathBuf::from(format!("{}.bai", bam.display())), "BAI")?;
            }
            _ => {}
        },
        "bedGraphToBigWig" | "bedToBigBed" => touch(&last(args)?, "track")?,
        "multiqc" => {
            let out = after(args, "-o").ok_or_else(|| anyhow!("no output dir"))?;
            touch(&out.join("multiqc_report.html"), "<html/>")?;
        }
        _ => {}
    }
    if let Some(stdout) = &command.stdout {
        touch(stdout, "chr1\t0\t10\t1\n")?;
    }
    Ok(())
}

impl ToolRunner for ScriptedRunner {
    fn run<'a>(&'a self, command: &'a ToolCommand, _work_dir: &'a Path) -> BoxFuture<'a, Result<ToolOutput>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(command.clone());
            let fails = self
                .failing
                .iter()
                .any(|(program, arg)| command.program == *program && command.args.iter().any(|a| a.contains(arg)));
            if fails {
                return Ok(ToolOutput { code: Some(2), stderr: "simulated failure\n".to_string() });
            }
            simulate(command)?;
            Ok(ToolOutput { code: Some(0), stderr: String::new() })
        })
    }

    fn version<'a>(&'a self, _tool: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async { Ok("1.0".to_string()) })
    }
}

fn samplesheet(dir: &TempDir, contents: &str) -> PathBuf {
    let sheet = dir.path().join("samplesheet.csv");
    fs::write(&sheet, contents).unwrap();
    sheet
}

fn reads(dir: &TempDir, name: &str) {
    fs::write(dir.path().join(name), READ).unwrap();
}

fn arguments(dir: &TempDir, sheet: &Path, extra: impl FnOnce(&mut Arguments)) -> Arguments {
    let mut args = Arguments {
        input: Some(sheet.to_string_lossy().into_owned()),
        protocol: "DNA".to_string(),
        aligner: "minimap2".to_string(),
        out_dir: dir.path().join("results").to_string_lossy().into_owned(),
        skip_basecalling: true,
        igenomes_base: "s3://ngi-igenomes/igenomes".to_string(),
        max_multiqc_email_size: 25_000_000,
        run_name: "test_run".to_string(),
        ..Default::default()
    };
    extra(&mut args);
    args
}

async fn launch(
    dir: &TempDir,
    args: Arguments,
    runner: Arc<ScriptedRunner>,
) -> (Option<RunSummary>, Result<(), PipelineError>, PathBuf) {
    let plan = Arc::new(ExecutionPlan::resolve(&args, dir.path(), CEILING).unwrap());
    let out_dir = plan.out_dir.clone();
    let config = Arc::new(RunConfig {
        cwd: dir.path().to_path_buf(),
        out_dir: out_dir.clone(),
        args,
        plan,
    });
    let (summary, result) = timeout(Duration::from_secs(30), nanoseq::run(config, runner))
        .await
        .expect("pipeline did not finish");
    (summary, result, out_dir)
}

fn state(summary: &RunSummary, id: StageId) -> StageState {
    summary.stages.iter().find(|(s, _)| *s == id).map(|(_, state)| *state).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_samples_sharing_a_genome_share_one_index() {
    let dir = TempDir::new().unwrap();
    reads(&dir, "s1.fastq");
    reads(&dir, "s2.fastq");
    reads(&dir, "s3.fastq");
    fs::write(dir.path().join("refA.fa"), ">chr1\nACGT\n").unwrap();
    let sheet = samplesheet(
        &dir,
        "sample,fastq,barcode,genome\ns1,s1.fastq,,refA.fa\ns2,s2.fastq,,refA.fa\ns3,s3.fastq,,\n",
    );
    let runner = Arc::new(ScriptedRunner::default());
    let (summary, result, out) = launch(&dir, arguments(&dir, &sheet, |_| {}), runner.clone()).await;
    assert!(result.is_ok(), "{:?}", result);
    let summary = summary.unwrap();

    let minimap2 = runner.calls_to("minimap2");
    assert_eq!(minimap2.iter().filter(|c| c.args.contains(&"-d".to_string())).count(), 1);
    assert_eq!(minimap2.iter().filter(|c| c.stdout.is_some()).count(), 2);
    assert_eq!(runner.calls_to("fastqc").len(), 3);
    assert_eq!(runner.calls_to("NanoPlot").len(), 3);
    assert_eq!(runner.calls_to("multiqc").len(), 1);
    assert_eq!(runner.calls_to("bedGraphToBigWig").len(), 2);

    let aligned = out.join("minimap2");
    assert!(aligned.join("reference_genome/refA.fa.mmi").is_file());
    assert!(aligned.join("reference_genome/refA.fa.sizes").is_file());
    for sample in ["s1", "s2"] {
        assert!(aligned.join(format!("{}.sorted.bam", sample)).is_file());
        assert!(aligned.join(format!("{}.sorted.bam.bai", sample)).is_file());
        assert!(aligned.join(format!("samtools_stats/{}.sorted.bam.flagstat", sample)).is_file());
        assert!(aligned.join(format!("bigwig/{}.bigWig", sample)).is_file());
        assert!(aligned.join(format!("bigbed/{}.bigBed", sample)).is_file());
        assert!(!aligned.join(format!("{}.sam", sample)).exists());
        assert!(!aligned.join(format!("{}.bam", sample)).exists());
    }
    assert!(!aligned.join("s3.sorted.bam").exists());

    let report = fs::read_to_string(out.join("pipeline_info").join(RUN_REPORT)).unwrap();
    assert!(report.contains("Samples (3):"));
    assert!(report.contains("Alignment statistics (6 files)"));
    assert!(report.contains("0 failed"));
    let versions = fs::read_to_string(out.join("pipeline_info").join(VERSIONS_CSV)).unwrap();
    assert!(versions.contains("minimap2,1.0"));
    assert!(versions.contains("multiqc,1.0"));

    assert_eq!(state(&summary, StageId::Basecall), StageState::Inactive);
    assert_eq!(state(&summary, StageId::Align), StageState::Done);
    assert_eq!(state(&summary, StageId::Report), StageState::Done);
    assert_eq!(summary.tally.failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_genomes_sharing_a_file_name_get_separate_bundles() {
    let dir = TempDir::new().unwrap();
    reads(&dir, "h1.fastq");
    reads(&dir, "m1.fastq");
    for species in ["human", "mouse"] {
        fs::create_dir_all(dir.path().join(species)).unwrap();
        fs::write(dir.path().join(species).join("genome.fa"), ">chr1\nACGT\n").unwrap();
    }
    let sheet = samplesheet(
        &dir,
        "sample,fastq,genome\nh1,h1.fastq,human/genome.fa\nm1,m1.fastq,mouse/genome.fa\n",
    );
    let runner = Arc::new(ScriptedRunner::default());
    let (_, result, out) = launch(&dir, arguments(&dir, &sheet, |_| {}), runner.clone()).await;
    assert!(result.is_ok(), "{:?}", result);

    let minimap2 = runner.calls_to("minimap2");
    let built: Vec<(PathBuf, PathBuf)> = minimap2
        .iter()
        .filter_map(|c| Some((last(&c.args).ok()?, after(&c.args, "-d")?)))
        .collect();
    assert_eq!(built.len(), 2);
    assert_ne!(built[0].1, built[1].1);
    let index_for = |species: &str| {
        built
            .iter()
            .find(|(fasta, _)| fasta.ends_with(format!("{}/genome.fa", species)))
            .map(|(_, index)| index.clone())
            .unwrap()
    };

    for (sample, species) in [("h1", "human"), ("m1", "mouse")] {
        let align = minimap2
            .iter()
            .find(|c| c.stdout.is_some() && c.args.last().is_some_and(|a| a.ends_with(&format!("{}.fastq", sample))))
            .unwrap();
        assert_eq!(PathBuf::from(&align.args[align.args.len() - 2]), index_for(species));
    }

    let faidx: Vec<PathBuf> = runner
        .calls_to("samtools")
        .iter()
        .filter_map(|c| after(&c.args, "--fai-idx"))
        .collect();
    assert_eq!(faidx.len(), 2);
    assert_ne!(faidx[0], faidx[1]);
    let sizes: Vec<PathBuf> = fs::read_dir(out.join("minimap2/reference_genome"))
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "sizes"))
        .collect();
    assert_eq!(sizes.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_skip_alignment_still_aggregates() {
    let dir = TempDir::new().unwrap();
    reads(&dir, "s1.fastq.gz");
    fs::write(dir.path().join("refA.fa"), ">chr1\nACGT\n").unwrap();
    let sheet = samplesheet(&dir, "sample,fastq,genome\ns1,s1.fastq.gz,refA.fa\n");
    let runner = Arc::new(ScriptedRunner::default());
    let args = arguments(&dir, &sheet, |a| a.skip_alignment = true);
    let (summary, result, out) = launch(&dir, args, runner.clone()).await;
    assert!(result.is_ok(), "{:?}", result);
    let summary = summary.unwrap();

    assert!(!out.join("minimap2").exists());
    assert!(runner.calls_to("minimap2").is_empty());
    assert!(out.join("fastqc/s1/s1_fastqc.html").is_file());
    assert!(out.join("multiqc/multiqc_report.html").is_file());
    assert_eq!(state(&summary, StageId::Align), StageState::Inactive);
    assert_eq!(state(&summary, StageId::MultiQc), StageState::Done);
    assert_eq!(summary.tally.succeeded, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_basecalled_reads_pooled_under_first_sample() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("run")).unwrap();
    fs::write(dir.path().join("refA.fa"), ">chr1\nACGT\n").unwrap();
    let sheet = samplesheet(&dir, "sample,fastq,barcode,genome\nrunA,,,refA.fa\n");
    let runner = Arc::new(ScriptedRunner::default());
    let args = arguments(&dir, &sheet, |a| {
        a.skip_basecalling = false;
        a.run_dir = Some("run".to_string());
        a.flowcell = Some("FLO-MIN106".to_string());
        a.kit = Some("SQK-LSK109".to_string());
    });
    let (summary, result, out) = launch(&dir, args, runner.clone()).await;
    assert!(result.is_ok(), "{:?}", result);
    let summary = summary.unwrap();

    let merged = out.join("guppy/fastq/runA.fastq");
    assert_eq!(fs::read_to_string(&merged).unwrap(), "@a\n@b\n");
    assert_eq!(runner.calls_to("guppy_basecaller").len(), 1);
    assert_eq!(runner.calls_to("pycoQC").len(), 1);
    let nanoplot = runner.calls_to("NanoPlot");
    assert_eq!(nanoplot.len(), 1);
    assert!(nanoplot[0].args.contains(&"--summary".to_string()));
    assert_eq!(runner.calls_to("fastqc").len(), 1);
    assert!(out.join("minimap2/runA.sorted.bam").is_file());
    assert_eq!(state(&summary, StageId::NanoPlotFastq), StageState::Inactive);
    assert_eq!(state(&summary, StageId::Demultiplex), StageState::Inactive);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_basecalled_barcodes_rejoin_samples() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("run")).unwrap();
    let sheet = samplesheet(&dir, "sample,barcode\nsA,1\nsB,2\nsC,5\n");
    let runner = Arc::new(ScriptedRunner::default());
    let args = arguments(&dir, &sheet, |a| {
        a.skip_basecalling = false;
        a.run_dir = Some("run".to_string());
        a.flowcell = Some("FLO-MIN106".to_string());
        a.kit = Some("SQK-LSK109".to_string());
        a.barcode_kit = Some("EXP-NBD103".to_string());
        a.skip_alignment = true;
    });
    let (summary, result, out) = launch(&dir, args, runner.clone()).await;
    assert!(result.is_ok(), "{:?}", result);
    let summary = summary.unwrap();

    let guppy = runner.calls_to("guppy_basecaller");
    assert_eq!(guppy.len(), 1);
    assert!(guppy[0].args.contains(&"--barcode_kits".to_string()));
    assert!(runner.calls_to("qcat").is_empty());

    let mut qc_inputs: Vec<String> = runner.calls_to("fastqc").iter().filter_map(|c| c.args.last().cloned()).collect();
    qc_inputs.sort();
    assert_eq!(qc_inputs.len(), 2);
    assert!(qc_inputs[0].ends_with("barcode01.fastq"));
    assert!(qc_inputs[1].ends_with("barcode02.fastq"));
    assert!(out.join("fastqc/sA/barcode01_fastqc.html").is_file());
    assert!(out.join("fastqc/sB/barcode02_fastqc.html").is_file());
    assert!(!out.join("fastqc/sC").exists());

    let report = fs::read_to_string(out.join("pipeline_info").join(RUN_REPORT)).unwrap();
    assert!(report.contains("Samples (2):"));
    assert!(report.contains("  sA\n"));
    assert!(report.contains("  sB\n"));
    assert!(!report.contains("sC"));
    assert_eq!(state(&summary, StageId::Basecall), StageState::Done);
    assert_eq!(state(&summary, StageId::Demultiplex), StageState::Inactive);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_demultiplexed_reads_rejoin_samples_by_barcode() {
    let dir = TempDir::new().unwrap();
    reads(&dir, "pooled.fastq");
    let sheet = samplesheet(&dir, "sample,barcode\ns1,1\ns2,BC02\ns4,barcode04\n");
    let runner = Arc::new(ScriptedRunner::default());
    let args = arguments(&dir, &sheet, |a| {
        a.barcode_kit = Some("NBD103".to_string());
        a.input_path = Some("pooled.fastq".to_string());
        a.skip_alignment = true;
    });
    let (summary, result, out) = launch(&dir, args, runner.clone()).await;
    assert!(result.is_ok(), "{:?}", result);

    assert_eq!(runner.calls_to("qcat").len(), 1);
    let mut qc_inputs: Vec<String> = runner.calls_to("fastqc").iter().filter_map(|c| c.args.last().cloned()).collect();
    qc_inputs.sort();
    assert_eq!(qc_inputs.len(), 2);
    assert!(qc_inputs[0].ends_with("qcat/fastq/barcode01.fastq"));
    assert!(qc_inputs[1].ends_with("qcat/fastq/barcode02.fastq"));
    assert!(out.join("fastqc/s1/barcode01_fastqc.html").is_file());
    assert!(!out.join("fastqc/s4").exists());

    let report = fs::read_to_string(out.join("pipeline_info").join(RUN_REPORT)).unwrap();
    assert!(report.contains("Samples (2):"));
    assert_eq!(state(&summary.unwrap(), StageId::Demultiplex), StageState::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stranded_graphmap_run_builds_per_strand_tracks() {
    let dir = TempDir::new().unwrap();
    reads(&dir, "s1.fastq");
    fs::write(dir.path().join("refA.fa"), ">chr1\nACGT\n").unwrap();
    let sheet = samplesheet(&dir, "sample,fastq,genome\ns1,s1.fastq,refA.fa\n");
    let runner = Arc::new(ScriptedRunner::default());
    let args = arguments(&dir, &sheet, |a| {
        a.aligner = "graphmap".to_string();
        a.protocol = "cDNA".to_string();
        a.stranded = true;
        a.skip_qc = true;
    });
    let (summary, result, out) = launch(&dir, args, runner.clone()).await;
    assert!(result.is_ok(), "{:?}", result);

    let graphmap = runner.calls_to("graphmap2");
    assert_eq!(graphmap.len(), 2);
    assert_eq!(graphmap.iter().filter(|c| c.args.contains(&"-I".to_string())).count(), 1);
    let aligned = out.join("graphmap");
    assert!(aligned.join("reference_genome/refA.fa.gmidx").is_file());
    assert!(aligned.join("bigwig/s1.plus.bigWig").is_file());
    assert!(aligned.join("bigwig/s1.minus.bigWig").is_file());
    assert!(!aligned.join("bigwig/s1.plus.bedGraph.unsorted").exists());
    assert!(runner.calls_to("fastqc").is_empty());
    assert!(runner.calls_to("multiqc").is_empty());
    assert_eq!(state(&summary.unwrap(), StageId::MultiQc), StageState::Inactive);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ignored_failures_are_tallied() {
    let dir = TempDir::new().unwrap();
    reads(&dir, "s1.fastq");
    reads(&dir, "s2.fastq");
    let sheet = samplesheet(&dir, "sample,fastq\ns1,s1.fastq\ns2,s2.fastq\n");
    let runner = Arc::new(ScriptedRunner::failing("fastqc", "s2.fastq"));
    let args = arguments(&dir, &sheet, |a| {
        a.skip_alignment = true;
        a.ignore_task_errors = true;
    });
    let (summary, result, out) = launch(&dir, args, runner.clone()).await;
    assert!(result.is_ok(), "{:?}", result);
    let summary = summary.unwrap();

    assert_eq!(summary.tally.ignored, 1);
    assert_eq!(summary.tally.failed, 0);
    assert_eq!(state(&summary, StageId::FastQc), StageState::Failed);
    assert_eq!(state(&summary, StageId::MultiQc), StageState::Done);
    assert!(out.join("fastqc/s1/s1_fastqc.html").is_file());
    let report = fs::read_to_string(out.join("pipeline_info").join(RUN_REPORT)).unwrap();
    assert!(report.contains("1 ignored"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_task_terminates_run_with_its_exit_code() {
    let dir = TempDir::new().unwrap();
    reads(&dir, "s1.fastq");
    let sheet = samplesheet(&dir, "sample,fastq\ns1,s1.fastq\n");
    let runner = Arc::new(ScriptedRunner::failing("fastqc", "s1.fastq"));
    let args = arguments(&dir, &sheet, |a| a.skip_alignment = true);
    let (summary, result, out) = launch(&dir, args, runner.clone()).await;

    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("simulated failure"));
    let summary = summary.unwrap();
    assert_eq!(summary.tally.failed, 1);
    assert_eq!(state(&summary, StageId::FastQc), StageState::Failed);
    let report = fs::read_to_string(out.join("pipeline_info").join(RUN_REPORT)).unwrap();
    assert!(report.contains("1 failed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_reads_fail_before_any_tool_runs() {
    let dir = TempDir::new().unwrap();
    let sheet = samplesheet(&dir, "sample,fastq\ns1,absent.fastq\n");
    let runner = Arc::new(ScriptedRunner::default());
    let (summary, result, _) = launch(&dir, arguments(&dir, &sheet, |_| {}), runner.clone()).await;
    assert!(summary.is_none());
    assert!(matches!(result, Err(PipelineError::MissingInput { .. })));
    assert_eq!(runner.total_calls(), 0);
}

#[test]
fn test_invalid_aligner_rejected_at_resolution() {
    let dir = TempDir::new().unwrap();
    let sheet = samplesheet(&dir, "sample,fastq\ns1,s1.fastq\n");
    let args = arguments(&dir, &sheet, |a| a.aligner = "foo".to_string());
    match ExecutionPlan::resolve(&args, dir.path(), CEILING) {
        Err(PipelineError::ConfigValidation { flag, message }) => {
            assert_eq!(flag, "aligner");
            assert!(message.contains("foo"));
        }
        other => panic!("expected a configuration error, got {:?}", other.map(|p| p.run_name)),
    }
}
