use clap::Parser;

// Aligner and protocol stay plain strings here; the plan resolver validates them so a bad
// value surfaces as a configuration error naming the allowed set.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "nanoseq-pipelines", version, about = "Nanopore sequencing dataflow runner")]
pub struct Arguments {

    #[arg(short = 'i', long = "input", help = "Samplesheet with columns sample,fastq,barcode,genome")]
    pub input: Option<String>,

    #[arg(long, default_value = "DNA", help = "Library protocol: 'DNA', 'cDNA' or 'directRNA'")]
    pub protocol: String,

    #[arg(short = 'o', long = "outdir", default_value = "./results")]
    pub out_dir: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    // Basecalling / demultiplexing
    #[arg(long)]
    pub run_dir: Option<String>,

    #[arg(long)]
    pub flowcell: Option<String>,

    #[arg(long)]
    pub kit: Option<String>,

    #[arg(long, help = "Basecaller config file; replaces --flowcell/--kit")]
    pub guppy_config: Option<String>,

    #[arg(long)]
    pub barcode_kit: Option<String>,

    #[arg(long, default_value_t = false)]
    pub guppy_gpu: bool,

    #[arg(long, default_value_t = 6)]
    pub guppy_gpu_runners: usize,

    #[arg(long, default_value_t = 1)]
    pub guppy_cpu_threads: usize,

    #[arg(long, default_value = "auto")]
    pub gpu_device: String,

    #[arg(long, default_value_t = false)]
    pub skip_basecalling: bool,

    #[arg(long, default_value_t = false)]
    pub skip_demultiplexing: bool,

    #[arg(long, help = "Pooled FASTQ to demultiplex when basecalling is skipped")]
    pub input_path: Option<String>,

    // Alignment
    #[arg(long, default_value_t = false)]
    pub stranded: bool,

    #[arg(long, default_value = "minimap2", help = "Aligner: 'minimap2' or 'graphmap'")]
    pub aligner: String,

    #[arg(long, default_value_t = false)]
    pub save_align_intermeds: bool,

    #[arg(long, default_value_t = false)]
    pub skip_alignment: bool,

    #[arg(long, default_value = "s3://ngi-igenomes/igenomes", help = "Root of the symbolic genome reference tree")]
    pub igenomes_base: String,

    // Coverage tracks
    #[arg(long, default_value_t = false)]
    pub skip_bigwig: bool,

    #[arg(long, default_value_t = false)]
    pub skip_bigbed: bool,

    // QC
    #[arg(long, default_value_t = false)]
    pub skip_qc: bool,

    #[arg(long, default_value_t = false)]
    pub skip_pycoqc: bool,

    #[arg(long, default_value_t = false)]
    pub skip_nanoplot: bool,

    #[arg(long, default_value_t = false)]
    pub skip_fastqc: bool,

    #[arg(long, default_value_t = false)]
    pub skip_multiqc: bool,

    // Notification
    #[arg(long)]
    pub email: Option<String>,

    #[arg(long, help = "Address notified only when the run fails")]
    pub email_on_fail: Option<String>,

    #[arg(long, default_value_t = 25_000_000, help = "Largest MultiQC report (bytes) attached to the summary e-mail")]
    pub max_multiqc_email_size: u64,

    // Engine
    #[arg(long, help = "CPU ceiling shared by all tasks; defaults to detected physical cores")]
    pub max_cpus: Option<usize>,

    #[arg(long, help = "Memory ceiling in GiB; defaults to detected total RAM")]
    pub max_memory_gb: Option<u64>,

    #[arg(long, default_value_t = false, help = "Keep running past individual task failures")]
    pub ignore_task_errors: bool,

    #[arg(long, default_value_t = false)]
    pub awsbatch: bool,

    #[arg(long)]
    pub awsqueue: Option<String>,

    #[arg(long, default_value = "nanoseq")]
    pub run_name: String,
}
