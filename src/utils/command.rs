/// Functions for building the command-line arguments of every wrapped tool

use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use tokio::process::Command;

use crate::config::defs::{
    BEDGRAPH_TO_BIGWIG_TAG, BEDTOOLS_TAG, BED_TO_BIGBED_TAG, FASTQC_TAG, GRAPHMAP2_TAG, GUPPY_TAG, MINIMAP2_TAG,
    MULTIQC_TAG, NANOPLOT_TAG, PYCOQC_TAG, QCAT_TAG, SAMTOOLS_TAG,
};

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

pub mod guppy {
    use std::path::Path;
    use crate::config::plan::{BasecallPlan, BasecallerModel};
    use super::path_arg;

    /// # Arguments
    ///
    /// * `plan` - Resolved basecalling options.
    /// * `barcode_kit` - Barcode kit; the basecaller demultiplexes when present.
    /// * `save_path` - Directory the basecaller writes into.
    /// * `cpus` - CPUs reserved for the task.
    pub fn arg_generator(plan: &BasecallPlan, barcode_kit: Option<&str>, save_path: &Path, cpus: usize) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("--input_path".to_string());
        args_vec.push(path_arg(&plan.run_dir));
        args_vec.push("--save_path".to_string());
        args_vec.push(path_arg(save_path));
        args_vec.push("--records_per_fastq".to_string());
        args_vec.push("0".to_string());
        args_vec.push("--compress_fastq".to_string());

        match &plan.model {
            BasecallerModel::ConfigFile(config) => {
                args_vec.push("--config".to_string());
                args_vec.push(path_arg(config));
            }
            BasecallerModel::FlowcellKit { flowcell, kit } => {
                args_vec.push("--flowcell".to_string());
                args_vec.push(flowcell.clone());
                args_vec.push("--kit".to_string());
                args_vec.push(kit.clone());
            }
        }

        if let Some(kit) = barcode_kit {
            args_vec.push("--barcode_kits".to_string());
            args_vec.push(kit.to_string());
        }

        match &plan.gpu {
            Some(gpu) => {
                args_vec.push("--device".to_string());
                args_vec.push(gpu.device.clone());
                args_vec.push("--num_callers".to_string());
                args_vec.push(cpus.to_string());
                args_vec.push("--cpu_threads_per_caller".to_string());
                args_vec.push(gpu.cpu_threads_per_caller.to_string());
                args_vec.push("--gpu_runners_per_device".to_string());
                args_vec.push(gpu.runners_per_device.to_string());
            }
            None => {
                args_vec.push("--num_callers".to_string());
                args_vec.push("2".to_string());
                args_vec.push("--cpu_threads_per_caller".to_string());
                args_vec.push((cpus / 2).max(1).to_string());
            }
        }
        args_vec
    }
}

pub mod qcat {
    use std::path::Path;
    use super::path_arg;

    pub fn arg_generator(pooled_fastq: &Path, out_dir: &Path, barcode_kit: &str) -> Vec<String> {
        vec![
            "-f".to_string(),
            path_arg(pooled_fastq),
            "-b".to_string(),
            path_arg(out_dir),
            "--kit".to_string(),
            barcode_kit.to_string(),
        ]
    }
}

pub mod pycoqc {
    use std::path::Path;
    use super::path_arg;

    pub fn arg_generator(summary: &Path, html: &Path) -> Vec<String> {
        vec!["-f".to_string(), path_arg(summary), "-o".to_string(), path_arg(html)]
    }
}

pub mod nanoplot {
    use std::path::Path;
    use super::path_arg;

    /// Plots from a basecaller sequencing summary.
    pub fn summary_args(summary: &Path, out_dir: &Path, cpus: usize) -> Vec<String> {
        vec![
            "-t".to_string(),
            cpus.to_string(),
            "--summary".to_string(),
            path_arg(summary),
            "-o".to_string(),
            path_arg(out_dir),
        ]
    }

    /// Plots straight from reads.
    pub fn fastq_args(fastq: &Path, out_dir: &Path, cpus: usize) -> Vec<String> {
        vec![
            "-t".to_string(),
            cpus.to_string(),
            "--fastq".to_string(),
            path_arg(fastq),
            "-o".to_string(),
            path_arg(out_dir),
        ]
    }
}

pub mod fastqc {
    use std::path::Path;
    use super::path_arg;

    pub fn arg_generator(fastq: &Path, out_dir: &Path, cpus: usize) -> Vec<String> {
        vec![
            "-q".to_string(),
            "-t".to_string(),
            cpus.to_string(),
            "-o".to_string(),
            path_arg(out_dir),
            path_arg(fastq),
        ]
    }
}

pub mod minimap2 {
    use std::path::Path;
    use crate::config::plan::{AlignmentPlan, Protocol};
    use super::path_arg;

    /// Preset shared by indexing and alignment; the index bakes in k-mer settings.
    fn preset(plan: &AlignmentPlan) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-ax".to_string());
        match plan.protocol {
            Protocol::Dna => args_vec.push("map-ont".to_string()),
            Protocol::Cdna | Protocol::DirectRna => args_vec.push("splice".to_string()),
        }
        if plan.protocol == Protocol::DirectRna {
            args_vec.push("-k14".to_string());
        }
        if plan.stranded {
            args_vec.push("-uf".to_string());
        }
        args_vec
    }

    pub fn index_args(plan: &AlignmentPlan, fasta: &Path, index: &Path, cpus: usize) -> Vec<String> {
        let mut args_vec = preset(plan);
        args_vec.push("-t".to_string());
        args_vec.push(cpus.to_string());
        args_vec.push("-d".to_string());
        args_vec.push(path_arg(index));
        args_vec.push(path_arg(fasta));
        args_vec
    }

    /// Alignment writes SAM to stdout.
    pub fn align_args(plan: &AlignmentPlan, index: &Path, fastq: &Path, cpus: usize) -> Vec<String> {
        let mut args_vec = preset(plan);
        args_vec.push("-t".to_string());
        args_vec.push(cpus.to_string());
        args_vec.push(path_arg(index));
        args_vec.push(path_arg(fastq));
        args_vec
    }
}

pub mod graphmap2 {
    use std::path::Path;
    use super::path_arg;

    pub fn index_args(fasta: &Path, index: &Path, cpus: usize) -> Vec<String> {
        vec![
            "align".to_string(),
            "-t".to_string(),
            cpus.to_string(),
            "-I".to_string(),
            "-r".to_string(),
            path_arg(fasta),
            "-i".to_string(),
            path_arg(index),
        ]
    }

    pub fn align_args(fasta: &Path, index: &Path, fastq: &Path, sam: &Path, cpus: usize) -> Vec<String> {
        vec![
            "align".to_string(),
            "-t".to_string(),
            cpus.to_string(),
            "-r".to_string(),
            path_arg(fasta),
            "-i".to_string(),
            path_arg(index),
            "-d".to_string(),
            path_arg(fastq),
            "-o".to_string(),
            path_arg(sam),
            "--extcigar".to_string(),
        ]
    }
}

pub mod samtools {
    use std::path::Path;
    use crate::config::defs::SamtoolsSubcommand;
    use super::path_arg;

    /// Paths a samtools subcommand reads from and writes to. Subcommands that print
    /// to stdout (flagstat, idxstats, stats) leave `output` unused; the caller
    /// redirects stdout instead.
    #[derive(Debug)]
    pub struct SamtoolsConfig<'a> {
        pub subcommand: SamtoolsSubcommand,
        pub input: &'a Path,
        pub output: Option<&'a Path>,
        pub cpus: usize,
    }

    pub fn arg_generator(config: &SamtoolsConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        match config.subcommand {
            SamtoolsSubcommand::Faidx => {
                args_vec.push("faidx".to_string());
                args_vec.push(path_arg(config.input));
                if let Some(fai) = config.output {
                    args_vec.push("--fai-idx".to_string());
                    args_vec.push(path_arg(fai));
                }
            }
            SamtoolsSubcommand::View => {
                args_vec.push("view".to_string());
                args_vec.push("-b".to_string());
                args_vec.push("-h".to_string());
                args_vec.push("-O".to_string());
                args_vec.push("BAM".to_string());
                args_vec.push("-@".to_string());
                args_vec.push(config.cpus.to_string());
                if let Some(output) = config.output {
                    args_vec.push("-o".to_string());
                    args_vec.push(path_arg(output));
                }
                args_vec.push(path_arg(config.input));
            }
            SamtoolsSubcommand::Sort => {
                args_vec.push("sort".to_string());
                args_vec.push("-@".to_string());
                args_vec.push(config.cpus.to_string());
                if let Some(output) = config.output {
                    args_vec.push("-o".to_string());
                    args_vec.push(path_arg(output));
                }
                args_vec.push(path_arg(config.input));
            }
            SamtoolsSubcommand::Index => {
                args_vec.push("index".to_string());
                args_vec.push(path_arg(config.input));
            }
            SamtoolsSubcommand::Flagstat => {
                args_vec.push("flagstat".to_string());
                args_vec.push(path_arg(config.input));
            }
            SamtoolsSubcommand::Idxstats => {
                args_vec.push("idxstats".to_string());
                args_vec.push(path_arg(config.input));
            }
            SamtoolsSubcommand::Stats => {
                args_vec.push("stats".to_string());
                args_vec.push(path_arg(config.input));
            }
        }
        args_vec
    }
}

pub mod bedtools {
    use std::path::Path;
    use crate::config::defs::BedtoolsSubcommand;
    use super::path_arg;

    /// Strand filter for `genomecov`.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Strand {
        Plus,
        Minus,
    }

    impl Strand {
        pub fn symbol(&self) -> &'static str {
            match self {
                Strand::Plus => "+",
                Strand::Minus => "-",
            }
        }

        pub fn label(&self) -> &'static str {
            match self {
                Strand::Plus => "plus",
                Strand::Minus => "minus",
            }
        }
    }

    /// Builds `genomecov` or `bamtobed` arguments. Both print to stdout.
    pub fn arg_generator(subcommand: BedtoolsSubcommand, bam: &Path, strand: Option<Strand>) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        match subcommand {
            BedtoolsSubcommand::Genomecov => {
                args_vec.push("genomecov".to_string());
                args_vec.push("-split".to_string());
                args_vec.push("-ibam".to_string());
                args_vec.push(path_arg(bam));
                args_vec.push("-bg".to_string());
                if let Some(strand) = strand {
                    args_vec.push("-strand".to_string());
                    args_vec.push(strand.symbol().to_string());
                }
            }
            BedtoolsSubcommand::Bamtobed => {
                args_vec.push("bamtobed".to_string());
                args_vec.push("-bed12".to_string());
                args_vec.push("-cigar".to_string());
                args_vec.push("-i".to_string());
                args_vec.push(path_arg(bam));
            }
        }
        args_vec
    }

    /// Coordinate sort printed to stdout, as the UCSC converters expect.
    pub fn sort_args(bed: &Path) -> Vec<String> {
        vec!["sort".to_string(), "-i".to_string(), path_arg(bed)]
    }
}

pub mod ucsc {
    use std::path::Path;
    use super::path_arg;

    /// `bedGraphToBigWig` and `bedToBigBed` share the same `in sizes out` shape.
    pub fn arg_generator(input: &Path, chrom_sizes: &Path, output: &Path) -> Vec<String> {
        vec![path_arg(input), path_arg(chrom_sizes), path_arg(output)]
    }
}

pub mod multiqc {
    use std::path::{Path, PathBuf};
    use super::path_arg;

    pub fn arg_generator(title: &str, out_dir: &Path, search_dirs: &[PathBuf]) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-f".to_string());
        args_vec.push("--title".to_string());
        args_vec.push(title.to_string());
        args_vec.push("-o".to_string());
        args_vec.push(path_arg(out_dir));
        for dir in search_dirs {
            args_vec.push(path_arg(dir));
        }
        args_vec
    }
}

/// Arguments that make `tool` print its version. The UCSC converters have no version
/// flag and print it in their usage text.
fn version_args(tool: &str) -> Result<&'static [&'static str]> {
    let args: &'static [&'static str] = match tool {
        GUPPY_TAG | QCAT_TAG | PYCOQC_TAG | NANOPLOT_TAG | FASTQC_TAG | MINIMAP2_TAG | GRAPHMAP2_TAG
        | SAMTOOLS_TAG | BEDTOOLS_TAG | MULTIQC_TAG => &["--version"],
        BEDGRAPH_TO_BIGWIG_TAG | BED_TO_BIGBED_TAG => &[],
        _ => return Err(anyhow!("Unknown tool: {}", tool)),
    };
    Ok(args)
}

/// First whitespace token that looks like a version number, e.g. `v0.11.9` -> `0.11.9`.
pub fn parse_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| c == ',' || c == ':' || c == '(' || c == ')'))
        .map(|token| token.strip_prefix('v').unwrap_or(token))
        .find(|token| token.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

pub async fn check_version(tool: &str) -> Result<String> {
    let args = version_args(tool)?;
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| anyhow!("Failed to spawn {}: {}. Is it installed?", tool, e))?;

    // Some tools print their version on stderr, or exit nonzero after printing usage.
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").to_string();
    parse_version(&text).ok_or_else(|| anyhow!("Invalid {} version output: {}", tool, first_line))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defs::SamtoolsSubcommand;
    use crate::config::plan::{AlignmentPlan, Aligner, BasecallPlan, BasecallerModel, GpuSettings, Protocol};
    use std::path::PathBuf;

    fn alignment(protocol: Protocol, stranded: bool) -> AlignmentPlan {
        AlignmentPlan { aligner: Aligner::Minimap2, protocol, stranded, save_intermediates: false }
    }

    #[test]
    fn test_minimap2_presets() {
        let index = Path::new("ref.mmi");
        let fastq = Path::new("s1.fastq.gz");
        let dna = minimap2::align_args(&alignment(Protocol::Dna, false), index, fastq, 12);
        assert_eq!(dna, vec!["-ax", "map-ont", "-t", "12", "ref.mmi", "s1.fastq.gz"]);

        let rna = minimap2::align_args(&alignment(Protocol::DirectRna, true), index, fastq, 4);
        assert_eq!(&rna[..4], &["-ax", "splice", "-k14", "-uf"]);

        let cdna = minimap2::index_args(&alignment(Protocol::Cdna, false), Path::new("ref.fa"), index, 2);
        assert_eq!(cdna, vec!["-ax", "splice", "-t", "2", "-d", "ref.mmi", "ref.fa"]);
    }

    #[test]
    fn test_guppy_cpu_and_gpu_modes() {
        let mut plan = BasecallPlan {
            run_dir: PathBuf::from("/runs/fast5"),
            model: BasecallerModel::FlowcellKit { flowcell: "FLO-MIN106".to_string(), kit: "SQK-LSK109".to_string() },
            gpu: None,
        };
        let cpu = guppy::arg_generator(&plan, Some("EXP-NBD104"), Path::new("/out/guppy"), 12);
        assert!(cpu.windows(2).any(|w| w == ["--cpu_threads_per_caller", "6"]));
        assert!(cpu.windows(2).any(|w| w == ["--barcode_kits", "EXP-NBD104"]));
        assert!(!cpu.contains(&"--device".to_string()));

        plan.gpu = Some(GpuSettings { device: "cuda:0".to_string(), runners_per_device: 6, cpu_threads_per_caller: 1 });
        plan.model = BasecallerModel::ConfigFile(PathBuf::from("dna.cfg"));
        let gpu = guppy::arg_generator(&plan, None, Path::new("/out/guppy"), 12);
        assert!(gpu.windows(2).any(|w| w == ["--device", "cuda:0"]));
        assert!(gpu.windows(2).any(|w| w == ["--config", "dna.cfg"]));
        assert!(!gpu.contains(&"--flowcell".to_string()));
    }

    #[test]
    fn test_samtools_view_and_faidx() {
        let view = samtools::arg_generator(&samtools::SamtoolsConfig {
            subcommand: SamtoolsSubcommand::View,
            input: Path::new("s1.sam"),
            output: Some(Path::new("s1.bam")),
            cpus: 6,
        });
        assert_eq!(view, vec!["view", "-b", "-h", "-O", "BAM", "-@", "6", "-o", "s1.bam", "s1.sam"]);

        let faidx = samtools::arg_generator(&samtools::SamtoolsConfig {
            subcommand: SamtoolsSubcommand::Faidx,
            input: Path::new("ref.fa"),
            output: Some(Path::new("out/ref.fa.fai")),
            cpus: 1,
        });
        assert_eq!(faidx, vec!["faidx", "ref.fa", "--fai-idx", "out/ref.fa.fai"]);
    }

    #[test]
    fn test_bedtools_genomecov_strand() {
        let args = bedtools::arg_generator(
            crate::config::defs::BedtoolsSubcommand::Genomecov,
            Path::new("s1.sorted.bam"),
            Some(bedtools::Strand::Minus),
        );
        assert_eq!(args, vec!["genomecov", "-split", "-ibam", "s1.sorted.bam", "-bg", "-strand", "-"]);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("2.24-r1122\n"), Some("2.24-r1122".to_string()));
        assert_eq!(parse_version("FastQC v0.11.9"), Some("0.11.9".to_string()));
        assert_eq!(parse_version("multiqc, version 1.13"), Some("1.13".to_string()));
        assert_eq!(
            parse_version(": Guppy Basecalling Software, (C) Oxford Nanopore Technologies plc. Version 6.0.1+652ffd1, client"),
            Some("6.0.1+652ffd1".to_string())
        );
        assert_eq!(parse_version("usage only"), None);
    }

    #[test]
    fn test_unknown_tool_has_no_version_query() {
        assert!(version_args("bwa").is_err());
    }
}
