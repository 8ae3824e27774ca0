// src/engine/aggregate.rs
//! Fan-in of side-channels into single run-level files. Both aggregators treat an
//! empty upstream as "nothing happened" and still write their outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::defs::{
    PipelineError, ALL_TOOLS, EXECUTION_TRACE, MULTIQC_TAG, PIPELINE_INFO_DIR, RUN_REPORT, VERSIONS_CSV,
    VERSIONS_MQC_YAML,
};
use crate::config::plan::{ExecutionPlan, StageId};
use crate::engine::scheduler::{StageState, ToolVersion};
use crate::engine::stage::{TallySnapshot, ToolRunner, TraceEntry};
use crate::utils::file::write_atomic;
use crate::utils::streams::Channel;

/// A file some stage left behind, optionally tied to a sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub stage: StageId,
    pub sample: Option<String>,
    pub path: PathBuf,
}

impl Artifact {
    pub fn new(stage: StageId, sample: Option<&str>, path: PathBuf) -> Self {
        Artifact {
            stage,
            sample: sample.map(str::to_string),
            path,
        }
    }

    /// samtools flagstat/idxstats/stats output.
    pub fn is_alignment_stats(&self) -> bool {
        self.stage == StageId::SortIndex
            && self
                .path
                .extension()
                .is_some_and(|ext| ext == "flagstat" || ext == "idxstats" || ext == "stats")
    }
}

/// One version per known tool, empty for tools that never ran.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionManifest {
    entries: Vec<(&'static str, String)>,
}

impl VersionManifest {
    pub fn from_reports(reports: Vec<ToolVersion>) -> Self {
        let mut reported: BTreeMap<String, String> = BTreeMap::new();
        for report in reports {
            reported.entry(report.tool).or_insert(report.version);
        }
        let entries = ALL_TOOLS
            .iter()
            .map(|tool| (*tool, reported.remove(*tool).unwrap_or_default()))
            .collect();
        for tool in reported.keys() {
            warn!("Version reported for unknown tool {}", tool);
        }
        VersionManifest { entries }
    }

    pub fn get(&self, tool: &str) -> Option<&str> {
        self.entries.iter().find(|(t, _)| *t == tool).map(|(_, v)| v.as_str())
    }

    fn set(&mut self, tool: &str, version: String) {
        if let Some(entry) = self.entries.iter_mut().find(|(t, _)| *t == tool) {
            entry.1 = version;
        }
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from("tool,version\n");
        for (tool, version) in &self.entries {
            out.push_str(&format!("{},{}\n", tool, version));
        }
        out
    }

    /// Custom-content section MultiQC picks up from its search path.
    pub fn to_mqc_yaml(&self) -> String {
        let mut out = String::from(
            "id: 'software_versions'\nsection_name: 'nanoseq Software Versions'\nplot_type: 'html'\n\
             description: 'are collected at run time from the software output.'\ndata: |\n    <dl class=\"dl-horizontal\">\n",
        );
        for (tool, version) in self.entries.iter().filter(|(_, v)| !v.is_empty()) {
            out.push_str(&format!("        <dt>{}</dt><dd><samp>{}</samp></dd>\n", tool, version));
        }
        out.push_str("    </dl>\n");
        out
    }
}

/// Drains the version side-channel and writes the manifest files.
///
/// MultiQC consumes the manifest, so it cannot report through the channel; when it
/// is active its version is asked for directly.
///
/// # Returns
/// The manifest plus the path of the MultiQC YAML section.
pub async fn aggregate_versions(
    reports: Channel<ToolVersion>,
    plan: &ExecutionPlan,
    runner: &dyn ToolRunner,
) -> Result<(VersionManifest, PathBuf), PipelineError> {
    let mut manifest = VersionManifest::from_reports(reports.collect().await);
    if plan.is_active(StageId::MultiQc) {
        match runner.version(MULTIQC_TAG).await {
            Ok(version) => manifest.set(MULTIQC_TAG, version),
            Err(e) => warn!("Could not determine {} version: {}", MULTIQC_TAG, e),
        }
    }
    let info_dir = plan.out_dir.join(PIPELINE_INFO_DIR);
    let yaml = info_dir.join(VERSIONS_MQC_YAML);
    write_atomic(&info_dir.join(VERSIONS_CSV), &manifest.to_csv())?;
    write_atomic(&yaml, &manifest.to_mqc_yaml())?;
    Ok((manifest, yaml))
}

/// Everything the run report is built from.
#[derive(Debug)]
pub struct ReportInput<'a> {
    pub plan: &'a ExecutionPlan,
    pub samples: &'a [String],
    pub artifacts: &'a [Artifact],
    pub stages: &'a [(StageId, StageState)],
    pub tally: TallySnapshot,
}

pub fn render_report(input: &ReportInput) -> String {
    let mut out = format!("nanoseq run report: {}\n\n", input.plan.run_name);

    out.push_str(&format!("Samples ({}):\n", input.samples.len()));
    for sample in input.samples {
        out.push_str(&format!("  {}\n", sample));
    }

    let mut per_sample: BTreeMap<&str, Vec<&Artifact>> = BTreeMap::new();
    let mut run_level = Vec::new();
    for artifact in input.artifacts {
        match &artifact.sample {
            Some(sample) => per_sample.entry(sample.as_str()).or_default().push(artifact),
            None => run_level.push(artifact),
        }
    }
    out.push_str("\nArtifacts:\n");
    for (sample, artifacts) in &per_sample {
        out.push_str(&format!("  {}:\n", sample));
        for artifact in artifacts {
            out.push_str(&format!("    [{}] {}\n", artifact.stage, artifact.path.display()));
        }
    }
    for artifact in &run_level {
        out.push_str(&format!("  [{}] {}\n", artifact.stage, artifact.path.display()));
    }

    let stats: Vec<&Artifact> = input.artifacts.iter().filter(|a| a.is_alignment_stats()).collect();
    out.push_str(&format!("\nAlignment statistics ({} files):\n", stats.len()));
    for artifact in stats {
        out.push_str(&format!(
            "  {}: {}\n",
            artifact.sample.as_deref().unwrap_or("-"),
            artifact.path.display()
        ));
    }

    out.push_str("\nStages:\n");
    for (id, state) in input.stages {
        out.push_str(&format!("  {:<18} {}\n", id.name(), state));
    }

    out.push_str(&format!(
        "\nTasks: {} succeeded, {} ignored, {} failed\n",
        input.tally.succeeded, input.tally.ignored, input.tally.failed
    ));
    out
}

pub fn render_trace(trace: &[TraceEntry]) -> String {
    let mut out = String::from("stage\ttag\tstatus\tduration_s\n");
    for entry in trace {
        out.push_str(&format!(
            "{}\t{}\t{}\t{:.3}\n",
            entry.stage,
            entry.tag,
            entry.status,
            entry.duration.as_secs_f64()
        ));
    }
    out
}

/// Writes `run_report.txt` and `execution_trace.txt` under `pipeline_info/`.
pub fn write_report(input: &ReportInput, trace: &[TraceEntry]) -> Result<PathBuf, PipelineError> {
    let info_dir = input.plan.out_dir.join(PIPELINE_INFO_DIR);
    let report = info_dir.join(RUN_REPORT);
    write_atomic(&report, &render_report(input))?;
    write_atomic(&info_dir.join(EXECUTION_TRACE), &render_trace(trace))?;
    info!("Run report written to {}", display_relative(&report, &input.plan.out_dir));
    Ok(report)
}

fn display_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}
