// src/engine/stage.rs: the contract between graph nodes and external tools

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use log::{debug, warn};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::config::defs::PipelineError;
use crate::config::plan::{ExecutionPlan, FailurePolicy, ResourceTier, StageId};
use crate::utils::command::check_version;

const STDERR_TAIL_LINES: usize = 5;

/// One external process call. `stdout` redirects the tool's standard output into a file.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdout: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        ToolCommand {
            program: program.to_string(),
            args,
            stdout: None,
        }
    }

    pub fn stdout_to(mut self, path: PathBuf) -> Self {
        self.stdout = Some(path);
        self
    }
}

/// Everything needed to run one task of a stage: the commands, in order, plus the
/// files it reads and the files it promises to leave behind.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stage: StageId,
    pub tag: String,
    pub work_dir: PathBuf,
    pub commands: Vec<ToolCommand>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

impl Invocation {
    pub fn new(stage: StageId, tag: &str, work_dir: PathBuf) -> Self {
        Invocation {
            stage,
            tag: tag.to_string(),
            work_dir,
            commands: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn command(mut self, command: ToolCommand) -> Self {
        self.commands.push(command);
        self
    }

    pub fn input(mut self, path: &Path) -> Self {
        self.inputs.push(path.to_path_buf());
        self
    }

    pub fn output(mut self, path: PathBuf) -> Self {
        self.outputs.push(path);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Seam between the scheduler and the operating system.
pub trait ToolRunner: Send + Sync {
    fn run<'a>(&'a self, command: &'a ToolCommand, work_dir: &'a Path) -> BoxFuture<'a, Result<ToolOutput>>;

    fn version<'a>(&'a self, tool: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Runs commands as child processes.
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run<'a>(&'a self, command: &'a ToolCommand, work_dir: &'a Path) -> BoxFuture<'a, Result<ToolOutput>> {
        Box::pin(async move {
            let stdout = match &command.stdout {
                Some(path) => Stdio::from(
                    File::create(path).map_err(|e| anyhow!("Failed to create {}: {}", path.display(), e))?,
                ),
                None => Stdio::null(),
            };
            let child = Command::new(&command.program)
                .args(&command.args)
                .current_dir(work_dir)
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| anyhow!("Failed to spawn {}: {}. Is it installed?", command.program, e))?;
            let output = child.wait_with_output().await?;
            Ok(ToolOutput {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn version<'a>(&'a self, tool: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(check_version(tool))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskOutcome {
    Succeeded,
    /// Failed, but the run is configured to carry on.
    Ignored,
    /// Never started because the run was already aborting.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TallySnapshot {
    pub succeeded: usize,
    pub ignored: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct TaskTally {
    succeeded: AtomicUsize,
    ignored: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub stage: StageId,
    pub tag: String,
    pub status: &'static str,
    pub duration: Duration,
}

/// Runs invocations under per-tier concurrency limits and applies the failure policy.
pub struct Executor {
    runner: Arc<dyn ToolRunner>,
    tiers: HashMap<ResourceTier, Arc<Semaphore>>,
    policy: FailurePolicy,
    tally: TaskTally,
    trace: Mutex<Vec<TraceEntry>>,
    aborted: AtomicBool,
}

impl Executor {
    pub fn new(runner: Arc<dyn ToolRunner>, plan: &ExecutionPlan) -> Self {
        let tiers = ResourceTier::ALL
            .iter()
            .map(|&tier| (tier, Arc::new(Semaphore::new(plan.ceiling.concurrency_for(tier)))))
            .collect();
        Executor {
            runner,
            tiers,
            policy: plan.failure_policy,
            tally: TaskTally::default(),
            trace: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn runner(&self) -> &Arc<dyn ToolRunner> {
        &self.runner
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Marks the run as aborting; tasks not yet started are cancelled.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Runs one invocation to completion.
    ///
    /// # Arguments
    ///
    /// * `tier` - Resource tier whose semaphore bounds this task.
    /// * `invocation` - Commands plus declared inputs/outputs.
    ///
    /// # Returns
    /// TaskOutcome, or the fatal PipelineError. Missing inputs are always fatal; tool
    /// failures are fatal unless the policy is `Ignore`.
    pub async fn execute(&self, tier: ResourceTier, invocation: &Invocation) -> Result<TaskOutcome, PipelineError> {
        if self.is_aborted() {
            return Ok(TaskOutcome::Cancelled);
        }
        if let Some(missing) = invocation.inputs.iter().find(|p| !p.exists()) {
            self.abort();
            self.tally.failed.fetch_add(1, Ordering::SeqCst);
            return Err(PipelineError::MissingInput {
                stage: invocation.stage.to_string(),
                path: missing.clone(),
            });
        }

        let semaphore = self.tiers[&tier].clone();
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Other(anyhow!("Semaphore closed: {}", e)))?;
        if self.is_aborted() {
            return Ok(TaskOutcome::Cancelled);
        }

        let start = Instant::now();
        debug!("{} [{}] starting", invocation.stage, invocation.tag);
        let failure = self.run_commands(invocation).await;
        let duration = start.elapsed();

        match failure {
            None => {
                self.tally.succeeded.fetch_add(1, Ordering::SeqCst);
                self.record(invocation, "COMPLETED", duration);
                debug!("{} [{}] completed in {:.1}s", invocation.stage, invocation.tag, duration.as_secs_f64());
                Ok(TaskOutcome::Succeeded)
            }
            Some(err) => match self.policy {
                FailurePolicy::Ignore => {
                    self.tally.ignored.fetch_add(1, Ordering::SeqCst);
                    self.record(invocation, "IGNORED", duration);
                    warn!("Ignoring failed task: {}", err);
                    Ok(TaskOutcome::Ignored)
                }
                FailurePolicy::Terminate => {
                    self.tally.failed.fetch_add(1, Ordering::SeqCst);
                    self.record(invocation, "FAILED", duration);
                    self.abort();
                    Err(err)
                }
            },
        }
    }

    async fn run_commands(&self, invocation: &Invocation) -> Option<PipelineError> {
        let dirs = std::iter::once(invocation.work_dir.as_path())
            .chain(invocation.outputs.iter().filter_map(|p| p.parent()));
        for dir in dirs {
            if let Err(e) = fs::create_dir_all(dir) {
                return Some(PipelineError::IOError(format!("Failed to create {}: {}", dir.display(), e)));
            }
        }
        for command in &invocation.commands {
            match self.runner.run(command, &invocation.work_dir).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    return Some(PipelineError::StageExecution {
                        stage: invocation.stage.to_string(),
                        tag: invocation.tag.clone(),
                        code: output.code.unwrap_or(-1),
                        stderr_tail: stderr_tail(&output.stderr),
                    });
                }
                Err(e) => {
                    return Some(PipelineError::ToolExecution {
                        tool: command.program.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        // A zero exit without the promised files is still a failed task.
        invocation.outputs.iter().find(|p| !p.exists()).map(|missing| PipelineError::StageExecution {
            stage: invocation.stage.to_string(),
            tag: invocation.tag.clone(),
            code: 1,
            stderr_tail: format!("declared output not produced: {}", missing.display()),
        })
    }

    fn record(&self, invocation: &Invocation, status: &'static str, duration: Duration) {
        if let Ok(mut trace) = self.trace.lock() {
            trace.push(TraceEntry {
                stage: invocation.stage,
                tag: invocation.tag.clone(),
                status,
                duration,
            });
        }
    }

    pub fn tally(&self) -> TallySnapshot {
        TallySnapshot {
            succeeded: self.tally.succeeded.load(Ordering::SeqCst),
            ignored: self.tally.ignored.load(Ordering::SeqCst),
            failed: self.tally.failed.load(Ordering::SeqCst),
        }
    }

    pub fn trace(&self) -> Vec<TraceEntry> {
        self.trace.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let tail = lines[start..].join(" | ");
    if tail.is_empty() { "no stderr output".to_string() } else { tail }
}
