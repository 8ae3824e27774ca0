// src/engine/scheduler.rs
//! Declarative graph builder. Every stage is registered up front; stages the plan
//! switches off stay `Inactive` and hand an empty channel downstream, so the graph
//! shape never depends on branching in the pipeline code.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::task::JoinSet;

use crate::config::defs::{PipelineError, DEFAULT_CHANNEL_CAPACITY};
use crate::config::plan::{ExecutionPlan, StageId, StageParams};
use crate::engine::stage::{Executor, Invocation, TallySnapshot, TaskOutcome, TraceEntry};
use crate::utils::streams::{channel, Channel, Emitter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Inactive,
    Waiting,
    Running,
    Done,
    Failed,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageState::Inactive => "inactive",
            StageState::Waiting => "waiting",
            StageState::Running => "running",
            StageState::Done => "done",
            StageState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Shared view of every stage's state.
#[derive(Debug, Clone, Default)]
pub struct StageBoard {
    states: Arc<Mutex<BTreeMap<StageId, StageState>>>,
}

impl StageBoard {
    fn register(&self, id: StageId, state: StageState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(id, state);
        }
    }

    /// Moves `id` to `next` if the state machine allows it. Inactive, Done and Failed are terminal;
    /// Done may still be demoted to Failed by a late tolerated failure.
    pub fn transition(&self, id: StageId, next: StageState) {
        let Ok(mut states) = self.states.lock() else { return };
        let current = states.get(&id).copied().unwrap_or(StageState::Inactive);
        let allowed = matches!(
            (current, next),
            (StageState::Waiting, StageState::Running)
                | (StageState::Waiting, StageState::Done)
                | (StageState::Waiting, StageState::Failed)
                | (StageState::Running, StageState::Done)
                | (StageState::Running, StageState::Failed)
                | (StageState::Done, StageState::Failed)
        );
        if allowed {
            debug!("{}: {} -> {}", id, current, next);
            states.insert(id, next);
        }
    }

    pub fn state(&self, id: StageId) -> StageState {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(&id).copied())
            .unwrap_or(StageState::Inactive)
    }

    pub fn snapshot(&self) -> Vec<(StageId, StageState)> {
        self.states
            .lock()
            .map(|s| s.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default()
    }
}

/// One tool version reported by a stage on its first successful task.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolVersion {
    pub tool: String,
    pub version: String,
}

/// What the run looked like once every node finished.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stages: Vec<(StageId, StageState)>,
    pub tally: TallySnapshot,
    pub trace: Vec<TraceEntry>,
}

pub struct Dag {
    plan: Arc<ExecutionPlan>,
    executor: Arc<Executor>,
    board: StageBoard,
    versions: Option<Emitter<ToolVersion>>,
    version_rx: Option<Channel<ToolVersion>>,
    nodes: JoinSet<(StageId, Result<(), PipelineError>)>,
}

impl Dag {
    pub fn new(plan: Arc<ExecutionPlan>, executor: Arc<Executor>) -> Self {
        let board = StageBoard::default();
        for id in StageId::ALL {
            let state = if plan.is_active(id) { StageState::Waiting } else { StageState::Inactive };
            board.register(id, state);
        }
        let active: Vec<&str> = plan.active_stages().map(|id| id.name()).collect();
        info!("Active stages: {}", active.join(", "));
        let (versions, version_rx) = channel(DEFAULT_CHANNEL_CAPACITY);
        Dag {
            plan,
            executor,
            board,
            versions: Some(versions),
            version_rx: Some(version_rx),
            nodes: JoinSet::new(),
        }
    }

    pub fn plan(&self) -> &Arc<ExecutionPlan> {
        &self.plan
    }

    pub fn board(&self) -> &StageBoard {
        &self.board
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Per-tuple node: every input tuple becomes one task as soon as it arrives,
    /// bounded by the stage's tier. Successful tasks emit `finish(tuple, invocation)`;
    /// failed or cancelled tasks emit nothing, so partial outputs never travel downstream.
    pub fn node<I, O, B, F>(&mut self, id: StageId, input: Channel<I>, build: B, finish: F) -> Channel<O>
    where
        I: Send + 'static,
        O: Send + 'static,
        B: Fn(&I) -> Result<Invocation, PipelineError> + Send + Sync + 'static,
        F: Fn(I, &Invocation) -> Result<O, PipelineError> + Send + Sync + 'static,
    {
        let params = self.plan.params(id);
        if !params.active {
            return Channel::empty();
        }
        let (tx, out) = channel(DEFAULT_CHANNEL_CAPACITY);
        let executor = self.executor.clone();
        let board = self.board.clone();
        let reporter = VersionReporter::new(self.plan.tool_for(id), self.versions.clone(), executor.clone());
        let build = Arc::new(build);
        let finish = Arc::new(finish);

        self.nodes.spawn(async move {
            let mut input = input;
            let mut tasks: JoinSet<Result<(), PipelineError>> = JoinSet::new();
            let mut first_error = None;
            while let Some(tuple) = input.recv().await {
                if executor.is_aborted() {
                    break;
                }
                let (executor, board, build, finish, tx, reporter) =
                    (executor.clone(), board.clone(), build.clone(), finish.clone(), tx.clone(), reporter.clone());
                tasks.spawn(async move {
                    run_task(id, params, tuple, &executor, &board, &*build, &*finish, &tx, &reporter).await
                });
            }
            drop(tx);
            while let Some(joined) = tasks.join_next().await {
                let result = joined.unwrap_or_else(|e| Err(PipelineError::Other(anyhow::anyhow!("{} task panicked: {}", id, e))));
                if let Err(e) = result {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            (id, settle(id, &board, first_error))
        });
        out
    }

    /// Aggregating node: waits for `input` to close, then runs at most one task over the
    /// whole collection. `build` may decline to run by returning `None`.
    pub fn gather<I, O, B, F>(&mut self, id: StageId, input: Channel<I>, build: B, finish: F) -> Channel<O>
    where
        I: Send + 'static,
        O: Send + 'static,
        B: FnOnce(&[I]) -> Result<Option<Invocation>, PipelineError> + Send + 'static,
        F: FnOnce(Vec<I>, &Invocation) -> Result<O, PipelineError> + Send + 'static,
    {
        let params = self.plan.params(id);
        if !params.active {
            return Channel::empty();
        }
        let (tx, out) = channel(1);
        let executor = self.executor.clone();
        let board = self.board.clone();

        self.nodes.spawn(async move {
            let items = input.collect().await;
            let result = run_gathered(id, params, items, &executor, &board, build, finish, &tx).await;
            drop(tx);
            (id, settle(id, &board, result.err()))
        });
        out
    }

    /// In-process stage: runs `work` once without a tool or tier permit. Used for
    /// bookkeeping stages that still belong on the board.
    pub fn internal<O, Fut>(&mut self, id: StageId, work: Fut) -> Channel<O>
    where
        O: Send + 'static,
        Fut: Future<Output = Result<O, PipelineError>> + Send + 'static,
    {
        if !self.plan.is_active(id) {
            return Channel::empty();
        }
        let (tx, out) = channel(1);
        let board = self.board.clone();
        self.nodes.spawn(async move {
            board.transition(id, StageState::Running);
            let error = match work.await {
                Ok(value) => {
                    tx.emit(value).await;
                    None
                }
                Err(e) => Some(e),
            };
            drop(tx);
            (id, settle(id, &board, error))
        });
        out
    }

    /// Hands out the version side-channel. Call after the last `node` is wired: it closes
    /// once every per-tuple node has finished, and nodes added later report nothing.
    pub fn take_versions(&mut self) -> Channel<ToolVersion> {
        self.versions = None;
        self.version_rx.take().unwrap_or_else(Channel::empty)
    }

    /// Waits for every node and reports the first fatal error, if any.
    pub async fn finish(mut self) -> (RunSummary, Result<(), PipelineError>) {
        self.versions = None;
        let mut first_error = None;
        while let Some(joined) = self.nodes.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    error!("{} failed: {}", id, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(PipelineError::Other(anyhow::anyhow!("Stage task panicked: {}", e)));
                    }
                }
            }
        }
        let summary = RunSummary {
            stages: self.board.snapshot(),
            tally: self.executor.tally(),
            trace: self.executor.trace(),
        };
        (summary, first_error.map_or(Ok(()), Err))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task<I, O, B, F>(
    id: StageId,
    params: StageParams,
    tuple: I,
    executor: &Executor,
    board: &StageBoard,
    build: &B,
    finish: &F,
    tx: &Emitter<O>,
    reporter: &VersionReporter,
) -> Result<(), PipelineError>
where
    O: Send,
    B: Fn(&I) -> Result<Invocation, PipelineError>,
    F: Fn(I, &Invocation) -> Result<O, PipelineError>,
{
    let invocation = build(&tuple)?;
    board.transition(id, StageState::Running);
    match executor.execute(params.tier, &invocation).await? {
        TaskOutcome::Succeeded => {
            reporter.report().await;
            tx.emit(finish(tuple, &invocation)?).await;
        }
        TaskOutcome::Ignored => board.transition(id, StageState::Failed),
        TaskOutcome::Cancelled => {}
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_gathered<I, O, B, F>(
    id: StageId,
    params: StageParams,
    items: Vec<I>,
    executor: &Executor,
    board: &StageBoard,
    build: B,
    finish: F,
    tx: &Emitter<O>,
) -> Result<(), PipelineError>
where
    O: Send,
    B: FnOnce(&[I]) -> Result<Option<Invocation>, PipelineError>,
    F: FnOnce(Vec<I>, &Invocation) -> Result<O, PipelineError>,
{
    let Some(invocation) = build(&items)? else {
        debug!("{}: nothing to aggregate", id);
        return Ok(());
    };
    board.transition(id, StageState::Running);
    match executor.execute(params.tier, &invocation).await? {
        TaskOutcome::Succeeded => {
            tx.emit(finish(items, &invocation)?).await;
        }
        TaskOutcome::Ignored => board.transition(id, StageState::Failed),
        TaskOutcome::Cancelled => {}
    }
    Ok(())
}

fn settle(id: StageId, board: &StageBoard, error: Option<PipelineError>) -> Result<(), PipelineError> {
    match error {
        Some(e) => {
            board.transition(id, StageState::Failed);
            Err(e)
        }
        None => {
            board.transition(id, StageState::Done);
            if board.state(id) == StageState::Failed {
                warn!("{}: finished with tolerated failures", id);
            }
            Ok(())
        }
    }
}

/// Sends a stage's tool version once, on its first successful task.
#[derive(Clone)]
struct VersionReporter {
    tool: Option<&'static str>,
    sink: Option<Emitter<ToolVersion>>,
    executor: Arc<Executor>,
    sent: Arc<tokio::sync::Mutex<bool>>,
}

impl VersionReporter {
    fn new(tool: Option<&'static str>, sink: Option<Emitter<ToolVersion>>, executor: Arc<Executor>) -> Self {
        VersionReporter {
            tool,
            sink,
            executor,
            sent: Arc::new(tokio::sync::Mutex::new(false)),
        }
    }

    async fn report(&self) {
        let (Some(tool), Some(sink)) = (self.tool, &self.sink) else { return };
        let mut sent = self.sent.lock().await;
        if *sent {
            return;
        }
        *sent = true;
        let version = match self.executor.runner().version(tool).await {
            Ok(version) => version,
            Err(e) => {
                warn!("Could not determine {} version: {}", tool, e);
                String::new()
            }
        };
        sink.emit(ToolVersion { tool: tool.to_string(), version }).await;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Arguments;
    use crate::config::plan::ResourceCeiling;
    use crate::engine::stage::{ToolCommand, ToolOutput, ToolRunner};
    use anyhow::Result;
    use futures::future::BoxFuture;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct OkRunner;

    impl ToolRunner for OkRunner {
        fn run<'a>(&'a self, command: &'a ToolCommand, _work_dir: &'a Path) -> BoxFuture<'a, Result<ToolOutput>> {
            Box::pin(async move {
                let code = if command.args.iter().any(|a| a == "fail") { 3 } else { 0 };
                Ok(ToolOutput { code: Some(code), stderr: String::new() })
            })
        }

        fn version<'a>(&'a self, _tool: &'a str) -> BoxFuture<'a, Result<String>> {
            Box::pin(async { Ok("2.24".to_string()) })
        }
    }

    fn plan(dir: &TempDir, extra: impl FnOnce(&mut Arguments)) -> Arc<ExecutionPlan> {
        let sheet = dir.path().join("samplesheet.csv");
        fs::write(&sheet, "sample,fastq,barcode,genome\n").unwrap();
        let mut args = Arguments {
            input: Some(sheet.to_string_lossy().into_owned()),
            protocol: "DNA".to_string(),
            aligner: "minimap2".to_string(),
            out_dir: "results".to_string(),
            skip_basecalling: true,
            ..Default::default()
        };
        extra(&mut args);
        let ceiling = ResourceCeiling { max_cpus: 8, max_memory_gb: 64 };
        Arc::new(ExecutionPlan::resolve(&args, dir.path(), ceiling).unwrap())
    }

    fn dag(plan: Arc<ExecutionPlan>) -> Dag {
        let executor = Arc::new(Executor::new(Arc::new(OkRunner), &plan));
        Dag::new(plan, executor)
    }

    fn align(dir: &Path, sample: &str, flag: &str) -> Invocation {
        Invocation::new(StageId::Align, sample, dir.to_path_buf())
            .command(ToolCommand::new("minimap2", vec![flag.to_string()]))
    }

    #[tokio::test]
    async fn test_inactive_node_yields_empty_channel() {
        let dir = TempDir::new().unwrap();
        let mut dag = dag(plan(&dir, |a| a.skip_alignment = true));
        let work = dir.path().to_path_buf();
        let out = dag.node(
            StageId::Align,
            Channel::of(vec!["s1", "s2"]),
            move |s: &&str| Ok(align(&work, s, "ok")),
            |s, _| Ok(s.to_string()),
        );
        assert!(out.collect().await.is_empty());
        let (summary, result) = dag.finish().await;
        assert!(result.is_ok());
        assert_eq!(summary.tally.succeeded, 0);
        assert!(summary.stages.contains(&(StageId::Align, StageState::Inactive)));
    }

    #[tokio::test]
    async fn test_node_runs_each_tuple_and_reports_version_once() {
        let dir = TempDir::new().unwrap();
        let mut dag = dag(plan(&dir, |_| {}));
        let work = dir.path().to_path_buf();
        let out = dag.node(
            StageId::Align,
            Channel::of(vec!["s1", "s2", "s3"]),
            move |s: &&str| Ok(align(&work, s, "ok")),
            |s, inv| Ok(format!("{}:{}", s, inv.tag)),
        );
        let versions = dag.take_versions();
        let collected = tokio::spawn(out.collect());
        let versions = tokio::spawn(versions.collect());
        let (summary, result) = dag.finish().await;
        assert!(result.is_ok());
        let mut outputs = collected.await.unwrap();
        outputs.sort();
        assert_eq!(outputs, vec!["s1:s1", "s2:s2", "s3:s3"]);
        assert_eq!(
            versions.await.unwrap(),
            vec![ToolVersion { tool: "minimap2".to_string(), version: "2.24".to_string() }]
        );
        assert_eq!(summary.tally.succeeded, 3);
        assert!(summary.stages.contains(&(StageId::Align, StageState::Done)));
    }

    #[tokio::test]
    async fn test_failed_task_fails_node_and_run() {
        let dir = TempDir::new().unwrap();
        let mut dag = dag(plan(&dir, |_| {}));
        let work = dir.path().to_path_buf();
        let out = dag.node(
            StageId::Align,
            Channel::of(vec!["s1"]),
            move |s: &&str| Ok(align(&work, s, "fail")),
            |s, _| Ok(s.to_string()),
        );
        let collected = tokio::spawn(out.collect());
        let (summary, result) = dag.finish().await;
        assert_eq!(result.unwrap_err().exit_code(), 3);
        assert!(collected.await.unwrap().is_empty());
        assert_eq!(summary.tally.failed, 1);
        assert!(summary.stages.contains(&(StageId::Align, StageState::Failed)));
    }

    #[tokio::test]
    async fn test_gather_runs_once_over_everything() {
        let dir = TempDir::new().unwrap();
        let mut dag = dag(plan(&dir, |_| {}));
        let work = dir.path().to_path_buf();
        let out = dag.gather(
            StageId::MultiQc,
            Channel::of(vec![1, 2, 3]),
            move |items: &[i32]| {
                Ok(Some(Invocation::new(StageId::MultiQc, &items.len().to_string(), work)
                    .command(ToolCommand::new("multiqc", vec![]))))
            },
            |items, _| Ok(items.iter().sum::<i32>()),
        );
        let collected = tokio::spawn(out.collect());
        let (summary, result) = dag.finish().await;
        assert!(result.is_ok());
        assert_eq!(collected.await.unwrap(), vec![6]);
        assert_eq!(summary.tally.succeeded, 1);
    }

    #[tokio::test]
    async fn test_internal_stage_lands_on_board() {
        let dir = TempDir::new().unwrap();
        let mut dag = dag(plan(&dir, |_| {}));
        let out = dag.internal(StageId::Versions, async { Ok(7usize) });
        let failed = dag.internal(StageId::Report, async {
            Err::<(), _>(PipelineError::IOError("disk full".to_string()))
        });
        let collected = tokio::spawn(out.collect());
        drop(failed);
        let (summary, result) = dag.finish().await;
        assert_eq!(collected.await.unwrap(), vec![7]);
        assert!(result.unwrap_err().to_string().contains("disk full"));
        assert!(summary.stages.contains(&(StageId::Versions, StageState::Done)));
        assert!(summary.stages.contains(&(StageId::Report, StageState::Failed)));
    }

    #[test]
    fn test_board_rejects_leaving_terminal_states() {
        let board = StageBoard::default();
        board.register(StageId::Align, StageState::Inactive);
        board.transition(StageId::Align, StageState::Running);
        assert_eq!(board.state(StageId::Align), StageState::Inactive);
        board.register(StageId::Index, StageState::Waiting);
        board.transition(StageId::Index, StageState::Running);
        board.transition(StageId::Index, StageState::Done);
        board.transition(StageId::Index, StageState::Running);
        assert_eq!(board.state(StageId::Index), StageState::Done);
    }
}
