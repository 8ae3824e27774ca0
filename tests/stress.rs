use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

use nanoseq_pipelines::cli::Arguments;
use nanoseq_pipelines::config::plan::{ExecutionPlan, ResourceCeiling, ResourceTier, StageId};
use nanoseq_pipelines::engine::scheduler::Dag;
use nanoseq_pipelines::engine::stage::{Executor, Invocation, ToolCommand, ToolOutput, ToolRunner};
use nanoseq_pipelines::utils::streams::{channel, Channel};

/// Feeds `items` into a channel with random pauses so the consumer sees
/// a different interleaving on every seed.
fn jittered<T: Send + 'static>(items: Vec<T>, seed: u64) -> Channel<T> {
    let (tx, out) = channel(4);
    tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(seed);
        for item in items {
            if rng.random_range(0..4) == 0 {
                sleep(Duration::from_micros(rng.random_range(0..200))).await;
            } else {
                tokio::task::yield_now().await;
            }
            if !tx.emit(item).await {
                break;
            }
        }
    });
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_by_under_random_interleavings() -> Result<()> {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut left: Vec<u32> = (0..2_000).collect();
        let mut right: Vec<u32> = (0..2_000).filter(|k| k % 10 != 0).collect();
        left.shuffle(&mut rng);
        right.shuffle(&mut rng);
        let expected = right.len();

        let joined = jittered(left, seed)
            .join_by(jittered(right, seed + 100), "stress", |l| *l, |r| *r)
            .collect();
        let mut pairs = timeout(Duration::from_secs(20), joined).await?;
        assert_eq!(pairs.len(), expected, "seed {}", seed);
        pairs.sort();
        assert!(pairs.iter().all(|(k, l, r)| k == l && l == r));
        pairs.dedup();
        assert_eq!(pairs.len(), expected);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cross_by_emits_each_pair_once() -> Result<()> {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let genomes: Vec<(u8, u32)> = (0..5u8).map(|g| (g, g as u32 * 100)).collect();
        let mut samples: Vec<(u32, u8)> = (0..500).map(|s| (s, rng.random_range(0..7u8))).collect();
        samples.shuffle(&mut rng);
        let expected = samples.iter().filter(|(_, g)| *g < 5).count();

        let pairs = jittered(genomes, seed)
            .cross_by(jittered(samples, seed + 1), |g| g.0, |s| s.1)
            .collect();
        let mut pairs = timeout(Duration::from_secs(20), pairs).await?;
        assert_eq!(pairs.len(), expected, "seed {}", seed);
        pairs.sort();
        pairs.dedup();
        assert_eq!(pairs.len(), expected);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fork_and_mix_with_slow_consumer() -> Result<()> {
    let count = 10_000u64;
    let [fast, slow, filtered] = jittered((0..count).collect::<Vec<u64>>(), 7).fork();
    let slow = slow.map(move |n| n + count);
    let filtered = filtered.filter(|n| n % 2 == 0).map(move |n| n + 2 * count);

    let start = Instant::now();
    let mixed = Channel::mix(vec![fast, slow, filtered]);
    let consumer = tokio::spawn(async move {
        let mut mixed = mixed;
        let mut seen = Vec::new();
        while let Some(n) = mixed.recv().await {
            if n % 1_000 == 0 {
                sleep(Duration::from_millis(1)).await;
            }
            seen.push(n);
        }
        seen
    });
    let mut seen = timeout(Duration::from_secs(30), consumer).await??;
    eprintln!("fork/mix of {} items took {:?}", count, start.elapsed());
    seen.sort();
    assert_eq!(seen.len() as u64, 2 * count + count / 2);
    seen.dedup();
    assert_eq!(seen.len() as u64, 2 * count + count / 2);
    Ok(())
}

/// Tracks how many commands are running at once.
#[derive(Default)]
struct CountingRunner {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ToolRunner for CountingRunner {
    fn run<'a>(&'a self, _command: &'a ToolCommand, _work_dir: &'a Path) -> BoxFuture<'a, Result<ToolOutput>> {
        Box::pin(async move {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(2)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ToolOutput { code: Some(0), stderr: String::new() })
        })
    }

    fn version<'a>(&'a self, _tool: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async { Ok("2.24".to_string()) })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tier_limit_holds_under_load() -> Result<()> {
    let dir = TempDir::new()?;
    let sheet = dir.path().join("samplesheet.csv");
    fs::write(&sheet, "sample\n")?;
    let args = Arguments {
        input: Some(sheet.to_string_lossy().into_owned()),
        protocol: "DNA".to_string(),
        aligner: "minimap2".to_string(),
        out_dir: dir.path().join("results").to_string_lossy().into_owned(),
        skip_basecalling: true,
        ..Default::default()
    };
    let ceiling = ResourceCeiling { max_cpus: 16, max_memory_gb: 64 };
    let plan = Arc::new(ExecutionPlan::resolve(&args, dir.path(), ceiling)?);
    let limit = plan.ceiling.concurrency_for(ResourceTier::High);

    let runner = Arc::new(CountingRunner::default());
    let executor = Arc::new(Executor::new(runner.clone(), &plan));
    let mut dag = Dag::new(plan, executor);
    let work = dir.path().to_path_buf();
    let tasks = 200usize;
    let out = dag.node(
        StageId::Align,
        jittered((0..tasks).collect::<Vec<usize>>(), 3),
        move |n: &usize| {
            Ok(Invocation::new(StageId::Align, &n.to_string(), work.clone())
                .command(ToolCommand::new("minimap2", vec![n.to_string()])))
        },
        |n, _| Ok(n),
    );
    let collected = tokio::spawn(out.collect());
    let (summary, result) = timeout(Duration::from_secs(60), dag.finish()).await?;
    result?;

    let mut done = collected.await?;
    done.sort();
    assert_eq!(done, (0..tasks).collect::<Vec<_>>());
    assert_eq!(summary.tally.succeeded, tasks);
    let peak = runner.peak.load(Ordering::SeqCst);
    assert!(peak <= limit, "peak {} above tier limit {}", peak, limit);
    assert!(peak >= 1);
    Ok(())
}
