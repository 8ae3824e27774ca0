use std::env;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{self, debug, error, info, warn, LevelFilter};

use nanoseq_pipelines::cli::parse;
use nanoseq_pipelines::config::defs::RunConfig;
use nanoseq_pipelines::config::plan::{ExecutionPlan, NotificationPlan};
use nanoseq_pipelines::engine::stage::ProcessRunner;
use nanoseq_pipelines::pipelines::nanoseq;
use nanoseq_pipelines::utils::completion::{complete, Completion};
use nanoseq_pipelines::utils::file::resolve_path;
use nanoseq_pipelines::utils::system::detect_ceiling;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n NanoSeq\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let ceiling = detect_ceiling(&args).await?;
    debug!("Resource ceiling: {} CPUs, {} GiB", ceiling.max_cpus, ceiling.max_memory_gb);

    let plan = match ExecutionPlan::resolve(&args, &dir, ceiling) {
        Ok(plan) => Arc::new(plan),
        Err(e) => {
            error!("{}", e);
            let out_dir = resolve_path(&args.out_dir, &dir);
            let notification = NotificationPlan::from_args(&args);
            let completion = Completion {
                run_name: &args.run_name,
                out_dir: &out_dir,
                input: args.input.as_deref().map(Path::new),
                notification: &notification,
                summary: None,
                error: Some(&e),
                duration: run_start.elapsed(),
            };
            if let Err(report_err) = complete(&completion).await {
                warn!("Could not write the completion summary: {}", report_err);
            }
            std::process::exit(e.exit_code());
        }
    };

    fs::create_dir_all(&plan.out_dir)?;
    let run_config = Arc::new(RunConfig {
        cwd: dir,
        out_dir: plan.out_dir.clone(),
        args,
        plan: plan.clone(),
    });

    let (summary, result) = nanoseq::run(run_config, Arc::new(ProcessRunner)).await;

    let completion = Completion::for_plan(&plan, summary.as_ref(), result.as_ref().err(), run_start.elapsed());
    if let Err(e) = complete(&completion).await {
        warn!("Could not write the completion summary: {}", e);
    }

    if let Err(e) = result {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(e.exit_code());
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}
