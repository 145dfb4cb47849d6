//! Run the daily stages for one issue in-process, in order, and stop at the
//! first job that does not succeed.
//!
//! Usage: `run_issue [--date YYYY-MM-DD] [--restart] [stage ...]`
//! Without stages, runs ingest through deliver.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::NaiveDate;

use issue_pipeline::config::PipelineConfig;
use issue_pipeline::jobs::{JobParams, JobStatus, Stage};
use issue_pipeline::telemetry::init_tracing;
use issue_pipeline::Pipeline;

const DAILY: [Stage; 7] = [
    Stage::Ingest,
    Stage::Classify,
    Stage::Select,
    Stage::Enrich,
    Stage::Images,
    Stage::Compile,
    Stage::Deliver,
];

struct Args {
    date: Option<NaiveDate>,
    restart: bool,
    stages: Vec<Stage>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        date: None,
        restart: false,
        stages: Vec::new(),
    };
    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        match a.as_str() {
            "--date" => {
                let v = it.next().context("--date needs a value")?;
                args.date = Some(NaiveDate::parse_from_str(&v, "%Y-%m-%d").with_context(|| format!("bad date '{v}'"))?);
            }
            "--restart" => args.restart = true,
            other => args.stages.push(Stage::from_str(other)?),
        }
    }
    if args.stages.is_empty() {
        args.stages = DAILY.to_vec();
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let cfg = PipelineConfig::from_env().context("loading configuration")?;
    init_tracing();

    let pipeline = Arc::new(Pipeline::from_config(&cfg)?);
    let executor = Arc::new(pipeline.executor(cfg.executor.clone()));
    executor.spawn_workers();

    for stage in args.stages.iter().copied() {
        let params = JobParams {
            date: args.date,
            // Selection is where a failed issue is reopened.
            restart: args.restart && stage == Stage::Select,
            ..JobParams::default()
        };
        let job = executor.enqueue(stage, params).await?;
        let done = executor
            .wait_for(&job.job_id, job.timeout() + std::time::Duration::from_secs(5))
            .await
            .context("job vanished")?;
        println!("{:<9} {:<10} {:?}", stage.as_str(), done.status.as_str(), done.summary);
        if done.status != JobStatus::Succeeded {
            executor.shutdown();
            bail!("{stage} ended {}: {}", done.status.as_str(), done.errors.join("; "));
        }
    }
    executor.shutdown();
    Ok(())
}
