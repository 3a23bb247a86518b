#![allow(clippy::doc_markdown)]
//! `fanquery` - runs simulated query batches described by JSON plans.

mod logging;
mod output;
mod plan;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use fanquery_core::{FanqueryConfig, QueryBatch, QueryResult};
use tracing::info;

use crate::output::OutputFormat;
use crate::plan::Plan;

/// fanquery - batched query subscriptions over a shared cache
#[derive(Parser, Debug)]
#[command(name = "fanquery")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./fanquery.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a plan and print the settled results
    Run {
        /// Plan file (JSON)
        plan: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        /// Print one line per batch notification to stderr
        #[arg(long)]
        watch: bool,

        /// Print Prometheus metrics after the results
        #[arg(long)]
        metrics: bool,

        /// Exit with an error if any query ends in error
        #[arg(long)]
        fail_on_error: bool,
    },

    /// Validate a plan without fetching anything
    Check {
        /// Plan file (JSON)
        plan: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn load_config(path: Option<&Path>) -> Result<FanqueryConfig> {
    let config = match path {
        Some(path) => FanqueryConfig::from_file(path)?,
        None => FanqueryConfig::load()?,
    };
    Ok(config)
}

async fn wait_settled(batch: &QueryBatch, timeout: Duration) -> Result<Vec<QueryResult>> {
    let mut updates = batch.updates();
    let settled = tokio::time::timeout(timeout, async {
        loop {
            let results = batch.results();
            if results.iter().all(|r| !r.is_fetching) {
                return Ok::<_, anyhow::Error>(results);
            }
            updates.changed().await.context("Batch closed")?;
        }
    })
    .await
    .map_err(|_| anyhow!("Plan did not settle within {} ms", timeout.as_millis()))??;
    Ok(settled)
}

async fn cmd_run(
    config: &FanqueryConfig,
    plan_path: &Path,
    format: OutputFormat,
    watch: bool,
    metrics: bool,
    fail_on_error: bool,
) -> Result<()> {
    let plan = Plan::from_file(plan_path)?;
    let batch = QueryBatch::from_config(config);

    let notifications = AtomicU64::new(0);
    let subscription = batch.subscribe(move |results| {
        let version = notifications.fetch_add(1, Ordering::Relaxed) + 1;
        if watch {
            eprintln!("{}", output::summary(version, results));
        }
    });

    let initial = batch.run(plan.descriptors())?;
    info!(queries = initial.len(), observers = batch.observer_count(), "Plan started");

    let results = wait_settled(&batch, plan.timeout()).await?;
    subscription.unsubscribe();

    match format {
        OutputFormat::Table => println!("{}", output::table(&results)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output::json(&results))?),
    }
    if metrics {
        print!("{}", batch.cache().metrics().export_prometheus());
        print!("{}", batch.metrics().export_prometheus());
    }

    let failed = results.iter().filter(|r| r.is_error()).count();
    info!(queries = results.len(), failed, "Plan settled");
    if fail_on_error && failed > 0 {
        bail!("{failed} of {} queries failed", results.len());
    }
    Ok(())
}

fn cmd_check(config: &FanqueryConfig, plan_path: &Path) -> Result<()> {
    let plan = Plan::from_file(plan_path)?;
    // An idle batch reconciles and validates without starting any fetch.
    let batch = QueryBatch::from_config(config);
    let results = batch
        .run(plan.descriptors())
        .with_context(|| format!("Plan {} rejected", plan_path.display()))?;
    let skipped = results.iter().filter(|r| r.is_paused()).count();
    println!(
        "Plan OK: {} queries, {} distinct keys, {skipped} skipped",
        results.len(),
        batch.observer_count()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    logging::init(&config.logging, cli.verbose)?;

    match cli.command {
        Command::Run {
            plan,
            format,
            watch,
            metrics,
            fail_on_error,
        } => cmd_run(&config, &plan, format, watch, metrics, fail_on_error).await,
        Command::Check { plan } => cmd_check(&config, &plan),
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
