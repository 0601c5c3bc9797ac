//! LexPortal load test - replays a probing client against the abuse guard
//!
//! Usage:
//!   lexportal-loadtest [--base-url URL] [--vus N] [--duration-secs S]
//!
//! Each virtual user probes a sensitive path repeatedly, checks that every
//! 429 carries the ban message, then hits the health endpoint to see whether
//! the ban applies there too.

mod metrics;
mod runner;

use anyhow::Result;
use clap::Parser;
use lexportal_common::constants;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug, Clone)]
#[command(name = "lexportal-loadtest")]
#[command(author = "LexPortal Team")]
#[command(version)]
#[command(about = "Load test the LexPortal abuse guard", long_about = None)]
pub struct LoadTestArgs {
    /// Base URL of the server under test
    #[arg(long, env = "LOADTEST_BASE_URL", default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Number of concurrent virtual users
    #[arg(long, env = "LOADTEST_VUS", default_value_t = 10)]
    pub vus: usize,

    /// Test duration in seconds
    #[arg(long, env = "LOADTEST_DURATION_SECS", default_value_t = 30)]
    pub duration_secs: u64,

    /// Sensitive path each virtual user probes
    #[arg(long, env = "LOADTEST_PROBE_PATH", default_value = "/.env")]
    pub probe_path: String,

    /// Probes per iteration
    #[arg(long, env = "LOADTEST_PROBES_PER_ITERATION", default_value_t = 6)]
    pub probes_per_iteration: u32,

    /// Pause between probes (ms)
    #[arg(long, env = "LOADTEST_PROBE_PAUSE_MS", default_value_t = 100)]
    pub probe_pause_ms: u64,

    /// Endpoint checked after the probes
    #[arg(long, env = "LOADTEST_HEALTH_PATH", default_value = constants::HEALTH_PATH)]
    pub health_path: String,

    /// Pause between iterations (ms)
    #[arg(long, env = "LOADTEST_ITERATION_PAUSE_MS", default_value_t = 1000)]
    pub iteration_pause_ms: u64,

    /// Fail when p95 latency is not below this (ms)
    #[arg(long, env = "LOADTEST_P95_THRESHOLD_MS", default_value_t = 50.0)]
    pub p95_threshold_ms: f64,

    /// X-Forwarded-For value to send (for servers behind a trusted proxy)
    #[arg(long, env = "LOADTEST_FORWARDED_FOR")]
    pub forwarded_for: Option<String>,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = LoadTestArgs::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},lexportal_loadtest=info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    if args.vus == 0 {
        anyhow::bail!("--vus must be at least 1");
    }

    let threshold = args.p95_threshold_ms;
    let json = args.json;
    let started_at = chrono::Utc::now();
    let (snapshot, elapsed) = runner::LoadTest::new(args)?.run().await?;
    let failures = snapshot.failures(threshold);

    if json {
        let report = serde_json::json!({
            "started_at": started_at.to_rfc3339(),
            "elapsed_secs": elapsed.as_secs_f64(),
            "metrics": snapshot,
            "failures": failures,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !failures.is_empty() {
            std::process::exit(1);
        }
        return Ok(());
    }

    println!("Started: {}", started_at.to_rfc3339());
    snapshot.print(elapsed);

    if failures.is_empty() {
        println!("\nPASS");
        Ok(())
    } else {
        println!("\nFAIL");
        for failure in &failures {
            println!("  - {}", failure);
        }
        std::process::exit(1);
    }
}
