//! Virtual-user loop replaying a probing client against the guard

use crate::metrics::{Metrics, MetricsSnapshot, Observation};
use crate::LoadTestArgs;
use anyhow::{Context, Result};
use lexportal_common::ErrorBody;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct LoadTest {
    args: LoadTestArgs,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl LoadTest {
    pub fn new(args: LoadTestArgs) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            args,
            client,
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Run all virtual users until the deadline (or Ctrl+C)
    pub async fn run(&self) -> Result<(MetricsSnapshot, Duration)> {
        let base = self.args.base_url.trim_end_matches('/').to_string();
        let duration = Duration::from_secs(self.args.duration_secs);

        tracing::info!(vus = self.args.vus, target = %base, "Starting load test");
        if !self.args.json {
            println!("Starting LexPortal guard load test");
            println!("Target: {}", base);
            println!("Virtual users: {}", self.args.vus);
            println!("Duration: {}s", self.args.duration_secs);
            println!(
                "Scenario: {} x {} then {}",
                self.args.probes_per_iteration, self.args.probe_path, self.args.health_path
            );
            println!("\nPress Ctrl+C to stop early\n");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let ctrlc_stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, stopping virtual users");
                ctrlc_stop.store(true, Ordering::SeqCst);
            }
        });

        let started = Instant::now();
        let deadline = started + duration;

        let mut handles = Vec::with_capacity(self.args.vus);
        for vu in 0..self.args.vus {
            let user = VirtualUser {
                id: vu,
                client: self.client.clone(),
                probe_url: format!("{}{}", base, self.args.probe_path),
                health_url: format!("{}{}", base, self.args.health_path),
                forwarded_for: self.args.forwarded_for.clone(),
                probes_per_iteration: self.args.probes_per_iteration,
                probe_pause: Duration::from_millis(self.args.probe_pause_ms),
                iteration_pause: Duration::from_millis(self.args.iteration_pause_ms),
                metrics: self.metrics.clone(),
                stop: stop.clone(),
            };
            handles.push(tokio::spawn(user.run(deadline)));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Virtual user task failed: {}", e);
            }
        }

        Ok((self.metrics.snapshot().await, started.elapsed()))
    }
}

struct VirtualUser {
    id: usize,
    client: reqwest::Client,
    probe_url: String,
    health_url: String,
    forwarded_for: Option<String>,
    probes_per_iteration: u32,
    probe_pause: Duration,
    iteration_pause: Duration,
    metrics: Arc<Metrics>,
    stop: Arc<AtomicBool>,
}

impl VirtualUser {
    fn should_stop(&self, deadline: Instant) -> bool {
        self.stop.load(Ordering::SeqCst) || Instant::now() >= deadline
    }

    async fn run(self, deadline: Instant) {
        let mut iterations = 0u64;

        while !self.should_stop(deadline) {
            for _ in 0..self.probes_per_iteration {
                if self.should_stop(deadline) {
                    break;
                }
                match self.get(&self.probe_url).await {
                    Ok((status, observation, elapsed)) => {
                        self.metrics.record_probe(status, observation, elapsed).await;
                    }
                    Err(e) => {
                        tracing::debug!(vu = self.id, "Probe failed: {}", e);
                        self.metrics.record_error().await;
                    }
                }
                tokio::time::sleep(self.probe_pause).await;
            }

            match self.get(&self.health_url).await {
                Ok((status, observation, elapsed)) => {
                    if observation != Observation::Passed {
                        tracing::debug!(vu = self.id, status, "Health check blocked");
                    }
                    self.metrics.record_health(status, observation, elapsed).await;
                }
                Err(e) => {
                    tracing::debug!(vu = self.id, "Health check failed: {}", e);
                    self.metrics.record_error().await;
                }
            }

            iterations += 1;
            tokio::time::sleep(self.iteration_pause).await;
        }

        tracing::debug!(vu = self.id, iterations, "Virtual user finished");
    }

    async fn get(&self, url: &str) -> reqwest::Result<(u16, Observation, Duration)> {
        let mut request = self.client.get(url);
        if let Some(forwarded_for) = &self.forwarded_for {
            request = request.header(lexportal_common::constants::FORWARDED_FOR_HEADER, forwarded_for);
        }

        let started = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        let elapsed = started.elapsed();

        Ok((status.as_u16(), classify(status, &body), elapsed))
    }
}

/// Interpret a guard response
fn classify(status: StatusCode, body: &str) -> Observation {
    if status != StatusCode::TOO_MANY_REQUESTS {
        return Observation::Passed;
    }

    match ErrorBody::from_json(body) {
        Ok(error) if error.is_ban() => Observation::Banned,
        _ => Observation::UnexplainedRejection,
    }
}
