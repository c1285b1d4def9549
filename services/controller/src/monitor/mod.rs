//! Monitor: samples the metrics backend on a fixed period and turns the
//! answers into [`Report`]s for the analyzer.

mod metrics;

use std::collections::HashMap;
use std::time::Duration;

use aad_core::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MonitorConfig;
pub use metrics::MetricsClient;

/// Request-level traffic numbers for one observation window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requests {
    /// Requests/s excluding hard-denied (403) traffic.
    pub total_rate: f64,
    /// Requests/s excluding denied (403) and rate-limited (429) traffic.
    pub non_limited_rate: f64,
    /// Standard deviation of the 429 rate across client IPs; NaN when the
    /// series does not exist.
    pub limited_rates_stddev: f64,
    /// Fraction of non-denied, non-limited requests completing under 1.2 s.
    pub good_latency_percent: f64,
}

/// One monitoring snapshot, produced once per tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    /// Mean CPU use across replicas, normalised so 1.0 saturates the
    /// configured quota.
    pub average_cpu_utilization: f64,
    pub requests: Requests,
    /// IP -> share of its requests that were rate-limited, for IPs above the
    /// attacker threshold.
    pub potential_attacker_ips: HashMap<String, f64>,
}

pub struct Monitor {
    cfg: MonitorConfig,
    client: MetricsClient,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn new(cfg: MonitorConfig) -> Result<Self> {
        let client = MetricsClient::new(&cfg.metrics_address)?;
        Ok(Self {
            cfg,
            client,
            cancel: CancellationToken::new(),
            handle: None,
        })
    }

    /// Spawns the tick loop. The returned channel closes when the monitor
    /// is stopped.
    pub fn start(&mut self) -> mpsc::Receiver<Report> {
        let (tx, rx) = mpsc::channel(1);
        let cfg = self.cfg.clone();
        let client = self.client.clone();
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(run(cfg, client, tx, cancel)));
        rx
    }

    /// Cancels the in-flight tick, if any, and waits for the loop to exit.
    /// Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run(
    cfg: MonitorConfig,
    client: MetricsClient,
    reports: mpsc::Sender<Report>,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + cfg.report_period, cfg.report_period);
    // A slow tick must not be followed by a burst of catch-up ticks.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            done = tick(&cfg, &client, &reports) => {
                if done.is_break() {
                    return;
                }
            }
        }
    }
}

async fn tick(
    cfg: &MonitorConfig,
    client: &MetricsClient,
    reports: &mpsc::Sender<Report>,
) -> std::ops::ControlFlow<()> {
    match collect(cfg, client).await {
        Ok(report) => {
            if reports.send(report).await.is_err() {
                return std::ops::ControlFlow::Break(());
            }
        }
        Err(e) => warn!("skipping report: {e}"),
    }
    std::ops::ControlFlow::Continue(())
}

/// Runs all queries for one report. Any failure aborts the whole report;
/// the next tick starts from scratch.
async fn collect(cfg: &MonitorConfig, client: &MetricsClient) -> Result<Report> {
    let requests = requests_report(cfg, client).await?;
    debug!(?requests, "requests");

    let cpu = average_cpu_utilization(cfg, client).await?;
    debug!(cpu, "cpu utilization");

    let attackers = potential_attacker_ips(cfg, client).await?;
    if !attackers.is_empty() {
        debug!(?attackers, "potential attackers");
    }

    Ok(Report {
        average_cpu_utilization: cpu,
        requests,
        potential_attacker_ips: attackers,
    })
}

fn window(period: Duration) -> String {
    format!("{}s", period.as_secs())
}

async fn requests_report(cfg: &MonitorConfig, client: &MetricsClient) -> Result<Requests> {
    let w = window(cfg.metrics_period);

    let total_rate = client
        .scalar(&format!(
            r#"sum(rate(traefik_entrypoint_requests_total{{code!="403"}}[{w}]))"#
        ))
        .await?;

    let non_limited_rate = client
        .scalar(&format!(
            r#"sum(rate(traefik_entrypoint_requests_total{{code!="403", code!="429"}}[{w}]))"#
        ))
        .await?;

    let mut good_latency_percent = client
        .scalar(&format!(
            r#"sum(rate(traefik_entrypoint_request_duration_seconds_bucket{{code!="403", code!="429", le="1.2"}}[{w}])) / sum(rate(traefik_entrypoint_request_duration_seconds_count{{code!="403", code!="429"}}[{w}]))"#
        ))
        .await?;
    // No traffic in the window reads as perfect latency.
    if good_latency_percent == 0.0 || good_latency_percent.is_nan() {
        good_latency_percent = 1.0;
    }

    let limited_rates_stddev = client
        .optional_scalar(&format!(
            r#"stddev(rate(traefik_entrypoint_requests_total{{code="429"}}[{w}]))"#
        ))
        .await?
        .unwrap_or(f64::NAN);

    Ok(Requests {
        total_rate,
        non_limited_rate,
        limited_rates_stddev,
        good_latency_percent,
    })
}

async fn average_cpu_utilization(cfg: &MonitorConfig, client: &MetricsClient) -> Result<f64> {
    let w = window(cfg.metrics_period);
    let mut value = client
        .scalar(&format!(
            r#"avg(rate(process_cpu_seconds_total{{job="file-server"}}[{w}]))"#
        ))
        .await?;
    // An idle or absent process sample reads as exactly-at-quota.
    if value == 0.0 || value.is_nan() {
        value = cfg.cpu_quota;
    }
    Ok(value / cfg.cpu_quota)
}

async fn potential_attacker_ips(
    cfg: &MonitorConfig,
    client: &MetricsClient,
) -> Result<HashMap<String, f64>> {
    let w = window(cfg.metrics_period);
    client
        .by_ip(&format!(
            r#"sum(rate(traefik_entrypoint_requests_total{{code="429"}}[{w}])) by (ip) / sum(rate(traefik_entrypoint_requests_total[{w}])) by (ip) > {}"#,
            cfg.attacker_percent_threshold
        ))
        .await
}
