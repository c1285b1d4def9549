//! Load generator: replays a set of simulated users, each with its own IP
//! and request rate, against the gateway. Used to exercise the controller
//! with mixed legitimate and attack traffic.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TARGET_URL: &str = "http://localhost:4000/a.png";
const SLOW_RESPONSE: Duration = Duration::from_millis(1200);

#[derive(Debug, Deserialize)]
struct Config {
    users: HashMap<String, User>,
}

#[derive(Debug, Clone, Deserialize)]
struct User {
    /// Delay before this user starts sending.
    #[serde(with = "humantime_serde")]
    start: Duration,
    /// Requests per second.
    rps: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let config: Config = serde_yaml::from_str(&raw).with_context(|| format!("parsing {path}"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;

    for (ip, user) in config.users {
        tokio::spawn(apply_load(client.clone(), ip, user));
    }

    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn apply_load(client: reqwest::Client, ip: String, user: User) {
    if user.rps <= 0.0 {
        warn!(%ip, rps = user.rps, "skipping user with non-positive rate");
        return;
    }
    tokio::time::sleep(user.start).await;
    info!(%ip, rps = user.rps, "starting user");

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / user.rps));
    loop {
        ticker.tick().await;
        let client = client.clone();
        let ip = ip.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            match client
                .get(TARGET_URL)
                .header("X-Forwarded-For", &ip)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status != StatusCode::OK {
                        warn!(%ip, %status, "bad status code");
                    }
                    if let Err(e) = response.bytes().await {
                        warn!(%ip, "failed to read body: {e}");
                        return;
                    }
                    let elapsed = start.elapsed();
                    if elapsed > SLOW_RESPONSE {
                        warn!(%ip, ?elapsed, "slow response");
                    }
                }
                Err(e) => warn!(%ip, "request failed: {e}"),
            }
        });
    }
}
