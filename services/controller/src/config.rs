use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

const CONFIG_FILE: &str = "/etc/config.yaml";
const ENV_PREFIX: &str = "AAD";
const ENV_SEPARATOR: &str = "__";

/// Controller configuration, one section per MAPE module.
///
/// Values are layered: defaults, then `/etc/config.yaml`, then environment
/// variables with the `AAD__` prefix and `__` as the path separator
/// (`AAD__MONITOR__REPORT_PERIOD=6s` overrides `monitor.report_period`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub monitor: MonitorConfig,
    pub analyze: AnalyzeConfig,
    pub plan: PlanConfig,
    pub execute: ExecuteConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub metrics_address: String,
    #[serde(with = "humantime_serde")]
    pub metrics_period: Duration,
    #[serde(with = "humantime_serde")]
    pub report_period: Duration,
    pub cpu_quota: f64,
    pub attacker_percent_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            metrics_address: "http://localhost:9090".to_string(),
            metrics_period: Duration::from_secs(15),
            report_period: Duration::from_secs(6),
            cpu_quota: 0.01,
            attacker_percent_threshold: 0.25,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzeConfig {
    pub target_utilization: f64,
    pub max_replicas: u64,
    pub min_replicas: u64,
    pub limited_request_cost: f64,
    pub replica_cost: f64,
    pub min_limit: u32,
    #[serde(with = "humantime_serde")]
    pub unban_check_period: Duration,
    #[serde(with = "humantime_serde")]
    pub unban_after: Duration,
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            target_utilization: 0.7,
            max_replicas: 4,
            min_replicas: 1,
            limited_request_cost: 50.0,
            replica_cost: 200.0,
            min_limit: 5,
            unban_check_period: Duration::from_secs(10),
            unban_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    #[serde(with = "humantime_serde")]
    pub merge_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub execution_timeout: Duration,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            merge_timeout: Duration::from_secs(3),
            execution_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecuteConfig {
    pub initial_limit: u32,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self { initial_limit: 50 }
    }
}

/// Loads the layered configuration. A missing YAML file is fine; a present
/// but malformed one is not.
pub fn load() -> anyhow::Result<Settings> {
    load_from(CONFIG_FILE)
}

fn load_from(path: &str) -> anyhow::Result<Settings> {
    let settings = Config::builder()
        .add_source(File::new(path, FileFormat::Yaml).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        )
        .build()?
        .try_deserialize::<Settings>()?;
    Ok(settings)
}
