//! Adaptive anti-DoS controller: a MAPE-K loop that watches traffic and
//! resource metrics, plans cost-optimal adaptations, and drives the edge
//! gateway and the orchestrator.

pub mod analyze;
pub mod config;
pub mod execute;
pub mod monitor;
pub mod plan;

use std::sync::Arc;

use aad_core::KnowledgeBase;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::analyze::Analyze;
use crate::config::Settings;
use crate::execute::{DockerOrchestrator, Execute, Orchestrator};
use crate::monitor::Monitor;
use crate::plan::Plan;

/// Address the gateway polls for its dynamic configuration.
const GATEWAY_ADDR: &str = "0.0.0.0:6041";

/// Runs the control loop until an interrupt or termination signal arrives,
/// then shuts the pipeline down in order: Monitor first (closing the report
/// stream), Analyze (draining, stopping the unban scanner), Plan (flushing
/// the pending change set), and finally the gateway endpoint.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let knowledge = Arc::new(KnowledgeBase::new());
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(DockerOrchestrator::new()?);
    let execute = Execute::new(settings.execute, Arc::clone(&knowledge), orchestrator).await?;

    let mut monitor = Monitor::new(settings.monitor)?;
    let mut analyze = Analyze::new(settings.analyze, Arc::clone(&knowledge));
    let mut plan = Plan::new(settings.plan, Arc::clone(&execute));

    let reports = monitor.start();
    let actions = analyze.start(reports);
    plan.start(actions);

    let shutdown = CancellationToken::new();
    let listener = tokio::net::TcpListener::bind(GATEWAY_ADDR).await?;
    info!("gateway config endpoint listening on {GATEWAY_ADDR}");
    let server = {
        let app = execute::router(Arc::clone(&execute));
        let cancelled = shutdown.clone().cancelled_owned();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(cancelled)
                .await
        })
    };

    wait_for_signal().await?;
    info!("shutdown signal received, stopping control loop");

    monitor.stop().await;
    analyze.stop().await;
    plan.stop().await;
    shutdown.cancel();
    server.await??;

    info!("control loop stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
