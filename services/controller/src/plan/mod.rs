//! Plan: merges bursts of adaptation actions into one coherent change set
//! and hands it to Execute once the burst goes quiet.

mod actions;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use crate::config::PlanConfig;
use crate::execute::Execute;
pub use actions::{AdaptationAction, ChangeSet};

pub struct Plan {
    cfg: PlanConfig,
    execute: Arc<Execute>,
    handle: Option<JoinHandle<()>>,
}

impl Plan {
    pub fn new(cfg: PlanConfig, execute: Arc<Execute>) -> Self {
        Self {
            cfg,
            execute,
            handle: None,
        }
    }

    /// Consumes the action stream until it closes. The loop exits on its
    /// own once every producer has dropped its sender.
    pub fn start(&mut self, actions: mpsc::Receiver<AdaptationAction>) {
        let cfg = self.cfg.clone();
        let execute = Arc::clone(&self.execute);
        self.handle = Some(tokio::spawn(run(cfg, execute, actions)));
    }

    /// Waits for the merge loop to flush and exit. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run(cfg: PlanConfig, execute: Arc<Execute>, mut actions: mpsc::Receiver<AdaptationAction>) {
    let mut pending = ChangeSet::default();
    let mut merged = 0usize;

    // Quiet-window timer: re-armed on every action, consulted only while
    // something is pending, so a storm of actions waits for its own pause.
    let timer = sleep(cfg.merge_timeout);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            received = actions.recv() => match received {
                Some(action) => {
                    debug!(?action, "merging action");
                    pending.apply(action);
                    merged += 1;
                    timer.as_mut().reset(Instant::now() + cfg.merge_timeout);
                }
                None => {
                    // Producers are gone; flush whatever is pending.
                    if merged > 0 {
                        execute_change_set(&cfg, &execute, std::mem::take(&mut pending)).await;
                    }
                    return;
                }
            },
            _ = timer.as_mut(), if merged > 0 => {
                info!(merged, "merge window closed, executing change set");
                execute_change_set(&cfg, &execute, std::mem::take(&mut pending)).await;
                merged = 0;
            }
        }
    }
}

/// Applies one merged change set: bans and unbans first, then the scale
/// call (bounded by `execution_timeout`), then the limit. A scale failure
/// is logged and must not block the remaining actuator updates.
async fn execute_change_set(cfg: &PlanConfig, execute: &Execute, set: ChangeSet) {
    for (ip, ban) in set.ban_or_unban {
        if ban {
            execute.ban_ip(ip);
        } else {
            execute.unban_ip(ip);
        }
    }

    if let Some(replicas) = set.replicas {
        match tokio::time::timeout(cfg.execution_timeout, execute.scale_service(replicas)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("failed to scale service: {e}"),
            Err(_) => error!(
                "scale to {replicas} replicas timed out after {:?}",
                cfg.execution_timeout
            ),
        }
    }

    if let Some(limit) = set.limit {
        execute.set_rate_limit(limit);
    }
}
