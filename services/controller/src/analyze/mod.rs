//! Analyze: turns monitoring reports into adaptation actions, and owns the
//! scanner that lifts bans once they have aged out.

mod decision;

use std::sync::Arc;

use aad_core::KnowledgeBase;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AnalyzeConfig;
use crate::monitor::Report;
use crate::plan::AdaptationAction;
pub use decision::{decide, Decision};

pub struct Analyze {
    cfg: AnalyzeConfig,
    knowledge: Arc<KnowledgeBase>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Analyze {
    pub fn new(cfg: AnalyzeConfig, knowledge: Arc<KnowledgeBase>) -> Self {
        Self {
            cfg,
            knowledge,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Spawns the report consumer and the unban scanner. Both feed the
    /// returned action channel; it closes only when the report stream has
    /// closed and the scanner has exited.
    pub fn start(&mut self, reports: mpsc::Receiver<Report>) -> mpsc::Receiver<AdaptationAction> {
        let (tx, rx) = mpsc::channel(1);

        let worker = {
            let cfg = self.cfg.clone();
            let knowledge = Arc::clone(&self.knowledge);
            let tx = tx.clone();
            tokio::spawn(consume_reports(cfg, knowledge, reports, tx))
        };
        let scanner = {
            let cfg = self.cfg.clone();
            let knowledge = Arc::clone(&self.knowledge);
            let cancel = self.cancel.clone();
            tokio::spawn(unban_scanner(cfg, knowledge, tx, cancel))
        };
        self.tasks = vec![worker, scanner];
        rx
    }

    /// Stops the unban scanner and waits for both tasks. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

async fn consume_reports(
    cfg: AnalyzeConfig,
    knowledge: Arc<KnowledgeBase>,
    mut reports: mpsc::Receiver<Report>,
    actions: mpsc::Sender<AdaptationAction>,
) {
    while let Some(report) = reports.recv().await {
        for action in actions_for(&cfg, &knowledge, &report) {
            if actions.send(action).await.is_err() {
                return;
            }
        }
    }
}

/// All actions for one report; bans always come before resource actions.
fn actions_for(
    cfg: &AnalyzeConfig,
    knowledge: &KnowledgeBase,
    report: &Report,
) -> Vec<AdaptationAction> {
    let mut actions: Vec<AdaptationAction> = report
        .potential_attacker_ips
        .keys()
        .map(|ip| AdaptationAction::BanIp(ip.clone()))
        .collect();

    let decision = decide(
        cfg,
        knowledge.current_replicas(),
        knowledge.current_limit(),
        report,
    );
    debug!(?decision, "resource decision");
    if let Some(replicas) = decision.replicas {
        actions.push(AdaptationAction::AdaptReplicas(replicas));
    }
    if let Some(limit) = decision.limit {
        actions.push(AdaptationAction::AdaptLimit(limit));
    }
    actions
}

/// Periodically sweeps the ban ledger and emits an unban for every entry
/// older than `unban_after`.
async fn unban_scanner(
    cfg: AnalyzeConfig,
    knowledge: Arc<KnowledgeBase>,
    actions: mpsc::Sender<AdaptationAction>,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(
        Instant::now() + cfg.unban_check_period,
        cfg.unban_check_period,
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        for (ip, banned_at) in knowledge.banned_ips() {
            if banned_at.elapsed() < cfg.unban_after {
                continue;
            }
            info!(%ip, "ban expired");
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = actions.send(AdaptationAction::UnbanIp(ip.to_string())) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn attack_report(ips: &[&str]) -> Report {
        Report {
            average_cpu_utilization: 0.7,
            requests: crate::monitor::Requests {
                total_rate: 400.0,
                non_limited_rate: 300.0,
                limited_rates_stddev: 1.0,
                good_latency_percent: 1.0,
            },
            potential_attacker_ips: ips.iter().map(|ip| (ip.to_string(), 0.5)).collect(),
        }
    }

    #[test]
    fn bans_precede_resource_actions() {
        let cfg = AnalyzeConfig::default();
        let knowledge = KnowledgeBase::new();
        knowledge.set_replicas(2);
        knowledge.set_limit(50);

        let actions = actions_for(&cfg, &knowledge, &attack_report(&["1.2.3.4", "5.6.7.8"]));
        assert_eq!(actions.len(), 4);

        let bans: HashSet<_> = actions[..2]
            .iter()
            .map(|a| match a {
                AdaptationAction::BanIp(ip) => ip.clone(),
                other => panic!("expected ban first, got {other:?}"),
            })
            .collect();
        assert_eq!(
            bans,
            HashSet::from(["1.2.3.4".to_string(), "5.6.7.8".to_string()])
        );
        assert_eq!(actions[2], AdaptationAction::AdaptReplicas(3));
        assert_eq!(actions[3], AdaptationAction::AdaptLimit(75));
    }

    #[tokio::test(start_paused = true)]
    async fn scanner_unbans_after_expiry() {
        let cfg = AnalyzeConfig::default();
        let knowledge = Arc::new(KnowledgeBase::new());
        knowledge.ban_ip("1.2.3.4".parse().unwrap());

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(unban_scanner(
            cfg.clone(),
            Arc::clone(&knowledge),
            tx,
            cancel.clone(),
        ));

        // well before unban_after nothing is emitted
        tokio::time::advance(cfg.unban_check_period + std::time::Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());

        // the first scan at or after the deadline emits the unban
        tokio::time::advance(cfg.unban_after).await;
        let action = rx.recv().await.expect("unban action");
        assert_eq!(action, AdaptationAction::UnbanIp("1.2.3.4".to_string()));

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn scanner_ignores_fresh_bans() {
        let cfg = AnalyzeConfig::default();
        let knowledge = Arc::new(KnowledgeBase::new());

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(unban_scanner(
            cfg.clone(),
            Arc::clone(&knowledge),
            tx,
            cancel.clone(),
        ));

        tokio::time::advance(cfg.unban_after).await;
        knowledge.ban_ip("1.2.3.4".parse().unwrap());
        tokio::time::advance(cfg.unban_check_period).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        let _ = handle.await;
    }
}
