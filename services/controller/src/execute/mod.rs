//! Execute: the actuator side of the loop. Holds the state the gateway
//! polls, talks to the orchestrator, and commits applied changes to the
//! knowledge base.

mod gateway;
mod orchestrator;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use aad_core::{KnowledgeBase, Result};
use dashmap::DashMap;
use tracing::info;

use crate::config::ExecuteConfig;
pub use gateway::router;
pub use orchestrator::{DockerOrchestrator, Orchestrator};

/// Name substring identifying the protected service in the orchestrator.
const TARGET_SERVICE: &str = "file-server";

pub struct Execute {
    knowledge: Arc<KnowledgeBase>,
    orchestrator: Arc<dyn Orchestrator>,
    /// The limit the gateway will be told on its next poll; committed to the
    /// knowledge base only once a poll has actually served it.
    limit: AtomicU32,
    /// Bans (true) and unbans (false) staged for the next gateway poll.
    pending: DashMap<IpAddr, bool>,
}

impl Execute {
    /// Builds the actuator and seeds the knowledge base: replica count read
    /// from the orchestrator, limit from configuration. Failure to reach
    /// the orchestrator here is fatal to the caller.
    pub async fn new(
        cfg: ExecuteConfig,
        knowledge: Arc<KnowledgeBase>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Result<Arc<Self>> {
        let replicas = orchestrator.replicas(TARGET_SERVICE).await?;
        knowledge.set_replicas(replicas);
        knowledge.set_limit(cfg.initial_limit);

        let execute = Arc::new(Self {
            knowledge,
            orchestrator,
            limit: AtomicU32::new(cfg.initial_limit),
            pending: DashMap::new(),
        });
        info!(replicas, limit = cfg.initial_limit, "execute initialised");
        Ok(execute)
    }

    /// Sets the desired replica count on the orchestrator. The knowledge
    /// base is updated only on success, so a failed scale leaves the next
    /// analysis working from the last materialised count.
    pub async fn scale_service(&self, replicas: u64) -> Result<()> {
        self.orchestrator.scale(TARGET_SERVICE, replicas).await?;
        self.knowledge.set_replicas(replicas);
        Ok(())
    }

    /// Stages a new per-IP rate limit for the next gateway poll.
    pub fn set_rate_limit(&self, limit: u32) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    pub fn ban_ip(&self, ip: IpAddr) {
        self.pending.insert(ip, true);
    }

    pub fn unban_ip(&self, ip: IpAddr) {
        self.pending.insert(ip, false);
    }

    fn current_limit(&self) -> u32 {
        self.limit.load(Ordering::SeqCst)
    }
}
