use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::time::Instant;

/// Shared state of the control loop: the actuator values last committed by
/// Execute plus the banned-IP ledger. Scalars are atomics and the ban map is
/// a concurrent map, so readers never block writers.
#[derive(Debug, Default)]
pub struct KnowledgeBase {
    limit: AtomicU32,
    replicas: AtomicU64,
    banned: DashMap<IpAddr, Instant>,
}

impl KnowledgeBase {
    /// Empty knowledge base: zero scalars, no bans. Execute seeds the
    /// scalars from the orchestrator and the configured limit before the
    /// pipeline starts.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_limit(&self) -> u32 {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn current_replicas(&self) -> u64 {
        self.replicas.load(Ordering::SeqCst)
    }

    pub fn set_limit(&self, limit: u32) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    pub fn set_replicas(&self, replicas: u64) {
        self.replicas.store(replicas, Ordering::SeqCst);
    }

    /// Records a ban with the current time. Re-banning an already banned IP
    /// keeps the original timestamp so the unban deadline is not pushed back.
    pub fn ban_ip(&self, ip: IpAddr) {
        self.banned.entry(ip).or_insert_with(Instant::now);
    }

    pub fn unban_ip(&self, ip: IpAddr) {
        self.banned.remove(&ip);
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.contains_key(&ip)
    }

    /// Snapshot of the ban ledger. The snapshot is not atomic with respect
    /// to concurrent writes; callers must tolerate entries appearing or
    /// disappearing between iteration and use.
    pub fn banned_ips(&self) -> Vec<(IpAddr, Instant)> {
        self.banned
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }
}
