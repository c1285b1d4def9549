use std::collections::HashMap;
use std::net::IpAddr;

use tracing::debug;

/// One adaptation step produced by the analyzer or the unban scanner.
///
/// Ban targets travel as strings because they originate from metric labels;
/// validation happens when the action is applied to a change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdaptationAction {
    BanIp(String),
    UnbanIp(String),
    AdaptReplicas(u64),
    AdaptLimit(u32),
}

/// Latest-writer-wins accumulator for a merge window. `None` means "leave
/// that actuator alone".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub limit: Option<u32>,
    pub replicas: Option<u64>,
    /// true = ban, false = unban; the last write for an IP wins.
    pub ban_or_unban: HashMap<IpAddr, bool>,
}

impl ChangeSet {
    pub fn apply(&mut self, action: AdaptationAction) {
        match action {
            AdaptationAction::AdaptLimit(limit) => self.limit = Some(limit),
            AdaptationAction::AdaptReplicas(replicas) => self.replicas = Some(replicas),
            AdaptationAction::BanIp(ip) => self.set_ban(&ip, true),
            AdaptationAction::UnbanIp(ip) => self.set_ban(&ip, false),
        }
    }

    fn set_ban(&mut self, ip: &str, ban: bool) {
        match ip.parse::<IpAddr>() {
            Ok(ip) => {
                self.ban_or_unban.insert(ip, ban);
            }
            // Metric labels are not trusted input; a malformed literal is
            // dropped rather than propagated.
            Err(_) => debug!(ip, ban, "dropping malformed IP literal"),
        }
    }
}
