//! The configuration endpoint the edge gateway polls: Traefik's HTTP
//! provider fetches `/gateway` and applies the returned dynamic config.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::Execute;

/// Some gateways reject an empty deny list outright, so an always-harmless
/// placeholder is shipped instead. It never enters the knowledge base.
const SENTINEL_DENY_IP: &str = "11.0.0.0";

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DynamicConfig {
    http: HttpConfig,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct HttpConfig {
    middlewares: Middlewares,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct Middlewares {
    #[serde(rename = "fs-rate-limit")]
    rate_limit: RateLimitMiddleware,
    #[serde(rename = "fs-deny-ip")]
    deny_ip: DenyIpMiddleware,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct RateLimitMiddleware {
    #[serde(rename = "rateLimit")]
    rate_limit: RateLimit,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct RateLimit {
    average: u32,
    burst: u32,
    period: u64,
    #[serde(rename = "sourceCriterion")]
    source_criterion: SourceCriterion,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct SourceCriterion {
    #[serde(rename = "ipStrategy")]
    ip_strategy: IpStrategy,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct IpStrategy {
    depth: u32,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct DenyIpMiddleware {
    plugin: DenyIpPlugin,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct DenyIpPlugin {
    denyip: DenyIp,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct DenyIp {
    #[serde(rename = "ipDenyList")]
    ip_deny_list: Vec<String>,
}

impl DynamicConfig {
    fn new(limit: u32, deny_list: Vec<String>) -> Self {
        Self {
            http: HttpConfig {
                middlewares: Middlewares {
                    rate_limit: RateLimitMiddleware {
                        rate_limit: RateLimit {
                            average: limit,
                            burst: limit,
                            period: 1,
                            source_criterion: SourceCriterion {
                                ip_strategy: IpStrategy { depth: 1 },
                            },
                        },
                    },
                    deny_ip: DenyIpMiddleware {
                        plugin: DenyIpPlugin {
                            denyip: DenyIp {
                                ip_deny_list: deny_list,
                            },
                        },
                    },
                },
            },
        }
    }
}

pub fn router(execute: Arc<Execute>) -> Router {
    Router::new()
        .route("/gateway", get(gateway_config))
        .layer(TraceLayer::new_for_http())
        .with_state(execute)
}

async fn gateway_config(State(execute): State<Arc<Execute>>) -> Json<DynamicConfig> {
    Json(execute.gateway_payload())
}

impl Execute {
    /// Builds the configuration for one gateway poll and commits the served
    /// state to the knowledge base afterwards, so Knowledge always reflects
    /// what the gateway has actually been told.
    pub(crate) fn gateway_payload(&self) -> DynamicConfig {
        // Bans already committed to Knowledge re-enter the pending set, so a
        // freshly restarted gateway still receives the full deny list.
        for (ip, _) in self.knowledge.banned_ips() {
            self.pending.entry(ip).or_insert(true);
        }

        let staged: Vec<(IpAddr, bool)> = self
            .pending
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        let mut deny_list: Vec<String> = staged
            .iter()
            .filter(|(_, ban)| *ban)
            .map(|(ip, _)| ip.to_string())
            .collect();
        deny_list.sort();
        if deny_list.is_empty() {
            deny_list.push(SENTINEL_DENY_IP.to_string());
        }

        let limit = self.current_limit();
        let config = DynamicConfig::new(limit, deny_list);

        self.knowledge.set_limit(limit);
        for (ip, ban) in staged {
            if ban {
                self.knowledge.ban_ip(ip);
            } else {
                self.knowledge.unban_ip(ip);
            }
            // Only drop the staged flag if it was not overwritten while this
            // poll was being served.
            self.pending.remove_if(&ip, |_, current| *current == ban);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aad_core::{KnowledgeBase, Result};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::config::ExecuteConfig;
    use crate::execute::Orchestrator;

    struct StaticOrchestrator(u64);

    #[async_trait]
    impl Orchestrator for StaticOrchestrator {
        async fn replicas(&self, _name: &str) -> Result<u64> {
            Ok(self.0)
        }

        async fn scale(&self, _name: &str, _replicas: u64) -> Result<()> {
            Ok(())
        }
    }

    async fn execute_with(knowledge: Arc<KnowledgeBase>) -> Arc<Execute> {
        Execute::new(
            ExecuteConfig { initial_limit: 50 },
            knowledge,
            Arc::new(StaticOrchestrator(2)),
        )
        .await
        .expect("execute init")
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("test IP literal")
    }

    #[tokio::test]
    async fn serialises_the_gateway_wire_shape() {
        let knowledge = Arc::new(KnowledgeBase::new());
        let execute = execute_with(Arc::clone(&knowledge)).await;
        execute.ban_ip(ip("1.2.3.4"));
        execute.ban_ip(ip("5.6.7.8"));

        let value = serde_json::to_value(execute.gateway_payload()).expect("serialise");
        assert_eq!(
            value,
            json!({
                "http": {
                    "middlewares": {
                        "fs-rate-limit": {
                            "rateLimit": {
                                "average": 50,
                                "burst": 50,
                                "period": 1,
                                "sourceCriterion": {"ipStrategy": {"depth": 1}}
                            }
                        },
                        "fs-deny-ip": {
                            "plugin": {"denyip": {"ipDenyList": ["1.2.3.4", "5.6.7.8"]}}
                        }
                    }
                }
            })
        );
    }

    #[tokio::test]
    async fn empty_deny_list_ships_the_sentinel_without_persisting_it() {
        let knowledge = Arc::new(KnowledgeBase::new());
        let execute = execute_with(Arc::clone(&knowledge)).await;

        let value = serde_json::to_value(execute.gateway_payload()).expect("serialise");
        assert_eq!(
            value["http"]["middlewares"]["fs-deny-ip"]["plugin"]["denyip"]["ipDenyList"],
            json!(["11.0.0.0"])
        );
        assert!(knowledge.banned_ips().is_empty());
    }

    #[tokio::test]
    async fn poll_commits_staged_state_to_knowledge() {
        let knowledge = Arc::new(KnowledgeBase::new());
        let execute = execute_with(Arc::clone(&knowledge)).await;

        execute.set_rate_limit(75);
        execute.ban_ip(ip("1.2.3.4"));
        let _ = execute.gateway_payload();

        assert_eq!(knowledge.current_limit(), 75);
        assert!(knowledge.is_banned(ip("1.2.3.4")));

        // an unban staged later is committed on the next poll
        execute.unban_ip(ip("1.2.3.4"));
        let value = serde_json::to_value(execute.gateway_payload()).expect("serialise");
        assert!(!knowledge.is_banned(ip("1.2.3.4")));
        assert_eq!(
            value["http"]["middlewares"]["fs-deny-ip"]["plugin"]["denyip"]["ipDenyList"],
            json!(["11.0.0.0"])
        );
    }

    #[tokio::test]
    async fn knowledge_bans_reappear_for_fresh_polls() {
        let knowledge = Arc::new(KnowledgeBase::new());
        knowledge.ban_ip(ip("9.9.9.9"));
        let execute = execute_with(Arc::clone(&knowledge)).await;

        let value = serde_json::to_value(execute.gateway_payload()).expect("serialise");
        assert_eq!(
            value["http"]["middlewares"]["fs-deny-ip"]["plugin"]["denyip"]["ipDenyList"],
            json!(["9.9.9.9"])
        );
    }

    #[tokio::test]
    async fn scale_failure_leaves_knowledge_untouched() {
        struct FailingOrchestrator;

        #[async_trait]
        impl Orchestrator for FailingOrchestrator {
            async fn replicas(&self, _name: &str) -> Result<u64> {
                Ok(2)
            }

            async fn scale(&self, name: &str, _replicas: u64) -> Result<()> {
                Err(aad_core::Error::ServiceNotFound(name.to_string()))
            }
        }

        let knowledge = Arc::new(KnowledgeBase::new());
        let execute = Execute::new(
            ExecuteConfig { initial_limit: 50 },
            Arc::clone(&knowledge),
            Arc::new(FailingOrchestrator),
        )
        .await
        .expect("execute init");

        assert!(execute.scale_service(3).await.is_err());
        assert_eq!(knowledge.current_replicas(), 2);
    }
}
