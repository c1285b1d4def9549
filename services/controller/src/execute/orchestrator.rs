use aad_core::{Error, Result};
use async_trait::async_trait;
use bollard::service::{ListServicesOptions, Service, UpdateServiceOptions};
use bollard::Docker;
use tracing::{info, warn};

/// The slice of the orchestrator the controller needs: read and write the
/// replica count of one replicated service, addressed by name substring.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn replicas(&self, name: &str) -> Result<u64>;
    async fn scale(&self, name: &str, replicas: u64) -> Result<()>;
}

/// Docker swarm implementation over the local daemon socket.
pub struct DockerOrchestrator {
    docker: Docker,
}

impl DockerOrchestrator {
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Orchestrator(e.to_string()))?;
        Ok(Self { docker })
    }

    async fn find_service(&self, name: &str) -> Result<Service> {
        let services = self
            .docker
            .list_services(None::<ListServicesOptions<String>>)
            .await
            .map_err(|e| Error::Orchestrator(e.to_string()))?;

        services
            .into_iter()
            .find(|service| {
                service
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.name.as_deref())
                    .is_some_and(|n| n.contains(name))
            })
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn replicas(&self, name: &str) -> Result<u64> {
        let service = self.find_service(name).await?;
        let replicas = service
            .spec
            .and_then(|spec| spec.mode)
            .and_then(|mode| mode.replicated)
            .and_then(|replicated| replicated.replicas)
            .ok_or_else(|| Error::InvalidServiceSpec(name.to_string()))?;
        Ok(replicas as u64)
    }

    async fn scale(&self, name: &str, replicas: u64) -> Result<()> {
        let service = self.find_service(name).await?;
        let id = service
            .id
            .ok_or_else(|| Error::InvalidServiceSpec(name.to_string()))?;
        let version = service
            .version
            .and_then(|version| version.index)
            .ok_or_else(|| Error::InvalidServiceSpec(name.to_string()))?;
        let mut spec = service
            .spec
            .ok_or_else(|| Error::InvalidServiceSpec(name.to_string()))?;

        let mut mode = spec.mode.unwrap_or_default();
        let mut replicated = mode.replicated.unwrap_or_default();
        replicated.replicas = Some(replicas as i64);
        mode.replicated = Some(replicated);
        spec.mode = Some(mode);

        let response = self
            .docker
            .update_service(
                &id,
                spec,
                UpdateServiceOptions {
                    version,
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|e| Error::Orchestrator(e.to_string()))?;

        if let Some(warnings) = response.warnings {
            for warning in warnings {
                warn!(%warning, "service update warning");
            }
        }
        info!(service = %id, replicas, "scaled service");
        Ok(())
    }
}
