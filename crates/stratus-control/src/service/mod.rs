//! Control plane and step metadata interfaces.
//!
//! The cluster lifecycle only talks to the outside world through
//! [`ControlService`] and [`StepMetadataStore`]. [`HttpControlService`] speaks
//! to a REST control plane; [`MemoryControlService`] keeps everything in
//! process and is used by tests and the `memory` backend.

mod http;
mod memory;

pub use http::HttpControlService;
pub use memory::{MemoryControlService, MemoryControlServiceBuilder};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ControlBackend, ControlConfig};
use crate::error::ControlResult;
use crate::types::{
    ClusterDescription, ClusterId, ClusterSpec, StepIndex, StepKey, StepMetadata, StepSpec,
    StepStatus,
};

/// Operations offered by the cluster control plane.
///
/// Any call may fail with [`crate::ControlError::Throttled`].
#[async_trait]
pub trait ControlService: Send + Sync {
    /// Request a new cluster. Fails with `NameCollision` if a live cluster
    /// already carries the name.
    async fn create(&self, spec: &ClusterSpec) -> ControlResult<ClusterId>;

    /// Describe one cluster.
    async fn describe(&self, id: &ClusterId) -> ControlResult<ClusterDescription>;

    /// Describe several clusters in one round trip.
    ///
    /// Clusters the control plane no longer knows are omitted from the result.
    async fn describe_all(&self, ids: &[ClusterId]) -> ControlResult<Vec<ClusterDescription>> {
        let mut descriptions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.describe(id).await {
                Ok(description) => descriptions.push(description),
                Err(crate::ControlError::ClusterNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(descriptions)
    }

    /// Identifiers of live clusters carrying `name`.
    async fn list_by_name(&self, name: &str) -> ControlResult<Vec<ClusterId>>;

    /// Submit a step; returns the ordinal the control plane assigned.
    async fn add_step(&self, id: &ClusterId, spec: &StepSpec) -> ControlResult<StepIndex>;

    /// Current status of a step.
    async fn describe_step(&self, id: &ClusterId, index: StepIndex) -> ControlResult<StepStatus>;

    /// Request termination of a cluster.
    async fn terminate(&self, id: &ClusterId) -> ControlResult<()>;
}

/// Store holding per-step debugging metadata written by step executions.
#[async_trait]
pub trait StepMetadataStore: Send + Sync {
    /// Metadata recorded for `key`; empty if nothing was written yet.
    async fn get(&self, key: &StepKey) -> ControlResult<StepMetadata>;
}

/// Create the control service and metadata store selected by configuration.
pub fn create_control_service(
    config: &ControlConfig,
) -> ControlResult<(Arc<dyn ControlService>, Arc<dyn StepMetadataStore>)> {
    match config.backend {
        ControlBackend::Http => {
            let service = Arc::new(HttpControlService::new(config)?);
            let control: Arc<dyn ControlService> = service.clone();
            let metadata: Arc<dyn StepMetadataStore> = service;
            Ok((control, metadata))
        }
        ControlBackend::Memory => {
            let service = Arc::new(MemoryControlService::new());
            let control: Arc<dyn ControlService> = service.clone();
            let metadata: Arc<dyn StepMetadataStore> = service;
            Ok((control, metadata))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::ResourceState;

    #[tokio::test]
    async fn memory_backend_from_config() {
        let config = ControlConfig {
            backend: ControlBackend::Memory,
            ..ControlConfig::default()
        };
        let (control, _metadata) = create_control_service(&config).unwrap();
        let spec = ClusterSpec::new("etl").with_log_uri("s3://logs");
        let id = control.create(&spec).await.unwrap();
        let description = control.describe(&id).await.unwrap();
        assert_eq!(description.name, "etl");
        assert_ne!(description.state, ResourceState::Terminated);
    }

    #[tokio::test]
    async fn describe_all_skips_unknown_clusters() {
        let control = MemoryControlService::new();
        let spec = ClusterSpec::new("etl").with_log_uri("s3://logs");
        let id = control.create(&spec).await.unwrap();

        let found = control
            .describe_all(&[id.clone(), ClusterId::new("c-missing")])
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
    }
}
