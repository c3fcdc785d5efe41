//! In-process control plane.
//!
//! Clusters and steps advance through their states as they are described,
//! which lets tests script convergence precisely without real time passing.
//! This implementation is not suitable for production use as all state is
//! lost when the process exits.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::types::{
    ClusterDescription, ClusterId, ClusterSpec, ResourceState, StepIndex, StepKey, StepMetadata,
    StepSpec, StepStatus,
};

use super::{ControlService, StepMetadataStore};

/// Name of the step the control plane inserts when debugging is enabled.
pub const DEBUGGING_STEP_NAME: &str = "Setup debugging";

#[derive(Debug, Clone)]
struct Settings {
    initializing_after: u32,
    ready_after: u32,
    address_delay: u32,
    step_running_after: u32,
    step_done_after: u32,
    metadata_lag: u32,
    failing_steps: HashSet<String>,
    failing_clusters: HashSet<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            initializing_after: 2,
            ready_after: 3,
            address_delay: 0,
            step_running_after: 1,
            step_done_after: 2,
            metadata_lag: 0,
            failing_steps: HashSet::new(),
            failing_clusters: HashSet::new(),
        }
    }
}

#[derive(Debug)]
struct ClusterRecord {
    description: ClusterDescription,
    spec: ClusterSpec,
    describes: u32,
    scripted: bool,
    steps: Vec<StepRecord>,
}

#[derive(Debug)]
struct StepRecord {
    name: String,
    status: StepStatus,
    describes: u32,
}

#[derive(Debug)]
struct PendingMetadata {
    metadata: StepMetadata,
    hidden_reads: u32,
}

#[derive(Debug, Default)]
struct Inner {
    clusters: BTreeMap<ClusterId, ClusterRecord>,
    metadata: HashMap<StepKey, PendingMetadata>,
    throttle_budget: u32,
    calls: HashMap<&'static str, u32>,
}

/// In-memory [`ControlService`] and [`StepMetadataStore`].
#[derive(Debug)]
pub struct MemoryControlService {
    settings: Settings,
    inner: Mutex<Inner>,
}

/// Builder for [`MemoryControlService`].
#[derive(Debug, Default)]
pub struct MemoryControlServiceBuilder {
    settings: Settings,
}

impl MemoryControlServiceBuilder {
    /// Number of describes after which a new cluster reports `initializing`.
    #[must_use]
    pub const fn initializing_after(mut self, describes: u32) -> Self {
        self.settings.initializing_after = describes;
        self
    }

    /// Number of describes after which a new cluster reports `ready`.
    #[must_use]
    pub const fn ready_after(mut self, describes: u32) -> Self {
        self.settings.ready_after = describes;
        self
    }

    /// Extra describes a ready cluster reports no address for.
    #[must_use]
    pub const fn address_delay(mut self, describes: u32) -> Self {
        self.settings.address_delay = describes;
        self
    }

    /// Step status progression: `running` after `running_after` describes,
    /// terminal after `done_after` describes.
    #[must_use]
    pub const fn step_progress(mut self, running_after: u32, done_after: u32) -> Self {
        self.settings.step_running_after = running_after;
        self.settings.step_done_after = done_after;
        self
    }

    /// Reads of a step's metadata that still return nothing after it succeeded.
    #[must_use]
    pub const fn metadata_lag(mut self, reads: u32) -> Self {
        self.settings.metadata_lag = reads;
        self
    }

    /// Steps with this name finish as failed.
    #[must_use]
    pub fn failing_step(mut self, name: impl Into<String>) -> Self {
        self.settings.failing_steps.insert(name.into());
        self
    }

    /// Clusters with this name end in `failed` instead of `ready`.
    #[must_use]
    pub fn failing_cluster(mut self, name: impl Into<String>) -> Self {
        self.settings.failing_clusters.insert(name.into());
        self
    }

    /// Build the service.
    #[must_use]
    pub fn build(self) -> MemoryControlService {
        MemoryControlService {
            settings: self.settings,
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryControlService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryControlService {
    /// Create a service with default progression.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a service.
    #[must_use]
    pub fn builder() -> MemoryControlServiceBuilder {
        MemoryControlServiceBuilder::default()
    }

    /// Reject the next `calls` calls, of any kind, with a throttling error.
    pub fn throttle_next(&self, calls: u32) -> ControlResult<()> {
        self.lock()?.throttle_budget = calls;
        Ok(())
    }

    /// Number of calls made for an operation (`create`, `describe`,
    /// `list_by_name`, `add_step`, `describe_step`, `terminate`,
    /// `metadata`), throttled attempts included.
    pub fn call_count(&self, operation: &str) -> u32 {
        self.lock()
            .map(|inner| inner.calls.get(operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Force a cluster into a state; it stops following its script.
    pub fn set_state(&self, id: &ClusterId, state: ResourceState) -> ControlResult<()> {
        let mut inner = self.lock()?;
        let record = inner
            .clusters
            .get_mut(id)
            .ok_or_else(|| ControlError::ClusterNotFound(id.to_string()))?;
        record.scripted = false;
        record.description.state = state;
        if state == ResourceState::Ready && record.description.address.is_none() {
            record.description.address = Some(address_for(id));
        }
        Ok(())
    }

    /// Number of live clusters with the given name.
    pub fn live_count(&self, name: &str) -> usize {
        self.lock()
            .map(|inner| {
                inner
                    .clusters
                    .values()
                    .filter(|r| r.description.name == name && r.description.state.is_live())
                    .count()
            })
            .unwrap_or(0)
    }

    fn lock(&self) -> ControlResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    /// Count the call and consume throttle budget.
    fn enter(&self, operation: &'static str) -> ControlResult<std::sync::MutexGuard<'_, Inner>> {
        let mut inner = self.lock()?;
        *inner.calls.entry(operation).or_insert(0) += 1;
        if inner.throttle_budget > 0 {
            inner.throttle_budget -= 1;
            debug!(operation, "memory control plane throttling call");
            return Err(ControlError::throttled(operation));
        }
        Ok(inner)
    }

    fn advance_cluster(settings: &Settings, record: &mut ClusterRecord) {
        record.describes += 1;
        let description = &mut record.description;
        match description.state {
            ResourceState::Terminating => {
                description.state = ResourceState::Terminated;
                return;
            }
            ResourceState::Creating | ResourceState::Initializing if record.scripted => {}
            ResourceState::Ready if record.scripted && description.address.is_none() => {}
            _ => return,
        }

        let n = record.describes;
        if n >= settings.ready_after {
            if settings.failing_clusters.contains(&description.name) {
                description.state = ResourceState::Failed;
                return;
            }
            description.state = ResourceState::Ready;
            if n >= settings.ready_after.saturating_add(settings.address_delay) {
                description.address = Some(address_for(&description.id));
            }
        } else if n >= settings.initializing_after {
            description.state = ResourceState::Initializing;
        }
    }

    fn advance_step(
        settings: &Settings,
        metadata: &mut HashMap<StepKey, PendingMetadata>,
        record: &mut ClusterRecord,
        index: StepIndex,
    ) -> ControlResult<StepStatus> {
        let cluster_id = record.description.id.clone();
        let debugging = record.spec.enable_debugging;
        let position = usize::try_from(index.get())
            .ok()
            .and_then(|i| i.checked_sub(1))
            .filter(|i| *i < record.steps.len())
            .ok_or_else(|| {
                ControlError::service(format!("cluster {cluster_id} has no step {index}"))
            })?;
        let step = &mut record.steps[position];

        if !step.status.is_terminal() {
            step.describes += 1;
            step.status = if step.describes >= settings.step_done_after {
                if settings.failing_steps.contains(&step.name) {
                    StepStatus::Failed
                } else {
                    StepStatus::Succeeded
                }
            } else if step.describes >= settings.step_running_after {
                StepStatus::Running
            } else {
                StepStatus::Pending
            };

            if step.status.is_terminal() && debugging {
                let mut recorded = StepMetadata::new();
                recorded.insert(StepMetadata::CLUSTER_ID, cluster_id.as_str());
                recorded.insert(StepMetadata::STEP_INDEX, index.to_string());
                recorded.insert(StepMetadata::STEP_NAME, step.name.clone());
                recorded.insert("status", step.status.as_str());
                metadata.insert(
                    StepKey::new(cluster_id, index),
                    PendingMetadata {
                        metadata: recorded,
                        hidden_reads: settings.metadata_lag,
                    },
                );
            }
        }
        Ok(step.status)
    }
}

fn address_for(id: &ClusterId) -> String {
    format!("{}.master.cluster.internal", id.as_str())
}

#[async_trait]
impl ControlService for MemoryControlService {
    async fn create(&self, spec: &ClusterSpec) -> ControlResult<ClusterId> {
        let mut inner = self.enter("create")?;

        let collides = inner
            .clusters
            .values()
            .any(|r| r.description.name == spec.name && r.description.state.is_live());
        if collides {
            return Err(ControlError::NameCollision {
                name: spec.name.clone(),
            });
        }

        let id = ClusterId::generate();
        let mut steps = Vec::new();
        if spec.enable_debugging {
            steps.push(StepRecord {
                name: DEBUGGING_STEP_NAME.to_owned(),
                status: StepStatus::Succeeded,
                describes: 0,
            });
        }

        let mut attributes = BTreeMap::new();
        attributes.insert("instance_count".to_owned(), spec.instance_count.to_string());
        attributes.insert(
            "master_instance_type".to_owned(),
            spec.master_instance_type.clone(),
        );

        let record = ClusterRecord {
            description: ClusterDescription {
                id: id.clone(),
                name: spec.name.clone(),
                state: ResourceState::Creating,
                address: None,
                attributes,
                created_at: Utc::now(),
            },
            spec: spec.clone(),
            describes: 0,
            scripted: true,
            steps,
        };
        inner.clusters.insert(id.clone(), record);
        debug!(cluster_id = %id, name = %spec.name, "memory control plane created cluster");
        Ok(id)
    }

    async fn describe(&self, id: &ClusterId) -> ControlResult<ClusterDescription> {
        let mut inner = self.enter("describe")?;
        let record = inner
            .clusters
            .get_mut(id)
            .ok_or_else(|| ControlError::ClusterNotFound(id.to_string()))?;
        Self::advance_cluster(&self.settings, record);
        Ok(record.description.clone())
    }

    async fn describe_all(&self, ids: &[ClusterId]) -> ControlResult<Vec<ClusterDescription>> {
        let mut inner = self.enter("describe")?;
        let mut descriptions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = inner.clusters.get_mut(id) {
                Self::advance_cluster(&self.settings, record);
                descriptions.push(record.description.clone());
            }
        }
        Ok(descriptions)
    }

    async fn list_by_name(&self, name: &str) -> ControlResult<Vec<ClusterId>> {
        let inner = self.enter("list_by_name")?;
        Ok(inner
            .clusters
            .values()
            .filter(|r| r.description.name == name && r.description.state.is_live())
            .map(|r| r.description.id.clone())
            .collect())
    }

    async fn add_step(&self, id: &ClusterId, spec: &StepSpec) -> ControlResult<StepIndex> {
        let mut inner = self.enter("add_step")?;
        let record = inner
            .clusters
            .get_mut(id)
            .ok_or_else(|| ControlError::ClusterNotFound(id.to_string()))?;
        if record.description.state != ResourceState::Ready {
            return Err(ControlError::service(format!(
                "cluster {id} does not accept steps in state '{}'",
                record.description.state
            )));
        }
        record.steps.push(StepRecord {
            name: spec.name.clone(),
            status: StepStatus::Pending,
            describes: 0,
        });
        let index = u32::try_from(record.steps.len())
            .map_err(|_| ControlError::internal("step count overflow"))?;
        Ok(StepIndex::new(index))
    }

    async fn describe_step(&self, id: &ClusterId, index: StepIndex) -> ControlResult<StepStatus> {
        let mut guard = self.enter("describe_step")?;
        let inner = &mut *guard;
        let record = inner
            .clusters
            .get_mut(id)
            .ok_or_else(|| ControlError::ClusterNotFound(id.to_string()))?;
        Self::advance_step(&self.settings, &mut inner.metadata, record, index)
    }

    async fn terminate(&self, id: &ClusterId) -> ControlResult<()> {
        let mut inner = self.enter("terminate")?;
        let record = inner
            .clusters
            .get_mut(id)
            .ok_or_else(|| ControlError::ClusterNotFound(id.to_string()))?;
        if record.description.state.is_live() || record.description.state == ResourceState::Failed
        {
            record.scripted = false;
            record.description.state = ResourceState::Terminating;
        }
        Ok(())
    }
}

#[async_trait]
impl StepMetadataStore for MemoryControlService {
    async fn get(&self, key: &StepKey) -> ControlResult<StepMetadata> {
        let mut inner = self.enter("metadata")?;
        match inner.metadata.get_mut(key) {
            Some(pending) if pending.hidden_reads > 0 => {
                pending.hidden_reads -= 1;
                Ok(StepMetadata::new())
            }
            Some(pending) => Ok(pending.metadata.clone()),
            None => Ok(StepMetadata::new()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ClusterSpec {
        ClusterSpec::new(name).with_log_uri("s3://logs")
    }

    #[tokio::test]
    async fn cluster_follows_script() {
        let control = MemoryControlService::builder()
            .initializing_after(2)
            .ready_after(3)
            .build();
        let id = control.create(&spec("etl")).await.unwrap();

        let states: Vec<ResourceState> = [
            control.describe(&id).await.unwrap(),
            control.describe(&id).await.unwrap(),
            control.describe(&id).await.unwrap(),
        ]
        .into_iter()
        .map(|d| d.state)
        .collect();

        assert_eq!(
            states,
            vec![
                ResourceState::Creating,
                ResourceState::Initializing,
                ResourceState::Ready
            ]
        );
    }

    #[tokio::test]
    async fn address_can_lag_behind_ready() {
        let control = MemoryControlService::builder()
            .ready_after(1)
            .address_delay(1)
            .build();
        let id = control.create(&spec("etl")).await.unwrap();

        let first = control.describe(&id).await.unwrap();
        assert_eq!(first.state, ResourceState::Ready);
        assert!(first.address.is_none());

        let second = control.describe(&id).await.unwrap();
        assert!(second.address.is_some());
    }

    #[tokio::test]
    async fn duplicate_live_name_collides() {
        let control = MemoryControlService::new();
        control.create(&spec("etl")).await.unwrap();
        let err = control.create(&spec("etl")).await.unwrap_err();
        assert!(matches!(err, ControlError::NameCollision { .. }));
    }

    #[tokio::test]
    async fn terminated_clusters_free_their_name() {
        let control = MemoryControlService::new();
        let id = control.create(&spec("etl")).await.unwrap();
        control.terminate(&id).await.unwrap();

        assert!(control.list_by_name("etl").await.unwrap().is_empty());
        assert!(control.create(&spec("etl")).await.is_ok());
        assert_eq!(
            control.describe(&id).await.unwrap().state,
            ResourceState::Terminated
        );
    }

    #[tokio::test]
    async fn debugging_step_takes_first_ordinal() {
        let control = MemoryControlService::builder().ready_after(1).build();
        let id = control.create(&spec("etl")).await.unwrap();
        control.describe(&id).await.unwrap();

        let step = StepSpec::new("wc", "jar", "main", "in", "out");
        let index = control.add_step(&id, &step).await.unwrap();
        assert_eq!(index, StepIndex::new(2));
    }

    #[tokio::test]
    async fn steps_rejected_until_ready() {
        let control = MemoryControlService::new();
        let id = control.create(&spec("etl")).await.unwrap();
        let step = StepSpec::new("wc", "jar", "main", "in", "out");
        assert!(matches!(
            control.add_step(&id, &step).await,
            Err(ControlError::Service(_))
        ));
    }

    #[tokio::test]
    async fn throttle_budget_is_consumed() {
        let control = MemoryControlService::new();
        control.throttle_next(2).unwrap();
        assert!(control.list_by_name("x").await.unwrap_err().is_throttling());
        assert!(control.list_by_name("x").await.unwrap_err().is_throttling());
        assert!(control.list_by_name("x").await.is_ok());
        assert_eq!(control.call_count("list_by_name"), 3);
    }

    #[tokio::test]
    async fn metadata_appears_after_lag() {
        let control = MemoryControlService::builder()
            .ready_after(1)
            .step_progress(1, 1)
            .metadata_lag(1)
            .build();
        let id = control.create(&spec("etl")).await.unwrap();
        control.describe(&id).await.unwrap();
        let index = control
            .add_step(&id, &StepSpec::new("wc", "jar", "main", "in", "out"))
            .await
            .unwrap();
        assert_eq!(
            control.describe_step(&id, index).await.unwrap(),
            StepStatus::Succeeded
        );

        let key = StepKey::new(id.clone(), index);
        assert!(control.get(&key).await.unwrap().is_empty());
        let metadata = control.get(&key).await.unwrap();
        assert_eq!(metadata.get(StepMetadata::CLUSTER_ID), Some(id.as_str()));
        assert_eq!(metadata.get(StepMetadata::STEP_NAME), Some("wc"));
    }
}
