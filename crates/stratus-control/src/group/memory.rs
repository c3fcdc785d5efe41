//! In-process instance provider.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};

use super::{InstanceDescription, InstanceId, InstanceService, InstanceState, LaunchConfig};

#[derive(Debug)]
struct InstanceRecord {
    description: InstanceDescription,
    describes: u32,
}

#[derive(Debug, Default)]
struct Inner {
    instances: BTreeMap<InstanceId, InstanceRecord>,
    next_instance: u32,
    next_reservation: u32,
}

/// In-memory [`InstanceService`].
///
/// Launched instances report `pending` until they were described
/// `running_after` times, then `running` with an address. Stopping and
/// terminating instances settle on the next describe.
#[derive(Debug)]
pub struct MemoryInstanceService {
    running_after: u32,
    inner: Mutex<Inner>,
}

impl Default for MemoryInstanceService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInstanceService {
    /// Instances run from their second describe on.
    #[must_use]
    pub fn new() -> Self {
        Self::with_running_after(2)
    }

    /// Instances run once described `describes` times.
    #[must_use]
    pub fn with_running_after(describes: u32) -> Self {
        Self {
            running_after: describes,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Current state of an instance, without advancing it.
    pub fn state_of(&self, id: &InstanceId) -> Option<InstanceState> {
        self.inner
            .lock()
            .ok()?
            .instances
            .get(id)
            .map(|r| r.description.state)
    }

    fn lock(&self) -> ControlResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn advance(&self, record: &mut InstanceRecord) {
        record.describes += 1;
        let description = &mut record.description;
        description.state = match description.state {
            InstanceState::Pending if record.describes >= self.running_after => {
                description.public_address =
                    Some(format!("10.0.0.{}", description.launch_index + 10));
                InstanceState::Running
            }
            InstanceState::Stopping => InstanceState::Stopped,
            InstanceState::ShuttingDown => {
                description.public_address = None;
                InstanceState::Terminated
            }
            other => other,
        };
    }

    fn transition(&self, ids: &[InstanceId], to: InstanceState) -> ControlResult<()> {
        let mut inner = self.lock()?;
        for id in ids {
            let record = inner
                .instances
                .get_mut(id)
                .ok_or_else(|| ControlError::service(format!("unknown instance {id}")))?;
            if record.description.state != InstanceState::Terminated {
                record.description.state = to;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceService for MemoryInstanceService {
    async fn run_instances(&self, config: &LaunchConfig) -> ControlResult<Vec<InstanceId>> {
        let mut inner = self.lock()?;
        inner.next_reservation += 1;
        let reservation = format!("r-{:04}", inner.next_reservation);

        let mut ids = Vec::new();
        for launch_index in 0..config.count {
            inner.next_instance += 1;
            let id = InstanceId::new(format!("i-{:06}", inner.next_instance));
            inner.instances.insert(
                id.clone(),
                InstanceRecord {
                    description: InstanceDescription {
                        id: id.clone(),
                        group: config.group.clone(),
                        reservation: reservation.clone(),
                        launch_index,
                        state: InstanceState::Pending,
                        public_address: None,
                    },
                    describes: 0,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn describe_instances(
        &self,
        ids: &[InstanceId],
    ) -> ControlResult<Vec<InstanceDescription>> {
        let mut inner = self.lock()?;
        let mut descriptions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = inner.instances.get_mut(id) {
                self.advance(record);
                descriptions.push(record.description.clone());
            }
        }
        Ok(descriptions)
    }

    async fn find_by_group(&self, group: &str) -> ControlResult<Vec<InstanceDescription>> {
        let inner = self.lock()?;
        Ok(inner
            .instances
            .values()
            .filter(|r| r.description.group == group && r.description.state.is_live())
            .map(|r| r.description.clone())
            .collect())
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> ControlResult<()> {
        self.transition(ids, InstanceState::ShuttingDown)
    }

    async fn stop_instances(&self, ids: &[InstanceId]) -> ControlResult<()> {
        self.transition(ids, InstanceState::Stopping)
    }
}
