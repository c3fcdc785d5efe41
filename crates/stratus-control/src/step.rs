//! Handles to steps submitted to a connected cluster.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::error::{ControlError, ControlResult};
use crate::service::{ControlService, StepMetadataStore};
use crate::throttle::ThrottleGuard;
use crate::types::{StepIndex, StepKey, StepMetadata, StepSpec, StepStatus};

struct StepInner {
    key: StepKey,
    spec: StepSpec,
    status: watch::Sender<StepStatus>,
    cached_metadata: Mutex<Option<StepMetadata>>,
    control: Arc<dyn ControlService>,
    metadata: Arc<dyn StepMetadataStore>,
    throttle: Arc<ThrottleGuard>,
    poll_interval: Duration,
}

/// A step submitted through [`crate::Cluster::submit_step`].
///
/// Clones share the last observed status with each other and with the
/// owning cluster's step list.
#[derive(Clone)]
pub struct StepHandle {
    inner: Arc<StepInner>,
}

impl std::fmt::Debug for StepHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepHandle")
            .field("key", &self.inner.key)
            .field("name", &self.inner.spec.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl StepHandle {
    pub(crate) fn new(
        key: StepKey,
        spec: StepSpec,
        control: Arc<dyn ControlService>,
        metadata: Arc<dyn StepMetadataStore>,
        throttle: Arc<ThrottleGuard>,
        poll_interval: Duration,
    ) -> Self {
        let (status, _) = watch::channel(StepStatus::Pending);
        Self {
            inner: Arc::new(StepInner {
                key,
                spec,
                status,
                cached_metadata: Mutex::new(None),
                control,
                metadata,
                throttle,
                poll_interval,
            }),
        }
    }

    /// Ordinal assigned by the control plane.
    #[must_use]
    pub fn index(&self) -> StepIndex {
        self.inner.key.index
    }

    /// Step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    /// Composite identity of the step.
    #[must_use]
    pub fn key(&self) -> &StepKey {
        &self.inner.key
    }

    /// Specification the step was submitted with.
    #[must_use]
    pub fn spec(&self) -> &StepSpec {
        &self.inner.spec
    }

    /// Last observed status.
    #[must_use]
    pub fn status(&self) -> StepStatus {
        *self.inner.status.borrow()
    }

    /// Watch status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StepStatus> {
        self.inner.status.subscribe()
    }

    /// Reload the status from the control plane unless it is already terminal.
    pub async fn refresh(&self) -> ControlResult<StepStatus> {
        let current = self.status();
        if current.is_terminal() {
            return Ok(current);
        }

        let key = &self.inner.key;
        let status = self
            .inner
            .throttle
            .call("describe_step", || {
                self.inner.control.describe_step(&key.cluster, key.index)
            })
            .await?;

        if status != current {
            info!(
                cluster_id = %key.cluster,
                step_index = key.index.get(),
                step = %self.inner.spec.name,
                from = %current,
                to = %status,
                "step status changed"
            );
            self.inner.status.send_replace(status);
        }
        Ok(status)
    }

    /// Wait until the step finishes.
    ///
    /// There is no deadline; the step is reloaded every poll interval until
    /// it is terminal.
    ///
    /// # Errors
    ///
    /// [`ControlError::StepFailed`] if the step finished as failed, or any
    /// error from reloading its status.
    pub async fn join(&self) -> ControlResult<()> {
        let mut status = self.status();
        while !status.is_terminal() {
            debug!(
                step = %self.inner.key,
                sleep_ms = self.inner.poll_interval.as_millis(),
                "waiting for step to finish"
            );
            tokio::time::sleep(self.inner.poll_interval).await;
            status = self.refresh().await?;
        }

        match status {
            StepStatus::Failed => Err(ControlError::StepFailed {
                cluster: self.inner.key.cluster.clone(),
                index: self.inner.key.index,
                name: self.inner.spec.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Debugging metadata recorded for the step.
    ///
    /// The first non-empty result is cached and returned by every later call.
    /// Metadata is written asynchronously by the step execution, so a call
    /// right after [`join`](Self::join) may see an empty mapping; that result
    /// is not cached and the next call fetches again.
    pub async fn metadata(&self) -> ControlResult<StepMetadata> {
        let mut cached = self.inner.cached_metadata.lock().await;
        if let Some(metadata) = cached.as_ref() {
            return Ok(metadata.clone());
        }

        let metadata = self.inner.metadata.get(&self.inner.key).await?;
        if metadata.is_empty() {
            debug!(step = %self.inner.key, "step metadata not written yet");
        } else {
            debug!(step = %self.inner.key, entries = metadata.len(), "cached step metadata");
            *cached = Some(metadata.clone());
        }
        Ok(metadata)
    }
}
