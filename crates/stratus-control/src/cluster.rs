//! Cluster lifecycle.
//!
//! A [`Cluster`] is a process-local view of one named cluster resource on the
//! control plane. It moves between [`ClusterState::Unconnected`],
//! [`ClusterState::Starting`] and [`ClusterState::Connected`], and never
//! trusts its own identity across instances: two views sharing a name are
//! reconciled independently through [`Cluster::synchronize_state`].
//!
//! State-changing operations are serialised per instance. Readers observe
//! every transition through a watch channel, including while an operation is
//! in flight.

use std::sync::{Arc, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{StratusConfig, ThrottleConfig};
use crate::error::{ControlError, ControlResult};
use crate::poller::{ControlPollSource, ConvergenceTarget, StatePoller};
use crate::service::{create_control_service, ControlService, StepMetadataStore};
use crate::step::StepHandle;
use crate::throttle::ThrottleGuard;
use crate::types::{ClusterId, ClusterSpec, ClusterState, ResourceState, StepKey, StepSpec};

/// States a new cluster may pass through before it is ready.
const STARTUP_STATES: &[ResourceState] = &[ResourceState::Creating, ResourceState::Initializing];

/// Timing and throttling settings for a [`Cluster`].
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Throttling of control plane calls made by this cluster.
    pub throttle: ThrottleConfig,
    /// Sleep between two reloads while starting.
    pub poll_interval: Duration,
    /// How long `start` waits for the cluster to become ready.
    pub startup_timeout: Duration,
    /// Sleep between two step status reloads.
    pub step_poll_interval: Duration,
}

impl From<&StratusConfig> for ClusterOptions {
    fn from(config: &StratusConfig) -> Self {
        Self {
            throttle: config.throttle.clone(),
            poll_interval: config.poller.poll_interval(),
            startup_timeout: config.poller.startup_timeout(),
            step_poll_interval: config.steps.poll_interval(),
        }
    }
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self::from(&StratusConfig::default())
    }
}

/// What readers see of a cluster: its state and identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSnapshot {
    /// Lifecycle state.
    pub state: ClusterState,
    /// External identity; only present while connected.
    pub id: Option<ClusterId>,
}

/// Lifecycle state machine for one named cluster.
pub struct Cluster {
    spec: RwLock<ClusterSpec>,
    control: Arc<dyn ControlService>,
    metadata: Arc<dyn StepMetadataStore>,
    throttle: Arc<ThrottleGuard>,
    poller: StatePoller,
    startup_timeout: Duration,
    step_poll_interval: Duration,
    snapshot: watch::Sender<ClusterSnapshot>,
    steps: std::sync::Mutex<Vec<StepHandle>>,
    operation: Mutex<()>,
}

/// Puts a cluster back to `Unconnected` unless `start` reached the end.
///
/// Covers both error returns and a `start` future dropped mid-flight.
struct StartGuard<'a> {
    cluster: &'a Cluster,
    id: Option<ClusterId>,
    armed: bool,
}

impl<'a> StartGuard<'a> {
    fn new(cluster: &'a Cluster) -> Self {
        Self {
            cluster,
            id: None,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cluster.publish(ClusterState::Unconnected, None);
        if let Some(id) = &self.id {
            warn!(
                cluster = %self.cluster.name(),
                cluster_id = %id,
                "abandoning cluster that did not finish starting"
            );
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name())
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Create an unconnected view of the cluster described by `spec`.
    #[must_use]
    pub fn new(
        spec: ClusterSpec,
        control: Arc<dyn ControlService>,
        metadata: Arc<dyn StepMetadataStore>,
        options: ClusterOptions,
    ) -> Self {
        let (snapshot, _) = watch::channel(ClusterSnapshot::default());
        Self {
            spec: RwLock::new(spec),
            control,
            metadata,
            throttle: Arc::new(ThrottleGuard::new(&options.throttle)),
            poller: StatePoller::new(options.poll_interval),
            startup_timeout: options.startup_timeout,
            step_poll_interval: options.step_poll_interval,
            snapshot,
            steps: std::sync::Mutex::new(Vec::new()),
            operation: Mutex::new(()),
        }
    }

    /// Create a cluster wired to the control plane selected by `config`.
    pub fn from_config(spec: ClusterSpec, config: &StratusConfig) -> ControlResult<Self> {
        let (control, metadata) = create_control_service(&config.control)?;
        Ok(Self::new(
            spec,
            control,
            metadata,
            ClusterOptions::from(config),
        ))
    }

    /// Configured cluster name.
    #[must_use]
    pub fn name(&self) -> String {
        self.spec_guard().name.clone()
    }

    /// Specification used by [`start`](Self::start).
    #[must_use]
    pub fn spec(&self) -> ClusterSpec {
        self.spec_guard().clone()
    }

    /// Rename the cluster. Only allowed while unconnected.
    pub async fn set_name(&self, name: impl Into<String>) -> ControlResult<()> {
        let _operation = self.operation.lock().await;
        self.require(ClusterState::Unconnected, "rename")?;
        let name = name.into();
        debug!(from = %self.name(), to = %name, "renaming cluster");
        self.spec
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .name = name;
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClusterState {
        self.snapshot.borrow().state
    }

    /// Current external identity, if connected.
    #[must_use]
    pub fn cluster_id(&self) -> Option<ClusterId> {
        self.snapshot.borrow().id.clone()
    }

    /// State and identity as one consistent value.
    #[must_use]
    pub fn snapshot(&self) -> ClusterSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClusterSnapshot> {
        self.snapshot.subscribe()
    }

    /// Throttle guard shared by every control plane call of this cluster.
    #[must_use]
    pub fn throttle(&self) -> &ThrottleGuard {
        &self.throttle
    }

    /// Steps submitted through this instance, in control plane order.
    #[must_use]
    pub fn steps(&self) -> Vec<StepHandle> {
        self.step_list().clone()
    }

    /// Create the cluster and wait until it is ready.
    ///
    /// # Errors
    ///
    /// [`ControlError::NameCollision`] if a live cluster already has this
    /// name; [`ControlError::TransitionTimeout`] or
    /// [`ControlError::UnexpectedState`] if the new cluster does not become
    /// ready. The instance is left unconnected on every error.
    pub async fn start(&self) -> ControlResult<()> {
        let _operation = self.operation.lock().await;
        self.require(ClusterState::Unconnected, "start")?;

        let spec = self.spec();
        spec.validate()?;

        self.publish(ClusterState::Starting, None);
        let mut starting = StartGuard::new(self);
        info!(cluster = %spec.name, instances = spec.instance_count, "starting cluster");

        let id = self
            .throttle
            .call("create", || self.control.create(&spec))
            .await
            .inspect_err(|e| {
                warn!(cluster = %spec.name, error = %e, "cluster create request failed");
            })?;
        starting.id = Some(id.clone());
        info!(cluster = %spec.name, cluster_id = %id, "cluster requested, waiting until ready");

        let source = ControlPollSource::new(self.control.as_ref(), &self.throttle);
        self.poller
            .wait_for(
                &source,
                std::slice::from_ref(&id),
                STARTUP_STATES,
                ConvergenceTarget::with_address(ResourceState::Ready),
                self.startup_timeout,
            )
            .await
            .inspect_err(|e| {
                warn!(
                    cluster = %spec.name,
                    cluster_id = %id,
                    error = %e,
                    "cluster did not become ready"
                );
            })?;

        starting.disarm();
        self.connected(id.clone());
        info!(cluster = %spec.name, cluster_id = %id, "cluster connected");
        Ok(())
    }

    /// Connect to an existing cluster by identity.
    ///
    /// # Errors
    ///
    /// [`ControlError::ClusterNotFound`] if the control plane does not know
    /// `id`; [`ControlError::NotConnectable`] if the cluster is not ready.
    pub async fn connect_by_id(&self, id: &ClusterId) -> ControlResult<()> {
        let _operation = self.operation.lock().await;
        self.require(ClusterState::Unconnected, "connect")?;
        self.attach(id).await
    }

    /// Connect to the single live cluster carrying the configured name.
    ///
    /// # Errors
    ///
    /// [`ControlError::AmbiguousName`] unless exactly one cluster matches;
    /// otherwise as [`connect_by_id`](Self::connect_by_id).
    pub async fn connect_by_name(&self) -> ControlResult<()> {
        let _operation = self.operation.lock().await;
        self.require(ClusterState::Unconnected, "connect")?;

        let name = self.name();
        let mut matches = self.lookup(&name).await?;
        if matches.len() != 1 {
            return Err(ambiguous(name, &matches));
        }
        let id = matches.remove(0);
        self.attach(&id).await
    }

    /// Forget the identity without touching the external cluster.
    pub async fn disconnect(&self) -> ControlResult<()> {
        let _operation = self.operation.lock().await;
        self.require(ClusterState::Connected, "disconnect")?;
        let id = self.cluster_id();
        self.publish(ClusterState::Unconnected, None);
        info!(
            cluster = %self.name(),
            cluster_id = ?id.as_ref().map(ClusterId::as_str),
            "cluster disconnected"
        );
        Ok(())
    }

    /// Re-derive state and identity from the control plane by name.
    ///
    /// One match connects to it, no match leaves the instance unconnected.
    ///
    /// # Errors
    ///
    /// [`ControlError::AmbiguousName`] when several live clusters carry the
    /// name; the local state is left unchanged.
    pub async fn synchronize_state(&self) -> ControlResult<()> {
        let _operation = self.operation.lock().await;
        let name = self.name();
        let previous = self.snapshot();
        let mut matches = self.lookup(&name).await?;

        match matches.len() {
            0 => {
                self.publish(ClusterState::Unconnected, None);
                info!(
                    cluster = %name,
                    previous = %previous.state,
                    "no live cluster found, now unconnected"
                );
            }
            1 => {
                let id = matches.remove(0);
                if previous.id.as_ref() != Some(&id) {
                    info!(cluster = %name, cluster_id = %id, "synchronized onto cluster");
                }
                self.connected(id);
            }
            _ => return Err(ambiguous(name, &matches)),
        }
        Ok(())
    }

    /// Wait until idle, then terminate the cluster this instance is bound to.
    ///
    /// Only this instance's own identity is ever terminated. The call returns
    /// once the terminate request is accepted.
    pub async fn shutdown(&self) -> ControlResult<()> {
        let _operation = self.operation.lock().await;
        self.require(ClusterState::Connected, "shut down")?;
        let id = self
            .cluster_id()
            .ok_or_else(|| ControlError::internal("connected cluster without identity"))?;

        self.wait_until_idle().await?;

        info!(cluster = %self.name(), cluster_id = %id, "terminating cluster");
        self.throttle
            .call("terminate", || self.control.terminate(&id))
            .await?;

        self.publish(ClusterState::Unconnected, None);
        self.step_list().clear();
        info!(cluster = %self.name(), cluster_id = %id, "cluster shut down");
        Ok(())
    }

    /// Whether no known step is pending or running.
    ///
    /// Reloads the status of every unfinished step first.
    pub async fn is_idle(&self) -> ControlResult<bool> {
        let unfinished: Vec<StepHandle> = self
            .steps()
            .into_iter()
            .filter(|s| !s.status().is_terminal())
            .collect();

        let mut idle = true;
        for step in unfinished {
            if !step.refresh().await?.is_terminal() {
                idle = false;
            }
        }
        Ok(idle)
    }

    /// Block until [`is_idle`](Self::is_idle) holds.
    pub async fn wait_until_idle(&self) -> ControlResult<()> {
        while !self.is_idle().await? {
            debug!(
                cluster = %self.name(),
                sleep_ms = self.step_poll_interval.as_millis(),
                "waiting for steps to finish"
            );
            tokio::time::sleep(self.step_poll_interval).await;
        }
        Ok(())
    }

    /// Submit a step; returns once the control plane accepted it.
    ///
    /// # Errors
    ///
    /// [`ControlError::Config`] for an invalid step and
    /// [`ControlError::InvalidStateTransition`] unless connected.
    pub async fn submit_step(&self, spec: StepSpec) -> ControlResult<StepHandle> {
        spec.validate()?;
        let _operation = self.operation.lock().await;
        self.require(ClusterState::Connected, "submit a step")?;
        let id = self
            .cluster_id()
            .ok_or_else(|| ControlError::internal("connected cluster without identity"))?;

        let index = self
            .throttle
            .call("add_step", || self.control.add_step(&id, &spec))
            .await?;
        info!(
            cluster_id = %id,
            step_index = index.get(),
            step = %spec.name,
            "step submitted"
        );

        let handle = StepHandle::new(
            StepKey::new(id, index),
            spec,
            Arc::clone(&self.control),
            Arc::clone(&self.metadata),
            Arc::clone(&self.throttle),
            self.step_poll_interval,
        );
        let mut steps = self.step_list();
        steps.push(handle.clone());
        steps.sort_by_key(StepHandle::index);
        Ok(handle)
    }

    /// Submit a step running `entry_point` from `artifact` on `input`,
    /// writing to `output`.
    pub async fn submit_job_step(
        &self,
        name: impl Into<String>,
        artifact: impl Into<String>,
        entry_point: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> ControlResult<StepHandle> {
        self.submit_step(StepSpec::new(name, artifact, entry_point, input, output))
            .await
    }

    async fn attach(&self, id: &ClusterId) -> ControlResult<()> {
        let description = self
            .throttle
            .call("describe", || self.control.describe(id))
            .await?;

        if description.state != ResourceState::Ready {
            return Err(ControlError::NotConnectable {
                id: id.clone(),
                state: description.state.to_string(),
            });
        }

        let name = self.name();
        if description.name != name {
            debug!(
                cluster = %name,
                remote_name = %description.name,
                "connected cluster carries a different name"
            );
        }
        self.connected(id.clone());
        info!(cluster = %name, cluster_id = %id, "cluster connected");
        Ok(())
    }

    async fn lookup(&self, name: &str) -> ControlResult<Vec<ClusterId>> {
        self.throttle
            .call("list_by_name", || self.control.list_by_name(name))
            .await
    }

    fn require(&self, expected: ClusterState, operation: &'static str) -> ControlResult<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(ControlError::InvalidStateTransition {
                from: state.as_str(),
                operation,
            })
        }
    }

    /// Bind to `id`, keeping only the steps that belong to it.
    fn connected(&self, id: ClusterId) {
        self.step_list().retain(|s| s.key().cluster == id);
        self.publish(ClusterState::Connected, Some(id));
    }

    fn publish(&self, state: ClusterState, id: Option<ClusterId>) {
        let previous = self.snapshot.send_replace(ClusterSnapshot { state, id });
        if previous.state != state {
            debug!(cluster = %self.name(), from = %previous.state, to = %state, "cluster state changed");
        }
    }

    fn spec_guard(&self) -> std::sync::RwLockReadGuard<'_, ClusterSpec> {
        self.spec.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn step_list(&self) -> MutexGuard<'_, Vec<StepHandle>> {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ambiguous(name: String, matches: &[ClusterId]) -> ControlError {
    ControlError::AmbiguousName {
        name,
        matches: matches.iter().map(ToString::to_string).collect(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::service::MemoryControlService;

    fn options() -> ClusterOptions {
        ClusterOptions {
            throttle: ThrottleConfig::default(),
            poll_interval: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(60),
            step_poll_interval: Duration::from_secs(1),
        }
    }

    fn cluster(control: &Arc<MemoryControlService>, name: &str) -> Cluster {
        Cluster::new(
            ClusterSpec::new(name).with_log_uri("s3://logs"),
            control.clone(),
            control.clone(),
            options(),
        )
    }

    #[test]
    fn options_follow_config() {
        let options = ClusterOptions::default();
        assert_eq!(options.poll_interval, Duration::from_secs(10));
        assert_eq!(options.startup_timeout, Duration::from_secs(600));
        assert_eq!(options.throttle.max_attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn start_publishes_starting_then_connected() {
        let control = Arc::new(MemoryControlService::new());
        let cluster = cluster(&control, "etl");
        let mut updates = cluster.subscribe();

        let watcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            while updates.changed().await.is_ok() {
                let state = updates.borrow_and_update().state;
                seen.push(state);
                if state == ClusterState::Connected {
                    break;
                }
            }
            seen
        });

        cluster.start().await.unwrap();
        let seen = watcher.await.unwrap();

        assert_eq!(seen, vec![ClusterState::Starting, ClusterState::Connected]);
        assert!(cluster.cluster_id().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected() {
        let control = Arc::new(MemoryControlService::new());
        let cluster = cluster(&control, "etl");
        cluster.start().await.unwrap();

        let err = cluster.start().await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidStateTransition { from: "connected", operation: "start" }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_spec_fails_before_any_call() {
        let control = Arc::new(MemoryControlService::new());
        let cluster = Cluster::new(
            ClusterSpec::new("etl").with_instance_count(0),
            control.clone(),
            control.clone(),
            options(),
        );

        assert!(matches!(cluster.start().await, Err(ControlError::Config(_))));
        assert_eq!(control.call_count("create"), 0);
        assert_eq!(cluster.state(), ClusterState::Unconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_startup_returns_to_unconnected() {
        let control = Arc::new(MemoryControlService::builder().failing_cluster("etl").build());
        let cluster = cluster(&control, "etl");

        let err = cluster.start().await.unwrap_err();

        assert!(matches!(err, ControlError::UnexpectedState { .. }));
        assert_eq!(cluster.snapshot(), ClusterSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_timeout_returns_to_unconnected() {
        let control = Arc::new(MemoryControlService::builder().ready_after(1000).build());
        let cluster = cluster(&control, "etl");

        let err = cluster.start().await.unwrap_err();

        assert!(matches!(err, ControlError::TransitionTimeout { .. }));
        assert_eq!(cluster.state(), ClusterState::Unconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_start_returns_to_unconnected() {
        let control = Arc::new(MemoryControlService::new());
        let cluster = cluster(&control, "etl");

        let abandoned = tokio::time::timeout(Duration::from_millis(1500), cluster.start()).await;
        assert!(abandoned.is_err());
        assert_eq!(cluster.state(), ClusterState::Unconnected);
        assert!(cluster.cluster_id().is_none());

        for id in control.list_by_name("etl").await.unwrap() {
            control.terminate(&id).await.unwrap();
        }
        cluster.start().await.unwrap();
        assert_eq!(cluster.state(), ClusterState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn rename_only_while_unconnected() {
        let control = Arc::new(MemoryControlService::new());
        let cluster = cluster(&control, "etl");
        cluster.set_name("nightly").await.unwrap();
        assert_eq!(cluster.name(), "nightly");

        cluster.start().await.unwrap();
        assert!(cluster.set_name("other").await.is_err());
        assert_eq!(control.live_count("nightly"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_rejects_cluster_that_is_not_ready() {
        let control = Arc::new(MemoryControlService::new());
        let id = control
            .create(&ClusterSpec::new("etl").with_log_uri("s3://logs"))
            .await
            .unwrap();
        let cluster = cluster(&control, "etl");

        let err = cluster.connect_by_id(&id).await.unwrap_err();
        assert!(matches!(err, ControlError::NotConnectable { .. }));
        assert_eq!(cluster.state(), ClusterState::Unconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_by_name_without_match_fails() {
        let control = Arc::new(MemoryControlService::new());
        let cluster = cluster(&control, "etl");

        let err = cluster.connect_by_name().await.unwrap_err();
        assert!(matches!(err, ControlError::AmbiguousName { ref matches, .. } if matches.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_requires_connection() {
        let control = Arc::new(MemoryControlService::new());
        let cluster = cluster(&control, "etl");

        let err = cluster
            .submit_job_step("wc", "jar", "main", "in", "out")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidStateTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_start_is_transparent() {
        let control = Arc::new(MemoryControlService::new());
        control.throttle_next(2).unwrap();
        let cluster = cluster(&control, "etl");

        cluster.start().await.unwrap();

        assert_eq!(cluster.state(), ClusterState::Connected);
        assert_eq!(control.call_count("create"), 3);
    }
}
