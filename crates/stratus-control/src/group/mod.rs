//! Plain instance groups.
//!
//! Besides managed clusters, stratus can launch a group of bare instances
//! from a launch configuration, adopt an existing group by name, and hand its
//! members to the remote command dispatcher as hosts.

mod memory;

pub use memory::MemoryInstanceService;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratus_remote::{Credential, Host, HostSet};
use tracing::{info, warn};

use crate::config::{PollerConfig, StratusConfig};
use crate::error::{ControlError, ControlResult};
use crate::poller::{ConvergenceTarget, Observation, PollSource, StatePoller};
use crate::throttle::ThrottleGuard;

/// Identifier of an instance, assigned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wrap a raw identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provider-reported state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Being launched.
    Pending,
    /// Up.
    Running,
    /// Stop in progress.
    Stopping,
    /// Stopped; can be started again.
    Stopped,
    /// Termination in progress.
    ShuttingDown,
    /// Gone.
    Terminated,
}

impl InstanceState {
    /// Every state, used when any state may precede termination.
    pub const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::ShuttingDown,
        Self::Terminated,
    ];

    /// State name as used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        }
    }

    /// Whether the instance counts as a member of its group.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    /// Instance identifier.
    pub id: InstanceId,
    /// Group the instance was launched into.
    pub group: String,
    /// Launch request the instance belongs to.
    pub reservation: String,
    /// Position within its launch request.
    pub launch_index: u32,
    /// Current state.
    pub state: InstanceState,
    /// Public address once assigned.
    #[serde(default)]
    pub public_address: Option<String>,
}

/// How to launch a group of instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Group name the instances are tagged with.
    pub group: String,
    /// Machine image.
    pub image: String,
    /// Instance type.
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    /// Number of instances.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Key pair installed on the instances.
    #[serde(default)]
    pub key_name: Option<String>,
    /// Placement zone.
    #[serde(default)]
    pub availability_zone: Option<String>,
}

fn default_instance_type() -> String {
    "m5.large".to_owned()
}

const fn default_count() -> u32 {
    1
}

impl LaunchConfig {
    /// Launch `count` instances of `image` into `group`.
    #[must_use]
    pub fn new(group: impl Into<String>, image: impl Into<String>, count: u32) -> Self {
        Self {
            group: group.into(),
            image: image.into(),
            instance_type: default_instance_type(),
            count,
            key_name: None,
            availability_zone: None,
        }
    }

    /// Check the configuration before it is sent anywhere.
    pub fn validate(&self) -> ControlResult<()> {
        if self.group.trim().is_empty() {
            return Err(ControlError::config("group name must not be empty"));
        }
        if self.image.trim().is_empty() {
            return Err(ControlError::config("image must not be empty"));
        }
        if self.count == 0 {
            return Err(ControlError::config("count must be at least 1"));
        }
        Ok(())
    }
}

/// Operations offered by the instance provider.
#[async_trait]
pub trait InstanceService: Send + Sync {
    /// Launch instances; returns their identifiers in launch order.
    async fn run_instances(&self, config: &LaunchConfig) -> ControlResult<Vec<InstanceId>>;

    /// Describe instances; unknown identifiers are left out.
    async fn describe_instances(&self, ids: &[InstanceId])
        -> ControlResult<Vec<InstanceDescription>>;

    /// Live instances tagged with `group`.
    async fn find_by_group(&self, group: &str) -> ControlResult<Vec<InstanceDescription>>;

    /// Request termination.
    async fn terminate_instances(&self, ids: &[InstanceId]) -> ControlResult<()>;

    /// Request a stop.
    async fn stop_instances(&self, ids: &[InstanceId]) -> ControlResult<()>;
}

struct InstancePollSource<'a> {
    service: &'a dyn InstanceService,
    throttle: &'a ThrottleGuard,
}

#[async_trait]
impl PollSource for InstancePollSource<'_> {
    type Id = InstanceId;
    type State = InstanceState;

    async fn reload(
        &self,
        ids: &[InstanceId],
    ) -> ControlResult<Vec<Observation<InstanceId, InstanceState>>> {
        let descriptions = self
            .throttle
            .call("describe_instances", || self.service.describe_instances(ids))
            .await?;
        Ok(descriptions
            .into_iter()
            .map(|d| Observation {
                id: d.id,
                state: d.state,
                address: d.public_address,
            })
            .collect())
    }
}

/// A group of instances launched or adopted by this process.
pub struct InstanceGroup {
    service: Arc<dyn InstanceService>,
    throttle: Arc<ThrottleGuard>,
    poller: StatePoller,
    terminate_timeout: Duration,
    name: Option<String>,
    members: Vec<InstanceDescription>,
}

impl fmt::Debug for InstanceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceGroup")
            .field("name", &self.name)
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

impl InstanceGroup {
    /// Create an empty group.
    #[must_use]
    pub fn new(
        service: Arc<dyn InstanceService>,
        throttle: Arc<ThrottleGuard>,
        poller: StatePoller,
    ) -> Self {
        Self {
            service,
            throttle,
            poller,
            terminate_timeout: PollerConfig::default().terminate_timeout(),
            name: None,
            members: Vec::new(),
        }
    }

    /// Create an empty group paced and timed by `config`.
    #[must_use]
    pub fn from_config(service: Arc<dyn InstanceService>, config: &StratusConfig) -> Self {
        let mut group = Self::new(
            service,
            Arc::new(ThrottleGuard::new(&config.throttle)),
            StatePoller::new(config.poller.poll_interval()),
        );
        group.terminate_timeout = config.poller.terminate_timeout();
        group
    }

    /// Deadline applied by [`InstanceGroup::shutdown`].
    #[must_use]
    pub const fn terminate_timeout(&self) -> Duration {
        self.terminate_timeout
    }

    /// Group name, once started or connected.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Members in launch order.
    #[must_use]
    pub fn members(&self) -> &[InstanceDescription] {
        &self.members
    }

    /// Launch the group and wait until every instance runs with an address.
    pub async fn start(&mut self, config: &LaunchConfig, timeout: Duration) -> ControlResult<()> {
        self.require_empty("start")?;
        config.validate()?;

        info!(group = %config.group, count = config.count, image = %config.image, "launching instances");
        let ids = self
            .throttle
            .call("run_instances", || self.service.run_instances(config))
            .await?;

        let source = InstancePollSource {
            service: self.service.as_ref(),
            throttle: &self.throttle,
        };
        let waited = self
            .poller
            .wait_for(
                &source,
                &ids,
                &[InstanceState::Pending],
                ConvergenceTarget::with_address(InstanceState::Running),
                timeout,
            )
            .await;

        if let Err(e) = waited {
            warn!(group = %config.group, error = %e, "instances did not come up");
            return Err(e);
        }

        let mut members = self
            .throttle
            .call("describe_instances", || self.service.describe_instances(&ids))
            .await?;
        members.sort_by_key(|m| m.launch_index);
        info!(group = %config.group, members = members.len(), "instance group running");
        self.name = Some(config.group.clone());
        self.members = members;
        Ok(())
    }

    /// Adopt the live instances of an existing group.
    ///
    /// # Errors
    ///
    /// [`ControlError::ClusterNotFound`] if the group has no live instance;
    /// [`ControlError::AmbiguousName`] if its instances come from more than
    /// one launch request.
    pub async fn connect(&mut self, group: &str) -> ControlResult<()> {
        self.require_empty("connect")?;

        let mut members = self
            .throttle
            .call("find_by_group", || self.service.find_by_group(group))
            .await?;
        if members.is_empty() {
            return Err(ControlError::ClusterNotFound(group.to_owned()));
        }

        let mut reservations: Vec<String> = members.iter().map(|m| m.reservation.clone()).collect();
        reservations.sort();
        reservations.dedup();
        if reservations.len() > 1 {
            return Err(ControlError::AmbiguousName {
                name: group.to_owned(),
                matches: reservations,
            });
        }

        members.sort_by_key(|m| m.launch_index);
        info!(group, members = members.len(), "connected to instance group");
        self.name = Some(group.to_owned());
        self.members = members;
        Ok(())
    }

    /// Terminate every member and wait until they are gone.
    pub async fn terminate(&mut self, timeout: Duration) -> ControlResult<()> {
        let ids = self.member_ids("terminate")?;
        self.throttle
            .call("terminate_instances", || self.service.terminate_instances(&ids))
            .await?;

        let source = InstancePollSource {
            service: self.service.as_ref(),
            throttle: &self.throttle,
        };
        self.poller
            .wait_for(
                &source,
                &ids,
                InstanceState::ALL,
                ConvergenceTarget::state(InstanceState::Terminated),
                timeout,
            )
            .await?;

        info!(group = ?self.name, members = ids.len(), "instance group terminated");
        self.name = None;
        self.members.clear();
        Ok(())
    }

    /// Terminate every member within the configured terminate timeout.
    pub async fn shutdown(&mut self) -> ControlResult<()> {
        self.terminate(self.terminate_timeout).await
    }

    /// Stop every member without terminating it.
    pub async fn stop(&mut self) -> ControlResult<()> {
        let ids = self.member_ids("stop")?;
        self.throttle
            .call("stop_instances", || self.service.stop_instances(&ids))
            .await?;
        info!(group = ?self.name, members = ids.len(), "instance group stop requested");
        Ok(())
    }

    /// Members as remote hosts, in launch order.
    ///
    /// # Errors
    ///
    /// [`ControlError::Config`] if the group is empty or a member has no
    /// public address.
    pub fn hosts(&self, user: &str, credential: &Credential) -> ControlResult<HostSet> {
        if self.members.is_empty() {
            return Err(ControlError::config("instance group has no members"));
        }
        self.members
            .iter()
            .map(|m| {
                let address = m.public_address.as_ref().ok_or_else(|| {
                    ControlError::config(format!("instance {} has no public address", m.id))
                })?;
                Ok(Host::new(address.clone(), user, credential.clone()))
            })
            .collect()
    }

    fn require_empty(&self, operation: &'static str) -> ControlResult<()> {
        if self.members.is_empty() {
            Ok(())
        } else {
            Err(ControlError::InvalidStateTransition {
                from: "running",
                operation,
            })
        }
    }

    fn member_ids(&self, operation: &'static str) -> ControlResult<Vec<InstanceId>> {
        if self.members.is_empty() {
            return Err(ControlError::InvalidStateTransition {
                from: "empty",
                operation,
            });
        }
        Ok(self.members.iter().map(|m| m.id.clone()).collect())
    }
}
