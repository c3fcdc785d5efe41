//! Core types for stratus-control.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

/// External identifier of a cluster resource, assigned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// Create a new cluster ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique cluster ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("c-{}", ulid::Ulid::new().to_string().to_lowercase()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ClusterId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Ordinal of a step within its cluster, assigned by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepIndex(u32);

impl StepIndex {
    /// Wrap a raw ordinal.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The raw ordinal.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StepIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite identity of a step: owning cluster plus ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepKey {
    /// Owning cluster.
    pub cluster: ClusterId,
    /// Step ordinal.
    pub index: StepIndex,
}

impl StepKey {
    /// Build a key from its parts.
    #[must_use]
    pub const fn new(cluster: ClusterId, index: StepIndex) -> Self {
        Self { cluster, index }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.index)
    }
}

/// Lifecycle state of a local cluster view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    /// No external identity is held.
    #[default]
    Unconnected,
    /// A create request was issued and the resource is converging.
    Starting,
    /// Bound to a ready external resource.
    Connected,
}

impl ClusterState {
    /// State name for logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Starting => "starting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a cluster resource as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Instances are being allocated.
    Creating,
    /// Instances are up and bootstrapping.
    Initializing,
    /// The cluster accepts work.
    Ready,
    /// Shutdown in progress.
    Terminating,
    /// The cluster is gone.
    Terminated,
    /// Provisioning failed.
    Failed,
}

impl ResourceState {
    /// State name as used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    /// Whether the resource still exists from the user's point of view.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Creating | Self::Initializing | Self::Ready)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a cluster resource returned by `describe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDescription {
    /// Resource identifier.
    pub id: ClusterId,
    /// Human name given at creation.
    pub name: String,
    /// Current resource state.
    pub state: ResourceState,
    /// Address of the master node, once assigned.
    #[serde(default)]
    pub address: Option<String>,
    /// Free-form attributes reported by the control plane.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Request to create a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Cluster name; must be unique among live clusters.
    pub name: String,
    /// Total number of instances, master included.
    #[serde(default = "default_instance_count")]
    pub instance_count: u32,
    /// Instance type of the master node.
    #[serde(default = "default_instance_type")]
    pub master_instance_type: String,
    /// Instance type of worker nodes.
    #[serde(default = "default_instance_type")]
    pub worker_instance_type: String,
    /// Name of the key pair installed on every node.
    #[serde(default)]
    pub key_name: Option<String>,
    /// Location the control plane writes cluster logs to.
    #[serde(default)]
    pub log_uri: Option<String>,
    /// Placement zone.
    #[serde(default)]
    pub availability_zone: Option<String>,
    /// Keep the cluster alive when no steps remain.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    /// Record per-step debugging metadata.
    #[serde(default = "default_enable_debugging")]
    pub enable_debugging: bool,
}

const fn default_instance_count() -> u32 {
    1
}

fn default_instance_type() -> String {
    "m5.xlarge".to_owned()
}

const fn default_keep_alive() -> bool {
    true
}

const fn default_enable_debugging() -> bool {
    true
}

impl ClusterSpec {
    /// Create a spec with default sizing for the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_count: default_instance_count(),
            master_instance_type: default_instance_type(),
            worker_instance_type: default_instance_type(),
            key_name: None,
            log_uri: None,
            availability_zone: None,
            keep_alive: default_keep_alive(),
            enable_debugging: default_enable_debugging(),
        }
    }

    /// Set the number of instances.
    #[must_use]
    pub const fn with_instance_count(mut self, count: u32) -> Self {
        self.instance_count = count;
        self
    }

    /// Set the key pair name.
    #[must_use]
    pub fn with_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = Some(key_name.into());
        self
    }

    /// Set the log location.
    #[must_use]
    pub fn with_log_uri(mut self, log_uri: impl Into<String>) -> Self {
        self.log_uri = Some(log_uri.into());
        self
    }

    /// Check the spec before it is sent anywhere.
    pub fn validate(&self) -> ControlResult<()> {
        validate_name(&self.name, "cluster name")?;
        if self.instance_count == 0 {
            return Err(ControlError::config("instance_count must be at least 1"));
        }
        if self.master_instance_type.trim().is_empty() || self.worker_instance_type.trim().is_empty()
        {
            return Err(ControlError::config("instance types must not be empty"));
        }
        if self.enable_debugging && self.log_uri.is_none() {
            return Err(ControlError::config(
                "enable_debugging requires a log_uri to write step metadata to",
            ));
        }
        Ok(())
    }
}

/// What the cluster does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOnFailure {
    /// Continue with the next step.
    #[default]
    Continue,
    /// Cancel pending steps and wait.
    CancelAndWait,
    /// Terminate the cluster.
    TerminateCluster,
}

/// A unit of work submitted to a connected cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name.
    pub name: String,
    /// Reference to the executable artifact (for example a jar location).
    pub artifact: String,
    /// Entry point within the artifact.
    pub entry_point: String,
    /// Extra arguments passed after input and output.
    #[serde(default)]
    pub args: Vec<String>,
    /// Input locator.
    pub input: String,
    /// Output locator.
    pub output: String,
    /// Failure behaviour.
    #[serde(default)]
    pub action_on_failure: ActionOnFailure,
}

impl StepSpec {
    /// Build a step specification.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        artifact: impl Into<String>,
        entry_point: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            artifact: artifact.into(),
            entry_point: entry_point.into(),
            args: Vec::new(),
            input: input.into(),
            output: output.into(),
            action_on_failure: ActionOnFailure::default(),
        }
    }

    /// Append extra arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the failure behaviour.
    #[must_use]
    pub const fn with_action_on_failure(mut self, action: ActionOnFailure) -> Self {
        self.action_on_failure = action;
        self
    }

    /// Full argument vector handed to the entry point.
    #[must_use]
    pub fn command_line(&self) -> Vec<String> {
        let mut line = vec![
            self.entry_point.clone(),
            self.input.clone(),
            self.output.clone(),
        ];
        line.extend(self.args.iter().cloned());
        line
    }

    /// Check the spec before it is sent anywhere.
    pub fn validate(&self) -> ControlResult<()> {
        validate_name(&self.name, "step name")?;
        for (value, what) in [
            (&self.artifact, "artifact"),
            (&self.entry_point, "entry point"),
            (&self.input, "input locator"),
            (&self.output, "output locator"),
        ] {
            if value.trim().is_empty() {
                return Err(ControlError::config(format!("{what} must not be empty")));
            }
        }
        Ok(())
    }
}

fn validate_name(name: &str, what: &str) -> ControlResult<()> {
    if name.trim().is_empty() {
        return Err(ControlError::config(format!("{what} must not be empty")));
    }
    if name.len() > 256 {
        return Err(ControlError::config(format!(
            "{what} must be at most 256 characters"
        )));
    }
    Ok(())
}

/// Execution status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Queued behind earlier steps.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
}

impl StepStatus {
    /// Whether the step has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Status name as used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Debugging metadata recorded for a step by the external metadata store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepMetadata(BTreeMap<String, String>);

impl StepMetadata {
    /// Key holding the owning cluster's identifier.
    pub const CLUSTER_ID: &'static str = "cluster_id";
    /// Key holding the step ordinal.
    pub const STEP_INDEX: &'static str = "step_index";
    /// Key holding the step name.
    pub const STEP_NAME: &'static str = "step_name";

    /// Create an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for StepMetadata {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cluster_spec_defaults() {
        let spec = ClusterSpec::new("etl").with_log_uri("s3://logs/etl");
        assert_eq!(spec.instance_count, 1);
        assert!(spec.keep_alive);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn cluster_spec_rejects_empty_name() {
        let err = ClusterSpec::new("  ").validate().unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }

    #[test]
    fn cluster_spec_rejects_zero_instances() {
        let spec = ClusterSpec::new("etl")
            .with_log_uri("s3://logs")
            .with_instance_count(0);
        assert!(matches!(spec.validate(), Err(ControlError::Config(_))));
    }

    #[test]
    fn debugging_requires_log_uri() {
        let spec = ClusterSpec::new("etl");
        assert!(matches!(spec.validate(), Err(ControlError::Config(_))));
    }

    #[test]
    fn cluster_spec_from_toml() {
        let spec: ClusterSpec = toml::from_str(
            r#"
            name = "nightly"
            instance_count = 4
            log_uri = "s3://logs/nightly"
        "#,
        )
        .unwrap();
        assert_eq!(spec.instance_count, 4);
        assert_eq!(spec.master_instance_type, "m5.xlarge");
        assert!(spec.enable_debugging);
    }

    #[test]
    fn step_command_line_order() {
        let spec = StepSpec::new("wc", "s3://jars/examples.jar", "wordcount", "in/", "out/")
            .with_args(["-D", "x=1"]);
        assert_eq!(
            spec.command_line(),
            vec!["wordcount", "in/", "out/", "-D", "x=1"]
        );
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn step_spec_rejects_missing_locator() {
        let spec = StepSpec::new("wc", "jar", "main", "", "out/");
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("input locator"));
    }

    #[test]
    fn step_status_terminality() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Succeeded.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
    }

    #[test]
    fn step_key_display() {
        let key = StepKey::new(ClusterId::new("c-1"), StepIndex::new(3));
        assert_eq!(key.to_string(), "c-1/3");
    }
}
