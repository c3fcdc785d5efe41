//! Stratus cluster control
//!
//! This crate manages short-lived, named compute clusters on a remote control
//! plane and tracks the work submitted to them.
//!
//! # Architecture
//!
//! - **Cluster lifecycle**: [`Cluster`] creates, connects to, reconciles and
//!   terminates one named cluster
//! - **Steps**: [`Cluster::submit_step`] hands out [`StepHandle`]s that can be
//!   joined and queried for debugging metadata
//! - **Convergence polling**: [`StatePoller`] waits for a set of resources to
//!   reach a target state under a deadline
//! - **Throttling**: every control plane call goes through a [`ThrottleGuard`]
//! - **Instance groups**: [`InstanceGroup`] launches bare instances and exposes
//!   them as hosts for `stratus-remote`
//!
//! # State Machine
//!
//! ```text
//!              start                 ready
//! Unconnected ──────▶ Starting ────────────▶ Connected
//!      ▲                 │                      │
//!      │   collision,    │                      │ disconnect, shutdown,
//!      │   timeout       │                      │ synchronize (gone)
//!      └─────────────────┴──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stratus_control::{Cluster, ClusterOptions, ClusterSpec, MemoryControlService};
//!
//! let control = Arc::new(MemoryControlService::new());
//! let cluster = Cluster::new(
//!     ClusterSpec::new("nightly").with_log_uri("s3://logs/nightly"),
//!     control.clone(),
//!     control,
//!     ClusterOptions::default(),
//! );
//!
//! cluster.start().await?;
//! let step = cluster
//!     .submit_job_step("wordcount", "s3://jars/wc.jar", "wordcount", "in/", "out/")
//!     .await?;
//! step.join().await?;
//! cluster.shutdown().await?;
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod group;
pub mod poller;
pub mod service;
pub mod step;
pub mod throttle;
pub mod types;

// Re-export commonly used types at the crate root
pub use cluster::{Cluster, ClusterOptions, ClusterSnapshot};
pub use config::{
    ControlBackend, ControlConfig, PollerConfig, RemoteConfig, StepConfig, StratusConfig,
    ThrottleConfig,
};
pub use error::{ControlError, ControlResult};
pub use group::{
    InstanceDescription, InstanceGroup, InstanceId, InstanceService, InstanceState, LaunchConfig,
    MemoryInstanceService,
};
pub use poller::{ControlPollSource, ConvergenceTarget, Observation, PollSource, StatePoller};
pub use service::{
    create_control_service, ControlService, HttpControlService, MemoryControlService,
    MemoryControlServiceBuilder, StepMetadataStore,
};
pub use step::StepHandle;
pub use throttle::{RetryPolicy, ThrottleGuard};
pub use types::{
    ActionOnFailure, ClusterDescription, ClusterId, ClusterSpec, ClusterState, ResourceState,
    StepIndex, StepKey, StepMetadata, StepSpec, StepStatus,
};
