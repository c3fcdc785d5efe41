//! Common test utilities for cluster integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stratus_control::{
    Cluster, ClusterOptions, ClusterSpec, MemoryControlService, MemoryControlServiceBuilder,
    ThrottleConfig,
};

/// An in-memory control plane plus helpers to build clusters against it.
pub struct TestControlPlane {
    pub control: Arc<MemoryControlService>,
}

impl TestControlPlane {
    /// Control plane with default progression.
    pub fn new() -> Self {
        Self::with(MemoryControlService::builder())
    }

    /// Control plane configured through its builder.
    pub fn with(builder: MemoryControlServiceBuilder) -> Self {
        Self {
            control: Arc::new(builder.build()),
        }
    }

    /// Fast polling options for paused-clock tests.
    pub fn options() -> ClusterOptions {
        ClusterOptions {
            throttle: ThrottleConfig::default(),
            poll_interval: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(120),
            step_poll_interval: Duration::from_secs(1),
        }
    }

    /// Spec for a cluster with debugging enabled.
    pub fn spec(name: &str) -> ClusterSpec {
        ClusterSpec::new(name).with_log_uri(format!("s3://logs/{name}"))
    }

    /// New unconnected cluster view with the given name.
    pub fn cluster(&self, name: &str) -> Cluster {
        Cluster::new(
            Self::spec(name),
            self.control.clone(),
            self.control.clone(),
            Self::options(),
        )
    }
}

impl Default for TestControlPlane {
    fn default() -> Self {
        Self::new()
    }
}
