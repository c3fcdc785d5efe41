//! Waiting for a collection of external resources to converge on a state.
//!
//! [`StatePoller::wait_for`] sleeps, reloads every tracked resource in one
//! batch through a [`PollSource`], and classifies each one as converged,
//! still transitioning, or in an unexpected state. An unexpected state fails
//! the wait at once; the deadline only bounds resources that are still
//! legitimately transitioning.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{ControlError, ControlResult};
use crate::service::ControlService;
use crate::throttle::ThrottleGuard;
use crate::types::{ClusterId, ResourceState};

/// One resource as seen by the most recent reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation<I, S> {
    /// Resource identifier.
    pub id: I,
    /// Reported state.
    pub state: S,
    /// Network address, when the resource has one.
    pub address: Option<String>,
}

/// State a wait converges on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceTarget<S> {
    /// Target state.
    pub state: S,
    /// Only count a resource at `state` as converged once it has an address.
    pub requires_address: bool,
}

impl<S> ConvergenceTarget<S> {
    /// Target a state with no secondary attribute.
    pub const fn state(state: S) -> Self {
        Self {
            state,
            requires_address: false,
        }
    }

    /// Target a state that must also carry an address.
    pub const fn with_address(state: S) -> Self {
        Self {
            state,
            requires_address: true,
        }
    }
}

/// Batch loader of resource states.
#[async_trait]
pub trait PollSource: Send + Sync {
    /// Resource identifier.
    type Id: Clone + Eq + fmt::Display + Send + Sync;
    /// Resource state.
    type State: Copy + PartialEq + fmt::Display + Send + Sync;

    /// Reload the current state of `ids` in one call.
    ///
    /// Resources the source no longer knows are left out of the result.
    async fn reload(
        &self,
        ids: &[Self::Id],
    ) -> ControlResult<Vec<Observation<Self::Id, Self::State>>>;
}

/// Repeats reloads at a fixed interval until convergence, failure or timeout.
#[derive(Debug, Clone, Copy)]
pub struct StatePoller {
    poll_interval: Duration,
}

impl StatePoller {
    /// Create a poller sleeping `poll_interval` before every reload.
    #[must_use]
    pub const fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Sleep between two reloads.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Block until every resource in `ids` is at `target`.
    ///
    /// Resources may pass through any state in `allowed` on the way. Returns
    /// the final observations in the order of `ids`.
    ///
    /// # Errors
    ///
    /// [`ControlError::UnexpectedState`] as soon as a resource reports a state
    /// that is neither allowed nor the target, or disappears;
    /// [`ControlError::TransitionTimeout`] listing the stragglers once
    /// `timeout` has elapsed; any error returned by the source.
    pub async fn wait_for<P>(
        &self,
        source: &P,
        ids: &[P::Id],
        allowed: &[P::State],
        target: ConvergenceTarget<P::State>,
        timeout: Duration,
    ) -> ControlResult<Vec<Observation<P::Id, P::State>>>
    where
        P: PollSource + ?Sized,
    {
        // A timeout too large to represent means no deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut round: u32 = 0;

        loop {
            debug!(
                sleep_ms = self.poll_interval.as_millis(),
                target = %target.state,
                "waiting before next state reload"
            );
            tokio::time::sleep(self.poll_interval).await;
            round += 1;

            let observations = source.reload(ids).await?;
            let mut converged = Vec::with_capacity(ids.len());
            let mut pending = Vec::new();

            for id in ids {
                let Some(observation) = observations.iter().find(|o| &o.id == id) else {
                    return Err(ControlError::UnexpectedState {
                        resource: id.to_string(),
                        state: "missing".to_owned(),
                        target: target.state.to_string(),
                    });
                };

                if observation.state == target.state {
                    if target.requires_address && observation.address.is_none() {
                        let state = format!("{} (no address)", observation.state);
                        pending.push((id.to_string(), state));
                    } else {
                        converged.push(observation.clone());
                    }
                } else if allowed.contains(&observation.state) {
                    pending.push((id.to_string(), observation.state.to_string()));
                } else {
                    return Err(ControlError::UnexpectedState {
                        resource: id.to_string(),
                        state: observation.state.to_string(),
                        target: target.state.to_string(),
                    });
                }
            }

            if pending.is_empty() {
                info!(
                    resources = ids.len(),
                    rounds = round,
                    target = %target.state,
                    "resources converged"
                );
                return Ok(converged);
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ControlError::TransitionTimeout {
                    target: target.state.to_string(),
                    pending,
                });
            }

            debug!(
                round,
                pending = pending.len(),
                converged = converged.len(),
                "resources still transitioning"
            );
        }
    }
}

/// [`PollSource`] over cluster resources of a control plane.
#[derive(Clone, Copy)]
pub struct ControlPollSource<'a> {
    control: &'a dyn ControlService,
    throttle: &'a ThrottleGuard,
}

impl<'a> ControlPollSource<'a> {
    /// Reload through `control`, paced by `throttle`.
    #[must_use]
    pub fn new(control: &'a dyn ControlService, throttle: &'a ThrottleGuard) -> Self {
        Self { control, throttle }
    }
}

#[async_trait]
impl PollSource for ControlPollSource<'_> {
    type Id = ClusterId;
    type State = ResourceState;

    async fn reload(
        &self,
        ids: &[ClusterId],
    ) -> ControlResult<Vec<Observation<ClusterId, ResourceState>>> {
        let descriptions = self
            .throttle
            .call("describe", || self.control.describe_all(ids))
            .await?;
        Ok(descriptions
            .into_iter()
            .map(|d| Observation {
                id: d.id,
                state: d.state,
                address: d.address,
            })
            .collect())
    }
}
