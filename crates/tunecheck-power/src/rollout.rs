//! Waiting for a MachineConfigPool rollout to converge.
//!
//! After a configuration object changes, the pool goes through
//! `Idle -> Updating -> Updated`. [`ConvergenceWaiter::wait`] follows that
//! sequence: it first waits for `Updating` to turn true, then for it to turn
//! false again. `Degraded` observed at any poll aborts the wait.
//!
//! When the submitted spec equals the prior one there is nothing to roll out
//! and the waiter returns [`Convergence::Unchanged`] without polling.
//!
//! A wait that was cut short leaves `Updating` true for a rollout nobody is
//! following. [`ConvergenceWaiter::settle`] waits that rollout out so the next
//! change does not mistake it for its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use tunecheck_common::kube_utils::{build_api_resource, condition_status};
use tunecheck_common::poll::Poller;
use tunecheck_common::{Error, Result};

/// MachineConfigPool condition: a rollout is in progress
pub const CONDITION_UPDATING: &str = "Updating";
/// MachineConfigPool condition: the pool cannot converge
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Phase of a rollout as seen by the waiter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutStatus {
    /// No update observed yet
    Idle,
    /// Updating is true
    Updating,
    /// Updating went back to false
    Updated,
    /// Degraded is true
    Degraded,
}

/// Outcome of waiting on a rollout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Convergence {
    /// The rollout went Updating true -> false
    Updated,
    /// The spec did not change, nothing was rolled out
    Unchanged,
}

/// Read access to a rollout resource's status conditions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConditionStore: Send + Sync {
    /// Whether condition `condition` of `rollout` is true.
    ///
    /// A condition that is not reported is false.
    async fn get_condition(&self, rollout: &str, condition: &str) -> Result<bool>;
}

/// [`ConditionStore`] over MachineConfigPools
pub struct MachineConfigPools {
    api: Api<DynamicObject>,
}

impl MachineConfigPools {
    /// Create a store backed by the cluster's MachineConfigPools
    pub fn new(client: Client) -> Self {
        let ar = build_api_resource("machineconfiguration.openshift.io", "v1", "MachineConfigPool");
        Self {
            api: Api::all_with(client, &ar),
        }
    }
}

#[async_trait]
impl ConditionStore for MachineConfigPools {
    async fn get_condition(&self, rollout: &str, condition: &str) -> Result<bool> {
        let pool = self.api.get(rollout).await?;
        Ok(condition_status(pool.data.get("status"), condition).unwrap_or(false))
    }
}

/// Follows a rollout through its phases with bounded waits
#[derive(Clone)]
pub struct ConvergenceWaiter {
    store: Arc<dyn ConditionStore>,
    poller: Poller,
    updating_timeout: Duration,
    updated_timeout: Duration,
}

impl ConvergenceWaiter {
    /// Create a waiter polling `store` every `interval`
    pub fn new(
        store: Arc<dyn ConditionStore>,
        interval: Duration,
        updating_timeout: Duration,
        updated_timeout: Duration,
    ) -> Self {
        Self {
            store,
            poller: Poller::new(interval, updating_timeout),
            updating_timeout,
            updated_timeout,
        }
    }

    /// Abort waits when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.poller = self.poller.with_cancellation(token);
        self
    }

    /// Copy of this waiter that ignores cancellation
    pub fn uncancellable(&self) -> Self {
        Self {
            poller: self.poller.uncancellable(),
            ..self.clone()
        }
    }

    /// Wait for `rollout` to converge after a change was submitted.
    ///
    /// `changed` is the applicator's verdict on whether the submitted spec
    /// differs from the prior one.
    pub async fn wait(&self, rollout: &str, changed: bool) -> Result<Convergence> {
        if !changed {
            info!(rollout = %rollout, "Spec unchanged, no rollout expected");
            return Ok(Convergence::Unchanged);
        }

        info!(rollout = %rollout, timeout = ?self.updating_timeout, "Waiting for rollout to start");
        self.wait_for_phase(rollout, RolloutStatus::Updating)
            .await
            .map_err(|e| match e {
                Error::Timeout { .. } => Error::RolloutNeverStarted {
                    rollout: rollout.to_string(),
                    timeout: self.updating_timeout,
                },
                other => other,
            })?;

        info!(rollout = %rollout, timeout = ?self.updated_timeout, "Rollout started, waiting for it to finish");
        self.wait_for_phase(rollout, RolloutStatus::Updated)
            .await
            .map_err(|e| match e {
                Error::Timeout { .. } => Error::RolloutTimedOut {
                    rollout: rollout.to_string(),
                    timeout: self.updated_timeout,
                },
                other => other,
            })?;

        info!(rollout = %rollout, "Rollout finished");
        Ok(Convergence::Updated)
    }

    /// Wait until `rollout` is no longer updating, whatever started it.
    pub async fn settle(&self, rollout: &str) -> Result<()> {
        info!(rollout = %rollout, timeout = ?self.updated_timeout, "Waiting for in-flight rollout to settle");
        self.wait_for_phase(rollout, RolloutStatus::Idle)
            .await
            .map_err(|e| match e {
                Error::Timeout { .. } => Error::RolloutTimedOut {
                    rollout: rollout.to_string(),
                    timeout: self.updated_timeout,
                },
                other => other,
            })
    }

    async fn wait_for_phase(&self, rollout: &str, phase: RolloutStatus) -> Result<()> {
        let (timeout, want_updating) = match phase {
            RolloutStatus::Updating => (self.updating_timeout, true),
            _ => (self.updated_timeout, false),
        };
        let description = format!("rollout {rollout} to reach {phase:?}");

        self.poller
            .with_timeout(timeout)
            .poll(&description, || async move {
                let status = self.observe(rollout).await?;
                debug!(rollout = %rollout, ?status, "Observed rollout status");
                match status {
                    RolloutStatus::Degraded => Err(Error::RolloutDegraded {
                        rollout: rollout.to_string(),
                        message: format!("{CONDITION_DEGRADED} is True while waiting for {phase:?}"),
                    }),
                    RolloutStatus::Updating if want_updating => Ok(Some(())),
                    RolloutStatus::Idle if !want_updating => Ok(Some(())),
                    _ => Ok(None),
                }
            })
            .await
    }

    async fn observe(&self, rollout: &str) -> Result<RolloutStatus> {
        if self.store.get_condition(rollout, CONDITION_DEGRADED).await? {
            return Ok(RolloutStatus::Degraded);
        }
        if self.store.get_condition(rollout, CONDITION_UPDATING).await? {
            Ok(RolloutStatus::Updating)
        } else {
            Ok(RolloutStatus::Idle)
        }
    }
}
