//! Submit a configuration change and wait for the cluster to roll it out

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use tunecheck_common::{Error, Result};

use crate::change::ConfigurationChange;
use crate::profile::SpecStore;
use crate::rollout::{Convergence, ConvergenceWaiter};

/// Applies [`ConfigurationChange`]s to one configuration object and waits on
/// the rollout that depends on it
#[derive(Clone)]
pub struct ChangeApplicator {
    store: Arc<dyn SpecStore>,
    waiter: ConvergenceWaiter,
    resource: String,
    rollout: String,
    cancel: Option<CancellationToken>,
}

impl ChangeApplicator {
    /// Create an applicator for `resource`, whose changes roll out through
    /// `rollout`
    pub fn new(
        store: Arc<dyn SpecStore>,
        waiter: ConvergenceWaiter,
        resource: impl Into<String>,
        rollout: impl Into<String>,
    ) -> Self {
        Self {
            store,
            waiter,
            resource: resource.into(),
            rollout: rollout.into(),
            cancel: None,
        }
    }

    /// Name of the configuration object
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Refuse to write, and abort rollout waits, once `token` is cancelled
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            waiter: self.waiter.clone().with_cancellation(token.clone()),
            cancel: Some(token),
            ..self.clone()
        }
    }

    /// Copy of this applicator that ignores cancellation
    pub fn uncancellable(&self) -> Self {
        Self {
            waiter: self.waiter.uncancellable(),
            cancel: None,
            ..self.clone()
        }
    }

    /// Wait until the rollout is idle before a follow-up change
    pub async fn settle(&self) -> Result<()> {
        self.waiter.settle(&self.rollout).await
    }

    fn check_cancelled(&self, change: &ConfigurationChange) -> Result<()> {
        match self.cancel {
            Some(ref token) if token.is_cancelled() => {
                Err(Error::cancelled(format!("change {}", change.name())))
            }
            _ => Ok(()),
        }
    }

    /// Read the current spec, capture the change's originals, write the
    /// mutated spec if it differs, and wait for the rollout.
    ///
    /// A cancelled applicator returns [`Error::Cancelled`] without capturing,
    /// so there is nothing to restore.
    pub async fn apply(&self, change: &mut ConfigurationChange) -> Result<Convergence> {
        self.check_cancelled(change)?;
        let prior = self.store.read_spec(&self.resource).await?;
        self.check_cancelled(change)?;
        change.capture(&prior)?;

        let updated = change.apply_to(&prior)?;
        let changed = updated != prior;
        if changed {
            info!(
                resource = %self.resource,
                change = %change.name(),
                "Submitting configuration change"
            );
            self.store.write_spec(&self.resource, updated).await?;
        }

        self.waiter.wait(&self.rollout, changed).await
    }
}
