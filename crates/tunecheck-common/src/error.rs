//! Error types for tunecheck
//!
//! Errors carry enough structure for callers to tell "never converged" apart
//! from "converged to the wrong value" and from "could not even start". The
//! [`Error::is_transient`] classification drives the poller: transient errors
//! are retried until the deadline, everything else aborts immediately.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::Target;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for tunecheck operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A condition that is expected to resolve by itself (empty probe output,
    /// object not created yet)
    #[error("transient [{context}]: {message}")]
    Transient {
        /// Where the condition was observed
        context: String,
        /// Description of what is not ready
        message: String,
    },

    /// A poll exhausted its deadline without the probe reporting done
    #[error("timeout after {elapsed:?} waiting for {description}")]
    Timeout {
        /// What was being waited for
        description: String,
        /// How long the wait lasted
        elapsed: Duration,
    },

    /// A probed value differs from the expected one
    #[error("mismatch on {target} ({probe}): expected {expected:?}, got {actual:?}")]
    Mismatch {
        /// Target whose value differed
        target: Target,
        /// Name of the probe that read the value
        probe: String,
        /// Expected value
        expected: String,
        /// Value actually observed (trimmed)
        actual: String,
    },

    /// The rollout never reported Updating after a change was submitted
    #[error("rollout {rollout} never started updating within {timeout:?}")]
    RolloutNeverStarted {
        /// Name of the rollout resource
        rollout: String,
        /// How long we waited for Updating
        timeout: Duration,
    },

    /// The rollout started but did not finish in time
    #[error("rollout {rollout} did not finish updating within {timeout:?}")]
    RolloutTimedOut {
        /// Name of the rollout resource
        rollout: String,
        /// How long we waited for the update to finish
        timeout: Duration,
    },

    /// The rollout reported Degraded
    #[error("rollout {rollout} is degraded: {message}")]
    RolloutDegraded {
        /// Name of the rollout resource
        rollout: String,
        /// Description from the condition, if any
        message: String,
    },

    /// Remote command execution failed
    #[error("exec error on {target}: {message}")]
    Exec {
        /// Where the command ran
        target: String,
        /// Description of what failed, including stderr when available
        message: String,
    },

    /// Malformed input (bad field path, unparseable output, wrong target kind)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending field, if known
        field: Option<String>,
    },

    /// The cluster does not have the topology the suite requires
    #[error("unsupported topology: {message}")]
    Topology {
        /// Description of the mismatch
        message: String,
    },

    /// Suite configuration could not be loaded
    #[error("configuration error: {message}")]
    Config {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A wait was aborted through its cancellation token
    #[error("cancelled while waiting for {description}")]
    Cancelled {
        /// What was being waited for
        description: String,
    },

    /// A scenario finished with at least one failure
    #[error(transparent)]
    Scenario(Box<ScenarioFailure>),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a transient error with context
    pub fn transient(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(description: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            description: description.into(),
            elapsed,
        }
    }

    /// Create a mismatch error
    pub fn mismatch(
        target: Target,
        probe: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Mismatch {
            target,
            probe: probe.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an exec error for a target
    pub fn exec(target: impl fmt::Display, msg: impl Into<String>) -> Self {
        Self::Exec {
            target: target.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a topology error
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(description: impl Into<String>) -> Self {
        Self::Cancelled {
            description: description.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether a poller should keep retrying after this error.
    ///
    /// Transient conditions and server-side/transport kube failures are
    /// retryable. Client errors (4xx other than 429), malformed input,
    /// mismatches and rollout failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient { .. } => true,
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 429 || ae.code >= 500,
                kube::Error::HyperError(_) | kube::Error::Service(_) => true,
                _ => false,
            },
            _ => false,
        }
    }

    /// Whether this error means a wait ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::RolloutNeverStarted { .. }
                | Error::RolloutTimedOut { .. }
        )
    }

    /// Whether this is a kube "not found" response
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Whether this is an optimistic-concurrency conflict on write
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }
}

/// Composite result of a scenario that did not fully succeed.
///
/// The primary failure (apply or verification) and the cleanup failures
/// (teardown of ephemeral workloads, restoration of the original
/// configuration) are kept apart so neither hides the other.
#[derive(Debug)]
pub struct ScenarioFailure {
    /// Scenario name
    pub scenario: String,
    /// Failure of the apply/verify phase
    pub primary: Option<Error>,
    /// Failure while deleting ephemeral workloads
    pub teardown: Option<Error>,
    /// Failure while restoring the original configuration
    pub restore: Option<Error>,
}

impl ScenarioFailure {
    /// Collect the phase results of a scenario.
    ///
    /// Returns `None` when every phase succeeded.
    pub fn collect(
        scenario: impl Into<String>,
        primary: Option<Error>,
        teardown: Option<Error>,
        restore: Option<Error>,
    ) -> Option<Self> {
        if primary.is_none() && teardown.is_none() && restore.is_none() {
            return None;
        }
        Some(Self {
            scenario: scenario.into(),
            primary,
            teardown,
            restore,
        })
    }

    /// The error that decided the scenario's fate: primary first, then
    /// teardown, then restore
    pub fn root_cause(&self) -> Option<&Error> {
        self.primary
            .as_ref()
            .or(self.teardown.as_ref())
            .or(self.restore.as_ref())
    }
}

impl fmt::Display for ScenarioFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scenario {} failed", self.scenario)?;
        if let Some(ref e) = self.primary {
            write!(f, ": {e}")?;
        }
        if let Some(ref e) = self.teardown {
            write!(f, "; teardown failed: {e}")?;
        }
        if let Some(ref e) = self.restore {
            write!(f, "; restore failed: {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ScenarioFailure {}

impl From<ScenarioFailure> for Error {
    fn from(failure: ScenarioFailure) -> Self {
        Error::Scenario(Box::new(failure))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
