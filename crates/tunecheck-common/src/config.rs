//! Suite configuration.
//!
//! Names, timeouts and probe CPUs are deployment data, not engine logic, so
//! they live in a YAML file with defaults for every field:
//!
//! ```yaml
//! power:
//!   privilegedNamespace: tunecheck-privileged
//!   pool: master
//!   updatingTimeoutSecs: 1200
//! metallb:
//!   namespace: metallb-system
//! ```
//!
//! The file is resolved in priority order:
//! 1. Explicit `--config` flag
//! 2. `TUNECHECK_CONFIG` environment variable
//! 3. Built-in defaults

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Environment variable naming the suite configuration file
pub const CONFIG_ENV: &str = "TUNECHECK_CONFIG";

/// Environment variable naming the kubeconfig of the cluster under test
pub const KUBECONFIG_ENV: &str = "TUNECHECK_KUBECONFIG";

/// Top-level suite configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SuiteConfig {
    /// Power-management suite settings
    pub power: PowerConfig,
    /// MetalLB operator suite settings
    pub metallb: MetalLbConfig,
}

/// Settings for the power-management scenarios
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PowerConfig {
    /// Namespace for the host-probe pod and the QoS test pods
    pub privileged_namespace: String,
    /// MachineConfigPool that rolls out profile changes
    pub pool: String,
    /// Image for the host-probe and test pods
    pub probe_image: String,
    /// Spacing between rollout condition polls
    pub rollout_poll_interval_secs: u64,
    /// Deadline for the pool to start updating after a change
    pub updating_timeout_secs: u64,
    /// Deadline for the pool to finish updating
    pub updated_timeout_secs: u64,
    /// Spacing between value probes
    pub verify_poll_interval_secs: u64,
    /// Deadline for a probed value to show up
    pub verify_timeout_secs: u64,
    /// Deadline for test pods to start or be deleted
    pub workload_timeout_secs: u64,
    /// CPU probed for the isolated-core frequency
    pub isolated_probe_cpu: u32,
    /// CPU probed for the reserved-core frequency
    pub reserved_probe_cpu: u32,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            privileged_namespace: "tunecheck-privileged".to_string(),
            pool: "master".to_string(),
            probe_image: "registry.access.redhat.com/ubi9/ubi-minimal:latest".to_string(),
            rollout_poll_interval_secs: 10,
            updating_timeout_secs: 1200,
            updated_timeout_secs: 1800,
            verify_poll_interval_secs: 1,
            verify_timeout_secs: 60,
            workload_timeout_secs: 600,
            isolated_probe_cpu: 2,
            reserved_probe_cpu: 0,
        }
    }
}

impl PowerConfig {
    /// Spacing between rollout condition polls
    pub fn rollout_poll_interval(&self) -> Duration {
        Duration::from_secs(self.rollout_poll_interval_secs)
    }

    /// Deadline for the pool to start updating
    pub fn updating_timeout(&self) -> Duration {
        Duration::from_secs(self.updating_timeout_secs)
    }

    /// Deadline for the pool to finish updating
    pub fn updated_timeout(&self) -> Duration {
        Duration::from_secs(self.updated_timeout_secs)
    }

    /// Spacing between value probes
    pub fn verify_poll_interval(&self) -> Duration {
        Duration::from_secs(self.verify_poll_interval_secs)
    }

    /// Deadline for a probed value
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// Deadline for test pod lifecycle operations
    pub fn workload_timeout(&self) -> Duration {
        Duration::from_secs(self.workload_timeout_secs)
    }
}

/// Settings for the MetalLB operator checks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetalLbConfig {
    /// Namespace the operator is installed into
    pub namespace: String,
    /// Namespace holding package manifests
    pub operators_namespace: String,
    /// Package manifest / operator name
    pub operator_name: String,
    /// Subscription that installed the operator
    pub subscription_name: String,
    /// Name of the MetalLB custom resource
    pub instance_name: String,
    /// Controller deployment created for the instance
    pub deployment_name: String,
    /// Speaker daemonset
    pub daemonset_name: String,
    /// Node selector for the MetalLB instance's speakers
    pub worker_label_map: BTreeMap<String, String>,
    /// Deadline for the speaker daemonset to become ready
    pub daemonset_timeout_secs: u64,
    /// Deadline for the controller deployment to become available
    pub deployment_timeout_secs: u64,
}

impl Default for MetalLbConfig {
    fn default() -> Self {
        Self {
            namespace: "metallb-system".to_string(),
            operators_namespace: "openshift-marketplace".to_string(),
            operator_name: "metallb-operator".to_string(),
            subscription_name: "metallb-operator-sub".to_string(),
            instance_name: "metallb".to_string(),
            deployment_name: "controller".to_string(),
            daemonset_name: "speaker".to_string(),
            worker_label_map: BTreeMap::from([(
                "node-role.kubernetes.io/worker".to_string(),
                String::new(),
            )]),
            daemonset_timeout_secs: 300,
            deployment_timeout_secs: 300,
        }
    }
}

impl MetalLbConfig {
    /// Deadline for the speaker daemonset
    pub fn daemonset_timeout(&self) -> Duration {
        Duration::from_secs(self.daemonset_timeout_secs)
    }

    /// Deadline for the controller deployment
    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs)
    }
}

impl SuiteConfig {
    /// Parse a configuration document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid suite configuration: {e}")))
    }

    /// Load configuration from a file
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&data)
    }

    /// Load configuration using the resolution chain
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            debug!(path = %path.display(), "Loading suite configuration from flag");
            return Self::load_from(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                debug!(path = %path, "Loading suite configuration from environment");
                return Self::load_from(Path::new(&path));
            }
        }

        Ok(Self::default())
    }
}

/// Resolve the kubeconfig path.
///
/// Returns `None` to fall back to kube defaults (`KUBECONFIG`, `~/.kube/config`,
/// in-cluster).
pub fn resolve_kubeconfig(explicit: Option<&str>) -> Option<String> {
    if let Some(path) = explicit {
        return Some(path.to_string());
    }
    std::env::var(KUBECONFIG_ENV)
        .ok()
        .filter(|path| !path.is_empty())
}
