//! Shared Kubernetes utilities using kube-rs

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::poll::Poller;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result, FIELD_MANAGER, MANAGED_BY_LABEL};

/// Condition status value for "True"
pub const STATUS_TRUE: &str = "True";

/// Deployment condition type for availability
pub const CONDITION_AVAILABLE: &str = "Available";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Default spacing for resource polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Create a kube client from an optional kubeconfig path and check that the
/// API server answers.
///
/// Retries transient failures so a briefly unreachable API server (common
/// right after a rollout reboots a single-node cluster) does not fail the run.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    create_client_with_retry(kubeconfig, &RetryConfig::with_max_attempts(10)).await
}

/// [`create_client`] with an explicit retry budget for the reachability check.
///
/// Kubeconfig problems are returned immediately as [`Error::Config`].
pub async fn create_client_with_retry(
    kubeconfig: Option<&Path>,
    retry: &RetryConfig,
) -> Result<Client> {
    let client = create_client_once(kubeconfig).await?;
    retry_with_backoff(retry, "kube_apiserver_version", || {
        let client = client.clone();
        async move {
            let version = client.apiserver_version().await?;
            debug!(version = %version.git_version, "API server reachable");
            Ok(())
        }
    })
    .await?;
    Ok(client)
}

async fn create_client_once(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };

    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Build an ApiResource for a group/version/kind known at compile time
pub fn build_api_resource(group: &str, version: &str, kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

/// Look up a condition's status in an untyped `status.conditions` array.
///
/// Returns `None` when the condition is not present at all.
pub fn condition_status(status: Option<&serde_json::Value>, condition_type: &str) -> Option<bool> {
    find_condition(status, condition_type)
        .map(|c| c.get("status").and_then(|s| s.as_str()) == Some(STATUS_TRUE))
}

/// Message of a condition in an untyped `status.conditions` array
pub fn condition_message(status: Option<&serde_json::Value>, condition_type: &str) -> Option<String> {
    find_condition(status, condition_type)
        .and_then(|c| c.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

fn find_condition<'a>(
    status: Option<&'a serde_json::Value>,
    condition_type: &str,
) -> Option<&'a serde_json::Value> {
    status?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(condition_type))
}

/// Check if a Deployment reports the Available condition
pub fn deployment_available(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == CONDITION_AVAILABLE && c.status == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Check if every scheduled DaemonSet pod is ready
pub fn daemonset_ready(daemonset: &DaemonSet) -> bool {
    daemonset
        .status
        .as_ref()
        .map(|s| s.desired_number_scheduled > 0 && s.number_ready == s.desired_number_scheduled)
        .unwrap_or(false)
}

/// Ensure a namespace exists, creating it if needed.
///
/// `labels` are applied on creation only (e.g. pod-security labels for
/// privileged pods).
pub async fn ensure_namespace(
    client: &Client,
    name: &str,
    labels: &[(&str, &str)],
) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    if api.get_opt(name).await?.is_some() {
        debug!(namespace = %name, "Namespace already exists");
        return Ok(());
    }

    let mut all_labels: std::collections::BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    all_labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());

    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(all_labels),
            ..Default::default()
        },
        ..Default::default()
    };

    match api.create(&PostParams::default(), &ns).await {
        Ok(_) => {
            info!(namespace = %name, "Created namespace");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Check whether a namespace exists, polling briefly to ride out API blips
pub async fn namespace_exists(client: &Client, name: &str, timeout: Duration) -> Result<bool> {
    let api: Api<Namespace> = Api::all(client.clone());
    Poller::new(Duration::from_millis(500), timeout)
        .poll(&format!("namespace {name}"), || {
            let api = api.clone();
            async move { Ok(Some(api.get_opt(name).await?.is_some())) }
        })
        .await
}

/// Delete a namespace and wait until it is gone
pub async fn delete_namespace_and_wait(
    client: &Client,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());

    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    Poller::new(DEFAULT_POLL_INTERVAL, timeout)
        .poll(&format!("namespace {name} deletion"), || {
            let api = api.clone();
            async move {
                Ok(match api.get_opt(name).await? {
                    Some(_) => None,
                    None => Some(()),
                })
            }
        })
        .await?;

    info!(namespace = %name, "Deleted namespace");
    Ok(())
}

/// Wait for a deployment to report Available
pub async fn wait_for_deployment(
    client: &Client,
    name: &str,
    namespace: &str,
    timeout: Duration,
) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    Poller::new(DEFAULT_POLL_INTERVAL, timeout)
        .poll(
            &format!("deployment {namespace}/{name} to be available"),
            || {
                let api = api.clone();
                async move {
                    Ok(match api.get_opt(name).await? {
                        Some(d) if deployment_available(&d) => Some(()),
                        _ => None,
                    })
                }
            },
        )
        .await
}

/// Wait for every pod of a daemonset to be ready
pub async fn wait_for_daemonset(
    client: &Client,
    name: &str,
    namespace: &str,
    timeout: Duration,
) -> Result<()> {
    let api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    Poller::new(DEFAULT_POLL_INTERVAL, timeout)
        .poll(&format!("daemonset {namespace}/{name} to be ready"), || {
            let api = api.clone();
            async move {
                Ok(match api.get_opt(name).await? {
                    Some(ds) if daemonset_ready(&ds) => Some(()),
                    _ => None,
                })
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DaemonSetStatus, DeploymentCondition, DeploymentStatus};
    use serde_json::json;

    const UNREACHABLE_KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: local
  cluster:
    server: http://127.0.0.1:1
contexts:
- name: local
  context:
    cluster: local
    user: local
current-context: local
users:
- name: local
  user:
    token: unused
"#;

    fn quick_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unreachable_api_server_fails_with_a_transient_kube_error() {
        crate::install_crypto_provider();
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("kubeconfig");
        std::fs::write(&path, UNREACHABLE_KUBECONFIG).expect("write kubeconfig");

        let err = create_client_with_retry(Some(&path), &quick_retry())
            .await
            .err().expect("nothing listens on port 1");

        assert!(matches!(err, Error::Kube { .. }), "got {err:?}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn missing_kubeconfig_is_a_config_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("absent");

        let err = create_client_with_retry(Some(&path), &quick_retry())
            .await
            .err().expect("kubeconfig does not exist");

        assert!(matches!(err, Error::Config { .. }), "got {err:?}");
        assert!(!err.is_transient());
    }

    #[test]
    fn condition_status_reads_untyped_conditions() {
        let status = json!({
            "conditions": [
                {"type": "Updating", "status": "True"},
                {"type": "Updated", "status": "False"},
                {"type": "Degraded", "status": "False", "message": "all good"}
            ]
        });

        assert_eq!(condition_status(Some(&status), "Updating"), Some(true));
        assert_eq!(condition_status(Some(&status), "Updated"), Some(false));
        assert_eq!(condition_status(Some(&status), "RenderDegraded"), None);
        assert_eq!(condition_status(None, "Updating"), None);
        assert_eq!(
            condition_message(Some(&status), "Degraded").as_deref(),
            Some("all good")
        );
    }

    #[test]
    fn deployment_available_requires_true_condition() {
        let mut deployment = Deployment::default();
        assert!(!deployment_available(&deployment));

        deployment.status = Some(DeploymentStatus {
            conditions: Some(vec![DeploymentCondition {
                type_: CONDITION_AVAILABLE.to_string(),
                status: STATUS_TRUE.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(deployment_available(&deployment));
    }

    #[test]
    fn daemonset_ready_needs_all_scheduled_pods() {
        let mut ds = DaemonSet::default();
        assert!(!daemonset_ready(&ds));

        ds.status = Some(DaemonSetStatus {
            desired_number_scheduled: 3,
            number_ready: 2,
            ..Default::default()
        });
        assert!(!daemonset_ready(&ds));

        if let Some(status) = ds.status.as_mut() {
            status.number_ready = 3;
        }
        assert!(daemonset_ready(&ds));
    }

    #[test]
    fn api_resource_uses_plural_kind() {
        let ar = build_api_resource("machineconfiguration.openshift.io", "v1", "MachineConfigPool");
        assert_eq!(ar.api_version, "machineconfiguration.openshift.io/v1");
        assert_eq!(ar.plural, "machineconfigpools");
    }
}
