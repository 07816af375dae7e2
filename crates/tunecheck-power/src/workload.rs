//! Ephemeral test pods with guaranteed QoS

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use tunecheck_common::poll::Poller;
use tunecheck_common::{Error, Result, Target, FIELD_MANAGER, MANAGED_BY_LABEL};

use crate::executor::pod_phase;

/// QoS class Kubernetes assigns when requests equal limits for every resource
pub const QOS_GUARANTEED: &str = "Guaranteed";

/// CRI-O annotations that hand a pod's CPUs over to the pod: no load
/// balancing, no CFS quota, no IRQs, no C-states, and the `performance`
/// governor
pub fn power_state_annotations() -> BTreeMap<String, String> {
    [
        ("cpu-load-balancing.crio.io", "disable"),
        ("cpu-quota.crio.io", "disable"),
        ("irq-load-balancing.crio.io", "disable"),
        ("cpu-c-states.crio.io", "disable"),
        ("cpu-freq-governor.crio.io", "performance"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Definition of a guaranteed-QoS test pod
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadSpec {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
    /// Node the pod is pinned to
    pub node: String,
    /// Container image
    pub image: String,
    /// CPU request and limit (whole CPUs)
    pub cpus: u32,
    /// Memory request and limit
    pub memory: String,
    /// Pod annotations
    pub annotations: BTreeMap<String, String>,
    /// Runtime class, if any
    pub runtime_class: Option<String>,
}

impl WorkloadSpec {
    /// Target addressing the pod once created
    pub fn target(&self) -> Target {
        Target::pod(&self.namespace, &self.name)
    }

    /// Render the pod object
    pub fn to_pod(&self) -> Pod {
        let amounts = BTreeMap::from([
            ("cpu".to_string(), Quantity(self.cpus.to_string())),
            ("memory".to_string(), Quantity(self.memory.clone())),
        ]);

        Pod {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                annotations: Some(self.annotations.clone()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(self.node.clone()),
                runtime_class_name: self.runtime_class.clone(),
                restart_policy: Some("Never".to_string()),
                termination_grace_period_seconds: Some(0),
                containers: vec![Container {
                    name: "test".to_string(),
                    image: Some(self.image.clone()),
                    command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                    resources: Some(ResourceRequirements {
                        requests: Some(amounts.clone()),
                        limits: Some(amounts),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Create, observe and delete ephemeral test pods
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadLifecycle: Send + Sync {
    /// Create the pod and return its target
    async fn create(&self, spec: &WorkloadSpec) -> Result<Target>;

    /// Wait until the pod is running with guaranteed QoS
    async fn wait_running(&self, target: &Target) -> Result<()>;

    /// Whether the pod still exists
    async fn exists(&self, target: &Target) -> Result<bool>;

    /// Delete the pod and wait until it is gone
    async fn delete(&self, target: &Target) -> Result<()>;
}

/// [`WorkloadLifecycle`] over the Pod API
pub struct KubeWorkloads {
    client: Client,
    poller: Poller,
}

impl KubeWorkloads {
    /// Create a lifecycle manager with the given wait budget
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            poller: Poller::new(Duration::from_secs(2), timeout),
        }
    }

    fn api(&self, target: &Target) -> Result<(Api<Pod>, String)> {
        match target {
            Target::Pod { namespace, name } => {
                Ok((Api::namespaced(self.client.clone(), namespace), name.clone()))
            }
            other => Err(Error::validation(format!("{other} is not a pod"))),
        }
    }
}

#[async_trait]
impl WorkloadLifecycle for KubeWorkloads {
    async fn create(&self, spec: &WorkloadSpec) -> Result<Target> {
        let target = spec.target();
        let (pods, _) = self.api(&target)?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        pods.create(&params, &spec.to_pod()).await?;
        info!(pod = %target, node = %spec.node, "Created test pod");
        Ok(target)
    }

    async fn wait_running(&self, target: &Target) -> Result<()> {
        let (pods, name) = self.api(target)?;
        let (pods, name) = (&pods, name.as_str());

        self.poller
            .poll(&format!("{target} to be running"), || async move {
                let Some(pod) = pods.get_opt(name).await? else {
                    return Ok(None);
                };
                match pod_phase(&pod) {
                    Some("Running") => {}
                    Some("Failed") | Some("Succeeded") => {
                        return Err(Error::validation(format!(
                            "{target} terminated before running"
                        )))
                    }
                    _ => return Ok(None),
                }
                let qos = pod.status.as_ref().and_then(|s| s.qos_class.as_deref());
                if qos != Some(QOS_GUARANTEED) {
                    return Err(Error::validation(format!(
                        "{target} has QoS class {}, expected {QOS_GUARANTEED}",
                        qos.unwrap_or("<none>")
                    )));
                }
                Ok(Some(()))
            })
            .await
    }

    async fn exists(&self, target: &Target) -> Result<bool> {
        let (pods, name) = self.api(target)?;
        Ok(pods.get_opt(&name).await?.is_some())
    }

    async fn delete(&self, target: &Target) -> Result<()> {
        let (pods, name) = self.api(target)?;
        match pods.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let (pods, name) = (&pods, name.as_str());
        self.poller
            .poll(&format!("{target} to be deleted"), || async move {
                Ok(match pods.get_opt(name).await? {
                    Some(_) => None,
                    None => Some(()),
                })
            })
            .await?;
        info!(pod = %target, "Deleted test pod");
        Ok(())
    }
}
