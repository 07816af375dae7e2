//! Remote command execution on nodes and pods.
//!
//! This is the only I/O boundary between the verification engine and the
//! system under test. Pod targets run `sh -c <command>` in the pod's default
//! container. Node targets run through a privileged host-probe pod pinned to
//! the node, with the host filesystem mounted at `/host` and the command run
//! under `chroot /host`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, Pod, PodSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use kube::api::{Api, AttachParams, DeleteParams, PostParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use tunecheck_common::poll::Poller;
use tunecheck_common::{Error, Result, Target, FIELD_MANAGER, MANAGED_BY_LABEL};

/// Prefix of host-probe pod names; the node name is appended
pub const HOST_PROBE_PREFIX: &str = "tunecheck-probe";

/// Mount point of the host root filesystem inside host-probe pods
pub const HOST_MOUNT: &str = "/host";

/// Runs a command on a target and returns its raw standard output
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Execute `command` through a shell on `target`.
    ///
    /// Output is returned untrimmed. A non-zero exit status is an error whose
    /// message includes stderr. No retries happen at this layer.
    async fn execute(&self, target: &Target, command: &str) -> Result<String>;
}

/// [`RemoteExecutor`] over the pod exec subresource
pub struct PodExecutor {
    client: Client,
    namespace: String,
    image: String,
    poller: Poller,
    host_pods: Mutex<HashMap<String, String>>,
}

impl PodExecutor {
    /// Create an executor that places host-probe pods in `namespace`
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        image: impl Into<String>,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            image: image.into(),
            poller: Poller::new(Duration::from_secs(2), startup_timeout),
            host_pods: Mutex::new(HashMap::new()),
        }
    }

    /// Delete every host-probe pod this executor created
    pub async fn shutdown(&self) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut host_pods = self.host_pods.lock().await;
        for (node, pod) in host_pods.drain() {
            match pods.delete(&pod, &DeleteParams::default()).await {
                Ok(_) => debug!(node = %node, pod = %pod, "Deleted host-probe pod"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn host_probe_pod(&self, node: &str) -> Result<String> {
        let mut host_pods = self.host_pods.lock().await;
        if let Some(name) = host_pods.get(node) {
            return Ok(name.clone());
        }

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pod = host_probe_pod_spec(node, &self.namespace, &self.image);
        let name = pod.metadata.name.clone().unwrap_or_default();

        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match pods.create(&params, &pod).await {
            Ok(_) => info!(node = %node, pod = %name, "Created host-probe pod"),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(node = %node, pod = %name, "Reusing existing host-probe pod")
            }
            Err(e) => return Err(e.into()),
        }

        wait_for_pod_running(&pods, &name, &self.poller).await?;
        host_pods.insert(node.to_string(), name.clone());
        Ok(name)
    }
}

#[async_trait]
impl RemoteExecutor for PodExecutor {
    async fn execute(&self, target: &Target, command: &str) -> Result<String> {
        let (namespace, pod, argv) = match target {
            Target::Node(node) => {
                let pod = self.host_probe_pod(node).await?;
                (self.namespace.clone(), pod, host_command(command))
            }
            Target::Pod { namespace, name } => {
                (namespace.clone(), name.clone(), shell_command(command))
            }
            Target::Cpu(_) => {
                return Err(Error::validation(format!(
                    "cannot execute commands on {target}; use its node or a pod"
                )))
            }
        };

        debug!(target = %target, command = %command, "Executing remote command");
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        exec_in_pod(&pods, &pod, argv, target).await
    }
}

/// `sh -c <command>`
pub fn shell_command(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}

/// `chroot /host sh -c <command>`
pub fn host_command(command: &str) -> Vec<String> {
    let mut argv = vec!["chroot".to_string(), HOST_MOUNT.to_string()];
    argv.extend(shell_command(command));
    argv
}

async fn exec_in_pod(
    pods: &Api<Pod>,
    pod: &str,
    argv: Vec<String>,
    target: &Target,
) -> Result<String> {
    let params = AttachParams::default().stdin(false).stdout(true).stderr(true);
    let mut attached = pods.exec(pod, argv, &params).await.map_err(|e| {
        // Keep API server outages retryable; everything else is an exec failure
        let err = Error::from(e);
        if err.is_transient() {
            err
        } else {
            Error::exec(target, format!("exec in pod {pod} failed: {err}"))
        }
    })?;

    let stdout = attached.stdout();
    let stderr = attached.stderr();
    let status = attached.take_status();

    let (out, err) = tokio::join!(read_stream(stdout), read_stream(stderr));
    let out = out.map_err(|e| Error::exec(target, format!("failed to read stdout: {e}")))?;
    let err = err.map_err(|e| Error::exec(target, format!("failed to read stderr: {e}")))?;

    let status = match status {
        Some(status) => status.await,
        None => None,
    };
    attached
        .join()
        .await
        .map_err(|e| Error::exec(target, format!("exec session failed: {e}")))?;

    check_exit_status(status.as_ref(), &err).map_err(|message| Error::exec(target, message))?;
    Ok(out)
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> std::io::Result<String> {
    let mut buf = String::new();
    if let Some(mut reader) = stream {
        reader.read_to_string(&mut buf).await?;
    }
    Ok(buf)
}

/// Turn the exec status channel into a pass/fail verdict
fn check_exit_status(status: Option<&Status>, stderr: &str) -> std::result::Result<(), String> {
    match status {
        Some(s) if s.status.as_deref() == Some("Failure") => {
            let message = s.message.clone().unwrap_or_else(|| "command failed".to_string());
            let stderr = stderr.trim();
            if stderr.is_empty() {
                Err(message)
            } else {
                Err(format!("{message}: {stderr}"))
            }
        }
        _ => Ok(()),
    }
}

async fn wait_for_pod_running(pods: &Api<Pod>, name: &str, poller: &Poller) -> Result<()> {
    poller
        .poll(&format!("pod {name} to be running"), || async move {
            let pod = match pods.get_opt(name).await? {
                Some(pod) => pod,
                None => return Ok(None),
            };
            match pod_phase(&pod) {
                Some("Running") => Ok(Some(())),
                Some("Failed") | Some("Succeeded") => Err(Error::exec(
                    Target::pod(pods_namespace(&pod), name),
                    "pod terminated before it could run commands",
                )),
                _ => Ok(None),
            }
        })
        .await
}

pub(crate) fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

fn pods_namespace(pod: &Pod) -> String {
    pod.metadata.namespace.clone().unwrap_or_default()
}

/// Host-probe pod definition for `node`
pub fn host_probe_pod_spec(node: &str, namespace: &str, image: &str) -> Pod {
    let name = format!("{HOST_PROBE_PREFIX}-{node}");
    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string()),
                ("app.kubernetes.io/component".to_string(), "host-probe".to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            host_pid: Some(true),
            host_network: Some(true),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(0),
            tolerations: Some(vec![k8s_openapi::api::core::v1::Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: "probe".to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    run_as_user: Some(0),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: "host".to_string(),
                    mount_path: HOST_MOUNT.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "host".to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: "/".to_string(),
                    type_: Some("Directory".to_string()),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Log-and-continue wrapper for best-effort executor cleanup
pub async fn shutdown_quietly(executor: &PodExecutor) {
    if let Err(e) = executor.shutdown().await {
        warn!(error = %e, "Failed to delete host-probe pods");
    }
}
