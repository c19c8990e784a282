//! Per-node build servers.
//!
//! A privileged daemon set in `kube-system` exposes each node's docker
//! socket on a TCP port, so images can be built directly on the node that
//! will run the session pod.

use crate::kubectl::{Kubectl, KubectlError};
use crate::model::EngineConfig;
use crate::output::Output;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

pub const NAMESPACE: &str = "kube-system";
pub const PORT: u16 = 2375;
const NAME: &str = "kdo-server";
const SELECTOR: &str = "component=kdo-server";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server: {0}")]
    Kubectl(#[from] KubectlError),

    #[error("server: malformed status: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("server: waiting for instances: timed out")]
    Timeout,
}

fn manifest() -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "DaemonSet",
        "metadata": {"name": NAME, "labels": {"component": NAME}},
        "spec": {
            "selector": {"matchLabels": {"component": NAME}},
            "template": {
                "metadata": {"labels": {"component": NAME}},
                "spec": {
                    "nodeSelector": {"kubernetes.io/os": "linux"},
                    "volumes": [{"name": "docker-socket", "hostPath": {"path": DOCKER_SOCKET}}],
                    "containers": [{
                        "name": NAME,
                        "image": "alpine/socat",
                        "args": ["-d", format!("tcp4-listen:{PORT},fork"), format!("UNIX-CONNECT:{DOCKER_SOCKET}")],
                        "volumeMounts": [{"name": "docker-socket", "mountPath": DOCKER_SOCKET}],
                        "securityContext": {"privileged": true},
                        "readinessProbe": {"tcpSocket": {"port": PORT}},
                    }],
                },
            },
        },
    })
}

#[derive(Deserialize)]
struct DaemonSet {
    #[serde(default)]
    status: DaemonSetStatus,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DaemonSetStatus {
    #[serde(default)]
    number_ready: i64,
    #[serde(default)]
    desired_number_scheduled: i64,
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Deserialize)]
struct Pod {
    metadata: Metadata,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    #[serde(default)]
    node_name: String,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Deserialize)]
struct ContainerStatus {
    #[serde(default)]
    ready: bool,
}

/// Apply the daemon set and wait until every instance is ready.
pub async fn install(k: &dyn Kubectl, output: &Output, cfg: &EngineConfig) -> Result<(), ServerError> {
    let data = serde_json::to_vec(&manifest())?;
    output
        .run("Installing server components", |op| async move {
            op.progress("applying manifest");
            k.run_with_input(&data, &["--namespace", NAMESPACE, "apply", "--filename", "-"])
                .await?;

            op.progress("checking readiness");
            let ready = async {
                loop {
                    let raw = k
                        .capture_string(&["--namespace", NAMESPACE, "get", "daemonset", NAME, "--output", "json"])
                        .await?;
                    let ds: DaemonSet = serde_json::from_str(&raw)?;
                    let (current, desired) = (ds.status.number_ready, ds.status.desired_number_scheduled);
                    op.progress(format!("{current}/{desired} instances are ready"));
                    if desired > 0 && current == desired {
                        return Ok::<_, ServerError>(());
                    }
                    tokio::time::sleep(cfg.poll_interval).await;
                }
            };
            match cfg.timeout {
                Some(t) => tokio::time::timeout(t, ready)
                    .await
                    .map_err(|_| ServerError::Timeout)?,
                None => ready.await,
            }
        })
        .await
}

/// Ready server pods, keyed by the node they run on.
async fn ready_pods(k: &dyn Kubectl) -> Result<(HashMap<String, String>, usize), ServerError> {
    let raw = k
        .capture_string(&["--namespace", NAMESPACE, "get", "pod", "--selector", SELECTOR, "--output", "json"])
        .await?;
    let list: PodList = serde_json::from_str(&raw)?;
    let total = list.items.len();
    let ready = list
        .items
        .into_iter()
        .filter(|p| {
            !p.spec.node_name.is_empty()
                && !p.status.container_statuses.is_empty()
                && p.status.container_statuses.iter().all(|c| c.ready)
        })
        .map(|p| (p.spec.node_name, p.metadata.name))
        .collect();
    Ok((ready, total))
}

/// Map each node to a ready server pod, installing the servers when some
/// are missing or not ready.
pub async fn node_pods(
    k: &dyn Kubectl,
    output: &Output,
    cfg: &EngineConfig,
) -> Result<HashMap<String, String>, ServerError> {
    let (pods, total) = ready_pods(k).await?;
    if total > 0 && pods.len() == total {
        return Ok(pods);
    }
    debug!(ready = pods.len(), total, "build servers incomplete");
    install(k, output, cfg).await?;
    Ok(ready_pods(k).await?.0)
}

pub async fn uninstall(k: &dyn Kubectl, output: &Output) -> Result<(), ServerError> {
    output
        .run("Uninstalling server components", |_| async move {
            k.run(&["--namespace", NAMESPACE, "delete", "daemonset", "--selector", SELECTOR])
                .await?;
            Ok::<_, ServerError>(())
        })
        .await
}
