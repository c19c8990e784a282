use crate::error::SessionError;
use crate::kubectl::Kubectl;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// The parts of a pod's live state the engine polls.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct PodSnapshot {
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    node_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    name: String,
    #[serde(default)]
    state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerState {
    terminated: Option<Terminated>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Terminated {
    exit_code: i32,
}

impl PodSnapshot {
    pub(crate) async fn fetch(k: &dyn Kubectl, pod: &str) -> Result<Self, SessionError> {
        let raw = k
            .capture_string(&["get", "pod", pod, "--output", "json"])
            .await
            .map_err(SessionError::Status)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub(crate) fn node(&self) -> Option<&str> {
        self.spec.node_name.as_deref().filter(|n| !n.is_empty())
    }

    pub(crate) fn ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True")
    }

    /// Exit code of `container`, once it has terminated.
    pub(crate) fn exit_code(&self, container: &str) -> Option<i32> {
        self.status
            .container_statuses
            .iter()
            .find(|s| s.name == container)
            .and_then(|s| s.state.terminated.as_ref())
            .map(|t| t.exit_code)
    }
}

/// Handle to the main container of a running session pod.
pub struct Process {
    kubectl: Arc<dyn Kubectl>,
    pub pod: String,
    pub container: String,
    exit_code: OnceCell<i32>,
    poll_interval: Duration,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pod", &self.pod)
            .field("container", &self.container)
            .field("exit_code", &self.exit_code.get())
            .finish()
    }
}

impl Process {
    pub(crate) fn new(
        kubectl: Arc<dyn Kubectl>,
        pod: String,
        container: String,
        exit_code: Option<i32>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            kubectl,
            pod,
            container,
            exit_code: OnceCell::new_with(exit_code),
            poll_interval,
        }
    }

    /// Whether the exit code is already known.
    pub fn exited(&self) -> bool {
        self.exit_code.initialized()
    }

    /// Exit code of the container, waiting for it to terminate if needed.
    /// Only the first successful call reads from the cluster.
    pub async fn exit_code(&self) -> Result<i32, SessionError> {
        self.exit_code
            .get_or_try_init(|| async {
                loop {
                    let snapshot = PodSnapshot::fetch(&*self.kubectl, &self.pod).await?;
                    if let Some(code) = snapshot.exit_code(&self.container) {
                        return Ok::<_, SessionError>(code);
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            })
            .await
            .copied()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::kubectl::fake::{FakeKubectl, Reply};

    fn snapshot(raw: &str) -> PodSnapshot {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn snapshot_reads_readiness_and_exit() {
        assert!(snapshot(&ready("n")).ready());
        assert!(!snapshot(&running("n")).ready());
        assert_eq!(snapshot(&terminated(2)).exit_code("web"), Some(2));
        assert_eq!(snapshot(&terminated(2)).exit_code("sidecar"), None);
        assert_eq!(snapshot(&running("n")).exit_code("web"), None);
    }

    #[test]
    fn unscheduled_pod_has_no_node() {
        assert_eq!(snapshot("{}").node(), None);
        assert_eq!(snapshot(r#"{"spec": {"nodeName": ""}}"#).node(), None);
        assert_eq!(snapshot(&running("node-1")).node(), Some("node-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn exit_code_is_read_once() {
        let k = Arc::new(FakeKubectl::new());
        k.script(
            &["get", "pod", "kdo-h"],
            vec![Reply::Stdout(running("n")), Reply::Stdout(terminated(7))],
        );
        let p = Process::new(k.clone(), "kdo-h".into(), "web".into(), None, Duration::from_secs(1));
        assert!(!p.exited());
        assert_eq!(p.exit_code().await.unwrap(), 7);
        assert!(p.exited());
        let reads = k.count(&["get", "pod"]);
        assert_eq!(reads, 2);
        assert_eq!(p.exit_code().await.unwrap(), 7);
        assert_eq!(k.count(&["get", "pod"]), reads);
    }

    #[tokio::test]
    async fn known_exit_code_needs_no_reads() {
        let k = Arc::new(FakeKubectl::new());
        let p = Process::new(k.clone(), "kdo-h".into(), "web".into(), Some(1), Duration::from_secs(1));
        assert!(p.exited());
        assert_eq!(p.exit_code().await.unwrap(), 1);
        assert!(k.calls().is_empty());
    }

    #[test]
    fn debug_shows_identity_and_known_exit_code() {
        let k = Arc::new(FakeKubectl::new());
        let p = Process::new(k, "kdo-h".into(), "web".into(), Some(2), Duration::from_secs(1));
        assert_eq!(
            format!("{p:?}"),
            r#"Process { pod: "kdo-h", container: "web", exit_code: Some(2) }"#
        );
    }

    #[tokio::test]
    async fn failed_read_is_not_memoized() {
        let k = Arc::new(FakeKubectl::new());
        k.script(
            &["get", "pod", "kdo-h"],
            vec![
                Reply::Stderr("error: the server is currently unable to handle the request".into()),
                Reply::Stdout(terminated(0)),
            ],
        );
        let p = Process::new(k.clone(), "kdo-h".into(), "web".into(), None, Duration::from_secs(1));
        assert!(matches!(p.exit_code().await, Err(SessionError::Status(_))));
        assert!(!p.exited());
        assert_eq!(p.exit_code().await.unwrap(), 0);
    }
}
