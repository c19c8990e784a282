mod baseline;
mod compose;
mod process;
mod track;

pub use process::Process;

use compose::compose;
use track::Tracker;

use crate::error::{BoxError, SessionError};
use crate::kubectl::Kubectl;
use crate::model::{pod_name, EngineConfig, Kind, SessionConfig};
use crate::output::{Operation, Output};
use crate::replacer::{self, Displacement};
use async_trait::async_trait;
use process::PodSnapshot;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Renders a service selector one `key=value` pair per line.
const SELECTOR_TEMPLATE: &str =
    "go-template={{range $k, $v := .spec.selector}}{{$k}}={{$v}}\n{{end}}";

/// Builds the session image on a specific node.
#[async_trait]
pub trait ImageBuild: Send + Sync {
    async fn build(&self, node: &str, op: &Operation) -> Result<(), BoxError>;
}


/// Creates, observes and tears down session pods.
pub struct SessionEngine {
    kubectl: Arc<dyn Kubectl>,
    output: Output,
    cfg: EngineConfig,
}

impl SessionEngine {
    pub fn new(kubectl: Arc<dyn Kubectl>, output: Output, cfg: EngineConfig) -> Self {
        Self {
            kubectl,
            output,
            cfg,
        }
    }

    fn k(&self) -> &dyn Kubectl {
        &*self.kubectl
    }

    async fn bounded<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        match self.cfg.timeout {
            Some(t) => tokio::time::timeout(t, fut)
                .await
                .map_err(|_| SessionError::Timeout(what))?,
            None => fut.await,
        }
    }

    /// Current selector of a service as comma-separated `key=value` pairs.
    async fn selector(&self, service: &str) -> Result<String, SessionError> {
        let pairs = self
            .k()
            .capture_lines(&[
                "get",
                "service",
                service,
                "--output",
                SELECTOR_TEMPLATE,
            ])
            .await
            .map_err(|e| SessionError::Resolution(e.to_string()))?;
        Ok(pairs
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(","))
    }

    /// Create (or recreate) the session pod for `hash` and wait until it is
    /// ready or has already exited.
    pub async fn apply(
        &self,
        hash: &str,
        config: &SessionConfig,
        build: Option<&dyn ImageBuild>,
    ) -> Result<Process, SessionError> {
        let pod = pod_name(hash);
        self.output
            .run("Creating pod", |op| async move {
                let tracker = Tracker::start(self.k(), &pod, &op);
                let res = self.create(hash, &pod, config, build, &op).await;
                tracker.stop();
                res
            })
            .await
    }

    async fn create(
        &self,
        hash: &str,
        pod: &str,
        config: &SessionConfig,
        build: Option<&dyn ImageBuild>,
        op: &Operation,
    ) -> Result<Process, SessionError> {
        let selector = format!("kdo-hash={hash}");
        self.k()
            .run(&["delete", "pod", "--selector", &selector])
            .await
            .map_err(SessionError::Teardown)?;

        op.progress("waiting for previous replacer");
        replacer::wait(self.k(), hash, &self.cfg).await?;

        let baseline = baseline::resolve(self.k(), config.inherit.as_ref()).await?;

        let displacement = match &config.inherit {
            Some(inherit) if config.replace => Some(Displacement {
                kind: inherit.kind,
                name: inherit.name.clone(),
                replicas: baseline.replicas,
                selector: if inherit.kind == Kind::Service {
                    self.selector(&inherit.name).await?
                } else {
                    String::new()
                },
            }),
            _ => None,
        };

        let manifest = compose(&baseline, config, hash, build.is_some())?;
        let data = serde_json::to_vec(&manifest)?;

        op.progress("applying manifest");
        self.k()
            .run_with_input(&data, &["apply", "--filename", "-"])
            .await
            .map_err(SessionError::Apply)?;

        let res = self
            .start(hash, pod, &baseline.container, displacement.as_ref(), build, op)
            .await;
        if res.is_err() {
            if let Err(e) = self
                .k()
                .run(&["delete", "pod", pod, "--ignore-not-found", "--wait=false"])
                .await
            {
                debug!(pod = %pod, error = %e, "cleanup after failed start");
            }
        }
        res
    }

    async fn start(
        &self,
        hash: &str,
        pod: &str,
        container: &str,
        displacement: Option<&Displacement>,
        build: Option<&dyn ImageBuild>,
        op: &Operation,
    ) -> Result<Process, SessionError> {
        if let Some(target) = displacement {
            replacer::apply(self.k(), target, hash, &self.output)
                .await
                .map_err(|e| SessionError::post_apply("replacer", e))?;
        }

        if let Some(build) = build {
            self.output
                .run("Building image", |op| async move {
                    op.progress("determining build node");
                    let node = self
                        .bounded("waiting for pod to be scheduled", self.await_node(pod))
                        .await
                        .map_err(|e| SessionError::post_apply("build", e))?;
                    debug!(pod = %pod, node = %node, "building on node");
                    build
                        .build(&node, &op)
                        .await
                        .map_err(|e| SessionError::post_apply("build", e))
                })
                .await?;
        }

        op.progress("waiting for pod");
        let exit_code = self
            .bounded("waiting for pod", self.await_ready(pod, container))
            .await
            .map_err(|e| SessionError::post_apply("readiness", e))?;

        Ok(Process::new(
            self.kubectl.clone(),
            pod.to_string(),
            container.to_string(),
            exit_code,
            self.cfg.poll_interval,
        ))
    }

    async fn await_node(&self, pod: &str) -> Result<String, SessionError> {
        loop {
            if let Some(node) = PodSnapshot::fetch(self.k(), pod).await?.node() {
                return Ok(node.to_string());
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }

    /// Poll until the pod is ready (`None`) or `container` has exited.
    async fn await_ready(&self, pod: &str, container: &str) -> Result<Option<i32>, SessionError> {
        loop {
            let snapshot = PodSnapshot::fetch(self.k(), pod).await?;
            if snapshot.ready() {
                return Ok(None);
            }
            if let Some(code) = snapshot.exit_code(container) {
                return Ok(Some(code));
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }

    /// Delete the session pod for `hash` without waiting for it to go.
    pub async fn delete(&self, hash: &str) -> Result<(), SessionError> {
        let pod = pod_name(hash);
        self.output
            .run("Deleting pod", |op| async move {
                let tracker = Tracker::start(self.k(), &pod, &op);
                let res = self
                    .k()
                    .run(&["delete", "pod", &pod, "--ignore-not-found", "--wait=false"])
                    .await
                    .map_err(SessionError::Teardown);
                tracker.stop();
                res
            })
            .await
    }

    /// Delete every session pod in the namespace, or in all namespaces.
    pub async fn delete_all(&self, all_namespaces: bool) -> Result<(), SessionError> {
        self.output
            .run("Deleting all kdo pods", |_| async move {
                let mut args = vec!["delete", "pod", "--selector", "kdo-pod=1"];
                if all_namespaces {
                    args.push("--all-namespaces");
                }
                self.k().run(&args).await.map_err(SessionError::Teardown)
            })
            .await
    }
}
