//! Building the session image directly on a cluster node.

use crate::engine::ImageBuild;
use crate::error::BoxError;
use crate::kubectl::{spawn_stream, Kubectl, KubectlError};
use crate::model::EngineConfig;
use crate::output::{Level, Operation, Output};
use crate::portforward::{self, ForwardError};
use crate::server::{self, ServerError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ImageBuildError {
    #[error("imagebuild: cannot build on node {0}")]
    NoServer(String),

    #[error("imagebuild: {0}")]
    Server(#[from] ServerError),

    #[error("imagebuild: {0}")]
    Forward(#[from] ForwardError),

    #[error("imagebuild: {0}")]
    Docker(#[from] KubectlError),
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub file: Option<String>,
    pub args: Vec<String>,
    pub target: Option<String>,
}

/// Builds `image` from `context` with the docker daemon of the node that
/// will run the session pod.
pub struct DockerBuild {
    kubectl: Arc<dyn Kubectl>,
    docker: String,
    image: String,
    context: String,
    options: BuildOptions,
    output: Output,
    cfg: EngineConfig,
}

impl DockerBuild {
    pub fn new(
        kubectl: Arc<dyn Kubectl>,
        docker: impl Into<String>,
        image: impl Into<String>,
        context: impl Into<String>,
        options: BuildOptions,
        output: Output,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            kubectl,
            docker: docker.into(),
            image: image.into(),
            context: context.into(),
            options,
            output,
            cfg,
        }
    }

    fn args(&self, port: &str) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            format!("tcp://localhost:{port}"),
            "build".to_string(),
        ];
        if let Some(file) = &self.options.file {
            args.push("--file".into());
            args.push(file.clone());
        }
        for arg in &self.options.args {
            args.push("--build-arg".into());
            args.push(arg.clone());
        }
        if let Some(target) = &self.options.target {
            args.push("--target".into());
            args.push(target.clone());
        }
        args.push("--tag".into());
        args.push(self.image.clone());
        args.push(self.context.clone());
        args
    }

    async fn run(&self, node: &str, op: &Operation) -> Result<(), ImageBuildError> {
        let k = &*self.kubectl;

        op.progress("determining build pod");
        let pods = server::node_pods(k, &self.output, &self.cfg).await?;
        let pod = pods
            .get(node)
            .ok_or_else(|| ImageBuildError::NoServer(node.to_string()))?;

        op.progress("connecting to docker daemon");
        let (port, forward) = portforward::start_one(k, server::NAMESPACE, pod, server::PORT).await?;

        op.progress("running");
        let mut cmd = Command::new(&self.docker);
        // The classic builder reports `Step n/m` on stdout.
        cmd.args(self.args(&port)).env("DOCKER_BUILDKIT", "0");
        let output = self.output.clone();
        let progress = op.clone();
        let mut stream = spawn_stream(
            cmd,
            "docker".to_string(),
            Box::new(move |line| match progress_line(line) {
                Some(step) if output.level() < Level::Verbose => progress.progress(step),
                _ => output.verbose(format!("[docker] {line}")),
            }),
        );
        let res = stream.wait().await;
        forward.stop();
        Ok(res?)
    }
}

/// Progress worth surfacing from a line of classic `docker build` output.
fn progress_line(line: &str) -> Option<String> {
    if line.starts_with("Step ") || line.starts_with("Sending build context ") {
        Some(format!("s{}", &line[1..]))
    } else {
        None
    }
}

#[async_trait]
impl ImageBuild for DockerBuild {
    async fn build(&self, node: &str, op: &Operation) -> Result<(), BoxError> {
        Ok(self.run(node, op).await?)
    }
}
