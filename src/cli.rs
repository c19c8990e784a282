use crate::engine::{ImageBuild, Process, SessionEngine};
use crate::imagebuild::{BuildOptions, DockerBuild};
use crate::kubectl::{Kubectl, KubectlCli, Options};
use crate::model::{session_hash, EngineConfig, InheritRef, Override, SessionConfig};
use crate::output::{Level, Output};
use crate::{portforward, replacer, server};
use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Parser, Clone)]
#[command(
    name = "kdo",
    version,
    about = "Run a disposable pod that inherits the configuration of an existing workload",
    override_usage = "kdo [flags] IMAGE|.DIR [COMMAND [ARG...]]"
)]
pub struct Cli {
    /// Path to the kubectl CLI
    #[arg(long, default_value = "kubectl")]
    pub kubectl: String,

    /// Path to the kubeconfig file to use
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// The name of the kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// The namespace scope for this CLI request
    #[arg(short = 'n', long)]
    pub namespace: Option<String>,

    /// Log level for the kubectl CLI
    #[arg(long = "kubectl-v", default_value_t = 0)]
    pub kubectl_v: u8,

    /// Install the per-node build servers
    #[arg(long)]
    pub install: bool,

    /// Remove every kdo object from the cluster
    #[arg(long)]
    pub uninstall: bool,

    /// Scoping value for the session hash (defaults to the host name)
    #[arg(long)]
    pub scope: Option<String>,

    /// Path to the docker CLI
    #[arg(long, default_value = "docker")]
    pub docker: String,

    /// Dockerfile to build with, relative to the working directory
    #[arg(short = 'f', long)]
    pub build_file: Option<String>,

    /// Build-time variable (NAME=VALUE), repeatable
    #[arg(long)]
    pub build_arg: Vec<String>,

    /// Dockerfile target stage to build
    #[arg(long)]
    pub build_target: Option<String>,

    /// Inherit an existing configuration: [KIND/]NAME[:CONTAINER]
    #[arg(short = 'c', long)]
    pub inherit: Option<String>,

    /// Inherit pod labels
    #[arg(short = 'L', long)]
    pub inherit_labels: bool,

    /// Inherit pod annotations
    #[arg(short = 'A', long)]
    pub inherit_annotations: bool,

    /// Set, inherit (NAME) or remove (NAME=) a pod label, repeatable
    #[arg(long = "label")]
    pub labels: Vec<String>,

    /// Set, inherit (NAME) or remove (NAME=) a pod annotation, repeatable
    #[arg(long = "annotate")]
    pub annotations: Vec<String>,

    /// Set, inherit (NAME) or remove (NAME=) an environment variable, repeatable
    #[arg(short = 'e', long)]
    pub env: Vec<String>,

    /// Drop the inherited lifecycle hooks
    #[arg(long)]
    pub no_lifecycle: bool,

    /// Drop the inherited liveness, readiness and startup probes
    #[arg(long)]
    pub no_probes: bool,

    /// Scale the inherited workload to zero (or take over its service)
    /// while the session runs
    #[arg(short = 'R', long)]
    pub replace: bool,

    /// Forward a local port to the pod ([LOCAL:]REMOTE), repeatable
    #[arg(short = 'p', long)]
    pub forward: Vec<String>,

    /// Pass stdin to the container
    #[arg(short = 'i', long)]
    pub stdin: bool,

    /// Allocate a TTY for the container
    #[arg(short = 't', long)]
    pub tty: bool,

    /// Leave the pod running after kdo exits
    #[arg(short = 'd', long)]
    pub detach: bool,

    /// Delete the pod for this session and exit
    #[arg(long)]
    pub delete: bool,

    /// Delete every kdo pod in the namespace and exit
    #[arg(long)]
    pub delete_all: bool,

    /// Only print errors
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Print kubectl and docker output
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Print every command kdo runs
    #[arg(long)]
    pub debug: bool,

    /// Delay between polls of pod and server status
    #[arg(long, default_value = "1s")]
    pub poll_interval: humantime::Duration,

    /// Give up on any single wait after this long (e.g. 5m)
    #[arg(long)]
    pub timeout: Option<humantime::Duration>,

    /// IMAGE (or .DIR to build), followed by the command and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
    pub args: Vec<String>,
}

impl Cli {
    pub fn level(&self) -> Level {
        if self.quiet {
            Level::Quiet
        } else if self.debug {
            Level::Debug
        } else if self.verbose {
            Level::Verbose
        } else {
            Level::Normal
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: *self.poll_interval,
            timeout: self.timeout.as_ref().map(|t| **t),
        }
    }

    fn kubectl_options(&self) -> Options {
        Options {
            kubeconfig: self.kubeconfig.clone(),
            context: self.context.clone(),
            namespace: self.namespace.clone(),
            verbosity: self.kubectl_v,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.install {
            if self.uninstall {
                bail!("--install cannot be used with --uninstall");
            }
            if !self.args.is_empty() {
                bail!("--install takes no arguments");
            }
        }
        if self.uninstall && !self.args.is_empty() {
            bail!("--uninstall takes no arguments");
        }
        if self.replace && self.inherit.is_none() {
            bail!("-R/--replace requires -c/--inherit");
        }
        if self.detach {
            if !self.forward.is_empty() {
                bail!("-p/--forward cannot be used with -d/--detach");
            }
            if self.delete || self.delete_all {
                bail!("-d/--detach cannot be used with --delete or --delete-all");
            }
        }
        if self.delete && self.args.len() > 1 {
            bail!("--delete takes at most one argument");
        }
        if self.delete_all && !self.args.is_empty() {
            bail!("--delete-all takes no arguments");
        }
        Ok(())
    }

    fn session_config(&self, image: String) -> Result<SessionConfig> {
        let inherit = match &self.inherit {
            Some(s) => Some(s.parse::<InheritRef>().context("invalid -c/--inherit")?),
            None => None,
        };
        Ok(SessionConfig {
            inherit,
            inherit_labels: self.inherit_labels,
            inherit_annotations: self.inherit_annotations,
            labels: Override::parse_all(&self.labels),
            annotations: Override::parse_all(&self.annotations),
            env: Override::parse_all(&self.env),
            image,
            command: self.args.iter().skip(1).cloned().collect(),
            no_lifecycle: self.no_lifecycle,
            no_probes: self.no_probes,
            replace: self.replace,
            stdin: self.stdin,
            tty: self.tty,
            detach: self.detach,
        })
    }
}

/// Host-derived default for `--scope`.
fn default_scope() -> String {
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.is_empty() {
            return host;
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// The image or build directory a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Image(String),
    Build(String),
}

impl Target {
    fn parse(arg: &str) -> Result<Self> {
        if !arg.starts_with('.') {
            return Ok(Target::Image(arg.to_string()));
        }
        let dir = std::path::absolute(arg).with_context(|| format!("resolving {arg}"))?;
        Ok(Target::Build(dir.to_string_lossy().into_owned()))
    }

    fn as_str(&self) -> &str {
        match self {
            Target::Image(s) | Target::Build(s) => s,
        }
    }

    /// Image reference the pod runs; builds get a fresh tag every time.
    fn image(&self, hash: &str) -> String {
        match self {
            Target::Image(image) => image.clone(),
            Target::Build(_) => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or_default();
                format!("kdo-{hash}:{nanos}")
            }
        }
    }
}

/// Run kdo and return the process exit code.
pub async fn run(args: Cli, output: Output) -> Result<i32> {
    args.validate()?;
    let kubectl: Arc<dyn Kubectl> = Arc::new(KubectlCli::new(
        args.kubectl.clone(),
        args.kubectl_options(),
        output.clone(),
    ));
    let scope = args.scope.clone().unwrap_or_else(default_scope);
    execute(&args, kubectl, &output, &scope).await
}

async fn execute(args: &Cli, kubectl: Arc<dyn Kubectl>, output: &Output, scope: &str) -> Result<i32> {
    let cfg = args.engine_config();
    let k = &*kubectl;
    let engine = SessionEngine::new(kubectl.clone(), output.clone(), cfg);

    if args.install {
        server::install(k, output, &cfg).await?;
        return Ok(0);
    }
    if args.uninstall {
        engine.delete_all(true).await?;
        replacer::wait_all(k, output, &cfg).await?;
        replacer::uninstall(k, output).await?;
        server::uninstall(k, output).await?;
        return Ok(0);
    }
    if args.delete_all {
        engine.delete_all(false).await?;
        return Ok(0);
    }

    let Some(first) = args.args.first() else {
        Cli::command().print_help()?;
        return Ok(0);
    };
    let target = Target::parse(first)?;
    let hash = session_hash(scope, target.as_str(), args.inherit.as_deref().unwrap_or(""));
    tracing::debug!(%hash, target = target.as_str(), "session");

    if args.delete {
        engine.delete(&hash).await?;
        return Ok(0);
    }

    let image = target.image(&hash);
    let config = args.session_config(image.clone())?;
    let build = match &target {
        Target::Build(dir) => Some(DockerBuild::new(
            kubectl.clone(),
            args.docker.clone(),
            image,
            dir.clone(),
            BuildOptions {
                file: args.build_file.clone(),
                args: args.build_arg.clone(),
                target: args.build_target.clone(),
            },
            output.clone(),
            cfg,
        )),
        Target::Image(_) => None,
    };

    let process = engine
        .apply(&hash, &config, build.as_ref().map(|b| b as &dyn ImageBuild))
        .await?;
    if args.detach {
        output.info(format!("Pod {} left running", process.pod));
        return Ok(0);
    }

    let res = session(args, k, output, &process).await;
    if let Err(e) = engine.delete(&hash).await {
        output.warning(e.to_string());
    }
    res
}

/// Connect the terminal to a ready pod and wait for its main container to exit.
async fn session(args: &Cli, k: &dyn Kubectl, output: &Output, process: &Process) -> Result<i32> {
    let forward = if args.forward.is_empty() {
        None
    } else {
        Some(
            output
                .run("Forwarding ports", |_| {
                    portforward::start_all(k, &process.pod, &args.forward)
                })
                .await?,
        )
    };

    let pod = process.pod.as_str();
    let container = process.container.as_str();
    let attached = if args.stdin && !process.exited() {
        // Show what the container printed before the attach.
        match k.replace_process(&["logs", pod, "--container", container]).await {
            Ok(()) => {
                let mut attach = vec!["attach", pod, "--container", container, "--stdin"];
                if args.tty {
                    attach.push("--tty");
                }
                k.replace_process(&attach).await
            }
            Err(e) => Err(e),
        }
    } else {
        k.replace_process(&["logs", "--follow", pod, "--container", container])
            .await
    };

    if let Some(forward) = forward {
        forward.stop();
    }
    if let Err(e) = attached {
        // kubectl already reported it; pass its status through.
        return match e.code() {
            Some(code) => Ok(code),
            None => Err(e.into()),
        };
    }
    Ok(process.exit_code().await?)
}
