use crate::error::SessionError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Name of the pod owned by the session with this hash.
pub fn pod_name(hash: &str) -> String {
    format!("kdo-{hash}")
}

/// Session identity: the first 16 hex digits of a SHA-256 over the scope,
/// the target (image or absolute build directory) and the inherit flag.
/// Each component is length-prefixed so no two tuples share an input.
pub fn session_hash(scope: &str, target: &str, inherit: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [scope, target, inherit] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Pod,
    Deployment,
    DaemonSet,
    ReplicaSet,
    ReplicationController,
    StatefulSet,
    Job,
    CronJob,
    Service,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Pod => "pod",
            Kind::Deployment => "deployment",
            Kind::DaemonSet => "daemonset",
            Kind::ReplicaSet => "replicaset",
            Kind::ReplicationController => "replicationcontroller",
            Kind::StatefulSet => "statefulset",
            Kind::Job => "job",
            Kind::CronJob => "cronjob",
            Kind::Service => "service",
        }
    }

    /// Kinds whose width can be scaled to zero and back.
    pub fn is_scalable(self) -> bool {
        matches!(
            self,
            Kind::Deployment | Kind::ReplicaSet | Kind::ReplicationController | Kind::StatefulSet
        )
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.to_lowercase().as_str() {
            "cj" | "cronjob" | "cronjobs" => Kind::CronJob,
            "ds" | "daemonset" | "daemonsets" => Kind::DaemonSet,
            "deploy" | "deployment" | "deployments" => Kind::Deployment,
            "job" | "jobs" => Kind::Job,
            "po" | "pod" | "pods" => Kind::Pod,
            "rs" | "replicaset" | "replicasets" => Kind::ReplicaSet,
            "rc" | "replicationcontroller" | "replicationcontrollers" => {
                Kind::ReplicationController
            }
            "svc" | "service" | "services" => Kind::Service,
            "sts" | "statefulset" | "statefulsets" => Kind::StatefulSet,
            _ => return Err(SessionError::Resolution(format!("unknown kind \"{s}\""))),
        };
        Ok(kind)
    }
}

/// `[kind/]name[:container]`, naming the object a session inherits from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritRef {
    pub kind: Kind,
    pub name: String,
    pub container: Option<String>,
}

impl FromStr for InheritRef {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = match s.split_once('/') {
            Some((kind, rest)) => (kind.parse()?, rest),
            None => (Kind::Pod, s),
        };
        let (name, container) = match rest.split_once(':') {
            Some((name, container)) => (name, Some(container.to_string())),
            None => (rest, None),
        };
        if name.is_empty() {
            return Err(SessionError::Resolution(format!(
                "missing object name in \"{s}\""
            )));
        }
        Ok(InheritRef {
            kind,
            name: name.to_string(),
            container,
        })
    }
}

/// One `name[=value]` assignment applied to labels, annotations or env.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Override {
    /// `name`: keep the inherited value, if there is one.
    Inherit(String),
    /// `name=value`
    Set(String, String),
    /// `name=`
    Remove(String),
}

impl Override {
    pub fn parse(s: &str) -> Self {
        match s.split_once('=') {
            None => Override::Inherit(s.to_string()),
            Some((name, "")) => Override::Remove(name.to_string()),
            Some((name, value)) => Override::Set(name.to_string(), value.to_string()),
        }
    }

    pub fn parse_all<S: AsRef<str>>(items: &[S]) -> Vec<Self> {
        items.iter().map(|s| Override::parse(s.as_ref())).collect()
    }
}

/// Everything a single apply call needs to know about the session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub inherit: Option<InheritRef>,
    pub inherit_labels: bool,
    pub inherit_annotations: bool,
    pub labels: Vec<Override>,
    pub annotations: Vec<Override>,
    pub env: Vec<Override>,
    pub image: String,
    pub command: Vec<String>,
    pub no_lifecycle: bool,
    pub no_probes: bool,
    pub replace: bool,
    pub stdin: bool,
    pub tty: bool,
    pub detach: bool,
}

/// Timing knobs for the engine's polling loops.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    /// Upper bound on each blocking wait; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

impl EngineConfig {
    /// Timeout in the form `kubectl wait --timeout` expects.
    pub fn kubectl_timeout(&self) -> String {
        match self.timeout {
            Some(t) => format!("{}s", t.as_secs().max(1)),
            None => "-1s".to_string(),
        }
    }
}
