//! Inherited configuration.
//!
//! Turns an inherit reference into the subset of a live pod specification a
//! session starts from, plus what the replacer needs to restore later.

use crate::error::SessionError;
use crate::kubectl::Kubectl;
use crate::manifest::{Object, ObjectExt};
use crate::model::{InheritRef, Kind};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// Container name used when nothing is inherited.
pub const DEFAULT_CONTAINER: &str = "kdo";

/// Pod spec fields copied from the inherited template. Restart policy,
/// hostname, subdomain, priority, preemption and ephemeral containers are
/// left out: the session pod assigns its own identity and restart policy.
pub const SPEC_FIELDS: &[&str] = &[
    "activeDeadlineSeconds",
    "affinity",
    "automountServiceAccountToken",
    "containers",
    "dnsConfig",
    "dnsPolicy",
    "enableServiceLinks",
    "hostAliases",
    "hostIPC",
    "hostNetwork",
    "hostPID",
    "imagePullSecrets",
    "initContainers",
    "nodeName",
    "nodeSelector",
    "readinessGates",
    "runtimeClassName",
    "schedulerName",
    "securityContext",
    "serviceAccountName",
    "shareProcessNamespace",
    "terminationGracePeriodSeconds",
    "tolerations",
    "topologySpreadConstraints",
    "volumes",
];

#[derive(Debug, Clone)]
pub struct Baseline {
    /// Pod-shaped partial manifest holding only [`SPEC_FIELDS`].
    pub manifest: Object,
    /// Original width of a scalable workload, 0 for everything else.
    pub replicas: i64,
    pub container: String,
    /// Pod template metadata, consulted by label/annotation overrides.
    pub source_labels: Object,
    pub source_annotations: Object,
}

impl Baseline {
    fn empty(container: Option<&str>) -> Self {
        Self {
            manifest: pod_shell(),
            replicas: 0,
            container: container.unwrap_or(DEFAULT_CONTAINER).to_string(),
            source_labels: Object::new(),
            source_annotations: Object::new(),
        }
    }
}

fn pod_shell() -> Object {
    let mut o = Object::new();
    o.insert("apiVersion".into(), json!("v1"));
    o.insert("kind".into(), json!("Pod"));
    o
}

#[derive(Deserialize)]
struct Endpoints {
    #[serde(default)]
    subsets: Vec<Subset>,
}

#[derive(Deserialize)]
struct Subset {
    #[serde(default)]
    addresses: Vec<Address>,
}

#[derive(Deserialize)]
struct Address {
    #[serde(rename = "targetRef")]
    target_ref: Option<TargetRef>,
}

#[derive(Deserialize)]
struct TargetRef {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    name: String,
}

/// First pod backing a service, taken from its endpoints.
pub(crate) fn backing_pod(endpoints: &str) -> Result<Option<String>, SessionError> {
    let endpoints: Endpoints = serde_json::from_str(endpoints)?;
    Ok(endpoints
        .subsets
        .into_iter()
        .flat_map(|s| s.addresses)
        .filter_map(|a| a.target_ref)
        .find(|r| r.kind == "Pod" && !r.name.is_empty())
        .map(|r| r.name))
}

/// Read the inherited object and reduce it to a baseline.
///
/// Without an inherit reference this is an empty pod manifest whose
/// container is named `kdo`.
pub async fn resolve(
    k: &dyn Kubectl,
    inherit: Option<&InheritRef>,
) -> Result<Baseline, SessionError> {
    let Some(inherit) = inherit else {
        return Ok(Baseline::empty(None));
    };

    let (kind, name) = if inherit.kind == Kind::Service {
        let endpoints = k
            .capture_string(&["get", "endpoints", &inherit.name, "--output", "json"])
            .await
            .map_err(|e| SessionError::Resolution(e.to_string()))?;
        match backing_pod(&endpoints)? {
            Some(pod) => (Kind::Pod, pod),
            None => {
                return Err(SessionError::Resolution(format!(
                    "unable to determine pod from service \"{}\"",
                    inherit.name
                )))
            }
        }
    } else {
        (inherit.kind, inherit.name.clone())
    };

    debug!(kind = %kind, name = %name, "reading inherited object");
    let raw = k
        .capture_string(&["get", kind.as_str(), &name, "--output", "json"])
        .await
        .map_err(|e| SessionError::Resolution(e.to_string()))?;
    let source: Value = serde_json::from_str(&raw)?;

    from_source(kind, &source, inherit.container.as_deref())
}

/// Reduce an already-fetched object of `kind` to a baseline.
pub fn from_source(
    kind: Kind,
    source: &Value,
    container: Option<&str>,
) -> Result<Baseline, SessionError> {
    let source = Object::deserialize(source)?;

    let replicas = if kind.is_scalable() {
        source.obj("spec").map_or(0, |spec| spec.num("replicas"))
    } else {
        0
    };

    let empty = Object::new();
    let template = match kind {
        Kind::Pod => Some(&source),
        Kind::CronJob => source
            .obj("spec")
            .and_then(|s| s.obj("jobTemplate"))
            .and_then(|s| s.obj("spec"))
            .and_then(|s| s.obj("template")),
        _ => source.obj("spec").and_then(|s| s.obj("template")),
    }
    .unwrap_or(&empty);

    let spec = template.obj("spec").unwrap_or(&empty);
    let metadata = template.obj("metadata").unwrap_or(&empty);

    let mut baseline = Baseline::empty(container);
    baseline.replicas = replicas;
    baseline.manifest.with("spec")?.copy_keys(spec, SPEC_FIELDS);
    baseline.source_labels = metadata.obj("labels").cloned().unwrap_or_default();
    baseline.source_annotations = metadata.obj("annotations").cloned().unwrap_or_default();

    if container.is_none() {
        if let Some(first) = spec
            .arr("containers")
            .first()
            .and_then(Value::as_object)
            .and_then(|c| c.str("name"))
        {
            baseline.container = first.to_string();
        }
    }

    Ok(baseline)
}
