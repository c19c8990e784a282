//! In-cluster displacement of a live workload for the lifetime of a session.
//!
//! A replacer is a namespace-scoped service account with just enough rights
//! to scale workloads and edit service selectors, plus a job named after the
//! session hash that runs a [`plan::Plan`]. Because the job lives in the
//! cluster, restoration happens even if the client never comes back.

mod plan;

pub use plan::Plan;
#[cfg(test)]
pub(crate) use plan::sim;

use crate::kubectl::{Kubectl, KubectlError};
use crate::model::{EngineConfig, Kind};
use crate::output::Output;
use serde_json::{json, Value};
use tracing::debug;

const ACCOUNT: &str = "kdo-replacer";
const IMAGE: &str = "bitnami/kubectl";
/// Label carried by every replacer job.
pub const JOB_SELECTOR: &str = "kdo-job=1";
/// Label carried by every replacer RBAC object.
pub const RBAC_SELECTOR: &str = "component=kdo-rbac";

#[derive(Debug, thiserror::Error)]
pub enum ReplacerError {
    #[error("replacer: {0}")]
    Kubectl(#[from] KubectlError),

    #[error("replacer: encoding manifest: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("replacer: waiting for {0}: timed out")]
    Timeout(String),
}

pub fn job_name(hash: &str) -> String {
    format!("kdo-replacer-{hash}")
}

/// What the replacer displaces and how to put it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Displacement {
    pub kind: Kind,
    pub name: String,
    /// Width to restore for scalable workloads.
    pub replicas: i64,
    /// Comma-separated `key=value` selector to restore for services.
    pub selector: String,
}

fn rbac() -> Vec<Value> {
    let labels = json!({"component": "kdo-rbac"});
    let rw = json!(["get", "patch", "update"]);
    vec![
        json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": ACCOUNT, "labels": labels},
        }),
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "Role",
            "metadata": {"name": ACCOUNT, "labels": labels},
            "rules": [
                {"apiGroups": [""], "resources": ["pods"], "verbs": ["get", "list", "watch"]},
                {"apiGroups": [""], "resources": ["replicationcontrollers", "replicationcontrollers/scale", "services"], "verbs": rw},
                {"apiGroups": ["apps"], "resources": [
                    "deployments", "deployments/scale", "daemonsets", "replicasets",
                    "replicasets/scale", "statefulsets", "statefulsets/scale",
                ], "verbs": rw},
                {"apiGroups": ["batch"], "resources": ["cronjobs", "jobs"], "verbs": rw},
                {"apiGroups": ["extensions"], "resources": ["deployments", "daemonsets", "replicasets"], "verbs": rw},
                {"apiGroups": ["batch"], "resources": ["jobs"], "verbs": ["delete"]},
            ],
        }),
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "RoleBinding",
            "metadata": {"name": ACCOUNT, "labels": labels},
            "subjects": [{"kind": "ServiceAccount", "name": ACCOUNT}],
            "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "Role", "name": ACCOUNT},
        }),
    ]
}

fn job(target: &Displacement, plan: Plan, hash: &str) -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {"name": job_name(hash), "labels": {"kdo-job": "1"}},
        "spec": {"template": {"spec": {
            "serviceAccountName": ACCOUNT,
            "containers": [{
                "name": "replacer",
                "image": IMAGE,
                "env": [
                    {"name": "NAMESPACE", "valueFrom": {"fieldRef": {"fieldPath": "metadata.namespace"}}},
                    {"name": "KIND", "value": target.kind.as_str()},
                    {"name": "NAME", "value": target.name},
                    {"name": "REPLICAS", "value": target.replicas.to_string()},
                    {"name": "SELECTOR", "value": target.selector},
                    {"name": "HASH", "value": hash},
                ],
                "command": ["/bin/bash", "-c", plan.script()],
            }],
            "restartPolicy": "OnFailure",
            "terminationGracePeriodSeconds": 0,
        }}},
    })
}

/// Full replacer manifest for `target`, or `None` when its kind cannot be
/// displaced.
pub fn manifest(target: &Displacement, hash: &str) -> Option<Value> {
    let plan = Plan::for_kind(target.kind)?;
    debug!(kind = %target.kind, steps = ?plan.steps(), "replacer plan");
    let mut items = rbac();
    items.push(job(target, plan, hash));
    Some(json!({"apiVersion": "v1", "kind": "List", "items": items}))
}

/// Create or update the replacer for the session `hash`.
pub async fn apply(
    k: &dyn Kubectl,
    target: &Displacement,
    hash: &str,
    output: &Output,
) -> Result<(), ReplacerError> {
    let Some(manifest) = manifest(target, hash) else {
        output.warning(format!(
            "cannot replace {}/{}: only scalable workloads and services can be replaced",
            target.kind, target.name
        ));
        return Ok(());
    };
    let data = serde_json::to_vec(&manifest)?;
    output
        .run(format!("Replacing {}", target.kind), |op| async move {
            op.progress("applying manifest");
            k.run_with_input(&data, &["apply", "--filename", "-"]).await?;
            Ok::<_, ReplacerError>(())
        })
        .await
}

async fn bounded(
    what: String,
    cfg: &EngineConfig,
    fut: impl std::future::Future<Output = Result<(), KubectlError>>,
) -> Result<Result<(), KubectlError>, ReplacerError> {
    match cfg.timeout {
        Some(t) => tokio::time::timeout(t, fut)
            .await
            .map_err(|_| ReplacerError::Timeout(what)),
        None => Ok(fut.await),
    }
}

/// Block until the replacer for `hash`, if any, has finished.
pub async fn wait(k: &dyn Kubectl, hash: &str, cfg: &EngineConfig) -> Result<(), ReplacerError> {
    let job = format!("job/{}", job_name(hash));
    let timeout = cfg.kubectl_timeout();
    debug!(job = %job, "waiting for replacer");
    let res = bounded(
        job.clone(),
        cfg,
        k.run(&["wait", "--for", "delete", &job, "--timeout", &timeout]),
    )
    .await?;
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => Ok(other?),
    }
}

/// Block until every replacer in the cluster has finished.
pub async fn wait_all(k: &dyn Kubectl, output: &Output, cfg: &EngineConfig) -> Result<(), ReplacerError> {
    let timeout = cfg.kubectl_timeout();
    output
        .run("Waiting for all replacers", |_| async move {
            let res = bounded(
                "replacers".to_string(),
                cfg,
                k.run(&[
                    "wait",
                    "--for",
                    "delete",
                    "job",
                    "--selector",
                    JOB_SELECTOR,
                    "--all-namespaces",
                    "--timeout",
                    &timeout,
                ]),
            )
            .await?;
            match res {
                Err(e) if e.stderr().starts_with("error: no matching resources found") => Ok(()),
                other => Ok::<_, ReplacerError>(other?),
            }
        })
        .await
}

/// Remove replacer RBAC objects from every namespace.
pub async fn uninstall(k: &dyn Kubectl, output: &Output) -> Result<(), ReplacerError> {
    output
        .run("Uninstalling replacer components", |_| async move {
            k.run(&[
                "delete",
                "rolebinding,role,serviceaccount",
                "--selector",
                RBAC_SELECTOR,
                "--all-namespaces",
            ])
            .await?;
            Ok::<_, ReplacerError>(())
        })
        .await
}
