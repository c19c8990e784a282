//! Final manifest composition.

use super::baseline::Baseline;
use crate::error::SessionError;
use crate::manifest::{Object, ObjectExt};
use crate::model::{pod_name, Override, SessionConfig};
use serde_json::{json, Value};

/// Init container that holds the pod until a locally built image exists.
pub const AWAIT_BUILD_CONTAINER: &str = "kdo-await-image-build";
const DOCKER_SOCKET_VOLUME: &str = "kdo-docker-socket";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Apply `overrides` to `target`, resolving bare names against `source`.
fn merge_map(target: &mut Object, source: &Object, overrides: &[Override]) {
    for o in overrides {
        match o {
            Override::Inherit(name) => match source.get(name) {
                Some(v) => {
                    target.insert(name.clone(), v.clone());
                }
                None => {
                    target.remove(name);
                }
            },
            Override::Set(name, value) => {
                target.insert(name.clone(), Value::String(value.clone()));
            }
            Override::Remove(name) => {
                target.remove(name);
            }
        }
    }
}

fn merge_env(container: &mut Object, overrides: &[Override]) -> Result<(), SessionError> {
    for o in overrides {
        match o {
            Override::Inherit(name) => {
                container.elem("env", name)?.remove("valueFrom");
            }
            Override::Set(name, value) => {
                let var = container.elem("env", name)?;
                var.insert("value".into(), Value::String(value.clone()));
                var.remove("valueFrom");
            }
            Override::Remove(name) => container.remove_elem("env", name),
        }
    }
    Ok(())
}

fn await_build(image: &str) -> Value {
    json!({
        "name": AWAIT_BUILD_CONTAINER,
        "image": "docker:19.03",
        "volumeMounts": [{"name": DOCKER_SOCKET_VOLUME, "mountPath": DOCKER_SOCKET}],
        "command": [
            "/bin/sh",
            "-c",
            format!("while [ -z \"$(docker images {image} --format '{{{{.Repository}}}}')\" ]; do sleep 1; done"),
        ],
    })
}

/// Merge `config` onto `baseline`, producing the manifest for the session
/// pod of `hash`. When `build_pending`, the image does not exist yet and
/// will be built directly on the node the pod lands on.
pub fn compose(
    baseline: &Baseline,
    config: &SessionConfig,
    hash: &str,
    build_pending: bool,
) -> Result<Object, SessionError> {
    let mut manifest = baseline.manifest.clone();

    let metadata = manifest.with("metadata")?;
    metadata.insert("name".into(), Value::String(pod_name(hash)));

    let mut labels = if config.inherit_labels {
        baseline.source_labels.clone()
    } else {
        Object::new()
    };
    merge_map(&mut labels, &baseline.source_labels, &config.labels);
    labels.insert("kdo-pod".into(), json!("1"));
    labels.insert("kdo-hash".into(), json!(hash));
    metadata.insert("labels".into(), Value::Object(labels));

    let mut annotations = if config.inherit_annotations {
        baseline.source_annotations.clone()
    } else {
        Object::new()
    };
    merge_map(&mut annotations, &baseline.source_annotations, &config.annotations);
    if !annotations.is_empty() {
        metadata.insert("annotations".into(), Value::Object(annotations));
    }

    let spec = manifest.with("spec")?;
    if build_pending {
        spec.push_elem("initContainers", await_build(&config.image))?;
        spec.push_elem(
            "volumes",
            json!({"name": DOCKER_SOCKET_VOLUME, "hostPath": {"path": DOCKER_SOCKET}}),
        )?;
    }

    let container = spec.elem("containers", &baseline.container)?;
    container.insert("image".into(), json!(config.image));
    if build_pending {
        container.insert("imagePullPolicy".into(), json!("Never"));
    }
    merge_env(container, &config.env)?;
    container.insert("stdin".into(), json!(config.stdin));
    container.insert("stdinOnce".into(), json!(config.stdin));
    container.insert("tty".into(), json!(config.tty));
    if !config.command.is_empty() {
        container.insert("command".into(), json!(config.command));
        container.remove("args");
    }
    if config.no_lifecycle {
        container.remove("lifecycle");
    }
    if config.no_probes || config.stdin {
        container.remove("livenessProbe");
        container.remove("readinessProbe");
        container.remove("startupProbe");
    }

    if !config.detach {
        spec.insert("restartPolicy".into(), json!("Never"));
    }

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Kind;
    use crate::engine::baseline::from_source;

    fn source_pod() -> Baseline {
        from_source(
            Kind::Pod,
            &json!({
                "metadata": {
                    "labels": {"a": "1", "b": "2"},
                    "annotations": {"note": "x"}
                },
                "spec": {"containers": [{
                    "name": "web",
                    "image": "todo:1",
                    "args": ["--serve"],
                    "env": [
                        {"name": "MODE", "value": "prod"},
                        {"name": "SECRET", "valueFrom": {"secretKeyRef": {"name": "s", "key": "k"}}},
                        {"name": "DROP", "value": "1"}
                    ],
                    "lifecycle": {"preStop": {}},
                    "livenessProbe": {},
                    "readinessProbe": {},
                    "startupProbe": {}
                }]}
            }),
            None,
        )
        .unwrap()
    }

    fn config() -> SessionConfig {
        SessionConfig {
            image: "alpine".into(),
            ..SessionConfig::default()
        }
    }

    fn container(m: &Object) -> &Object {
        m.obj("spec").unwrap().arr("containers")[0].as_object().unwrap()
    }

    #[test]
    fn label_merge_rule() {
        let cfg = SessionConfig {
            labels: Override::parse_all(&["a", "b=", "c=3", "missing"]),
            ..config()
        };
        let m = compose(&source_pod(), &cfg, "h", false).unwrap();
        let mut labels = m.obj("metadata").unwrap().obj("labels").unwrap().clone();
        assert_eq!(labels.remove("kdo-pod"), Some(json!("1")));
        assert_eq!(labels.remove("kdo-hash"), Some(json!("h")));
        assert_eq!(Value::Object(labels), json!({"a": "1", "c": "3"}));
    }

    #[test]
    fn inherited_labels_can_be_removed() {
        let cfg = SessionConfig {
            inherit_labels: true,
            labels: Override::parse_all(&["b="]),
            ..config()
        };
        let m = compose(&source_pod(), &cfg, "h", false).unwrap();
        let labels = m.obj("metadata").unwrap().obj("labels").unwrap();
        assert_eq!(labels.str("a"), Some("1"));
        assert!(labels.get("b").is_none());
    }

    #[test]
    fn identity_labels_cannot_be_overridden() {
        let cfg = SessionConfig {
            labels: Override::parse_all(&["kdo-hash=other", "kdo-pod="]),
            ..config()
        };
        let m = compose(&source_pod(), &cfg, "h", false).unwrap();
        let labels = m.obj("metadata").unwrap().obj("labels").unwrap();
        assert_eq!(labels.str("kdo-hash"), Some("h"));
        assert_eq!(labels.str("kdo-pod"), Some("1"));
        assert_eq!(m.obj("metadata").unwrap().str("name"), Some("kdo-h"));
    }

    #[test]
    fn annotations_only_when_present() {
        let m = compose(&source_pod(), &config(), "h", false).unwrap();
        assert!(m.obj("metadata").unwrap().get("annotations").is_none());

        let cfg = SessionConfig {
            annotations: Override::parse_all(&["note"]),
            ..config()
        };
        let m = compose(&source_pod(), &cfg, "h", false).unwrap();
        assert_eq!(
            m.obj("metadata").unwrap().obj("annotations").unwrap().str("note"),
            Some("x")
        );
    }

    #[test]
    fn env_merge_rule() {
        let cfg = SessionConfig {
            env: Override::parse_all(&["SECRET", "MODE=dev", "DROP=", "NEW=1"]),
            ..config()
        };
        let m = compose(&source_pod(), &cfg, "h", false).unwrap();
        assert_eq!(
            container(&m).get("env").unwrap(),
            &json!([
                {"name": "MODE", "value": "dev"},
                {"name": "SECRET"},
                {"name": "NEW", "value": "1"}
            ])
        );
    }

    #[test]
    fn command_replaces_args() {
        let cfg = SessionConfig {
            command: vec!["sh".into(), "-c".into(), "env".into()],
            ..config()
        };
        let m = compose(&source_pod(), &cfg, "h", false).unwrap();
        let c = container(&m);
        assert_eq!(c.get("command").unwrap(), &json!(["sh", "-c", "env"]));
        assert!(c.get("args").is_none());

        let m = compose(&source_pod(), &config(), "h", false).unwrap();
        assert_eq!(container(&m).get("args").unwrap(), &json!(["--serve"]));
    }

    #[test]
    fn stdin_strips_probes_but_keeps_lifecycle() {
        let cfg = SessionConfig {
            stdin: true,
            tty: true,
            ..config()
        };
        let m = compose(&source_pod(), &cfg, "h", false).unwrap();
        let c = container(&m);
        assert_eq!(c.get("stdin"), Some(&json!(true)));
        assert_eq!(c.get("stdinOnce"), Some(&json!(true)));
        assert_eq!(c.get("tty"), Some(&json!(true)));
        assert!(c.get("livenessProbe").is_none());
        assert!(c.get("startupProbe").is_none());
        assert!(c.get("lifecycle").is_some());
    }

    #[test]
    fn no_lifecycle_and_no_probes() {
        let cfg = SessionConfig {
            no_lifecycle: true,
            no_probes: true,
            ..config()
        };
        let m = compose(&source_pod(), &cfg, "h", false).unwrap();
        let c = container(&m);
        assert!(c.get("lifecycle").is_none());
        assert!(c.get("readinessProbe").is_none());
    }

    #[test]
    fn pending_build_gates_on_the_image() {
        let cfg = SessionConfig {
            image: "kdo-h:1".into(),
            ..config()
        };
        let m = compose(&source_pod(), &cfg, "h", true).unwrap();
        let spec = m.obj("spec").unwrap();
        let init = spec.arr("initContainers")[0].as_object().unwrap();
        assert_eq!(init.str("name"), Some(AWAIT_BUILD_CONTAINER));
        assert_eq!(
            init.arr("command")[2],
            json!("while [ -z \"$(docker images kdo-h:1 --format '{{.Repository}}')\" ]; do sleep 1; done")
        );
        assert_eq!(
            spec.arr("volumes")[0],
            json!({"name": "kdo-docker-socket", "hostPath": {"path": "/var/run/docker.sock"}})
        );
        assert_eq!(container(&m).str("imagePullPolicy"), Some("Never"));
    }

    #[test]
    fn restart_policy_depends_on_detach() {
        let m = compose(&source_pod(), &config(), "h", false).unwrap();
        assert_eq!(m.obj("spec").unwrap().str("restartPolicy"), Some("Never"));

        let cfg = SessionConfig {
            detach: true,
            ..config()
        };
        let m = compose(&source_pod(), &cfg, "h", false).unwrap();
        assert!(m.obj("spec").unwrap().get("restartPolicy").is_none());
    }

    #[test]
    fn empty_baseline_gets_named_container() {
        let b = Baseline {
            manifest: json!({"apiVersion": "v1", "kind": "Pod"}).as_object().cloned().unwrap(),
            replicas: 0,
            container: "kdo".into(),
            source_labels: Object::new(),
            source_annotations: Object::new(),
        };
        let m = compose(&b, &config(), "h", false).unwrap();
        assert_eq!(container(&m).str("name"), Some("kdo"));
        assert_eq!(container(&m).str("image"), Some("alpine"));
    }
}
