//! Schema-less manifest trees.
//!
//! Manifests are plain JSON objects (insertion ordered). [`ObjectExt`] adds
//! the handful of typed accessors and mutators the baseline resolver and the
//! composer need, so no per-kind structs are required.

use serde_json::{Map, Value};

pub type Object = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("expected \"{0}\" to be an object")]
    NotObject(String),

    #[error("expected \"{0}\" to be an array")]
    NotArray(String),

    #[error("expected an element of \"{0}\" to be an object")]
    NotObjectElement(String),
}

pub trait ObjectExt {
    /// Integer at `key`, or 0 when absent or not a number.
    fn num(&self, key: &str) -> i64;

    fn str(&self, key: &str) -> Option<&str>;

    fn obj(&self, key: &str) -> Option<&Object>;

    /// Array at `key`, or an empty slice when absent.
    fn arr(&self, key: &str) -> &[Value];

    /// Nested object at `key`, created when absent.
    fn with(&mut self, key: &str) -> Result<&mut Object, TreeError>;

    /// Copy each of `keys` present in `src` into `self`.
    fn copy_keys(&mut self, src: &Object, keys: &[&str]);

    /// Append `elem` to the array at `key`, creating the array when absent.
    fn push_elem(&mut self, key: &str, elem: Value) -> Result<(), TreeError>;

    /// Element of the array at `key` whose `name` is `name`, appended as
    /// `{"name": name}` when missing.
    fn elem(&mut self, key: &str, name: &str) -> Result<&mut Object, TreeError>;

    /// Remove elements of the array at `key` whose `name` is `name`.
    fn remove_elem(&mut self, key: &str, name: &str);
}

impl ObjectExt for Object {
    fn num(&self, key: &str) -> i64 {
        self.get(key).and_then(Value::as_i64).unwrap_or(0)
    }

    fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn obj(&self, key: &str) -> Option<&Object> {
        self.get(key).and_then(Value::as_object)
    }

    fn arr(&self, key: &str) -> &[Value] {
        self.get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn with(&mut self, key: &str) -> Result<&mut Object, TreeError> {
        self.entry(key)
            .or_insert_with(|| Value::Object(Object::new()))
            .as_object_mut()
            .ok_or_else(|| TreeError::NotObject(key.to_string()))
    }

    fn copy_keys(&mut self, src: &Object, keys: &[&str]) {
        for key in keys {
            match src.get(*key) {
                None | Some(Value::Null) => {}
                Some(v) => {
                    self.insert(key.to_string(), v.clone());
                }
            }
        }
    }

    fn push_elem(&mut self, key: &str, elem: Value) -> Result<(), TreeError> {
        self.entry(key)
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| TreeError::NotArray(key.to_string()))?
            .push(elem);
        Ok(())
    }

    fn elem(&mut self, key: &str, name: &str) -> Result<&mut Object, TreeError> {
        let arr = self
            .entry(key)
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| TreeError::NotArray(key.to_string()))?;

        let idx = match arr
            .iter()
            .position(|e| e.get("name").and_then(Value::as_str) == Some(name))
        {
            Some(idx) => idx,
            None => {
                let mut fresh = Object::new();
                fresh.insert("name".into(), Value::String(name.to_string()));
                arr.push(Value::Object(fresh));
                arr.len() - 1
            }
        };

        arr[idx]
            .as_object_mut()
            .ok_or_else(|| TreeError::NotObjectElement(key.to_string()))
    }

    fn remove_elem(&mut self, key: &str, name: &str) {
        if let Some(arr) = self.get_mut(key).and_then(Value::as_array_mut) {
            arr.retain(|e| e.get("name").and_then(Value::as_str) != Some(name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(v: Value) -> Object {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn typed_reads_default_when_missing() {
        let o = object(json!({"replicas": 3, "name": "web"}));
        assert_eq!(o.num("replicas"), 3);
        assert_eq!(o.num("missing"), 0);
        assert_eq!(o.str("name"), Some("web"));
        assert!(o.obj("spec").is_none());
        assert!(o.arr("containers").is_empty());
    }

    #[test]
    fn with_creates_nested_objects() {
        let mut o = Object::new();
        o.with("metadata")
            .unwrap()
            .with("labels")
            .unwrap()
            .insert("a".into(), json!("1"));
        assert_eq!(Value::Object(o), json!({"metadata": {"labels": {"a": "1"}}}));
    }

    #[test]
    fn with_rejects_scalars() {
        let mut o = object(json!({"metadata": "oops"}));
        assert!(matches!(o.with("metadata"), Err(TreeError::NotObject(_))));
    }

    #[test]
    fn copy_keys_skips_absent_and_null() {
        let src = object(json!({"a": 1, "b": null, "c": [1]}));
        let mut dst = Object::new();
        dst.copy_keys(&src, &["a", "b", "c", "d"]);
        assert_eq!(Value::Object(dst), json!({"a": 1, "c": [1]}));
    }

    #[test]
    fn elem_finds_or_appends_by_name() {
        let mut o = object(json!({"containers": [{"name": "web", "image": "nginx"}]}));
        o.elem("containers", "web")
            .unwrap()
            .insert("image".into(), json!("busybox"));
        o.elem("containers", "sidecar").unwrap();
        assert_eq!(
            Value::Object(o),
            json!({"containers": [
                {"name": "web", "image": "busybox"},
                {"name": "sidecar"}
            ]})
        );
    }

    #[test]
    fn remove_elem_drops_matching_names() {
        let mut o = object(json!({"env": [{"name": "A"}, {"name": "B"}]}));
        o.remove_elem("env", "A");
        o.remove_elem("volumes", "x");
        assert_eq!(Value::Object(o), json!({"env": [{"name": "B"}]}));
    }

    #[test]
    fn push_elem_creates_array() {
        let mut o = Object::new();
        o.push_elem("volumes", json!({"name": "v"})).unwrap();
        o.push_elem("volumes", json!({"name": "w"})).unwrap();
        assert_eq!(o.arr("volumes").len(), 2);
    }
}
