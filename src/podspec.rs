//! Merging of user supplied container and pod-spec overlays.
//!
//! Both sides are merged as JSON documents: objects merge key by key with the
//! overlay winning, lists of named items (containers, volumes, env, mounts)
//! merge item by item on `name`, and any other list is replaced. A name that
//! appears twice within one input is rejected. Empty overlay values leave the
//! base untouched.

use itertools::Itertools;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{ExecutorError, ExecutorResult};

pub fn merge_container(base: &Container, overlay: &Container) -> ExecutorResult<Container> {
    merge_typed(base, overlay, "container")
}

pub fn merge_pod_spec(base: &PodSpec, overlay: &PodSpec) -> ExecutorResult<PodSpec> {
    merge_typed(base, overlay, "podSpec")
}

fn merge_typed<T: Serialize + DeserializeOwned>(
    base: &T,
    overlay: &T,
    what: &str,
) -> ExecutorResult<T> {
    let base = serde_json::to_value(base).map_err(|e| ExecutorError::Internal(e.into()))?;
    let overlay = serde_json::to_value(overlay).map_err(|e| ExecutorError::Internal(e.into()))?;
    check_unique_names(&base, what)?;
    check_unique_names(&overlay, what)?;
    serde_json::from_value(merge_values(base, overlay))
        .map_err(|e| ExecutorError::invalid(format!("merged {what} is invalid: {e}")))
}

fn item_name(item: &Value) -> Option<&str> {
    item.as_object()?.get("name")?.as_str()
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(|item| item_name(item).is_some())
}

fn check_unique_names(value: &Value, path: &str) -> ExecutorResult<()> {
    match value {
        Value::Object(fields) => {
            for (key, field) in fields {
                check_unique_names(field, &format!("{path}.{key}"))?;
            }
        }
        Value::Array(items) => {
            if is_named_list(items) {
                if let Some(name) = items.iter().filter_map(item_name).duplicates().next() {
                    return Err(ExecutorError::invalid(format!(
                        "duplicate name {name:?} in {path}"
                    )));
                }
            }
            for item in items {
                check_unique_names(item, path)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        // Required fields of an unset overlay serialize as empty values.
        (base, Value::Null) => base,
        (base, Value::String(s)) if s.is_empty() => base,
        (base, Value::Array(items)) if items.is_empty() => base,
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (Value::Array(base), Value::Array(overlay))
            if is_named_list(&overlay) && (base.is_empty() || is_named_list(&base)) =>
        {
            let mut merged = base;
            for item in overlay {
                let position = merged
                    .iter()
                    .position(|existing| item_name(existing) == item_name(&item));
                match position {
                    Some(i) => {
                        let existing = std::mem::take(&mut merged[i]);
                        merged[i] = merge_values(existing, item);
                    }
                    None => merged.push(item),
                }
            }
            Value::Array(merged)
        }
        (_, overlay) => overlay,
    }
}
