//! Field-aware comparison of live and projected objects
//!
//! The planner decides whether an apply is a no-op by comparing the
//! server's dry-run projection against the fetched live object. Server-owned
//! bookkeeping (`managedFields`, `resourceVersion`, timestamps, `status`)
//! must not count as drift, and Secret payloads must never leak into
//! rendered diffs.

use serde_json::Value;
use similar::TextDiff;

use kube::api::DynamicObject;

/// Metadata keys owned by the server, ignored during comparison.
const SERVER_MANAGED_METADATA: &[&str] = &[
    "managedFields",
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "selfLink",
];

/// True when the projected merge differs from the live object in any field
/// the caller can own.
pub fn has_drifted(live: &DynamicObject, merged: &DynamicObject) -> bool {
    sanitized(live) != sanitized(merged)
}

/// Top-level paths that differ between the live object and the projection,
/// sorted. Metadata is reported one level deeper (`metadata.labels`, not
/// `metadata`) since that is the granularity operators reason about.
pub fn changed_paths(live: &DynamicObject, merged: &DynamicObject) -> Vec<String> {
    let old = sanitized(live);
    let new = sanitized(merged);

    let mut paths = Vec::new();
    for key in key_union(&old, &new) {
        if key == "apiVersion" || key == "kind" {
            continue;
        }
        let (a, b) = (old.get(&key), new.get(&key));
        if a == b {
            continue;
        }
        if key == "metadata" {
            let empty = Value::Object(Default::default());
            let (ma, mb) = (
                a.unwrap_or(&empty).clone(),
                b.unwrap_or(&empty).clone(),
            );
            for sub in key_union(&ma, &mb) {
                if ma.get(&sub) != mb.get(&sub) {
                    paths.push(format!("metadata.{sub}"));
                }
            }
        } else {
            paths.push(key);
        }
    }
    paths.sort();
    paths
}

/// Render a unified text diff of the two objects as YAML. Secret data is
/// masked before rendering; values that differ keep distinct masks so the
/// change stays visible.
pub fn render_text_diff(live: &DynamicObject, merged: &DynamicObject) -> String {
    let mut old = sanitized(live);
    let mut new = sanitized(merged);
    if is_secret(live) || is_secret(merged) {
        mask_secret_pair(&mut old, &mut new);
    }
    let old = serde_yaml::to_string(&old).unwrap_or_default();
    let new = serde_yaml::to_string(&new).unwrap_or_default();
    TextDiff::from_lines(&old, &new)
        .unified_diff()
        .context_radius(3)
        .header("live", "desired")
        .to_string()
}

pub fn is_secret(obj: &DynamicObject) -> bool {
    obj.types
        .as_ref()
        .map(|t| t.kind == "Secret" && !t.api_version.contains('/'))
        .unwrap_or(false)
}

/// Replace Secret payload values with a fixed mask.
pub fn mask_secret_data(value: &mut Value) {
    for field in ["data", "stringData"] {
        if let Some(map) = value.get_mut(field).and_then(Value::as_object_mut) {
            for v in map.values_mut() {
                *v = Value::String("*****".to_string());
            }
        }
    }
}

/// Mask a live/desired pair in lockstep: unchanged values share a mask,
/// changed values get before/after masks.
fn mask_secret_pair(old: &mut Value, new: &mut Value) {
    for field in ["data", "stringData"] {
        let changed: Vec<String> = match (old.get(field), new.get(field)) {
            (Some(a), Some(b)) => a
                .as_object()
                .into_iter()
                .flatten()
                .filter(|&(k, v)| b.get(k.as_str()) != Some(v))
                .map(|(k, _)| k.clone())
                .collect(),
            _ => Vec::new(),
        };
        for (value, mask) in [(&mut *old, "***** (before)"), (&mut *new, "***** (after)")] {
            if let Some(map) = value.get_mut(field).and_then(Value::as_object_mut) {
                for (k, v) in map.iter_mut() {
                    *v = if changed.contains(k) {
                        Value::String(mask.to_string())
                    } else {
                        Value::String("*****".to_string())
                    };
                }
            }
        }
    }
}

fn sanitized(obj: &DynamicObject) -> Value {
    let mut value = serde_json::to_value(obj).unwrap_or(Value::Null);
    if let Some(root) = value.as_object_mut() {
        root.remove("status");
        if let Some(meta) = root.get_mut("metadata").and_then(Value::as_object_mut) {
            for key in SERVER_MANAGED_METADATA {
                meta.remove(*key);
            }
        }
    }
    value
}

fn key_union(a: &Value, b: &Value) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for v in [a, b] {
        if let Some(map) = v.as_object() {
            for k in map.keys() {
                if !keys.contains(k) {
                    keys.push(k.clone());
                }
            }
        }
    }
    keys
}
