//! Object identity helpers for dynamic Kubernetes objects
//!
//! Everything in cairn addresses objects by their canonical subject string:
//! `Kind/namespace/name` for namespaced objects, `Kind/name` for
//! cluster-scoped ones. The subject is what shows up in change sets, error
//! messages and logs, and what selectors and tests key on.

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;

use crate::stage::ResourceClass;

/// Identity of a single object: type plus coordinates.
///
/// This is the key the engine hands to the object store; it is cheaper to
/// move around than a full `DynamicObject` and has stable equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectId {
    /// Extract the identity from a dynamic object.
    pub fn from_object(obj: &DynamicObject) -> Self {
        let (api_version, kind) = type_of(obj);
        Self {
            api_version,
            kind,
            namespace: obj
                .metadata
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty()),
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }

    /// Canonical subject string for this identity.
    pub fn subject(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}/{}", self.kind, ns, self.name),
            None => format!("{}/{}", self.kind, self.name),
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = split_api_version(&self.api_version);
        GroupVersionKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: self.kind.clone(),
        }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.subject())
    }
}

/// Canonical subject string for an object.
pub fn subject(obj: &DynamicObject) -> String {
    ObjectId::from_object(obj).subject()
}

/// GVK of a dynamic object. Objects without type information map to an
/// empty-group `Unknown` kind rather than panicking; callers treat those as
/// invalid manifests.
pub fn gvk_of(obj: &DynamicObject) -> GroupVersionKind {
    ObjectId::from_object(obj).gvk()
}

fn type_of(obj: &DynamicObject) -> (String, String) {
    match &obj.types {
        Some(t) => (t.api_version.clone(), t.kind.clone()),
        None => (String::new(), "Unknown".to_string()),
    }
}

/// Split an `apiVersion` into `(group, version)`.
///
/// Core API objects carry a bare version ("v1") and get the empty group.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Sort objects into natural apply order: stage class first, then
/// `(apiVersion, kind, namespace, name)`.
///
/// This is the order `ApplyAllStaged` reports in its change set, exposed so
/// callers and tests can predict it.
pub fn sort_objects(objects: &mut [DynamicObject]) {
    objects.sort_by_cached_key(sort_key);
}

fn sort_key(obj: &DynamicObject) -> (u8, String, String, String, String) {
    let id = ObjectId::from_object(obj);
    let class = ResourceClass::of(&id.kind, &id.api_version);
    (
        class as u8,
        id.api_version,
        id.kind,
        id.namespace.unwrap_or_default(),
        id.name,
    )
}
