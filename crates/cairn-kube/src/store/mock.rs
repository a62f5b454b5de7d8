//! In-memory object store for testing
//!
//! Behaves like a small API server: server-side apply merges, uid and
//! resourceVersion bookkeeping, managed-field tracking, immutable-field
//! rejection with the server's own messages, and finalizer-delayed
//! deletion. Useful for exercising the full apply pipeline without a
//! cluster.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, Time};
use kube::api::DynamicObject;
use uuid::Uuid;

use cairn_core::ObjectId;

use super::{ApplyParams, ObjectStore, Propagation, StoreError};

/// Counts of operations performed, for test assertions.
#[derive(Debug, Default, Clone)]
pub struct OperationCounts {
    pub gets: usize,
    pub creates: usize,
    pub updates: usize,
    pub applies: usize,
    pub dry_runs: usize,
    pub deletes: usize,
}

/// In-memory cluster fake.
#[derive(Clone, Default)]
pub struct MockObjectStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: RwLock<BTreeMap<String, DynamicObject>>,
    counts: RwLock<OperationCounts>,
    next_rv: AtomicU64,
    next_conflicts: AtomicUsize,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get operation counts for assertions.
    pub fn operation_counts(&self) -> OperationCounts {
        self.inner.counts.read().unwrap().clone()
    }

    /// Fail the next `n` updates with a resourceVersion conflict.
    pub fn fail_updates_with_conflict(&self, n: usize) {
        self.inner.next_conflicts.store(n, Ordering::SeqCst);
    }

    /// Peek at the live object without counting a get.
    pub fn live(&self, id: &ObjectId) -> Option<DynamicObject> {
        self.inner.objects.read().unwrap().get(&key_of(id)).cloned()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.inner.objects.read().unwrap().contains_key(&key_of(id))
    }

    /// Clear the object's finalizers, completing a pending deletion if one
    /// was parked on them.
    pub fn remove_finalizers(&self, id: &ObjectId) {
        let mut objects = self.inner.objects.write().unwrap();
        let key = key_of(id);
        if let Some(obj) = objects.get_mut(&key) {
            obj.metadata.finalizers = None;
            if obj.metadata.deletion_timestamp.is_some() {
                objects.remove(&key);
            } else {
                let rv = self.bump_rv();
                if let Some(obj) = objects.get_mut(&key) {
                    obj.metadata.resource_version = Some(rv);
                }
            }
        }
    }

    fn bump_rv(&self) -> String {
        (self.inner.next_rv.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn count(&self, f: impl FnOnce(&mut OperationCounts)) {
        f(&mut self.inner.counts.write().unwrap());
    }

    /// Server-side merge of `desired` over `live`: applied content and
    /// metadata come from the desired object, server-owned fields survive
    /// from the live one.
    fn merge(
        live: Option<&DynamicObject>,
        desired: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, StoreError> {
        let mut result = desired.clone();
        fold_string_data(&mut result);

        if let Some(live) = live {
            check_immutable(live, &result)?;

            let meta = &mut result.metadata;
            meta.uid = live.metadata.uid.clone();
            meta.creation_timestamp = live.metadata.creation_timestamp.clone();
            meta.resource_version = live.metadata.resource_version.clone();
            meta.generation = live.metadata.generation;
            meta.managed_fields = live.metadata.managed_fields.clone();
            meta.finalizers = live.metadata.finalizers.clone();
            meta.deletion_timestamp = live.metadata.deletion_timestamp.clone();

            if let Some(status) = live.data.get("status").cloned() {
                if let Some(data) = result.data.as_object_mut() {
                    data.insert("status".to_string(), status);
                }
            }
        }

        ensure_managed_entry(&mut result, field_manager, "Apply");
        Ok(result)
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn get(&self, id: &ObjectId) -> Result<DynamicObject, StoreError> {
        self.count(|c| c.gets += 1);
        self.inner
            .objects
            .read()
            .unwrap()
            .get(&key_of(id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, StoreError> {
        self.count(|c| c.creates += 1);
        let id = ObjectId::from_object(obj);
        let key = key_of(&id);

        let mut objects = self.inner.objects.write().unwrap();
        if objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{id} already exists")));
        }

        let mut stored = obj.clone();
        fold_string_data(&mut stored);
        stored.metadata.uid = Some(Uuid::new_v4().to_string());
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        stored.metadata.resource_version = Some(self.bump_rv());
        ensure_managed_entry(&mut stored, field_manager, "Update");

        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, StoreError> {
        self.count(|c| c.updates += 1);

        if self
            .inner
            .next_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict(
                "the object has been modified; please apply your changes to the latest version and try again".to_string(),
            ));
        }

        let id = ObjectId::from_object(obj);
        let key = key_of(&id);
        let mut objects = self.inner.objects.write().unwrap();
        let live = objects.get(&key).ok_or(StoreError::NotFound)?;

        if let (Some(sent), Some(current)) = (
            obj.metadata.resource_version.as_deref(),
            live.metadata.resource_version.as_deref(),
        ) {
            if sent != current {
                return Err(StoreError::Conflict(format!(
                    "Operation cannot be fulfilled on {id}: the object has been modified; please apply your changes to the latest version and try again"
                )));
            }
        }

        let mut stored = obj.clone();
        fold_string_data(&mut stored);
        stored.metadata.uid = live.metadata.uid.clone();
        stored.metadata.creation_timestamp = live.metadata.creation_timestamp.clone();
        stored.metadata.deletion_timestamp = live.metadata.deletion_timestamp.clone();
        stored.metadata.resource_version = Some(self.bump_rv());
        ensure_managed_entry(&mut stored, field_manager, "Update");

        // Clearing the last finalizer completes a pending deletion.
        let finalizers_empty = stored
            .metadata
            .finalizers
            .as_ref()
            .map(|f| f.is_empty())
            .unwrap_or(true);
        if stored.metadata.deletion_timestamp.is_some() && finalizers_empty {
            objects.remove(&key);
            return Ok(stored);
        }

        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn apply(
        &self,
        obj: &DynamicObject,
        params: &ApplyParams,
    ) -> Result<DynamicObject, StoreError> {
        if params.dry_run {
            self.count(|c| c.dry_runs += 1);
        } else {
            self.count(|c| c.applies += 1);
        }

        let id = ObjectId::from_object(obj);
        let key = key_of(&id);
        let mut objects = self.inner.objects.write().unwrap();

        let live = objects.get(&key);
        let mut merged = Self::merge(live, obj, &params.field_manager)?;

        if params.dry_run {
            return Ok(merged);
        }

        if live.is_none() {
            merged.metadata.uid = Some(Uuid::new_v4().to_string());
            merged.metadata.creation_timestamp = Some(Time(Utc::now()));
        }
        merged.metadata.resource_version = Some(self.bump_rv());

        objects.insert(key, merged.clone());
        Ok(merged)
    }

    async fn delete(&self, id: &ObjectId, _propagation: Propagation) -> Result<(), StoreError> {
        self.count(|c| c.deletes += 1);
        let key = key_of(id);
        let mut objects = self.inner.objects.write().unwrap();

        let live = objects.get_mut(&key).ok_or(StoreError::NotFound)?;
        let has_finalizers = live
            .metadata
            .finalizers
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);

        if has_finalizers {
            // Parked until the finalizers are cleared.
            live.metadata.deletion_timestamp = Some(Time(Utc::now()));
            live.metadata.resource_version = Some(self.bump_rv());
        } else {
            objects.remove(&key);
        }
        Ok(())
    }
}

fn key_of(id: &ObjectId) -> String {
    format!(
        "{}|{}|{}|{}",
        id.api_version,
        id.kind,
        id.namespace.as_deref().unwrap_or(""),
        id.name
    )
}

fn is_kind(obj: &DynamicObject, kind: &str) -> bool {
    obj.types.as_ref().map(|t| t.kind == kind).unwrap_or(false)
}

/// Fold Secret `stringData` into base64 `data`, as the server does on write.
fn fold_string_data(obj: &mut DynamicObject) {
    if !is_kind(obj, "Secret") {
        return;
    }
    let Some(root) = obj.data.as_object_mut() else {
        return;
    };
    let Some(string_data) = root.remove("stringData") else {
        return;
    };
    let Some(string_data) = string_data.as_object() else {
        return;
    };

    let data = root
        .entry("data".to_string())
        .or_insert_with(|| serde_json::Value::Object(Default::default()));
    if let Some(data) = data.as_object_mut() {
        for (k, v) in string_data {
            if let Some(s) = v.as_str() {
                data.insert(k.clone(), serde_json::Value::String(BASE64.encode(s)));
            }
        }
    }
}

/// Reject merges that would change an immutable field, with the server's
/// message for each case.
fn check_immutable(live: &DynamicObject, desired: &DynamicObject) -> Result<(), StoreError> {
    let name = live.metadata.name.as_deref().unwrap_or_default();

    if is_kind(live, "Secret") {
        let immutable = live
            .data
            .get("immutable")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if immutable && live.data.get("data") != desired.data.get("data") {
            return Err(StoreError::Invalid(format!(
                "Secret \"{name}\" is invalid: data: Forbidden: field is immutable when `immutable` is set"
            )));
        }
    }

    if is_kind(live, "ClusterRoleBinding") && live.data.get("roleRef") != desired.data.get("roleRef")
    {
        let role = desired
            .data
            .get("roleRef")
            .and_then(|r| r.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or_default();
        return Err(StoreError::Invalid(format!(
            "ClusterRoleBinding.rbac.authorization.k8s.io \"{name}\" is invalid: roleRef: Invalid value: \"{role}\": cannot change roleRef"
        )));
    }

    if is_kind(live, "StorageClass")
        && live.data.get("parameters") != desired.data.get("parameters")
    {
        return Err(StoreError::Invalid(format!(
            "StorageClass.storage.k8s.io \"{name}\" is invalid: parameters: Forbidden: updates to parameters are forbidden."
        )));
    }

    Ok(())
}

fn ensure_managed_entry(obj: &mut DynamicObject, manager: &str, operation: &str) {
    let entries = obj.metadata.managed_fields.get_or_insert_with(Vec::new);
    let present = entries.iter().any(|e| {
        e.manager.as_deref() == Some(manager) && e.operation.as_deref() == Some(operation)
    });
    if !present {
        entries.push(ManagedFieldsEntry {
            manager: Some(manager.to_string()),
            operation: Some(operation.to_string()),
            api_version: obj.types.as_ref().map(|t| t.api_version.clone()),
            ..Default::default()
        });
    }
}
