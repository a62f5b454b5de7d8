//! End-to-end apply scenarios against the in-memory object store

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use kube::api::DynamicObject;
use tokio_util::sync::CancellationToken;

use cairn_kube::{
    Action, Applier, ApplyOptions, CleanupOptions, FieldManagerSpec, FieldOperation,
    MockObjectStore, ObjectId, ObjectStore, Owner,
};

fn obj(json: serde_json::Value) -> DynamicObject {
    serde_json::from_value(json).unwrap()
}

fn namespace(name: &str) -> DynamicObject {
    obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name },
    }))
}

fn configmap(ns: &str, name: &str, value: &str) -> DynamicObject {
    obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": ns },
        "data": { "key": value },
    }))
}

fn service_account(ns: &str, name: &str) -> DynamicObject {
    obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": { "name": name, "namespace": ns },
    }))
}

fn deployment(ns: &str, name: &str) -> DynamicObject {
    obj(serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": ns },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": { "containers": [{ "name": name, "image": "nginx" }] },
            },
        },
    }))
}

fn secret(ns: &str, name: &str, value: &str) -> DynamicObject {
    obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": name, "namespace": ns },
        "type": "Opaque",
        "immutable": true,
        "stringData": { "key": value },
    }))
}

fn test_batch(ns: &str) -> Vec<DynamicObject> {
    vec![
        deployment(ns, "d"),
        configmap(ns, "c", "initial"),
        namespace(ns),
        service_account(ns, "s"),
    ]
}

fn applier() -> Applier<MockObjectStore> {
    Applier::new(MockObjectStore::new(), Owner::default())
        .with_poll_interval(Duration::from_millis(50))
}

fn selector(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_creates_objects_in_order() {
    let applier = applier();
    let change_set = applier
        .apply_all_staged(&test_batch("n"), &ApplyOptions::default())
        .await
        .unwrap();

    assert!(change_set
        .entries
        .iter()
        .all(|e| e.action == Action::Created));

    let subjects: Vec<&str> = change_set
        .entries
        .iter()
        .map(|e| e.subject.as_str())
        .collect();
    assert_eq!(
        subjects,
        vec![
            "Namespace/n",
            "ConfigMap/n/c",
            "ServiceAccount/n/s",
            "Deployment/n/d",
        ]
    );
}

#[tokio::test]
async fn test_reapply_is_unchanged() {
    let applier = applier();
    let batch = test_batch("n");
    applier
        .apply_all_staged(&batch, &ApplyOptions::default())
        .await
        .unwrap();

    let change_set = applier
        .apply_all_staged(&batch, &ApplyOptions::default())
        .await
        .unwrap();

    assert_eq!(change_set.len(), 4);
    assert!(change_set
        .entries
        .iter()
        .all(|e| e.action == Action::Unchanged));
}

#[tokio::test]
async fn test_applies_only_changed_objects() {
    let applier = applier();
    let mut batch = test_batch("n");
    applier
        .apply_all_staged(&batch, &ApplyOptions::default())
        .await
        .unwrap();

    // mutate only the configmap
    for o in &mut batch {
        if o.types.as_ref().unwrap().kind == "ConfigMap" {
            *o = configmap("n", "c", "val");
        }
    }

    let change_set = applier
        .apply_all_staged(&batch, &ApplyOptions::default())
        .await
        .unwrap();

    for entry in &change_set.entries {
        if entry.subject == "ConfigMap/n/c" {
            assert_eq!(entry.action, Action::Configured);
            assert_eq!(entry.diff.as_deref(), Some("data"));
        } else {
            assert_eq!(entry.action, Action::Unchanged, "{}", entry.subject);
        }
    }

    let live = applier
        .store()
        .live(&ObjectId::from_object(&configmap("n", "c", "val")))
        .unwrap();
    assert_eq!(live.data["data"]["key"], "val");
}

#[tokio::test]
async fn test_immutable_secret_fails_without_force() {
    let applier = applier();
    let mut batch = test_batch("n");
    batch.push(secret("n", "sec", "A"));
    applier
        .apply_all_staged(&batch, &ApplyOptions::default())
        .await
        .unwrap();

    for o in &mut batch {
        if o.types.as_ref().unwrap().kind == "Secret" {
            *o = secret("n", "sec", "B");
        }
    }

    let err = applier
        .apply_all_staged(&batch, &ApplyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Secret/n/sec dry-run failed (Invalid): Secret \"sec\" is invalid: data: Forbidden: field is immutable when `immutable` is set"
    );

    // the live secret is untouched
    let live = applier
        .store()
        .live(&ObjectId::from_object(&secret("n", "sec", "A")))
        .unwrap();
    assert_eq!(live.data["data"]["key"], BASE64.encode("A"));
}

#[tokio::test]
async fn test_immutable_secret_force_recreates() {
    let applier = applier();
    let mut batch = test_batch("n");
    batch.push(secret("n", "sec", "A"));
    applier
        .apply_all_staged(&batch, &ApplyOptions::default())
        .await
        .unwrap();

    let id = ObjectId::from_object(&secret("n", "sec", "A"));
    let old_uid = applier.store().live(&id).unwrap().metadata.uid;

    for o in &mut batch {
        if o.types.as_ref().unwrap().kind == "Secret" {
            *o = secret("n", "sec", "B");
        }
    }

    let opts = ApplyOptions {
        force: true,
        ..Default::default()
    };
    let change_set = applier.apply_all_staged(&batch, &opts).await.unwrap();

    for entry in &change_set.entries {
        if entry.subject == "Secret/n/sec" {
            assert_eq!(entry.action, Action::Created);
        } else {
            assert_eq!(entry.action, Action::Unchanged, "{}", entry.subject);
        }
    }

    let live = applier.store().live(&id).unwrap();
    assert_eq!(live.data["data"]["key"], BASE64.encode("B"));
    assert_ne!(live.metadata.uid, old_uid);
}

#[tokio::test]
async fn test_force_selector_permits_recreation() {
    let applier = applier();
    let sec = secret("n", "sec", "A");
    applier
        .apply(&sec, &ApplyOptions::default())
        .await
        .unwrap();

    let mut changed = secret("n", "sec", "B");
    changed
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert("cairn.io/force".to_string(), "true".to_string());

    // not force-eligible without the selector
    let err = applier
        .apply(&changed, &ApplyOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_invalid());

    let opts = ApplyOptions {
        force_selector: selector(&[("cairn.io/force", "true")]),
        ..Default::default()
    };
    let change_set = applier.apply(&changed, &opts).await.unwrap();
    assert_eq!(change_set.entries[0].action, Action::Created);
}

#[tokio::test]
async fn test_force_waits_for_finalizer() {
    let applier = applier();
    let sec = secret("n", "sec", "A");
    applier.apply(&sec, &ApplyOptions::default()).await.unwrap();

    let id = ObjectId::from_object(&sec);
    let store = applier.store().clone();

    // attach a finalizer to the live object
    let mut live = store.get(&id).await.unwrap();
    live.metadata.finalizers = Some(vec!["cairn.io/demo-finalizer".to_string()]);
    store.update(&live, "test").await.unwrap();

    // release it after a delay, as a slow controller would
    let delayed = store.clone();
    let delayed_id = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        delayed.remove_finalizers(&delayed_id);
    });

    let opts = ApplyOptions {
        force: true,
        ..Default::default()
    };
    let started = Instant::now();
    let change_set = applier.apply(&secret("n", "sec", "B"), &opts).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(change_set.entries[0].action, Action::Created);
    let live = store.live(&id).unwrap();
    assert_eq!(live.data["data"]["key"], BASE64.encode("B"));
}

#[tokio::test]
async fn test_exclusion_freezes_live_object() {
    let applier = applier();
    let cm = configmap("n", "c", "initial");
    applier.apply(&cm, &ApplyOptions::default()).await.unwrap();

    // an operator freezes the live object
    let id = ObjectId::from_object(&cm);
    let store = applier.store().clone();
    let mut live = store.get(&id).await.unwrap();
    live.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert("cairn.io/ignore".to_string(), "true".to_string());
    store.update(&live, "operator").await.unwrap();
    let frozen_rv = store.live(&id).unwrap().metadata.resource_version;

    let opts = ApplyOptions {
        exclusion_selector: selector(&[("cairn.io/ignore", "true")]),
        ..Default::default()
    };
    let change_set = applier
        .apply(&configmap("n", "c", "val"), &opts)
        .await
        .unwrap();

    assert_eq!(change_set.entries[0].action, Action::Unchanged);
    let live = store.live(&id).unwrap();
    assert_eq!(live.data["data"]["key"], "initial");
    assert_eq!(live.metadata.resource_version, frozen_rv);

    // without the exclusion the change goes through
    let change_set = applier
        .apply(&configmap("n", "c", "val"), &ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(change_set.entries[0].action, Action::Configured);
}

#[tokio::test]
async fn test_exclusion_on_desired_object() {
    let applier = applier();
    let mut cm = configmap("n", "c", "initial");
    applier.apply(&cm, &ApplyOptions::default()).await.unwrap();

    cm.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert("cairn.io/ignore".to_string(), "true".to_string());

    let opts = ApplyOptions {
        exclusion_selector: selector(&[("cairn.io/ignore", "true")]),
        ..Default::default()
    };
    let change_set = applier.apply(&cm, &opts).await.unwrap();
    assert_eq!(change_set.entries[0].action, Action::Unchanged);
}

#[tokio::test]
async fn test_if_not_present_with_override() {
    let applier = applier();
    let opts = ApplyOptions {
        if_not_present_selector: selector(&[("cairn.io/ssa", "IfNotPresent")]),
        ..Default::default()
    };

    let mut cm = configmap("n", "c", "initial");
    cm.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert("cairn.io/ssa".to_string(), "IfNotPresent".to_string());

    // first apply creates
    let change_set = applier
        .apply_all_staged(&[namespace("n"), cm.clone()], &opts)
        .await
        .unwrap();
    assert!(change_set.entries.iter().all(|e| e.action == Action::Created));

    // second apply skips, and writes nothing
    let id = ObjectId::from_object(&cm);
    let rv_before = applier.store().live(&id).unwrap().metadata.resource_version;
    let change_set = applier.apply(&cm, &opts).await.unwrap();
    assert_eq!(change_set.entries[0].action, Action::Skipped);
    assert_eq!(
        applier.store().live(&id).unwrap().metadata.resource_version,
        rv_before
    );

    // Override resumes normal apply
    let mut overridden = configmap("n", "c", "val");
    overridden
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert("cairn.io/ssa".to_string(), "Override".to_string());

    let change_set = applier.apply(&overridden, &opts).await.unwrap();
    assert_eq!(change_set.entries[0].action, Action::Configured);
    assert_eq!(
        applier.store().live(&id).unwrap().data["data"]["key"],
        "val"
    );
}

fn kubectl_cleanup() -> CleanupOptions {
    CleanupOptions {
        annotations: vec!["kubectl.kubernetes.io/last-applied-configuration".to_string()],
        labels: Vec::new(),
        field_managers: vec![
            FieldManagerSpec::new("kubectl", FieldOperation::Apply),
            FieldManagerSpec::new("kubectl", FieldOperation::Update),
        ],
        exclusions: Default::default(),
    }
}

#[tokio::test]
async fn test_cleanup_removes_competing_manager() {
    let applier = applier();

    // the deployment was last touched by kubectl
    let mut external = deployment("n", "d");
    external
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(
            "kubectl.kubernetes.io/last-applied-configuration".to_string(),
            "test".to_string(),
        );
    applier.store().create(&external, "kubectl").await.unwrap();

    let opts = ApplyOptions {
        cleanup: kubectl_cleanup(),
        ..Default::default()
    };
    let change_set = applier.apply(&deployment("n", "d"), &opts).await.unwrap();
    assert_eq!(change_set.entries[0].action, Action::Configured);

    let live = applier
        .store()
        .live(&ObjectId::from_object(&deployment("n", "d")))
        .unwrap();
    let managers: Vec<String> = live
        .metadata
        .managed_fields
        .unwrap_or_default()
        .into_iter()
        .filter_map(|e| e.manager)
        .collect();
    assert!(!managers.iter().any(|m| m == "kubectl"), "{managers:?}");
    assert!(managers.iter().any(|m| m == "cairn"));
    assert!(!live
        .metadata
        .annotations
        .unwrap_or_default()
        .contains_key("kubectl.kubernetes.io/last-applied-configuration"));
}

#[tokio::test]
async fn test_cleanup_exclusion_keeps_manager() {
    let applier = applier();
    applier
        .store()
        .create(&deployment("n", "d"), "kubectl")
        .await
        .unwrap();

    let mut desired = deployment("n", "d");
    desired
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert("cleanup/exclusion".to_string(), "true".to_string());

    let mut cleanup = kubectl_cleanup();
    cleanup.exclusions = selector(&[("cleanup/exclusion", "true")]);
    let opts = ApplyOptions {
        cleanup,
        ..Default::default()
    };

    let change_set = applier.apply(&desired, &opts).await.unwrap();
    assert_eq!(change_set.entries[0].action, Action::Configured);

    let live = applier
        .store()
        .live(&ObjectId::from_object(&desired))
        .unwrap();
    let managers: Vec<String> = live
        .metadata
        .managed_fields
        .unwrap_or_default()
        .into_iter()
        .filter_map(|e| e.manager)
        .collect();
    assert!(managers.iter().any(|m| m == "kubectl"), "{managers:?}");
}

#[tokio::test]
async fn test_cleanup_runs_on_unchanged_objects() {
    let applier = applier();
    let cm = configmap("n", "c", "v");
    applier.apply(&cm, &ApplyOptions::default()).await.unwrap();

    // a competing manager sneaks in between applies
    let id = ObjectId::from_object(&cm);
    let store = applier.store().clone();
    let live = store.get(&id).await.unwrap();
    store.update(&live, "kubectl").await.unwrap();

    let opts = ApplyOptions {
        cleanup: kubectl_cleanup(),
        ..Default::default()
    };
    let change_set = applier.apply(&cm, &opts).await.unwrap();
    assert_eq!(change_set.entries[0].action, Action::Unchanged);

    let managers: Vec<String> = store
        .live(&id)
        .unwrap()
        .metadata
        .managed_fields
        .unwrap_or_default()
        .into_iter()
        .filter_map(|e| e.manager)
        .collect();
    assert!(!managers.iter().any(|m| m == "kubectl"), "{managers:?}");
}

#[tokio::test]
async fn test_action_independent_of_batch_shape() {
    // the same object gets the same action whether applied alone or in a batch
    let alone = applier();
    let batched = applier();
    let batch = test_batch("n");

    alone
        .apply_all_staged(&batch, &ApplyOptions::default())
        .await
        .unwrap();
    batched
        .apply_all_staged(&batch, &ApplyOptions::default())
        .await
        .unwrap();

    let changed = configmap("n", "c", "val");
    let single = alone
        .apply(&changed, &ApplyOptions::default())
        .await
        .unwrap();

    let mut full = batch.clone();
    for o in &mut full {
        if o.types.as_ref().unwrap().kind == "ConfigMap" {
            *o = changed.clone();
        }
    }
    let in_batch = batched
        .apply_all(&full, &ApplyOptions::default())
        .await
        .unwrap();

    let single_action = single.to_map()["ConfigMap/n/c"];
    let batch_action = in_batch.to_map()["ConfigMap/n/c"];
    assert_eq!(single_action, batch_action);
    assert_eq!(single_action, Action::Configured);
}

#[tokio::test]
async fn test_apply_all_preserves_caller_order() {
    let applier = applier();
    let batch = vec![configmap("n", "z", "1"), configmap("n", "a", "1")];
    let change_set = applier
        .apply_all(&batch, &ApplyOptions::default())
        .await
        .unwrap();

    let subjects: Vec<&str> = change_set
        .entries
        .iter()
        .map(|e| e.subject.as_str())
        .collect();
    assert_eq!(subjects, vec!["ConfigMap/n/z", "ConfigMap/n/a"]);
}

#[tokio::test]
async fn test_cancellation() {
    let token = CancellationToken::new();
    let applier = Applier::new(MockObjectStore::new(), Owner::default())
        .cancelled_by(token.clone());

    token.cancel();
    let err = applier
        .apply(&configmap("n", "c", "v"), &ApplyOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_diff_does_not_write() {
    let applier = applier();
    let cm = configmap("n", "c", "initial");
    applier.apply(&cm, &ApplyOptions::default()).await.unwrap();
    let applies_before = applier.store().operation_counts().applies;

    let (entry, live, merged) = applier
        .diff(&configmap("n", "c", "val"), &ApplyOptions::default())
        .await
        .unwrap();

    assert_eq!(entry.action, Action::Configured);
    assert_eq!(entry.diff.as_deref(), Some("data"));
    let (live, merged) = (live.unwrap(), merged.unwrap());
    let text = cairn_kube::diff::render_text_diff(&live, &merged);
    assert!(text.contains("-  key: initial"));
    assert!(text.contains("+  key: val"));

    // nothing was committed
    assert_eq!(applier.store().operation_counts().applies, applies_before);
    let stored = applier
        .store()
        .live(&ObjectId::from_object(&cm))
        .unwrap();
    assert_eq!(stored.data["data"]["key"], "initial");
}

#[tokio::test]
async fn test_diff_reports_creation() {
    let applier = applier();
    let (entry, live, merged) = applier
        .diff(&configmap("n", "c", "v"), &ApplyOptions::default())
        .await
        .unwrap();

    assert_eq!(entry.action, Action::Created);
    assert!(live.is_none());
    assert!(merged.is_some());
    assert!(!applier.store().contains(&ObjectId::from_object(&configmap("n", "c", "v"))));
}
