//! Kubernetes-backed object store
//!
//! Routes dynamic objects to the right API endpoint via a cached discovery
//! run, refreshed once when a GVK is unknown (a CRD applied earlier in the
//! same call, typically).

use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::discovery::{ApiResource, Scope};
use kube::{Client, Discovery};
use tokio::sync::RwLock;
use tracing::debug;

use async_trait::async_trait;
use cairn_core::ObjectId;

use super::{ApplyParams, ObjectStore, Propagation, StoreError};

/// Object store backed by a kube client.
pub struct KubeStore {
    client: Client,
    discovery: RwLock<Discovery>,
}

impl KubeStore {
    /// Create a store, running an initial API discovery.
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(classify)?;
        Ok(Self {
            client,
            discovery: RwLock::new(discovery),
        })
    }

    /// Build a store from the default kubeconfig context.
    pub async fn try_default() -> Result<Self, StoreError> {
        let client = Client::try_default().await.map_err(classify)?;
        Self::new(client).await
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Resolve a GVK to an API resource, refreshing the discovery cache once
    /// on a miss.
    async fn resolve(&self, id: &ObjectId) -> Result<(ApiResource, bool), StoreError> {
        let gvk = id.gvk();
        if let Some((ar, caps)) = self.discovery.read().await.resolve_gvk(&gvk) {
            return Ok((ar, caps.scope == Scope::Namespaced));
        }

        debug!(gvk = %format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind), "unknown GVK, refreshing discovery");
        let mut guard = self.discovery.write().await;
        *guard = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(classify)?;
        guard
            .resolve_gvk(&gvk)
            .map(|(ar, caps)| (ar, caps.scope == Scope::Namespaced))
            .ok_or_else(|| {
                StoreError::Other(format!(
                    "no API resource for {}/{} {}",
                    gvk.group, gvk.version, gvk.kind
                ))
            })
    }

    async fn api_for(&self, id: &ObjectId) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.resolve(id).await?;
        let api = if namespaced {
            let ns = id.namespace.as_deref().unwrap_or("default");
            Api::namespaced_with(self.client.clone(), ns, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, id: &ObjectId) -> Result<DynamicObject, StoreError> {
        let api = self.api_for(id).await?;
        api.get(&id.name).await.map_err(classify)
    }

    async fn create(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, StoreError> {
        let id = ObjectId::from_object(obj);
        let api = self.api_for(&id).await?;
        let pp = PostParams {
            field_manager: Some(field_manager.to_string()),
            ..Default::default()
        };
        api.create(&pp, obj).await.map_err(classify)
    }

    async fn update(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, StoreError> {
        let id = ObjectId::from_object(obj);
        let api = self.api_for(&id).await?;
        let pp = PostParams {
            field_manager: Some(field_manager.to_string()),
            ..Default::default()
        };
        api.replace(&id.name, &pp, obj).await.map_err(classify)
    }

    async fn apply(
        &self,
        obj: &DynamicObject,
        params: &ApplyParams,
    ) -> Result<DynamicObject, StoreError> {
        let id = ObjectId::from_object(obj);
        let api = self.api_for(&id).await?;

        let mut pp = PatchParams::apply(&params.field_manager);
        if params.force {
            pp = pp.force();
        }
        if params.dry_run {
            pp = pp.dry_run();
        }

        api.patch(&id.name, &pp, &Patch::Apply(obj))
            .await
            .map_err(classify)
    }

    async fn delete(&self, id: &ObjectId, propagation: Propagation) -> Result<(), StoreError> {
        let api = self.api_for(id).await?;
        let dp = DeleteParams {
            propagation_policy: Some(match propagation {
                Propagation::Foreground => PropagationPolicy::Foreground,
                Propagation::Background => PropagationPolicy::Background,
                Propagation::Orphan => PropagationPolicy::Orphan,
            }),
            ..Default::default()
        };
        api.delete(&id.name, &dp).await.map_err(classify)?;
        Ok(())
    }
}

/// Map a kube transport error onto the engine's classification.
fn classify(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => classify_response(resp),
        other => StoreError::Other(other.to_string()),
    }
}

fn classify_response(resp: kube::core::ErrorResponse) -> StoreError {
    match resp.code {
        404 => StoreError::NotFound,
        409 => StoreError::Conflict(resp.message),
        403 => StoreError::Forbidden(resp.message),
        408 | 504 => StoreError::Timeout(resp.message),
        422 => StoreError::Invalid(resp.message),
        _ if resp.reason == "Invalid" => StoreError::Invalid(resp.message),
        _ => StoreError::Other(resp.message),
    }
}
