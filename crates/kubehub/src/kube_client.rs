use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use metrics::counter;
use meshdev_core::{Delta, MeshError, MeshResult, ResourceKind};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::{ensure_type_meta, gvk_key, gvk_of, object_ref, strip_managed_fields, ClusterClient};

/// kube-rs backed client with a cached REST mapping for non-builtin kinds.
pub struct KubeClusterClient {
    client: Client,
    field_manager: String,
    mappings: RwLock<HashMap<String, (ApiResource, bool)>>,
}

impl KubeClusterClient {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into(), mappings: RwLock::new(HashMap::new()) }
    }

    /// Client for the ambient kubeconfig / in-cluster config.
    pub async fn try_default(field_manager: impl Into<String>) -> MeshResult<Self> {
        let client = Client::try_default().await.map_err(|e| MeshError::Kube(e.to_string()))?;
        Ok(Self::new(client, field_manager))
    }

    async fn mapping(&self, gvk: &GroupVersionKind) -> MeshResult<(ApiResource, bool)> {
        if let Ok(kind) = gvk.kind.parse::<ResourceKind>() {
            if kind.group() == gvk.group && kind.version() == gvk.version {
                return Ok((kind.api_resource(), kind.namespaced()));
            }
        }
        let key = gvk_key(gvk);
        if let Some(found) = self.mappings.read().await.get(&key) {
            return Ok(found.clone());
        }
        let found = find_api_resource(self.client.clone(), gvk).await?;
        self.mappings.write().await.insert(key, found.clone());
        Ok(found)
    }

    fn api_for(&self, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> MeshResult<Api<DynamicObject>> {
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), ar));
        }
        match namespace {
            Some(ns) if !ns.is_empty() => Ok(Api::namespaced_with(self.client.clone(), ns, ar)),
            _ => Err(MeshError::Validation(format!("namespace required for namespaced kind {}", ar.kind))),
        }
    }

    async fn api_for_object(&self, obj: &DynamicObject) -> MeshResult<Api<DynamicObject>> {
        let gvk = gvk_of(obj)?;
        let (ar, namespaced) = self.mapping(&gvk).await?;
        self.api_for(&ar, namespaced, obj.metadata.namespace.as_deref())
    }

    fn api_for_kind(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    async fn patch_apply(&self, obj: &DynamicObject, force: bool) -> MeshResult<DynamicObject> {
        let api = self.api_for_object(obj).await?;
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| MeshError::Validation("object missing metadata.name".into()))?;
        let mut body = obj.clone();
        strip_managed_fields(&mut body);
        let mut pp = PatchParams::apply(&self.field_manager);
        if force {
            pp = pp.force();
        }
        let applied = api
            .patch(name, &pp, &Patch::Apply(&body))
            .await
            .map_err(|e| map_kube_err(e, format!("apply {}", object_ref(obj))))?;
        counter!("kube_apply_total", 1u64);
        debug!(obj = %object_ref(obj), force, "applied");
        Ok(applied)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn apply(&self, obj: &DynamicObject) -> MeshResult<DynamicObject> {
        self.patch_apply(obj, false).await
    }

    async fn apply_force(&self, obj: &DynamicObject) -> MeshResult<DynamicObject> {
        self.patch_apply(obj, true).await
    }

    async fn delete(&self, obj: &DynamicObject) -> MeshResult<bool> {
        let api = self.api_for_object(obj).await?;
        let name = meshdev_core::name_of(obj);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                counter!("kube_delete_total", 1u64);
                debug!(obj = %object_ref(obj), "deleted");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(map_kube_err(e, format!("delete {}", object_ref(obj)))),
        }
    }

    async fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> MeshResult<Option<DynamicObject>> {
        let api = self.api_for_kind(kind, namespace);
        let found = api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err(e, format!("get {}/{}", kind, name)))?;
        Ok(found.map(|o| ensure_type_meta(o, kind)))
    }

    async fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> MeshResult<Vec<DynamicObject>> {
        let api = self.api_for_kind(kind, namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_err(e, format!("list {} in {}", kind, namespace.unwrap_or("(all)"))))?;
        Ok(list.items.into_iter().map(|o| ensure_type_meta(o, kind)).collect())
    }

    async fn watch(&self, kind: ResourceKind, namespace: Option<String>, tx: mpsc::Sender<Delta>) -> MeshResult<()> {
        let api = self.api_for_kind(kind, namespace.as_deref());
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(kind = %kind, ns = ?namespace, "watcher started");
        while let Some(ev) = stream.next().await {
            let delta = match ev {
                Ok(watcher::Event::Applied(o)) => Delta::Applied(ensure_type_meta(o, kind)),
                Ok(watcher::Event::Deleted(o)) => Delta::Deleted(ensure_type_meta(o, kind)),
                Ok(watcher::Event::Restarted(list)) => {
                    debug!(kind = %kind, count = list.len(), "watch restart");
                    Delta::Restarted(list.into_iter().map(|o| ensure_type_meta(o, kind)).collect())
                }
                Err(e) => {
                    counter!("kube_watch_err_total", 1u64);
                    warn!(kind = %kind, ns = ?namespace, error = %e, "watch error; backing off");
                    continue;
                }
            };
            if tx.send(delta).await.is_err() {
                debug!(kind = %kind, ns = ?namespace, "watch receiver gone");
                return Ok(());
            }
        }
        warn!(kind = %kind, ns = ?namespace, "watcher stream ended");
        Ok(())
    }
}

fn map_kube_err(e: kube::Error, what: String) -> MeshError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => MeshError::Conflict(format!("{}: {}", what, ae.message)),
        kube::Error::Api(ae) if ae.code == 404 => MeshError::NotFound(format!("{}: {}", what, ae.message)),
        other => MeshError::Kube(format!("{}: {}", what, other)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> MeshResult<(ApiResource, bool)> {
    let discovery = Discovery::new(client)
        .run()
        .await
        .map_err(|e| MeshError::Kube(format!("discovery: {}", e)))?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(MeshError::NotFound(format!("GVK not found: {}", gvk_key(gvk))))
}
