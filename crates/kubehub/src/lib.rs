//! Cluster client capability: the narrow surface the mesh engine uses to read
//! and mutate cluster objects, plus its kube-rs implementation.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use meshdev_core::{Delta, MeshError, MeshResult, ResourceKind};
use tokio::sync::mpsc;

mod kube_client;
#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use kube_client::KubeClusterClient;

/// Operations against one cluster, on dynamically-typed documents.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Server-side apply; fails on field-ownership conflicts.
    async fn apply(&self, obj: &DynamicObject) -> MeshResult<DynamicObject>;

    /// Server-side apply taking ownership of conflicting fields. A stale
    /// `metadata.resourceVersion` in `obj` is still rejected as a conflict.
    async fn apply_force(&self, obj: &DynamicObject) -> MeshResult<DynamicObject>;

    /// Returns `false` when the object was already gone.
    async fn delete(&self, obj: &DynamicObject) -> MeshResult<bool>;

    async fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> MeshResult<Option<DynamicObject>>;

    async fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> MeshResult<Vec<DynamicObject>>;

    /// List+watch `kind` and forward deltas into `tx` until the receiver is
    /// dropped. The first delta is always a `Restarted` carrying the full list.
    async fn watch(&self, kind: ResourceKind, namespace: Option<String>, tx: mpsc::Sender<Delta>) -> MeshResult<()>;
}

/// Split `apiVersion` + `kind` of a document into a GVK.
pub fn gvk_of(obj: &DynamicObject) -> MeshResult<GroupVersionKind> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| MeshError::Validation(format!("object {} missing apiVersion/kind", meshdev_core::name_of(obj))))?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", types.api_version.as_str()),
    };
    if version.is_empty() || types.kind.is_empty() {
        return Err(MeshError::Validation(format!("invalid apiVersion/kind: {}/{}", types.api_version, types.kind)));
    }
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Fill in type meta that list responses leave out for their items.
pub fn ensure_type_meta(mut obj: DynamicObject, kind: ResourceKind) -> DynamicObject {
    if obj.types.as_ref().map(|t| t.kind.is_empty()).unwrap_or(true) {
        obj.types = Some(kind.type_meta());
    }
    obj
}

/// Drop fields the apply endpoint refuses to accept back.
pub fn strip_managed_fields(obj: &mut DynamicObject) {
    obj.metadata.managed_fields = None;
}

pub(crate) fn object_ref(obj: &DynamicObject) -> String {
    format!(
        "{}/{}/{}",
        meshdev_core::kind_of(obj),
        obj.metadata.namespace.as_deref().unwrap_or("-"),
        meshdev_core::name_of(obj)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(api_version: &str, kind: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "name": "x", "namespace": "ns" }
        }))
        .unwrap()
    }

    #[test]
    fn gvk_of_core_and_grouped() {
        let g = gvk_of(&obj("v1", "Service")).unwrap();
        assert_eq!((g.group.as_str(), g.version.as_str(), g.kind.as_str()), ("", "v1", "Service"));
        let g = gvk_of(&obj("networking.istio.io/v1alpha3", "VirtualService")).unwrap();
        assert_eq!(gvk_key(&g), "networking.istio.io/v1alpha3/VirtualService");
    }

    #[test]
    fn gvk_of_rejects_missing_types() {
        let mut o = obj("v1", "Service");
        o.types = None;
        assert!(gvk_of(&o).is_err());
        assert!(gvk_of(&obj("apps/", "Deployment")).is_err());
    }

    #[test]
    fn ensure_type_meta_fills_only_missing() {
        let mut o = obj("v1", "Service");
        o.types = None;
        let o = ensure_type_meta(o, ResourceKind::Service);
        assert_eq!(meshdev_core::kind_of(&o), "Service");
        let kept = ensure_type_meta(obj("v1", "ConfigMap"), ResourceKind::Service);
        assert_eq!(meshdev_core::kind_of(&kept), "ConfigMap");
    }
}
