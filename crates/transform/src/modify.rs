//! Re-target documents copied from the base namespace into a shadow namespace.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::core::DynamicObject;
use meshdev_core::{conventions, kind_of, to_dynamic, to_typed, MeshDevWorkload, MeshResult, ResourceKind};

use crate::deps::extract_dependencies;

/// Apply the kind-specific modifier followed by [`common_modifier`].
/// Returns the dependencies discovered in a workload's pod template.
pub fn mesh_dev_modifier(namespace: &str, obj: &mut DynamicObject) -> MeshResult<Vec<MeshDevWorkload>> {
    let deps = match kind_of(obj).parse::<ResourceKind>() {
        Ok(ResourceKind::Deployment) => deployment_modifier(obj)?,
        Ok(ResourceKind::Service) => {
            service_modifier(obj)?;
            Vec::new()
        }
        _ => Vec::new(),
    };
    common_modifier(namespace, obj);
    Ok(deps)
}

/// Strip server-owned metadata, move the object into `namespace` and point
/// the ownership annotations at it.
pub fn common_modifier(namespace: &str, obj: &mut DynamicObject) {
    let meta = &mut obj.metadata;
    meta.generate_name = None;
    meta.self_link = None;
    meta.uid = None;
    meta.resource_version = None;
    meta.generation = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.owner_references = None;
    meta.finalizers = None;
    meta.managed_fields = None;
    meta.namespace = Some(namespace.to_string());

    if let Some(annotations) = meta.annotations.as_mut() {
        for key in [conventions::APP_NAMESPACE_ANNOTATION, conventions::HELM_RELEASE_NAMESPACE_ANNOTATION] {
            if let Some(v) = annotations.get_mut(key) {
                if !v.is_empty() {
                    *v = namespace.to_string();
                }
            }
        }
        for key in conventions::NON_PORTABLE_ANNOTATIONS {
            annotations.remove(key);
        }
    }
}

/// Reset status and sanitize the pod template, returning its dependencies.
pub fn deployment_modifier(obj: &mut DynamicObject) -> MeshResult<Vec<MeshDevWorkload>> {
    let mut dep: Deployment = to_typed(obj)?;
    dep.status = None;
    let deps = dep
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .map(extract_dependencies)
        .unwrap_or_default();
    *obj = to_dynamic(&dep)?;
    Ok(deps)
}

/// Reset status and every cluster-assigned address or port.
pub fn service_modifier(obj: &mut DynamicObject) -> MeshResult<()> {
    let mut svc: Service = to_typed(obj)?;
    svc.status = None;
    if let Some(spec) = svc.spec.as_mut() {
        spec.cluster_ip = None;
        spec.cluster_ips = None;
        spec.health_check_node_port = None;
        for port in spec.ports.iter_mut().flatten() {
            port.node_port = None;
        }
    }
    *obj = to_dynamic(&svc)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(v: serde_json::Value) -> DynamicObject {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn common_modifier_retargets_metadata() {
        let mut o = obj(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cfg",
                "namespace": "team-a",
                "generateName": "cfg-",
                "uid": "1234",
                "resourceVersion": "99",
                "generation": 3,
                "finalizers": ["x"],
                "ownerReferences": [{ "apiVersion": "v1", "kind": "Pod", "name": "p", "uid": "u" }],
                "managedFields": [{ "manager": "kubectl" }],
                "annotations": {
                    "dev.nocalhost/application-namespace": "team-a",
                    "meta.helm.sh/release-namespace": "team-a",
                    "meta.helm.sh/release-name": "bookinfo",
                    "deployment.kubernetes.io/revision": "4",
                    "kubectl.kubernetes.io/last-applied-configuration": "{}",
                    "control-plane.alpha.kubernetes.io/leader": "{}",
                    "team": "payments"
                }
            },
            "data": { "k": "v" }
        }));
        common_modifier("team-a-dev-bob", &mut o);
        let m = &o.metadata;
        assert_eq!(m.namespace.as_deref(), Some("team-a-dev-bob"));
        assert!(m.uid.is_none() && m.resource_version.is_none() && m.generation.is_none());
        assert!(m.generate_name.is_none() && m.finalizers.is_none() && m.owner_references.is_none());
        assert!(m.managed_fields.is_none());
        let a = m.annotations.as_ref().unwrap();
        assert_eq!(a["dev.nocalhost/application-namespace"], "team-a-dev-bob");
        assert_eq!(a["meta.helm.sh/release-namespace"], "team-a-dev-bob");
        assert_eq!(a["meta.helm.sh/release-name"], "bookinfo");
        assert_eq!(a["team"], "payments");
        assert_eq!(a.len(), 4);
        assert_eq!(o.data["data"]["k"], "v");
    }

    #[test]
    fn service_modifier_clears_assigned_fields() {
        let mut o = obj(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "reviews", "namespace": "team-a" },
            "spec": {
                "type": "NodePort",
                "clusterIP": "10.0.0.12",
                "clusterIPs": ["10.0.0.12"],
                "selector": { "app": "reviews" },
                "ports": [{ "port": 9080, "nodePort": 30080 }]
            },
            "status": { "loadBalancer": {} }
        }));
        mesh_dev_modifier("team-a-dev-bob", &mut o).unwrap();
        assert_eq!(kind_of(&o), "Service");
        let spec = &o.data["spec"];
        assert!(spec.get("clusterIP").is_none());
        assert!(spec.get("clusterIPs").is_none());
        assert!(spec["ports"][0].get("nodePort").is_none());
        assert_eq!(spec["selector"]["app"], "reviews");
        assert!(o.data.get("status").is_none());
        assert_eq!(o.metadata.namespace.as_deref(), Some("team-a-dev-bob"));
    }

    #[test]
    fn deployment_modifier_resets_status_and_reports_dependencies() {
        let mut o = obj(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "reviews", "namespace": "team-a", "resourceVersion": "7" },
            "spec": {
                "selector": { "matchLabels": { "app": "reviews" } },
                "template": {
                    "metadata": { "labels": { "app": "reviews" } },
                    "spec": {
                        "initContainers": [{ "name": "wait-for-ratings" }],
                        "containers": [{
                            "name": "reviews",
                            "envFrom": [{ "configMapRef": { "name": "reviews-env" } }]
                        }]
                    }
                }
            },
            "status": { "replicas": 1 }
        }));
        let deps = mesh_dev_modifier("team-a-dev-bob", &mut o).unwrap();
        assert_eq!(deps.iter().map(|d| d.key()).collect::<Vec<_>>(), vec!["ConfigMap/reviews-env"]);
        assert!(o.data.get("status").is_none());
        let inits = &o.data["spec"]["template"]["spec"]["initContainers"];
        assert!(inits.is_null() || inits.as_array().map_or(false, Vec::is_empty));
        assert!(o.metadata.resource_version.is_none());
        assert_eq!(kind_of(&o), "Deployment");
    }

    #[test]
    fn other_kinds_only_get_common_changes() {
        let mut o = obj(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "s", "namespace": "team-a", "uid": "u" },
            "type": "Opaque",
            "data": { "pw": "cHc=" }
        }));
        assert!(mesh_dev_modifier("dev", &mut o).unwrap().is_empty());
        assert_eq!(o.data["type"], "Opaque");
        assert!(o.metadata.uid.is_none());
    }
}
