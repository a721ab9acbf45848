#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kube::core::DynamicObject;
use meshdev_core::virtualservice::HttpRoute;
use meshdev_core::{DesiredSelection, Header, MeshDevApp, MeshDevInfo, MeshDevWorkload, VirtualService};
use meshdev_kubehub::fake::FakeClusterClient;
use meshdev_mesh::{MeshManager, Settings};
use meshdev_store::CacheSettings;
use serde_json::json;

pub const BASE: &str = "team-a";
pub const DEV: &str = "team-a-dev-bob";

pub fn settings() -> Settings {
    Settings {
        cache: CacheSettings { sync_timeout: Some(Duration::from_secs(5)), ..CacheSettings::default() },
        header_poll: Duration::from_millis(10),
        header_timeout: Duration::from_millis(500),
        rollback_poll: Duration::from_millis(10),
        rollback_timeout: Duration::from_millis(200),
        ..Settings::default()
    }
}

pub fn deployment(ns: &str, name: &str, app: Option<&str>) -> serde_json::Value {
    let mut annotations = serde_json::Map::new();
    if let Some(app) = app {
        annotations.insert("dev.nocalhost/application-name".into(), json!(app));
    }
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": ns, "annotations": annotations, "resourceVersion": "1" },
        "spec": {
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": {
                    "initContainers": [{ "name": "nocalhost-dependency-waiting-job", "image": "busybox" }],
                    "containers": [{
                        "name": name,
                        "image": format!("{}:v1", name),
                        "env": [{ "name": "CFG", "valueFrom": { "configMapKeyRef": { "name": format!("{}-cfg", name), "key": "k" } } }]
                    }]
                }
            }
        },
        "status": { "replicas": 1 }
    })
}

pub fn service(ns: &str, name: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "namespace": ns },
        "spec": { "selector": { "app": name }, "clusterIP": "10.0.0.12", "ports": [{ "name": "http", "port": 9080 }] }
    })
}

pub fn config_map(ns: &str, name: &str) -> serde_json::Value {
    json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name, "namespace": ns }, "data": { "k": "v" } })
}

pub fn app_config(ns: &str, app: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "dev.nocalhost/application.meta",
        "metadata": { "name": format!("dev.nocalhost.application.{}", app), "namespace": ns },
        "data": {}
    })
}

pub fn virtual_service(ns: &str, name: &str) -> serde_json::Value {
    json!({
        "apiVersion": "networking.istio.io/v1alpha3",
        "kind": "VirtualService",
        "metadata": { "name": name, "namespace": ns },
        "spec": {
            "hosts": [name],
            "http": [{ "route": [{ "destination": { "host": format!("{}.{}.svc.cluster.local", name, ns) } }] }]
        }
    })
}

pub fn namespace(name: &str, labels: serde_json::Value) -> serde_json::Value {
    json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": name, "labels": labels } })
}

/// bookinfo in the base namespace: reviews (with a routing document) and
/// ratings (without), each with its service and config map.
pub fn bookinfo() -> Arc<FakeClusterClient> {
    let fake = Arc::new(FakeClusterClient::new());
    fake.insert_json(app_config(BASE, "bookinfo"));
    fake.insert_json(app_config(BASE, "default.application"));
    for name in ["reviews", "ratings"] {
        fake.insert_json(deployment(BASE, name, Some("bookinfo")));
        fake.insert_json(service(BASE, name));
        fake.insert_json(config_map(BASE, &format!("{}-cfg", name)));
    }
    fake.insert_json(virtual_service(BASE, "reviews"));
    fake
}

pub fn manager(fake: &Arc<FakeClusterClient>) -> MeshManager {
    MeshManager::new(fake.clone(), settings())
}

pub fn request(dev: &str, trace_value: &str, selected: &[&str]) -> MeshDevInfo {
    let workloads = ["reviews", "ratings"]
        .iter()
        .map(|n| {
            let sel = if selected.contains(n) { DesiredSelection::Selected } else { DesiredSelection::Unselected };
            MeshDevWorkload::new("Deployment", *n, sel)
        })
        .collect();
    MeshDevInfo {
        base_namespace: BASE.into(),
        mesh_dev_namespace: dev.into(),
        header: Header::new("x-trace-id", trace_value),
        apps: vec![MeshDevApp { name: "bookinfo".into(), workloads }],
        ..Default::default()
    }
}

pub fn routing(fake: &FakeClusterClient, ns: &str, name: &str) -> Option<VirtualService> {
    fake.object("VirtualService", ns, name).map(|o| VirtualService::from_dynamic(&o).unwrap())
}

pub fn route_names(vs: &VirtualService) -> Vec<Option<String>> {
    vs.spec.http.iter().map(|r| r.name.clone()).collect()
}

pub fn owned_route<'a>(vs: &'a VirtualService, dev: &str) -> Option<&'a HttpRoute> {
    let name = format!("nocalhost-{}", dev);
    vs.spec.http.iter().find(|r| r.name.as_deref() == Some(name.as_str()))
}

pub fn header_value(route: &HttpRoute) -> Option<String> {
    route.matches.first().and_then(|m| m.headers.get("x-trace-id")).and_then(|s| s.exact.clone())
}

pub fn data(obj: &DynamicObject, pointer: &str) -> Option<serde_json::Value> {
    obj.data.pointer(pointer).cloned()
}
