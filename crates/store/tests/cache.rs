use std::sync::Arc;
use std::time::Duration;

use meshdev_core::{conventions, name_of, ResourceKind};
use meshdev_kubehub::fake::FakeClusterClient;
use meshdev_kubehub::ClusterClient;
use meshdev_store::{CacheSettings, ResourceCache, APPLICATION_INDEX};
use serde_json::json;

fn settings(capacity: usize) -> CacheSettings {
    CacheSettings { capacity, sync_timeout: Some(Duration::from_secs(5)), ..CacheSettings::default() }
}

fn deployment(ns: &str, name: &str, app: &str) -> serde_json::Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": ns,
            "annotations": { "dev.nocalhost/application-name": app }
        },
        "spec": { "template": { "metadata": { "labels": { "app": name } } } }
    })
}

fn service(ns: &str, name: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "namespace": ns },
        "spec": { "selector": { "app": name }, "ports": [{ "port": 9080 }] }
    })
}

fn virtual_service(ns: &str, name: &str, hosts: &[&str]) -> serde_json::Value {
    json!({
        "apiVersion": "networking.istio.io/v1alpha3",
        "kind": "VirtualService",
        "metadata": { "name": name, "namespace": ns },
        "spec": { "hosts": hosts, "http": [{ "route": [{ "destination": { "host": hosts[0] } }] }] }
    })
}

async fn eventually(mut f: impl FnMut() -> bool) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn first_get_waits_for_initial_list() {
    let fake = Arc::new(FakeClusterClient::new());
    fake.insert_json(deployment("team-a", "reviews", "bookinfo"));
    fake.insert_json(deployment("team-a", "ratings", "bookinfo"));
    fake.insert_json(deployment("team-b", "other", "bookinfo"));
    let cache = ResourceCache::new(fake.clone(), settings(4));

    let handle = cache.get(Some("team-a"), ResourceKind::Deployment).await.unwrap();
    assert_eq!(handle.list().len(), 2);
    assert!(handle.get_one("reviews").is_some());
    assert!(handle.get_one("other").is_none());

    // second get reuses the entry
    cache.get(Some("team-a"), ResourceKind::Deployment).await.unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(fake.active_watches(), 1);
}

#[tokio::test]
async fn live_changes_reach_the_handle() {
    let fake = Arc::new(FakeClusterClient::new());
    let cache = ResourceCache::new(fake.clone(), settings(4));
    let handle = cache.get(Some("team-a"), ResourceKind::Service).await.unwrap();
    assert!(handle.list().is_empty());

    fake.insert_json(service("team-a", "reviews"));
    eventually(|| handle.get_one("reviews").is_some()).await;

    let live = fake.object("Service", "team-a", "reviews").unwrap();
    fake.delete(&live).await.unwrap();
    eventually(|| handle.list().is_empty()).await;
}

#[tokio::test]
async fn app_index_and_app_configs() {
    let fake = Arc::new(FakeClusterClient::new());
    fake.insert_json(deployment("team-a", "reviews", "bookinfo"));
    fake.insert_json(deployment("team-a", "foo", "foo"));
    fake.insert_json(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": "dev.nocalhost.application.bookinfo", "namespace": "team-a" },
        "type": conventions::APP_CONFIG_SECRET_TYPE
    }));
    fake.insert_json(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": "db-password", "namespace": "team-a" },
        "type": "Opaque"
    }));
    let cache = ResourceCache::new(fake.clone(), settings(4));

    let bookinfo = cache.list_by_app("team-a", ResourceKind::Deployment, "bookinfo").await.unwrap();
    assert_eq!(bookinfo.len(), 1);
    assert_eq!(name_of(&bookinfo[0]), "reviews");

    let handle = cache.get(Some("team-a"), ResourceKind::Deployment).await.unwrap();
    assert_eq!(handle.by_index(APPLICATION_INDEX, "team-a/foo").len(), 1);

    let configs = cache.app_configs("team-a").await.unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(name_of(&configs[0]), "dev.nocalhost.application.bookinfo");
}

#[tokio::test]
async fn eviction_stops_the_least_recent_watch() {
    let fake = Arc::new(FakeClusterClient::new());
    fake.insert_json(service("team-a", "reviews"));
    let cache = ResourceCache::new(fake.clone(), settings(2));

    let evicted = cache.get(Some("team-a"), ResourceKind::Service).await.unwrap();
    cache.get(Some("team-b"), ResourceKind::Service).await.unwrap();
    cache.get(Some("team-c"), ResourceKind::Service).await.unwrap();
    assert_eq!(cache.len(), 2);
    eventually(|| fake.active_watches() == 2).await;

    // the evicted handle keeps its last view but stops following changes
    fake.insert_json(service("team-a", "ratings"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(evicted.list().len(), 1);

    cache.purge();
    assert!(cache.is_empty());
    eventually(|| fake.active_watches() == 0).await;
}

#[tokio::test]
async fn cluster_scoped_kind_ignores_namespace() {
    let fake = Arc::new(FakeClusterClient::new());
    fake.insert_json(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "team-a" } }));
    let cache = ResourceCache::new(fake.clone(), settings(4));
    let a = cache.get(Some("whatever"), ResourceKind::Namespace).await.unwrap();
    let b = cache.get(None, ResourceKind::Namespace).await.unwrap();
    assert_eq!(a.key(), b.key());
    assert!(b.get_one("team-a").is_some());
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn services_and_routing_documents_by_workload() {
    let fake = Arc::new(FakeClusterClient::new());
    fake.insert_json(deployment("team-a", "reviews", "bookinfo"));
    fake.insert_json(service("team-a", "reviews"));
    fake.insert_json(service("team-a", "ratings"));
    fake.insert_json(virtual_service("team-a", "reviews", &["reviews"]));
    fake.insert_json(virtual_service("team-a", "reviews-fqdn", &["reviews.team-a.svc.cluster.local"]));
    fake.insert_json(virtual_service("team-a", "ratings", &["ratings"]));
    let cache = ResourceCache::new(fake.clone(), settings(4));

    let workload = fake.object("Deployment", "team-a", "reviews").unwrap();
    let services = cache.match_services_by_workload(&workload).await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(name_of(&services[0]), "reviews");

    let docs = cache.match_virtual_services_by_workload(&workload).await.unwrap();
    let names: Vec<&str> = docs["reviews"].iter().map(|vs| vs.name()).collect();
    assert_eq!(names, vec!["reviews", "reviews-fqdn"]);
    assert!(!docs.contains_key("ratings"));
}

#[tokio::test]
async fn failed_initial_sync_is_retried_with_a_fresh_watch() {
    let fake = Arc::new(FakeClusterClient::new());
    fake.insert_json(service("team-a", "reviews"));
    fake.inject_watch_failure(ResourceKind::Service, "forbidden");
    let cache = ResourceCache::new(fake.clone(), settings(4));

    assert!(cache.list("team-a", ResourceKind::Service).await.is_err());
    assert!(cache.is_empty());

    fake.clear_failures();
    let services = cache.list("team-a", ResourceKind::Service).await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(fake.watches_started(), 2);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn closed_cache_refuses_reads() {
    let fake = Arc::new(FakeClusterClient::new());
    fake.insert_json(service("team-a", "reviews"));
    let cache = ResourceCache::new(fake.clone(), settings(4));
    cache.list("team-a", ResourceKind::Service).await.unwrap();

    cache.close();
    assert!(cache.is_closed());
    assert!(cache.is_empty());
    assert!(cache.list("team-a", ResourceKind::Service).await.is_err());
    assert_eq!(fake.watches_started(), 1);
}
