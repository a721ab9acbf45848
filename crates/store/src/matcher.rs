//! Composable, side-effect-free filters over a snapshot of documents.

use std::collections::{BTreeMap, HashSet};

use kube::core::DynamicObject;
use meshdev_core::{conventions, kind_of, name_of, VirtualService};

use crate::index::owning_app;

/// Owned copy of the input, narrowed by each predicate in turn.
#[derive(Debug, Clone, Default)]
pub struct ResourceMatcher {
    resources: Vec<DynamicObject>,
}

fn owned_by_any(obj: &DynamicObject, apps: &HashSet<&str>) -> bool {
    owning_app(obj).map(|app| apps.contains(app)).unwrap_or(false)
}

fn app_set<'a>(names: &'a [&'a str]) -> HashSet<&'a str> {
    names.iter().copied().filter(|n| !n.is_empty()).collect()
}

impl ResourceMatcher {
    pub fn new(resources: &[DynamicObject]) -> Self {
        Self { resources: resources.to_vec() }
    }

    fn filter(mut self, f: impl Fn(&DynamicObject) -> bool) -> Self {
        self.resources.retain(|r| f(r));
        self
    }

    pub fn kind(self, kind: &str) -> Self {
        self.filter(|r| kind_of(r) == kind)
    }

    pub fn app(self, app: &str) -> Self {
        self.apps(&[app])
    }

    pub fn apps(self, apps: &[&str]) -> Self {
        let set = app_set(apps);
        self.filter(|r| owned_by_any(r, &set))
    }

    pub fn exclude_app(self, app: &str) -> Self {
        self.exclude_apps(&[app])
    }

    /// Unowned resources always survive an exclusion.
    pub fn exclude_apps(self, apps: &[&str]) -> Self {
        let set = app_set(apps);
        self.filter(|r| !owned_by_any(r, &set))
    }

    pub fn name(self, name: &str) -> Self {
        self.filter(|r| name_of(r) == name)
    }

    pub fn names(self, names: &[&str]) -> Self {
        let set: HashSet<&str> = names.iter().copied().collect();
        self.filter(|r| set.contains(name_of(r)))
    }

    pub fn name_prefix(self, prefix: &str) -> Self {
        self.filter(|r| name_of(r).starts_with(prefix))
    }

    /// Services whose selector is non-empty and fully contained in `labels`.
    pub fn selecting(self, labels: &BTreeMap<String, String>) -> Self {
        self.filter(|r| {
            let selector = service_selector(r);
            !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
        })
    }

    pub fn matched(self) -> Vec<DynamicObject> {
        self.resources
    }
}

fn string_map(v: Option<&serde_json::Value>) -> BTreeMap<String, String> {
    v.and_then(|v| v.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

pub fn service_selector(svc: &DynamicObject) -> BTreeMap<String, String> {
    string_map(svc.data.pointer("/spec/selector"))
}

/// Labels stamped on the pods a workload runs; a bare pod yields its own labels.
pub fn pod_template_labels(workload: &DynamicObject) -> BTreeMap<String, String> {
    if kind_of(workload) == "Pod" {
        return workload.metadata.labels.clone().unwrap_or_default();
    }
    string_map(workload.data.pointer("/spec/template/metadata/labels"))
}

/// Routing documents per service name; a document belongs to a service when
/// its hosts carry the short name or the fully qualified host in `namespace`.
pub fn virtual_services_by_service(
    docs: &[VirtualService],
    services: &[DynamicObject],
    namespace: &str,
) -> BTreeMap<String, Vec<VirtualService>> {
    let mut out = BTreeMap::new();
    for svc in services {
        let name = name_of(svc);
        let fqdn = conventions::service_host(name, namespace);
        let found: Vec<VirtualService> = docs
            .iter()
            .filter(|vs| vs.spec.hosts.iter().any(|h| h == name || *h == fqdn))
            .cloned()
            .collect();
        out.insert(name.to_string(), found);
    }
    out
}
