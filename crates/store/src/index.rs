//! Snapshot builder with the secondary indexes the mesh engine queries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kube::core::DynamicObject;
use meshdev_core::{conventions, kind_of, name_of, namespace_of, Delta, ResourceKind};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

pub const NAMESPACE_INDEX: &str = "namespace";
/// Owning application, value `<namespace>/<application>`.
pub const APPLICATION_INDEX: &str = "nocalhostApplication";
/// Application-config secrets, value `<namespace>`.
pub const APPLICATION_CONFIG_INDEX: &str = "nocalhostApplicationConfig";

type IndexValues = SmallVec<[String; 2]>;
type IndexFn = fn(&DynamicObject) -> IndexValues;

/// Application the object belongs to: the first non-empty of the platform
/// annotation and the helm release. The matcher's app predicates use it too.
pub fn owning_app(obj: &DynamicObject) -> Option<&str> {
    let annotations = obj.metadata.annotations.as_ref()?;
    [conventions::APP_NAME_ANNOTATION, conventions::HELM_RELEASE_NAME_ANNOTATION]
        .iter()
        .filter_map(|k| annotations.get(*k))
        .map(String::as_str)
        .find(|v| !v.is_empty())
}

pub fn index_by_namespace(obj: &DynamicObject) -> IndexValues {
    let mut out = IndexValues::new();
    out.push(namespace_of(obj).to_string());
    out
}

pub fn index_by_app_name(obj: &DynamicObject) -> IndexValues {
    let mut out = IndexValues::new();
    if let Some(app) = owning_app(obj) {
        out.push(app_index_value(namespace_of(obj), app));
    }
    out
}

pub fn index_app_config(obj: &DynamicObject) -> IndexValues {
    let mut out = IndexValues::new();
    if is_app_config(obj) {
        out.push(namespace_of(obj).to_string());
    }
    out
}

pub fn app_index_value(namespace: &str, app: &str) -> String {
    format!("{}/{}", namespace, app)
}

/// Secret carrying an application's configuration.
pub fn is_app_config(obj: &DynamicObject) -> bool {
    kind_of(obj) == ResourceKind::Secret.kind()
        && name_of(obj).starts_with(conventions::APP_CONFIG_SECRET_PREFIX)
        && obj.data.get("type").and_then(|v| v.as_str()) == Some(conventions::APP_CONFIG_SECRET_TYPE)
}

fn indexers_for(kind: ResourceKind) -> Vec<(&'static str, IndexFn)> {
    let mut out: Vec<(&'static str, IndexFn)> = vec![
        (NAMESPACE_INDEX, index_by_namespace as IndexFn),
        (APPLICATION_INDEX, index_by_app_name as IndexFn),
    ];
    if kind == ResourceKind::Secret {
        out.push((APPLICATION_CONFIG_INDEX, index_app_config as IndexFn));
    }
    out
}

fn object_key(obj: &DynamicObject) -> String {
    format!("{}/{}", namespace_of(obj), name_of(obj))
}

/// Frozen, read-only view handed to readers.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub epoch: u64,
    objects: BTreeMap<String, Arc<DynamicObject>>,
    indexes: FxHashMap<&'static str, FxHashMap<String, BTreeSet<String>>>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn list(&self) -> Vec<DynamicObject> {
        self.objects.values().map(|o| (**o).clone()).collect()
    }

    pub fn by_index(&self, index: &str, value: &str) -> Vec<DynamicObject> {
        self.indexes
            .get(index)
            .and_then(|idx| idx.get(value))
            .map(|keys| keys.iter().filter_map(|k| self.objects.get(k)).map(|o| (**o).clone()).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.objects.get(&format!("{}/{}", namespace, name)).map(|o| (**o).clone())
    }
}

/// Applies deltas for one resource kind and maintains its indexes.
pub struct SnapshotBuilder {
    epoch: u64,
    objects: BTreeMap<String, Arc<DynamicObject>>,
    indexers: Vec<(&'static str, IndexFn)>,
    indexes: FxHashMap<&'static str, FxHashMap<String, BTreeSet<String>>>,
}

impl SnapshotBuilder {
    pub fn new(kind: ResourceKind) -> Self {
        Self { epoch: 0, objects: BTreeMap::new(), indexers: indexers_for(kind), indexes: FxHashMap::default() }
    }

    fn unindex(&mut self, key: &str, obj: &DynamicObject) {
        for (name, f) in self.indexers.iter() {
            if let Some(idx) = self.indexes.get_mut(name) {
                for v in f(obj) {
                    if let Some(set) = idx.get_mut(&v) {
                        set.remove(key);
                        if set.is_empty() {
                            idx.remove(&v);
                        }
                    }
                }
            }
        }
    }

    fn index(&mut self, key: &str, obj: &DynamicObject) {
        for (name, f) in self.indexers.iter() {
            let idx = self.indexes.entry(name).or_default();
            for v in f(obj) {
                idx.entry(v).or_default().insert(key.to_string());
            }
        }
    }

    fn upsert(&mut self, obj: DynamicObject) {
        let key = object_key(&obj);
        if let Some(old) = self.objects.remove(&key) {
            self.unindex(&key, &old);
        }
        self.index(&key, &obj);
        self.objects.insert(key, Arc::new(obj));
    }

    fn remove(&mut self, obj: &DynamicObject) {
        let key = object_key(obj);
        if let Some(old) = self.objects.remove(&key) {
            self.unindex(&key, &old);
        }
    }

    pub fn apply(&mut self, delta: Delta) {
        match delta {
            Delta::Applied(o) => self.upsert(o),
            Delta::Deleted(o) => self.remove(&o),
            Delta::Restarted(list) => {
                self.objects.clear();
                self.indexes.clear();
                for o in list {
                    self.upsert(o);
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<Snapshot> {
        Arc::new(Snapshot { epoch: self.epoch, objects: self.objects.clone(), indexes: self.indexes.clone() })
    }
}
