//! In-memory [`ClusterClient`] for tests: a flat object map with resource
//! versions, live watch fan-out, a call log and injectable failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::core::DynamicObject;
use meshdev_core::{kind_of, name_of, Delta, MeshError, MeshResult, ResourceKind};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{strip_managed_fields, ClusterClient};

/// `(kind, namespace, name)`; cluster-scoped objects use an empty namespace.
pub type ObjKey = (String, String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Apply { key: ObjKey, force: bool },
    Delete { key: ObjKey, existed: bool },
}

struct Watch {
    kind: ResourceKind,
    namespace: Option<String>,
    tx: mpsc::Sender<Delta>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjKey, DynamicObject>,
    calls: Vec<Call>,
    conflicts: HashMap<ObjKey, usize>,
    failures: HashMap<ObjKey, String>,
    watch_failures: HashMap<ResourceKind, String>,
    watches_started: usize,
    watches: Vec<Watch>,
}

#[derive(Default)]
pub struct FakeClusterClient {
    state: Mutex<State>,
    rv: AtomicU64,
}

pub fn key_of(obj: &DynamicObject) -> ObjKey {
    (
        kind_of(obj).to_string(),
        obj.metadata.namespace.clone().unwrap_or_default(),
        name_of(obj).to_string(),
    )
}

pub fn key(kind: &str, namespace: &str, name: &str) -> ObjKey {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next_rv(&self) -> String {
        (self.rv.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Seed an object without recording a call.
    pub fn insert(&self, mut obj: DynamicObject) {
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        obj.metadata.resource_version = Some(self.next_rv());
        let mut st = self.lock();
        notify(&mut st.watches, &obj, Delta::Applied(obj.clone()));
        st.objects.insert(key_of(&obj), obj);
    }

    pub fn insert_json(&self, v: serde_json::Value) {
        match serde_json::from_value::<DynamicObject>(v) {
            Ok(obj) => self.insert(obj),
            Err(e) => panic!("invalid fixture: {}", e),
        }
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.lock().objects.get(&key(kind, namespace, name)).cloned()
    }

    pub fn objects_in(&self, kind: &str, namespace: &str) -> Vec<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| k == kind && ns == namespace)
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Watches whose receiver is still alive.
    pub fn active_watches(&self) -> usize {
        self.lock().watches.iter().filter(|w| !w.tx.is_closed()).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Reject the next `n` applies of this object with a conflict.
    pub fn inject_conflicts(&self, key: ObjKey, n: usize) {
        self.lock().conflicts.insert(key, n);
    }

    /// Reject every mutation of this object with a non-retryable error.
    pub fn inject_failure(&self, key: ObjKey, message: &str) {
        self.lock().failures.insert(key, message.to_string());
    }

    /// End every watch of `kind` with an error before its initial list.
    pub fn inject_watch_failure(&self, kind: ResourceKind, message: &str) {
        self.lock().watch_failures.insert(kind, message.to_string());
    }

    /// Watches opened so far, including failed ones.
    pub fn watches_started(&self) -> usize {
        self.lock().watches_started
    }

    pub fn clear_failures(&self) {
        let mut st = self.lock();
        st.failures.clear();
        st.conflicts.clear();
        st.watch_failures.clear();
    }

    fn do_apply(&self, obj: &DynamicObject, force: bool) -> MeshResult<DynamicObject> {
        let k = key_of(obj);
        let rv = self.next_rv();
        let mut st = self.lock();
        st.calls.push(Call::Apply { key: k.clone(), force });
        if let Some(msg) = st.failures.get(&k) {
            return Err(MeshError::Kube(msg.clone()));
        }
        if let Some(n) = st.conflicts.get_mut(&k) {
            if *n > 0 {
                *n -= 1;
                return Err(MeshError::Conflict(format!("{:?}: injected", k)));
            }
        }
        let existing = st.objects.get(&k);
        if let (Some(want), Some(live)) = (obj.metadata.resource_version.as_deref(), existing) {
            if live.metadata.resource_version.as_deref() != Some(want) {
                return Err(MeshError::Conflict(format!("{:?}: stale resourceVersion {}", k, want)));
            }
        }
        let mut stored = obj.clone();
        strip_managed_fields(&mut stored);
        stored.metadata.uid = existing
            .and_then(|o| o.metadata.uid.clone())
            .or_else(|| Some(Uuid::new_v4().to_string()));
        stored.metadata.resource_version = Some(rv);
        notify(&mut st.watches, &stored, Delta::Applied(stored.clone()));
        st.objects.insert(k, stored.clone());
        Ok(stored)
    }
}

fn watch_matches(w: &Watch, obj: &DynamicObject) -> bool {
    if w.kind.kind() != kind_of(obj) {
        return false;
    }
    match &w.namespace {
        Some(ns) => obj.metadata.namespace.as_deref() == Some(ns.as_str()),
        None => true,
    }
}

fn notify(watches: &mut Vec<Watch>, obj: &DynamicObject, delta: Delta) {
    watches.retain(|w| !w.tx.is_closed());
    for w in watches.iter().filter(|w| watch_matches(w, obj)) {
        let _ = w.tx.try_send(delta.clone());
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn apply(&self, obj: &DynamicObject) -> MeshResult<DynamicObject> {
        self.do_apply(obj, false)
    }

    async fn apply_force(&self, obj: &DynamicObject) -> MeshResult<DynamicObject> {
        self.do_apply(obj, true)
    }

    async fn delete(&self, obj: &DynamicObject) -> MeshResult<bool> {
        let k = key_of(obj);
        let mut st = self.lock();
        if let Some(msg) = st.failures.get(&k) {
            return Err(MeshError::Kube(msg.clone()));
        }
        let removed = st.objects.remove(&k);
        st.calls.push(Call::Delete { key: k, existed: removed.is_some() });
        if let Some(gone) = &removed {
            notify(&mut st.watches, gone, Delta::Deleted(gone.clone()));
        }
        Ok(removed.is_some())
    }

    async fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> MeshResult<Option<DynamicObject>> {
        let ns = if kind.namespaced() { namespace.unwrap_or("") } else { "" };
        Ok(self.object(kind.kind(), ns, name))
    }

    async fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> MeshResult<Vec<DynamicObject>> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| k == kind.kind() && namespace.map(|n| n == ns).unwrap_or(true))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn watch(&self, kind: ResourceKind, namespace: Option<String>, tx: mpsc::Sender<Delta>) -> MeshResult<()> {
        {
            let mut st = self.lock();
            st.watches_started += 1;
            if let Some(msg) = st.watch_failures.get(&kind) {
                return Err(MeshError::Kube(msg.clone()));
            }
            let w = Watch { kind, namespace, tx: tx.clone() };
            let initial: Vec<DynamicObject> =
                st.objects.values().filter(|o| watch_matches(&w, o)).cloned().collect();
            if tx.try_send(Delta::Restarted(initial)).is_err() {
                return Ok(());
            }
            st.watches.push(w);
        }
        tx.closed().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(ns: &str, name: &str) -> serde_json::Value {
        serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name, "namespace": ns } })
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let fake = FakeClusterClient::new();
        fake.insert_json(cm("ns", "a"));
        let mut live = fake.object("ConfigMap", "ns", "a").unwrap();
        fake.apply_force(&live).await.unwrap();
        // live still carries the pre-apply resourceVersion
        let err = fake.apply_force(&live).await.unwrap_err();
        assert!(err.is_conflict());
        live.metadata.resource_version = None;
        assert!(fake.apply_force(&live).await.is_ok());
    }

    #[tokio::test]
    async fn watch_sends_initial_list_then_changes() {
        let fake = std::sync::Arc::new(FakeClusterClient::new());
        fake.insert_json(cm("ns", "a"));
        fake.insert_json(cm("other", "b"));
        let (tx, mut rx) = mpsc::channel(8);
        let f2 = fake.clone();
        let task = tokio::spawn(async move { f2.watch(ResourceKind::ConfigMap, Some("ns".into()), tx).await });
        match rx.recv().await {
            Some(Delta::Restarted(list)) => assert_eq!(list.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        fake.insert_json(cm("ns", "c"));
        assert!(matches!(rx.recv().await, Some(Delta::Applied(_))));
        drop(rx);
        task.await.unwrap().unwrap();
    }
}
