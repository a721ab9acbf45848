//! Resource cache: lazily created, watch-backed and indexed views of one
//! resource kind per namespace, bounded by an LRU whose evictions stop the
//! underlying watch.

#![forbid(unsafe_code)]

pub mod index;
pub mod matcher;

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use kube::core::DynamicObject;
use lru::LruCache;
use meshdev_core::{namespace_of, Delta, MeshError, MeshResult, ResourceKind, VirtualService};
use meshdev_kubehub::ClusterClient;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub use index::{
    app_index_value, owning_app, Snapshot, SnapshotBuilder, APPLICATION_CONFIG_INDEX, APPLICATION_INDEX,
    NAMESPACE_INDEX,
};
pub use matcher::{pod_template_labels, service_selector, virtual_services_by_service, ResourceMatcher};

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Open (namespace, kind) entries kept before the least recently used is evicted.
    pub capacity: usize,
    /// Upper bound on the initial list; `None` waits forever.
    pub sync_timeout: Option<Duration>,
    /// Buffered watch deltas per entry.
    pub queue_cap: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { capacity: 12, sync_timeout: None, queue_cap: 1024 }
    }
}

impl CacheSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        let capacity = std::env::var("MESHDEV_CACHE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(d.capacity);
        let sync_timeout = std::env::var("MESHDEV_CACHE_SYNC_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let queue_cap = std::env::var("MESHDEV_CACHE_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.queue_cap);
        Self { capacity, sync_timeout, queue_cap }
    }
}

/// `(namespace, kind)`; cluster-scoped kinds never carry a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: Option<String>,
    pub kind: ResourceKind,
}

impl CacheKey {
    pub fn new(namespace: Option<&str>, kind: ResourceKind) -> Self {
        let namespace = if kind.namespaced() { namespace.filter(|n| !n.is_empty()).map(str::to_string) } else { None };
        Self { namespace, kind }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.kind, self.namespace.as_deref().unwrap_or("(all)"))
    }
}

struct CacheEntry {
    key: CacheKey,
    snap: Arc<ArcSwap<Snapshot>>,
    synced: watch::Receiver<bool>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl CacheEntry {
    fn start(client: Arc<dyn ClusterClient>, key: CacheKey, queue_cap: usize) -> Self {
        let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
        let (synced_tx, synced_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (tx, rx) = mpsc::channel::<Delta>(queue_cap.max(1));

        let task_key = key.clone();
        let task_snap = Arc::clone(&snap);
        tokio::spawn(async move {
            let started = Instant::now();
            let kind = task_key.kind;
            let run = async {
                let (res, ()) = tokio::join!(
                    client.watch(kind, task_key.namespace.clone(), tx),
                    ingest(kind, rx, task_snap, synced_tx, started)
                );
                res
            };
            tokio::select! {
                _ = stop_rx => debug!(entry = %task_key, "cache entry stopped"),
                res = run => match res {
                    Ok(()) => debug!(entry = %task_key, "cache watch ended"),
                    Err(e) => warn!(entry = %task_key, error = %e, "cache watch failed"),
                },
            }
        });
        info!(entry = %key, "cache entry started");
        Self { key, snap, synced: synced_rx, stop: Mutex::new(Some(stop_tx)) }
    }

    fn stop(&self) {
        let tx = self.stop.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    async fn wait_synced(&self, timeout: Option<Duration>) -> MeshResult<()> {
        let mut rx = self.synced.clone();
        let wait = async move { rx.wait_for(|s| *s).await.map(|_| ()) };
        let res = match timeout {
            Some(t) => tokio::time::timeout(t, wait)
                .await
                .map_err(|_| MeshError::Internal(format!("cache {} not synced after {:?}", self.key, t)))?,
            None => wait.await,
        };
        res.map_err(|_| MeshError::Internal(format!("cache {} watch ended before initial sync", self.key)))
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Applies deltas to a builder and publishes a snapshot after every burst.
/// Synced once the first full list has been published.
async fn ingest(
    kind: ResourceKind,
    mut rx: mpsc::Receiver<Delta>,
    snap: Arc<ArcSwap<Snapshot>>,
    synced: watch::Sender<bool>,
    started: Instant,
) {
    let mut builder = SnapshotBuilder::new(kind);
    let mut listed = false;
    while let Some(first) = rx.recv().await {
        listed |= matches!(first, Delta::Restarted(_));
        builder.apply(first);
        while let Ok(next) = rx.try_recv() {
            listed |= matches!(next, Delta::Restarted(_));
            builder.apply(next);
        }
        snap.store(builder.freeze());
        if listed && !*synced.borrow() {
            histogram!("cache_sync_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
            let _ = synced.send(true);
        }
    }
}

/// Read handle on one synced entry. Keeps serving the last snapshot after
/// the entry has been evicted.
#[derive(Clone)]
pub struct CacheHandle {
    key: CacheKey,
    snap: Arc<ArcSwap<Snapshot>>,
}

impl CacheHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.snap.load_full()
    }

    pub fn epoch(&self) -> u64 {
        self.snap.load().epoch
    }

    pub fn list(&self) -> Vec<DynamicObject> {
        self.snap.load().list()
    }

    pub fn by_index(&self, index: &str, value: &str) -> Vec<DynamicObject> {
        self.snap.load().by_index(index, value)
    }

    pub fn get_one(&self, name: &str) -> Option<DynamicObject> {
        self.snap.load().get(self.key.namespace.as_deref().unwrap_or(""), name)
    }
}

pub struct ResourceCache {
    client: Arc<dyn ClusterClient>,
    settings: CacheSettings,
    entries: Mutex<LruCache<CacheKey, Arc<CacheEntry>>>,
    closed: AtomicBool,
}

impl ResourceCache {
    pub fn new(client: Arc<dyn ClusterClient>, settings: CacheSettings) -> Self {
        let cap = NonZeroUsize::new(settings.capacity).unwrap_or(NonZeroUsize::MIN);
        Self { client, settings, entries: Mutex::new(LruCache::new(cap)), closed: AtomicBool::new(false) }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ensure_open(&self) -> MeshResult<()> {
        if self.is_closed() {
            return Err(MeshError::Internal("resource cache is closed".into()));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, Arc<CacheEntry>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Open (or reuse) the view of `kind` in `namespace` and wait for its
    /// initial list. `namespace` is ignored for cluster-scoped kinds.
    pub async fn get(&self, namespace: Option<&str>, kind: ResourceKind) -> MeshResult<CacheHandle> {
        let key = CacheKey::new(namespace, kind);
        let entry = {
            let mut entries = self.lock();
            self.ensure_open()?;
            match entries.get(&key) {
                Some(e) => Arc::clone(e),
                None => {
                    let e = Arc::new(CacheEntry::start(Arc::clone(&self.client), key.clone(), self.settings.queue_cap));
                    if let Some((old_key, old)) = entries.push(key.clone(), Arc::clone(&e)) {
                        if old_key != key {
                            old.stop();
                            counter!("cache_entries_evicted_total", 1u64);
                            debug!(entry = %old_key, "cache entry evicted");
                        }
                    }
                    e
                }
            }
        };
        if let Err(e) = entry.wait_synced(self.settings.sync_timeout).await {
            self.forget(&key, &entry);
            return Err(e);
        }
        Ok(CacheHandle { key, snap: Arc::clone(&entry.snap) })
    }

    /// Drop an entry that never synced so the next `get` starts a fresh watch.
    /// A newer entry under the same key is left alone.
    fn forget(&self, key: &CacheKey, entry: &Arc<CacheEntry>) {
        let mut entries = self.lock();
        if entries.peek(key).map(|e| Arc::ptr_eq(e, entry)).unwrap_or(false) {
            entries.pop(key);
            debug!(entry = %key, "unsynced cache entry dropped");
        }
        entry.stop();
    }

    pub async fn list(&self, namespace: &str, kind: ResourceKind) -> MeshResult<Vec<DynamicObject>> {
        Ok(self.get(Some(namespace), kind).await?.list())
    }

    pub async fn list_by_app(&self, namespace: &str, kind: ResourceKind, app: &str) -> MeshResult<Vec<DynamicObject>> {
        let handle = self.get(Some(namespace), kind).await?;
        Ok(handle.by_index(APPLICATION_INDEX, &app_index_value(namespace, app)))
    }

    pub async fn get_one(&self, namespace: &str, kind: ResourceKind, name: &str) -> MeshResult<Option<DynamicObject>> {
        Ok(self.get(Some(namespace), kind).await?.get_one(name))
    }

    /// Application-config secrets of a namespace.
    pub async fn app_configs(&self, namespace: &str) -> MeshResult<Vec<DynamicObject>> {
        let handle = self.get(Some(namespace), ResourceKind::Secret).await?;
        Ok(handle.by_index(APPLICATION_CONFIG_INDEX, namespace))
    }

    /// Services in the workload's namespace that select its pods.
    pub async fn match_services_by_workload(&self, workload: &DynamicObject) -> MeshResult<Vec<DynamicObject>> {
        let labels = pod_template_labels(workload);
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let services = self.list(namespace_of(workload), ResourceKind::Service).await?;
        Ok(ResourceMatcher::new(&services).selecting(&labels).matched())
    }

    /// Routing documents for each service backing the workload, keyed by
    /// service name. A document matches when its hosts carry the service's
    /// short name or fully qualified host.
    pub async fn match_virtual_services_by_workload(
        &self,
        workload: &DynamicObject,
    ) -> MeshResult<BTreeMap<String, Vec<VirtualService>>> {
        let ns = namespace_of(workload);
        let services = self.match_services_by_workload(workload).await?;
        if services.is_empty() {
            return Ok(BTreeMap::new());
        }
        let docs = self
            .list(ns, ResourceKind::VirtualService)
            .await?
            .iter()
            .map(VirtualService::from_dynamic)
            .collect::<MeshResult<Vec<_>>>()?;
        Ok(virtual_services_by_service(&docs, &services, ns))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop every watch and forget every entry.
    pub fn purge(&self) {
        let mut entries = self.lock();
        let n = entries.len();
        for (_, e) in entries.iter() {
            e.stop();
        }
        entries.clear();
        info!(entries = n, "cache purged");
    }

    /// Purge and refuse every later read.
    pub fn close(&self) {
        let mut entries = self.lock();
        self.closed.store(true, Ordering::SeqCst);
        for (_, e) in entries.iter() {
            e.stop();
        }
        entries.clear();
        info!("cache closed");
    }
}

impl Drop for ResourceCache {
    fn drop(&mut self) {
        self.purge();
    }
}
