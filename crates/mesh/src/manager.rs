//! Init, update and injection of a mesh dev space.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use kube::core::DynamicObject;
use meshdev_core::{
    conventions, workload_key, ActualPlacement, MeshDevInfo, MeshDevResources, MeshResult, ResourceKind,
    VirtualService,
};
use meshdev_kubehub::ClusterClient;
use meshdev_store::{virtual_services_by_service, ResourceCache};
use meshdev_transform as transform;
use metrics::{counter, histogram};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::retry::retry_on_conflict;
use crate::Settings;

/// Orchestrates one cluster's mesh dev spaces. Owns the resource cache for
/// that cluster; every mutation goes through the cluster client.
pub struct MeshManager {
    pub(crate) client: Arc<dyn ClusterClient>,
    pub(crate) cache: ResourceCache,
    pub(crate) settings: Settings,
}

/// Wrap an operation in a span with a fresh operation id and record its
/// count, latency and failures.
pub(crate) async fn observe<T>(
    op: &'static str,
    base: &str,
    dev: &str,
    fut: impl Future<Output = MeshResult<T>>,
) -> MeshResult<T> {
    let span = info_span!("mesh_op", op, op_id = %Uuid::new_v4(), base, dev);
    async move {
        let t0 = Instant::now();
        counter!("mesh_op_total", 1u64, "op" => op);
        info!("operation started");
        let res = fut.await;
        let ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("mesh_op_latency_ms", ms, "op" => op);
        match &res {
            Ok(_) => info!(ms, "operation finished"),
            Err(e) => {
                counter!("mesh_op_err_total", 1u64, "op" => op);
                warn!(ms, error = %e, "operation failed");
            }
        }
        res
    }
    .instrument(span)
    .await
}

impl MeshManager {
    pub fn new(client: Arc<dyn ClusterClient>, settings: Settings) -> Self {
        let cache = ResourceCache::new(Arc::clone(&client), settings.cache.clone());
        Self { client, cache, settings }
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Stop every cache watch. A closed manager rejects every later operation.
    pub fn close(&self) {
        self.cache.close();
    }

    /// Make an empty shadow namespace a transparent proxy to base: copy the
    /// application configs and every Service, each with a pass-through routing
    /// document. Selected workloads are injected right away.
    pub async fn init_mesh_dev_space(&self, info: &mut MeshDevInfo) -> MeshResult<()> {
        self.cache.ensure_open()?;
        info.validate()?;
        let base = info.base_namespace.clone();
        let dev = info.mesh_dev_namespace.clone();
        observe("init", &base, &dev, async {
            self.copy_app_configs(&base, &dev).await?;
            self.copy_services(&base, &dev).await?;
            if !info.apps.is_empty() {
                for w in info.workloads_mut() {
                    w.placement = ActualPlacement::from_selection(w.selection);
                }
                self.tag_resources(info).await?;
                self.inject_mesh_dev_space(info).await?;
            }
            Ok(())
        })
        .await
    }

    /// Diff the selection against the shadow namespace, inject the difference
    /// and optionally rewrite the header value on every owned route.
    pub async fn update_mesh_dev_space(&self, info: &mut MeshDevInfo) -> MeshResult<()> {
        self.cache.ensure_open()?;
        info.validate()?;
        let base = info.base_namespace.clone();
        let dev = info.mesh_dev_namespace.clone();
        observe("update", &base, &dev, async {
            self.resolve_placements(info).await?;
            self.tag_resources(info).await?;
            self.inject_mesh_dev_space(info).await?;
            if info.is_update_header {
                self.update_header_routes(info).await?;
            }
            Ok(())
        })
        .await
    }

    async fn copy_app_configs(&self, base: &str, dev: &str) -> MeshResult<()> {
        for mut secret in self.cache.app_configs(base).await? {
            let app = conventions::app_name_from_config_secret(meshdev_core::name_of(&secret))
                .unwrap_or_default()
                .to_string();
            if app == conventions::DEFAULT_APPLICATION {
                continue;
            }
            transform::mesh_dev_modifier(dev, &mut secret)?;
            self.client.apply_force(&secret).await?;
            debug!(app = %app, "application config copied");
        }
        Ok(())
    }

    async fn copy_services(&self, base: &str, dev: &str) -> MeshResult<()> {
        let mut services = self.cache.list(base, ResourceKind::Service).await?;
        let mut docs = Vec::with_capacity(services.len());
        for svc in services.iter_mut() {
            transform::mesh_dev_modifier(dev, svc)?;
            docs.push(transform::gen_virtual_service_for_mesh_dev_space(base, svc).to_dynamic()?);
        }
        tokio::try_join!(self.apply_all(&services), self.apply_all(&docs))?;
        info!(services = services.len(), "services copied with pass-through routing");
        Ok(())
    }

    async fn apply_all(&self, objs: &[DynamicObject]) -> MeshResult<()> {
        for o in objs {
            self.client.apply_force(o).await?;
            debug!(obj = %workload_key(o), "applied");
        }
        Ok(())
    }

    /// Fill in each workload's placement from what the shadow namespace holds now.
    async fn resolve_placements(&self, info: &mut MeshDevInfo) -> MeshResult<()> {
        let kinds = info.workloads().map(|w| w.kind.parse::<ResourceKind>()).collect::<MeshResult<BTreeSet<_>>>()?;
        let mut installed = HashSet::new();
        for kind in kinds {
            for o in self.client.list(kind, Some(&info.mesh_dev_namespace)).await? {
                installed.insert(workload_key(&o));
            }
        }
        let re_create = info.re_create;
        for w in info.workloads_mut() {
            w.placement = ActualPlacement::resolve(w.selection, installed.contains(&w.key()), re_create);
            debug!(workload = %w.key(), placement = w.placement.code(), "placement resolved");
        }
        Ok(())
    }

    /// Pick the base objects to install into and delete from the shadow
    /// namespace, matching Kind/name against the resolved placements.
    pub async fn tag_resources(&self, info: &mut MeshDevInfo) -> MeshResult<()> {
        let pending: HashMap<String, ActualPlacement> = info
            .workloads()
            .filter(|w| matches!(w.placement, ActualPlacement::PendingInstall | ActualPlacement::PendingDelete))
            .map(|w| (w.key(), w.placement))
            .collect();
        let kinds = info
            .workloads()
            .filter(|w| pending.contains_key(&w.key()))
            .map(|w| w.kind.parse::<ResourceKind>())
            .collect::<MeshResult<BTreeSet<_>>>()?;

        let mut resources = MeshDevResources::default();
        for kind in kinds {
            for obj in self.cache.list(&info.base_namespace, kind).await? {
                match pending.get(&workload_key(&obj)) {
                    Some(ActualPlacement::PendingInstall) => resources.install.push(obj),
                    Some(ActualPlacement::PendingDelete) => resources.delete.push(obj),
                    _ => {}
                }
            }
        }
        debug!(install = resources.install.len(), delete = resources.delete.len(), "resources tagged");
        info.resources = resources;
        Ok(())
    }

    /// Apply, re-route and delete concurrently; the first failure cancels the
    /// other phases without undoing what they already did.
    pub async fn inject_mesh_dev_space(&self, info: &MeshDevInfo) -> MeshResult<()> {
        let MeshDevResources { install, delete } = &info.resources;
        tokio::try_join!(
            self.apply_workloads(info, install),
            self.update_base_routing(info, install, delete),
            self.delete_workloads(info, delete),
        )?;
        Ok(())
    }

    async fn apply_workloads(&self, info: &MeshDevInfo, install: &[DynamicObject]) -> MeshResult<()> {
        let base = info.base_namespace.as_str();
        let dev = info.mesh_dev_namespace.as_str();
        for obj in install {
            let mut copy = obj.clone();
            let deps = transform::mesh_dev_modifier(dev, &mut copy)?;
            for dep in &deps {
                let kind: ResourceKind = dep.kind.parse()?;
                let Some(mut d) = self.cache.get_one(base, kind, &dep.name).await? else {
                    warn!(dependency = %dep.key(), workload = %workload_key(obj), "dependency missing from base namespace");
                    continue;
                };
                transform::mesh_dev_modifier(dev, &mut d)?;
                self.client.apply_force(&d).await?;
                debug!(dependency = %dep.key(), "dependency applied");
            }
            self.client.apply_force(&copy).await?;
            debug!(workload = %workload_key(obj), "workload applied");
            self.delete_shadow_routing(dev, obj).await?;
        }
        Ok(())
    }

    /// Drop the pass-through documents of the workload's services; the
    /// workload itself now answers in the shadow namespace.
    async fn delete_shadow_routing(&self, dev: &str, base_obj: &DynamicObject) -> MeshResult<()> {
        let services = self.cache.match_services_by_workload(base_obj).await?;
        if services.is_empty() {
            return Ok(());
        }
        let docs = self.routing_documents(dev).await?;
        for (svc, docs) in virtual_services_by_service(&docs, &services, dev) {
            for vs in docs {
                if self.client.delete(&vs.to_dynamic()?).await? {
                    debug!(service = %svc, doc = %vs.name(), "pass-through routing removed");
                }
            }
        }
        Ok(())
    }

    async fn delete_workloads(&self, info: &MeshDevInfo, delete: &[DynamicObject]) -> MeshResult<()> {
        let base = info.base_namespace.as_str();
        let dev = info.mesh_dev_namespace.as_str();
        for obj in delete {
            let mut target = obj.clone();
            transform::common_modifier(dev, &mut target);
            let existed = self.client.delete(&target).await?;
            debug!(workload = %workload_key(obj), existed, "workload deleted");
            for mut svc in self.cache.match_services_by_workload(obj).await? {
                transform::mesh_dev_modifier(dev, &mut svc)?;
                let vs = transform::gen_virtual_service_for_mesh_dev_space(base, &svc);
                self.client.apply_force(&vs.to_dynamic()?).await?;
                debug!(doc = %vs.name(), "pass-through routing restored");
            }
        }
        Ok(())
    }

    /// Live routing documents of a namespace, read from the cluster so that a
    /// read-modify-write never starts from a lagging view.
    pub(crate) async fn routing_documents(&self, namespace: &str) -> MeshResult<Vec<VirtualService>> {
        self.client
            .list(ResourceKind::VirtualService, Some(namespace))
            .await?
            .iter()
            .map(VirtualService::from_dynamic)
            .collect()
    }

    /// Base routing documents per service backing `workload`.
    async fn base_documents_for(
        &self,
        base: &str,
        workload: &DynamicObject,
    ) -> MeshResult<BTreeMap<String, Vec<VirtualService>>> {
        let services = self.cache.match_services_by_workload(workload).await?;
        if services.is_empty() {
            return Ok(BTreeMap::new());
        }
        let docs = self.routing_documents(base).await?;
        Ok(virtual_services_by_service(&docs, &services, base))
    }

    async fn update_base_routing(
        &self,
        info: &MeshDevInfo,
        install: &[DynamicObject],
        delete: &[DynamicObject],
    ) -> MeshResult<()> {
        tokio::try_join!(self.remove_header_routes(info, delete), self.add_header_routes(info, install))?;
        Ok(())
    }

    async fn remove_header_routes(&self, info: &MeshDevInfo, delete: &[DynamicObject]) -> MeshResult<()> {
        let base = info.base_namespace.as_str();
        for obj in delete {
            for docs in self.base_documents_for(base, obj).await?.into_values() {
                for vs in docs {
                    self.delete_header_route(base, &info.mesh_dev_namespace, vs.name()).await?;
                }
            }
        }
        Ok(())
    }

    async fn add_header_routes(&self, info: &MeshDevInfo, install: &[DynamicObject]) -> MeshResult<()> {
        let base = info.base_namespace.as_str();
        let dev = info.mesh_dev_namespace.as_str();
        for obj in install {
            for (svc, docs) in self.base_documents_for(base, obj).await? {
                if docs.is_empty() {
                    let vs = transform::gen_virtual_service_for_base_dev_space(base, dev, &svc, &info.header)?;
                    self.client.apply_force(&vs.to_dynamic()?).await?;
                    debug!(service = %svc, "base routing document generated");
                    info.rollback.record_add(vs);
                    continue;
                }
                for vs in docs {
                    self.add_header_route(info, vs.name(), &svc).await?;
                }
            }
        }
        Ok(())
    }

    async fn add_header_route(&self, info: &MeshDevInfo, name: &str, service: &str) -> MeshResult<()> {
        let client = &*self.client;
        let base = info.base_namespace.as_str();
        let dev = info.mesh_dev_namespace.as_str();
        let header = &info.header;
        let ledger = &info.rollback;
        retry_on_conflict(self.settings.header_poll, self.settings.header_timeout, "add header route", || async move {
            let Some(live) = client.get(ResourceKind::VirtualService, Some(base), name).await? else {
                return Ok(());
            };
            let mut vs = VirtualService::from_dynamic(&live)?;
            let before = vs.spec.http.clone();
            let previous = transform::owned_header_routes(&vs, dev);
            transform::add_header_to_virtual_service(&mut vs, service, dev, header);
            if vs.spec.http == before {
                return Ok(());
            }
            client.apply_force(&vs.to_dynamic()?).await?;
            if previous.is_empty() {
                debug!(doc = %name, "header route added");
                ledger.record_add(vs);
            } else if !ledger.added(name) {
                debug!(doc = %name, "header route replaced");
                ledger.record_update(name, previous);
            }
            Ok(())
        })
        .await
    }

    /// Rewrite the header value on every base document carrying a route owned
    /// by this shadow namespace.
    async fn update_header_routes(&self, info: &MeshDevInfo) -> MeshResult<()> {
        let owned = conventions::route_name(&info.mesh_dev_namespace);
        let docs = self.routing_documents(&info.base_namespace).await?;
        let names: Vec<&str> = docs
            .iter()
            .filter(|vs| vs.spec.http.iter().any(|r| r.name.as_deref() == Some(owned.as_str())))
            .map(|vs| vs.name())
            .collect();
        futures::future::try_join_all(names.into_iter().map(|n| self.update_header_route(info, n))).await?;
        Ok(())
    }

    async fn update_header_route(&self, info: &MeshDevInfo, name: &str) -> MeshResult<()> {
        let client = &*self.client;
        let base = info.base_namespace.as_str();
        let dev = info.mesh_dev_namespace.as_str();
        let header = &info.header;
        let ledger = &info.rollback;
        retry_on_conflict(self.settings.header_poll, self.settings.header_timeout, "update header route", || async move {
            let Some(live) = client.get(ResourceKind::VirtualService, Some(base), name).await? else {
                return Ok(());
            };
            let mut vs = VirtualService::from_dynamic(&live)?;
            let (previous, changed) = transform::update_header_to_virtual_service(&mut vs, dev, header);
            if !changed {
                return Ok(());
            }
            client.apply_force(&vs.to_dynamic()?).await?;
            debug!(doc = %name, "header route updated");
            ledger.record_update(name, previous);
            Ok(())
        })
        .await
    }

    pub(crate) async fn delete_header_route(&self, base: &str, dev: &str, name: &str) -> MeshResult<()> {
        retry_on_conflict(self.settings.header_poll, self.settings.header_timeout, "delete header route", || {
            self.strip_route_once(base, dev, name)
        })
        .await
    }

    /// One read-modify-write removing the owned route; absence is success.
    pub(crate) async fn strip_route_once(&self, namespace: &str, dev: &str, name: &str) -> MeshResult<()> {
        let Some(live) = self.client.get(ResourceKind::VirtualService, Some(namespace), name).await? else {
            return Ok(());
        };
        let mut vs = VirtualService::from_dynamic(&live)?;
        if !transform::delete_header_from_virtual_service(&mut vs, dev) {
            return Ok(());
        }
        self.client.apply_force(&vs.to_dynamic()?).await?;
        debug!(doc = %name, "header route removed");
        Ok(())
    }

    /// Remove this shadow namespace's route from every base routing document.
    pub async fn delete_tracing_header(&self, info: &MeshDevInfo) -> MeshResult<()> {
        self.cache.ensure_open()?;
        info.validate_namespaces()?;
        let base = info.base_namespace.as_str();
        let dev = info.mesh_dev_namespace.as_str();
        observe("delete_header", base, dev, async {
            let owned = conventions::route_name(dev);
            let docs = self.routing_documents(base).await?;
            let mut removed = 0usize;
            for vs in docs.iter().filter(|vs| vs.spec.http.iter().any(|r| r.name.as_deref() == Some(owned.as_str()))) {
                self.delete_header_route(base, dev, vs.name()).await?;
                removed += 1;
            }
            info!(documents = removed, "tracing header removed");
            Ok(())
        })
        .await
    }
}
