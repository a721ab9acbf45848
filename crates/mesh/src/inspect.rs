use std::collections::HashSet;

use kube::core::DynamicObject;
use meshdev_core::{
    conventions, kind_of, name_of, sort_apps, workload_key, DesiredSelection, MeshDevApp, MeshDevInfo, MeshDevWorkload,
    MeshError, MeshResult, ResourceKind,
};
use meshdev_store::ResourceMatcher;
use tracing::debug;

use crate::manager::MeshManager;

fn workloads_of(objs: &[DynamicObject]) -> Vec<MeshDevWorkload> {
    objs.iter().map(|o| MeshDevWorkload::new(kind_of(o), name_of(o), DesiredSelection::Unselected)).collect()
}

fn has_label(obj: &DynamicObject, (key, value): (&str, &str)) -> bool {
    obj.metadata.labels.as_ref().and_then(|l| l.get(key)).map(|v| v == value).unwrap_or(false)
}

impl MeshManager {
    /// Applications of the base namespace with their Deployments, all
    /// unselected. Deployments no application owns land in the default bucket.
    pub async fn get_base_dev_space_app_info(&self, info: &MeshDevInfo) -> MeshResult<Vec<MeshDevApp>> {
        let base = info.base_namespace.as_str();
        if base.is_empty() {
            return Err(MeshError::Validation("base namespace is required".into()));
        }
        let mut names: Vec<String> = self
            .cache
            .app_configs(base)
            .await?
            .iter()
            .filter_map(|s| conventions::app_name_from_config_secret(name_of(s)))
            .filter(|app| *app != conventions::DEFAULT_APPLICATION)
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();

        let deployments = self.cache.list(base, ResourceKind::Deployment).await?;
        let mut apps: Vec<MeshDevApp> = names
            .iter()
            .map(|app| MeshDevApp {
                name: app.clone(),
                workloads: workloads_of(&ResourceMatcher::new(&deployments).kind("Deployment").app(app).matched()),
            })
            .collect();
        let owned: Vec<&str> = names.iter().map(String::as_str).collect();
        apps.push(MeshDevApp {
            name: conventions::DEFAULT_APPLICATION.to_string(),
            workloads: workloads_of(&ResourceMatcher::new(&deployments).kind("Deployment").exclude_apps(&owned).matched()),
        });
        sort_apps(&mut apps);
        debug!(base, apps = apps.len(), "base dev space applications listed");
        Ok(apps)
    }

    /// Every application of the base namespace, with each workload marked
    /// selected when it already runs in the shadow namespace.
    pub async fn get_app_info(&self, info: &MeshDevInfo) -> MeshResult<Vec<MeshDevApp>> {
        info.validate_namespaces()?;
        let mut apps = self.get_base_dev_space_app_info(info).await?;
        let installed: HashSet<String> = self
            .client
            .list(ResourceKind::Deployment, Some(&info.mesh_dev_namespace))
            .await?
            .iter()
            .map(workload_key)
            .collect();
        for w in apps.iter_mut().flat_map(|a| a.workloads.iter_mut()) {
            if installed.contains(&w.key()) {
                w.selection = DesiredSelection::Selected;
            }
        }
        Ok(apps)
    }

    /// Namespaces that are mesh-enabled and marked as a base dev space, sorted.
    pub async fn get_mesh_namespace_names(&self) -> MeshResult<Vec<String>> {
        let handle = self.cache.get(None, ResourceKind::Namespace).await?;
        let mut names: Vec<String> = handle
            .list()
            .iter()
            .filter(|ns| has_label(ns, conventions::MESH_ENABLED_LABEL) && has_label(ns, conventions::BASE_DEV_SPACE_LABEL))
            .map(|ns| name_of(ns).to_string())
            .collect();
        names.sort();
        Ok(names)
    }
}
