//! Pod dependency extraction.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{Container, PodSpec, Volume};
use meshdev_core::{conventions, DesiredSelection, MeshDevWorkload, ResourceKind};
use tracing::debug;

/// Ordered, duplicate-free list of `(kind, name)` references.
#[derive(Default)]
struct Found {
    seen: HashSet<(ResourceKind, String)>,
    order: Vec<(ResourceKind, String)>,
}

impl Found {
    fn push(&mut self, kind: ResourceKind, name: Option<&String>) {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return;
        };
        if self.seen.insert((kind, name.clone())) {
            self.order.push((kind, name.clone()));
        }
    }

    fn into_workloads(self) -> Vec<MeshDevWorkload> {
        self.order
            .into_iter()
            .map(|(kind, name)| MeshDevWorkload::new(kind.kind(), name, DesiredSelection::Selected))
            .collect()
    }
}

pub fn is_dependency_wait_container(name: &str) -> bool {
    conventions::DEPENDENCY_INIT_CONTAINER_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Returns whether the volume survives the copy, recording what it references.
fn keep_volume(v: &Volume, found: &mut Found) -> bool {
    if let Some(cm) = &v.config_map {
        found.push(ResourceKind::ConfigMap, cm.name.as_ref());
        return true;
    }
    if let Some(secret) = &v.secret {
        found.push(ResourceKind::Secret, secret.secret_name.as_ref());
        return true;
    }
    v.empty_dir.is_some() || v.downward_api.is_some() || v.host_path.is_some()
}

fn scan_env(c: &Container, found: &mut Found) {
    for e in c.env.iter().flatten() {
        let Some(from) = &e.value_from else { continue };
        if let Some(r) = &from.config_map_key_ref {
            found.push(ResourceKind::ConfigMap, r.name.as_ref());
        }
        if let Some(r) = &from.secret_key_ref {
            found.push(ResourceKind::Secret, r.name.as_ref());
        }
    }
    for e in c.env_from.iter().flatten() {
        if let Some(r) = &e.config_map_ref {
            found.push(ResourceKind::ConfigMap, r.name.as_ref());
        }
        if let Some(r) = &e.secret_ref {
            found.push(ResourceKind::Secret, r.name.as_ref());
        }
    }
}

/// Sanitize a pod spec for a namespace where none of its peers exist yet and
/// collect the ConfigMaps and Secrets it needs.
///
/// Dependency-waiting init containers are removed. ConfigMap and Secret
/// volumes are kept and recorded; emptyDir, downwardAPI and hostPath volumes
/// pass through; every other volume is dropped along with its mounts.
/// Environment references (`valueFrom` and `envFrom`) of the remaining
/// containers are recorded as well.
pub fn extract_dependencies(spec: &mut PodSpec) -> Vec<MeshDevWorkload> {
    let mut found = Found::default();

    if let Some(inits) = spec.init_containers.as_mut() {
        inits.retain(|c| !is_dependency_wait_container(&c.name));
    }

    let mut dropped: HashSet<String> = HashSet::new();
    if let Some(volumes) = spec.volumes.as_mut() {
        volumes.retain(|v| {
            let keep = keep_volume(v, &mut found);
            if !keep {
                debug!(volume = %v.name, "dropping unsupported volume");
                dropped.insert(v.name.clone());
            }
            keep
        });
    }

    let inits = spec.init_containers.iter_mut().flatten();
    for c in spec.containers.iter_mut().chain(inits) {
        if !dropped.is_empty() {
            if let Some(mounts) = c.volume_mounts.as_mut() {
                mounts.retain(|m| !dropped.contains(&m.name));
            }
        }
        scan_env(c, &mut found);
    }

    found.into_workloads()
}
