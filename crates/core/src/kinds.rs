use std::fmt;
use std::str::FromStr;

use kube::core::{ApiResource, GroupVersionKind, TypeMeta};
use serde::{Deserialize, Serialize};

use crate::MeshError;

/// The resource kinds the mesh engine caches and manipulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Deployment,
    Service,
    ConfigMap,
    Secret,
    VirtualService,
    Namespace,
}

impl ResourceKind {
    /// Namespaced kinds cached for every base and shadow namespace.
    pub const NAMESPACED: [ResourceKind; 5] = [
        ResourceKind::VirtualService,
        ResourceKind::Deployment,
        ResourceKind::ConfigMap,
        ResourceKind::Service,
        ResourceKind::Secret,
    ];

    pub fn group(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "apps",
            ResourceKind::VirtualService => "networking.istio.io",
            _ => "",
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            ResourceKind::VirtualService => "v1alpha3",
            _ => "v1",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::VirtualService => "VirtualService",
            ResourceKind::Namespace => "Namespace",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployments",
            ResourceKind::Service => "services",
            ResourceKind::ConfigMap => "configmaps",
            ResourceKind::Secret => "secrets",
            ResourceKind::VirtualService => "virtualservices",
            ResourceKind::Namespace => "namespaces",
        }
    }

    pub fn namespaced(&self) -> bool {
        !matches!(self, ResourceKind::Namespace)
    }

    pub fn api_version(&self) -> String {
        if self.group().is_empty() {
            self.version().to_string()
        } else {
            format!("{}/{}", self.group(), self.version())
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(self.group(), self.version(), self.kind())
    }

    pub fn type_meta(&self) -> TypeMeta {
        TypeMeta { api_version: self.api_version(), kind: self.kind().to_string() }
    }

    /// Static REST mapping; these kinds never need discovery.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk(), self.plural())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

impl FromStr for ResourceKind {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Deployment" => Ok(ResourceKind::Deployment),
            "Service" => Ok(ResourceKind::Service),
            "ConfigMap" => Ok(ResourceKind::ConfigMap),
            "Secret" => Ok(ResourceKind::Secret),
            "VirtualService" => Ok(ResourceKind::VirtualService),
            "Namespace" => Ok(ResourceKind::Namespace),
            other => Err(MeshError::Validation(format!("unsupported kind: {}", other))),
        }
    }
}
