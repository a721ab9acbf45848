//! Mesh dev-space core types: workload selection model, resource kinds,
//! routing documents and the naming conventions shared by every crate.

#![forbid(unsafe_code)]

pub mod conventions;
pub mod error;
pub mod kinds;
pub mod model;
pub mod virtualservice;

use kube::core::DynamicObject;
use serde::{de::DeserializeOwned, Serialize};

pub use error::{MeshError, MeshResult};
pub use kinds::ResourceKind;
pub use model::{
    sort_apps, ActualPlacement, DesiredSelection, Header, HeaderLedger, MeshDevApp, MeshDevInfo,
    MeshDevResources, MeshDevWorkload, RollbackLedger,
};
pub use virtualservice::VirtualService;

pub mod prelude {
    pub use super::{
        ActualPlacement, Delta, DesiredSelection, MeshDevApp, MeshDevInfo, MeshDevWorkload, MeshError,
        MeshResult, ResourceKind, VirtualService,
    };
}

/// A single change observed on a watched resource stream.
#[derive(Debug, Clone)]
pub enum Delta {
    Applied(DynamicObject),
    Deleted(DynamicObject),
    /// Full relist; replaces everything previously seen on the stream.
    Restarted(Vec<DynamicObject>),
}

/// Kind of a dynamic object, empty when the type meta is missing.
pub fn kind_of(obj: &DynamicObject) -> &str {
    obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("")
}

pub fn name_of(obj: &DynamicObject) -> &str {
    obj.metadata.name.as_deref().unwrap_or("")
}

pub fn namespace_of(obj: &DynamicObject) -> &str {
    obj.metadata.namespace.as_deref().unwrap_or("")
}

/// `Kind/name`, the key used to line up workloads across namespaces.
pub fn workload_key(obj: &DynamicObject) -> String {
    format!("{}/{}", kind_of(obj), name_of(obj))
}

/// Decode a dynamic object into one of the typed models.
pub fn to_typed<T: DeserializeOwned>(obj: &DynamicObject) -> MeshResult<T> {
    let v = serde_json::to_value(obj).map_err(|e| MeshError::Decode(e.to_string()))?;
    serde_json::from_value(v).map_err(|e| {
        MeshError::Decode(format!("{} {}: {}", kind_of(obj), name_of(obj), e))
    })
}

/// Encode a typed model back into a dynamic object.
pub fn to_dynamic<T: Serialize>(typed: &T) -> MeshResult<DynamicObject> {
    let v = serde_json::to_value(typed).map_err(|e| MeshError::Decode(e.to_string()))?;
    serde_json::from_value(v).map_err(|e| MeshError::Decode(e.to_string()))
}
