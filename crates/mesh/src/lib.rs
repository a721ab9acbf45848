//! Mesh dev-space manager: clones a base namespace into a shadow namespace,
//! moves selected workloads there and steers tagged traffic to them through
//! header routes on the base namespace's routing documents.

#![forbid(unsafe_code)]

mod inspect;
mod manager;
mod retry;
mod rollback;
mod settings;

pub use manager::MeshManager;
pub use rollback::RollbackReport;
pub use settings::Settings;
