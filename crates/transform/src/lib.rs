//! Side-effect-free transforms used by the mesh manager: re-targeting copied
//! resources, pod dependency extraction and the routing document algebra.

#![forbid(unsafe_code)]

pub mod deps;
pub mod modify;
pub mod route;

pub use deps::{extract_dependencies, is_dependency_wait_container};
pub use modify::{common_modifier, deployment_modifier, mesh_dev_modifier, service_modifier};
pub use route::{
    add_header_to_virtual_service, delete_header_from_virtual_service, gen_virtual_service_for_base_dev_space,
    gen_virtual_service_for_mesh_dev_space, header_route, owned_header_routes, restore_header_routes,
    update_header_to_virtual_service,
};
