//! Routing documents implementing "exact tracing header goes to the shadow
//! namespace, everything else goes to base".

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use meshdev_core::conventions::{header_match_name, route_name, service_host};
use meshdev_core::virtualservice::{
    Destination, HttpMatchRequest, HttpRoute, HttpRouteDestination, RouteDestination, StringMatch, TcpRoute,
};
use meshdev_core::{name_of, namespace_of, Header, MeshError, MeshResult, VirtualService};

fn http_to(host: String) -> HttpRouteDestination {
    HttpRouteDestination { destination: Destination::host(host), ..Default::default() }
}

fn default_route(service: &str, base_ns: &str) -> HttpRoute {
    HttpRoute { route: vec![http_to(service_host(service, base_ns))], ..Default::default() }
}

fn header_match(mesh_dev_ns: &str, header: &Header) -> HttpMatchRequest {
    let mut headers = BTreeMap::new();
    headers.insert(header.trace_key.clone(), StringMatch::exact(header.trace_value.clone()));
    HttpMatchRequest { name: Some(header_match_name(mesh_dev_ns)), headers, ..Default::default() }
}

/// The route a shadow namespace owns on a base routing document.
pub fn header_route(service: &str, mesh_dev_ns: &str, header: &Header) -> HttpRoute {
    HttpRoute {
        name: Some(route_name(mesh_dev_ns)),
        matches: vec![header_match(mesh_dev_ns, header)],
        route: vec![http_to(service_host(service, mesh_dev_ns))],
        ..Default::default()
    }
}

fn owns(route: &HttpRoute, name: &str) -> bool {
    route.name.as_deref() == Some(name)
}

/// Pass-through document for a service copied into the shadow namespace:
/// all HTTP and TCP traffic goes to the same service in `base_ns`.
pub fn gen_virtual_service_for_mesh_dev_space(base_ns: &str, svc: &DynamicObject) -> VirtualService {
    let name = name_of(svc);
    let mut vs = VirtualService::new(name, namespace_of(svc));
    vs.metadata.labels = svc.metadata.labels.clone();
    vs.metadata.annotations = svc.metadata.annotations.clone();
    vs.spec.hosts = vec![name.to_string()];
    vs.spec.http = vec![default_route(name, base_ns)];
    vs.spec.tcp = vec![TcpRoute {
        route: vec![RouteDestination { destination: Destination::host(service_host(name, base_ns)), weight: None }],
        ..Default::default()
    }];
    vs
}

/// Base-side document for a service that has none yet: the header route to
/// the shadow namespace first, then the unconditional route to base.
pub fn gen_virtual_service_for_base_dev_space(
    base_ns: &str,
    mesh_dev_ns: &str,
    service: &str,
    header: &Header,
) -> MeshResult<VirtualService> {
    if !header.is_complete() {
        return Err(MeshError::Validation("can not find tracing header".into()));
    }
    let mut vs = VirtualService::new(service, base_ns);
    vs.spec.hosts = vec![service.to_string()];
    vs.spec.http = vec![header_route(service, mesh_dev_ns, header), default_route(service, base_ns)];
    Ok(vs)
}

/// Routes on `vs` owned by this shadow namespace, in document order.
pub fn owned_header_routes(vs: &VirtualService, mesh_dev_ns: &str) -> Vec<HttpRoute> {
    let name = route_name(mesh_dev_ns);
    vs.spec.http.iter().filter(|r| owns(r, &name)).cloned().collect()
}

/// Replace any route this shadow namespace already owns with a fresh one at
/// the head of the list.
pub fn add_header_to_virtual_service(vs: &mut VirtualService, service: &str, mesh_dev_ns: &str, header: &Header) {
    let name = route_name(mesh_dev_ns);
    vs.spec.http.retain(|r| !owns(r, &name));
    vs.spec.http.insert(0, header_route(service, mesh_dev_ns, header));
}

/// Point the owned route(s) at the requested header value. Returns the routes
/// as they were before the change and whether anything changed.
pub fn update_header_to_virtual_service(
    vs: &mut VirtualService,
    mesh_dev_ns: &str,
    header: &Header,
) -> (Vec<HttpRoute>, bool) {
    let name = route_name(mesh_dev_ns);
    let wanted = header_match(mesh_dev_ns, header);
    let mut previous = Vec::new();
    for route in vs.spec.http.iter_mut().filter(|r| owns(r, &name)) {
        if route.matches.len() == 1 && route.matches[0] == wanted {
            continue;
        }
        previous.push(route.clone());
        route.matches = vec![wanted.clone()];
    }
    let changed = !previous.is_empty();
    (previous, changed)
}

/// Remove the route owned by this shadow namespace.
pub fn delete_header_from_virtual_service(vs: &mut VirtualService, mesh_dev_ns: &str) -> bool {
    let name = route_name(mesh_dev_ns);
    let before = vs.spec.http.len();
    vs.spec.http.retain(|r| !owns(r, &name));
    vs.spec.http.len() != before
}

/// Put previously recorded routes back in place of their current versions.
pub fn restore_header_routes(vs: &mut VirtualService, previous: &[HttpRoute]) {
    for prev in previous {
        let Some(name) = prev.name.as_deref() else { continue };
        match vs.spec.http.iter_mut().find(|r| owns(r, name)) {
            Some(current) => *current = prev.clone(),
            None => vs.spec.http.insert(0, prev.clone()),
        }
    }
}
