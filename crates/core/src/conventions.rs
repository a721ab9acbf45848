//! Names, annotations and labels the platform agrees on with the rest of the
//! cluster tooling.

/// Product name; prefixes every route this engine owns.
pub const PRODUCT: &str = "nocalhost";

pub const APP_NAME_ANNOTATION: &str = "dev.nocalhost/application-name";
pub const APP_NAMESPACE_ANNOTATION: &str = "dev.nocalhost/application-namespace";
pub const HELM_RELEASE_NAME_ANNOTATION: &str = "meta.helm.sh/release-name";
pub const HELM_RELEASE_NAMESPACE_ANNOTATION: &str = "meta.helm.sh/release-namespace";

/// Annotations that never survive a copy into another namespace.
pub const NON_PORTABLE_ANNOTATIONS: [&str; 3] = [
    "deployment.kubernetes.io/revision",
    "kubectl.kubernetes.io/last-applied-configuration",
    "control-plane.alpha.kubernetes.io/leader",
];

pub const APP_CONFIG_SECRET_PREFIX: &str = "dev.nocalhost.application.";
pub const APP_CONFIG_SECRET_TYPE: &str = "dev.nocalhost/application.meta";
/// Catch-all application for workloads no application claims.
pub const DEFAULT_APPLICATION: &str = "default.application";

pub const MESH_ENABLED_LABEL: (&str, &str) = ("istio-injection", "enabled");
pub const BASE_DEV_SPACE_LABEL: (&str, &str) = ("nocalhost.dev/devspace", "base");

pub const DEPENDENCY_INIT_CONTAINER_PREFIXES: [&str; 2] =
    ["nocalhost-dependency-waiting-job", "wait-for-"];

pub const CLUSTER_DOMAIN: &str = "cluster.local";

/// Fully qualified in-cluster host of a service.
pub fn service_host(service: &str, namespace: &str) -> String {
    format!("{}.{}.svc.{}", service, namespace, CLUSTER_DOMAIN)
}

/// Name of the header route a shadow namespace owns on a base routing document.
pub fn route_name(mesh_dev_namespace: &str) -> String {
    format!("{}-{}", PRODUCT, mesh_dev_namespace)
}

/// Name of the header match inside that route.
pub fn header_match_name(mesh_dev_namespace: &str) -> String {
    format!("{}-{}-tracing-header", PRODUCT, mesh_dev_namespace)
}

/// Application name carried by an application-config secret name, if any.
pub fn app_name_from_config_secret(secret_name: &str) -> Option<&str> {
    secret_name.strip_prefix(APP_CONFIG_SECRET_PREFIX)
}
