//! Request model for one mesh dev-space operation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use kube::core::DynamicObject;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::virtualservice::{HttpRoute, VirtualService};
use crate::{MeshError, MeshResult};

static DNS1123_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

const DNS1123_LABEL_MAX_LEN: usize = 63;

/// What the caller asks for. Wire values: 0 = unselected, 1 = selected.
/// Values 2 (installed) and 3 (pending delete) echoed back by clients are
/// read as selected and unselected respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DesiredSelection {
    #[default]
    Unselected,
    Selected,
}

impl From<DesiredSelection> for u8 {
    fn from(s: DesiredSelection) -> u8 {
        match s {
            DesiredSelection::Unselected => 0,
            DesiredSelection::Selected => 1,
        }
    }
}

impl TryFrom<u8> for DesiredSelection {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 | 3 => Ok(DesiredSelection::Unselected),
            1 | 2 => Ok(DesiredSelection::Selected),
            other => Err(format!("invalid workload status {} (expect 0-3)", other)),
        }
    }
}

/// Where a workload actually stands relative to the shadow namespace,
/// computed by the manager and never supplied by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ActualPlacement {
    #[default]
    Absent,
    PendingInstall,
    Installed,
    PendingDelete,
}

impl ActualPlacement {
    /// Legacy numeric code, used in logs only.
    pub fn code(&self) -> u8 {
        match self {
            ActualPlacement::Absent => 0,
            ActualPlacement::PendingInstall => 1,
            ActualPlacement::Installed => 2,
            ActualPlacement::PendingDelete => 3,
        }
    }

    /// Placement from the selection alone, used when nothing is known about
    /// the shadow namespace yet.
    pub fn from_selection(selection: DesiredSelection) -> Self {
        match selection {
            DesiredSelection::Selected => ActualPlacement::PendingInstall,
            DesiredSelection::Unselected => ActualPlacement::Absent,
        }
    }

    /// Diff the selection against whether the workload already lives in the
    /// shadow namespace. `recreate` re-applies installed, still-selected workloads.
    pub fn resolve(selection: DesiredSelection, installed: bool, recreate: bool) -> Self {
        match (selection, installed) {
            (DesiredSelection::Selected, true) if recreate => ActualPlacement::PendingInstall,
            (DesiredSelection::Selected, true) => ActualPlacement::Installed,
            (DesiredSelection::Selected, false) => ActualPlacement::PendingInstall,
            (DesiredSelection::Unselected, true) => ActualPlacement::PendingDelete,
            (DesiredSelection::Unselected, false) => ActualPlacement::Absent,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub trace_key: String,
    #[serde(default)]
    pub trace_value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { trace_key: key.into(), trace_value: value.into() }
    }

    pub fn is_complete(&self) -> bool {
        !self.trace_key.is_empty() && !self.trace_value.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshDevWorkload {
    pub kind: String,
    pub name: String,
    #[serde(rename = "status", default)]
    pub selection: DesiredSelection,
    #[serde(skip)]
    pub placement: ActualPlacement,
}

impl MeshDevWorkload {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, selection: DesiredSelection) -> Self {
        Self { kind: kind.into(), name: name.into(), selection, placement: ActualPlacement::Absent }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshDevApp {
    pub name: String,
    #[serde(default)]
    pub workloads: Vec<MeshDevWorkload>,
}

/// Objects selected for install into, or removal from, the shadow namespace.
#[derive(Debug, Clone, Default)]
pub struct MeshDevResources {
    pub install: Vec<DynamicObject>,
    pub delete: Vec<DynamicObject>,
}

/// Routing mutations made during one operation, keyed by routing document name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderLedger {
    /// Documents that received a fresh header route.
    pub add: BTreeMap<String, VirtualService>,
    /// Prior header routes of documents whose route was rewritten.
    pub update: BTreeMap<String, Vec<HttpRoute>>,
}

impl HeaderLedger {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty()
    }
}

/// Shared handle on the header ledger; concurrent phases record into the same
/// ledger and rollback drains it.
#[derive(Debug, Clone, Default)]
pub struct RollbackLedger {
    header: Arc<Mutex<HeaderLedger>>,
}

impl RollbackLedger {
    fn lock(&self) -> MutexGuard<'_, HeaderLedger> {
        self.header.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_add(&self, vs: VirtualService) {
        self.lock().add.entry(vs.name().to_string()).or_insert(vs);
    }

    /// Keeps the oldest prior version so a rollback restores the original.
    pub fn record_update(&self, name: &str, previous: Vec<HttpRoute>) {
        self.lock().update.entry(name.to_string()).or_insert(previous);
    }

    /// Whether `name` received a fresh route during this operation.
    pub fn added(&self, name: &str) -> bool {
        self.lock().add.contains_key(name)
    }

    pub fn remove_add(&self, name: &str) {
        self.lock().add.remove(name);
    }

    pub fn remove_update(&self, name: &str) {
        self.lock().update.remove(name);
    }

    pub fn snapshot(&self) -> HeaderLedger {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshDevInfo {
    #[serde(skip)]
    pub base_namespace: String,
    #[serde(rename = "namespace")]
    pub mesh_dev_namespace: String,
    #[serde(default)]
    pub header: Header,
    #[serde(default)]
    pub apps: Vec<MeshDevApp>,
    #[serde(default)]
    pub is_update_header: bool,
    #[serde(default)]
    pub re_create: bool,
    #[serde(skip)]
    pub resources: MeshDevResources,
    #[serde(skip)]
    pub rollback: RollbackLedger,
}

impl MeshDevInfo {
    /// Local checks that must pass before any cluster mutation is issued.
    pub fn validate(&self) -> MeshResult<()> {
        if !self.header.is_complete() {
            return Err(MeshError::Validation("tracing header key and value are required".into()));
        }
        self.validate_namespaces()
    }

    /// Namespace checks alone, for operations that never write a header route.
    pub fn validate_namespaces(&self) -> MeshResult<()> {
        validate_dns1123_label(&self.mesh_dev_namespace)
            .map_err(|e| e.context("mesh dev namespace"))?;
        if self.base_namespace.is_empty() {
            return Err(MeshError::Validation("base namespace is required".into()));
        }
        if self.base_namespace == self.mesh_dev_namespace {
            return Err(MeshError::Validation(format!(
                "mesh dev namespace {} must differ from the base namespace",
                self.mesh_dev_namespace
            )));
        }
        Ok(())
    }

    pub fn sort_apps(&mut self) {
        sort_apps(&mut self.apps);
    }

    pub fn workloads(&self) -> impl Iterator<Item = &MeshDevWorkload> {
        self.apps.iter().flat_map(|a| a.workloads.iter())
    }

    pub fn workloads_mut(&mut self) -> impl Iterator<Item = &mut MeshDevWorkload> {
        self.apps.iter_mut().flat_map(|a| a.workloads.iter_mut())
    }
}

pub fn validate_dns1123_label(value: &str) -> MeshResult<()> {
    if value.is_empty() {
        return Err(MeshError::Validation("must not be empty".into()));
    }
    if value.len() > DNS1123_LABEL_MAX_LEN {
        return Err(MeshError::Validation(format!(
            "{} is longer than {} characters",
            value, DNS1123_LABEL_MAX_LEN
        )));
    }
    if !DNS1123_LABEL.is_match(value) {
        return Err(MeshError::Validation(format!("{} is not a valid DNS-1123 label", value)));
    }
    Ok(())
}

/// Apps by name; workloads by the concatenation of kind and name.
pub fn sort_apps(apps: &mut [MeshDevApp]) {
    apps.sort_by(|a, b| a.name.cmp(&b.name));
    for app in apps.iter_mut() {
        app.workloads.sort_by_cached_key(|w| format!("{}{}", w.kind, w.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> MeshDevInfo {
        MeshDevInfo {
            base_namespace: "team-a".into(),
            mesh_dev_namespace: "team-a-dev-bob".into(),
            header: Header::new("x-trace-id", "bob-123"),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_wire_shape() {
        let raw = serde_json::json!({
            "namespace": "team-a-dev-bob",
            "header": { "trace_key": "x-trace-id", "trace_value": "bob-123" },
            "apps": [{ "name": "bookinfo", "workloads": [
                { "kind": "Deployment", "name": "reviews", "status": 1 },
                { "kind": "Deployment", "name": "ratings", "status": 3 }
            ]}]
        });
        let info: MeshDevInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.mesh_dev_namespace, "team-a-dev-bob");
        assert_eq!(info.header.trace_value, "bob-123");
        let w = &info.apps[0].workloads;
        assert_eq!(w[0].selection, DesiredSelection::Selected);
        assert_eq!(w[1].selection, DesiredSelection::Unselected);
        assert_eq!(w[0].placement, ActualPlacement::Absent);
    }

    #[test]
    fn rejects_out_of_range_status() {
        let raw = serde_json::json!({ "kind": "Deployment", "name": "x", "status": 7 });
        assert!(serde_json::from_value::<MeshDevWorkload>(raw).is_err());
    }

    #[test]
    fn validate_checks_header_and_namespace() {
        assert!(info().validate().is_ok());

        let mut i = info();
        i.header.trace_value.clear();
        assert!(matches!(i.validate(), Err(MeshError::Validation(_))));

        let mut i = info();
        i.mesh_dev_namespace = "Team_A".into();
        assert!(i.validate().is_err());

        let mut i = info();
        i.mesh_dev_namespace = "a".repeat(64);
        assert!(i.validate().is_err());

        let mut i = info();
        i.mesh_dev_namespace = "team-a".into();
        assert!(i.validate().is_err());
    }

    #[test]
    fn resolve_placement() {
        use ActualPlacement::*;
        use DesiredSelection::*;
        assert_eq!(ActualPlacement::resolve(Selected, true, false), Installed);
        assert_eq!(ActualPlacement::resolve(Selected, true, true), PendingInstall);
        assert_eq!(ActualPlacement::resolve(Selected, false, false), PendingInstall);
        assert_eq!(ActualPlacement::resolve(Unselected, true, false), PendingDelete);
        assert_eq!(ActualPlacement::resolve(Unselected, false, true), Absent);
    }

    #[test]
    fn sort_orders_apps_and_workloads() {
        let w = |k: &str, n: &str| MeshDevWorkload::new(k, n, DesiredSelection::Unselected);
        let mut apps = vec![
            MeshDevApp {
                name: "foo".into(),
                workloads: vec![w("Deployment", "bar"), w("VirtualService", "foo"), w("ConfigMap", "bar"), w("Secret", "bar"), w("Deployment", "foo")],
            },
            MeshDevApp {
                name: "bookinfo".into(),
                workloads: vec![w("Secret", "ratings"), w("Deployment", "reviews"), w("ConfigMap", "details"), w("Deployment", "details")],
            },
        ];
        sort_apps(&mut apps);
        assert_eq!(apps[0].name, "bookinfo");
        let keys: Vec<String> = apps[0].workloads.iter().map(|w| w.key()).collect();
        assert_eq!(keys, vec!["ConfigMap/details", "Deployment/details", "Deployment/reviews", "Secret/ratings"]);
        let keys: Vec<String> = apps[1].workloads.iter().map(|w| w.key()).collect();
        assert_eq!(keys, vec!["ConfigMap/bar", "Deployment/bar", "Deployment/foo", "Secret/bar", "VirtualService/foo"]);
    }

    #[test]
    fn ledger_keeps_first_prior_version() {
        let ledger = RollbackLedger::default();
        let first = vec![HttpRoute { name: Some("a".into()), ..Default::default() }];
        let second = vec![HttpRoute { name: Some("b".into()), ..Default::default() }];
        ledger.record_update("reviews", first.clone());
        ledger.record_update("reviews", second);
        assert_eq!(ledger.snapshot().update["reviews"], first);

        let shared = ledger.clone();
        shared.remove_update("reviews");
        assert!(ledger.is_empty());

        assert!(!ledger.added("reviews"));
        ledger.record_add(VirtualService::new("reviews", "team-a"));
        assert!(shared.added("reviews"));
    }
}
