use std::time::Duration;

use meshdev_core::virtualservice::HttpRoute;
use meshdev_core::{MeshDevInfo, MeshResult, ResourceKind, VirtualService};
use meshdev_transform as transform;
use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::manager::{observe, MeshManager};

/// Ledger entries rollback could not reverse before its deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub unreversed_adds: Vec<String>,
    pub unreversed_updates: Vec<String>,
}

impl RollbackReport {
    pub fn is_complete(&self) -> bool {
        self.unreversed_adds.is_empty() && self.unreversed_updates.is_empty()
    }
}

impl MeshManager {
    /// Best-effort reversal of the header mutations recorded in `info`.
    /// Added routes are removed and rewritten routes restored; each side
    /// retries until the ledger drains or the rollback deadline passes.
    pub async fn rollback(&self, info: &MeshDevInfo) -> RollbackReport {
        let base = info.base_namespace.as_str();
        let dev = info.mesh_dev_namespace.as_str();
        let run = async {
            let (unreversed_adds, unreversed_updates) =
                tokio::join!(self.reverse_adds(info), self.reverse_updates(info));
            Ok(RollbackReport { unreversed_adds, unreversed_updates })
        };
        let report = observe("rollback", base, dev, run).await.unwrap_or_default();
        if report.is_complete() {
            info!(base, dev, "rollback complete");
        }
        report
    }

    async fn reverse_adds(&self, info: &MeshDevInfo) -> Vec<String> {
        let dev = info.mesh_dev_namespace.as_str();
        let ledger = &info.rollback;
        let pending = || -> Vec<(String, String)> {
            ledger.snapshot().add.into_iter().map(|(name, vs)| (name, vs.namespace().to_string())).collect()
        };
        drain(self.settings.rollback_poll, self.settings.rollback_timeout, "add", pending, |(name, ns)| async move {
            self.strip_route_once(&ns, dev, &name).await?;
            ledger.remove_add(&name);
            Ok(name)
        })
        .await
    }

    async fn reverse_updates(&self, info: &MeshDevInfo) -> Vec<String> {
        let base = info.base_namespace.as_str();
        let ledger = &info.rollback;
        let pending = || -> Vec<(String, Vec<HttpRoute>)> { ledger.snapshot().update.into_iter().collect() };
        drain(self.settings.rollback_poll, self.settings.rollback_timeout, "update", pending, |(name, previous)| async move {
            self.restore_once(base, &name, &previous).await?;
            ledger.remove_update(&name);
            Ok(name)
        })
        .await
    }

    async fn restore_once(&self, namespace: &str, name: &str, previous: &[HttpRoute]) -> MeshResult<()> {
        let Some(live) = self.client.get(ResourceKind::VirtualService, Some(namespace), name).await? else {
            return Ok(());
        };
        let mut vs = VirtualService::from_dynamic(&live)?;
        transform::restore_header_routes(&mut vs, previous);
        self.client.apply_force(&vs.to_dynamic()?).await?;
        debug!(doc = %name, "header routes restored");
        Ok(())
    }
}

/// Apply `reverse` to every pending entry, re-reading the ledger each round,
/// until nothing is pending or `timeout` passes. Returns the names left over.
async fn drain<T, P, F, Fut>(poll: Duration, timeout: Duration, side: &'static str, pending: P, reverse: F) -> Vec<String>
where
    P: Fn() -> Vec<(String, T)>,
    F: Fn((String, T)) -> Fut,
    Fut: std::future::Future<Output = MeshResult<String>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        let round = pending();
        if round.is_empty() {
            return Vec::new();
        }
        for entry in round {
            let name = entry.0.clone();
            match reverse(entry).await {
                Ok(done) => debug!(side, doc = %done, "ledger entry reversed"),
                Err(e) => debug!(side, doc = %name, error = %e, "ledger entry not reversed yet"),
            }
        }
        if pending().is_empty() {
            return Vec::new();
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(poll).await;
    }
    let left: Vec<String> = pending().into_iter().map(|(name, _)| name).collect();
    counter!("mesh_rollback_abandoned_total", left.len() as u64, "side" => side);
    for name in &left {
        warn!(side, doc = %name, "rollback gave up on ledger entry");
    }
    left
}
