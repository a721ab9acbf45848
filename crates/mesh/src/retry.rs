use std::future::Future;
use std::time::Duration;

use meshdev_core::MeshResult;
use metrics::counter;
use tokio::time::Instant;
use tracing::debug;

/// Run `attempt` every `poll` until it succeeds. Conflicts are retried until
/// `timeout` elapses, after which the last conflict is returned; any other
/// error is returned at once.
pub(crate) async fn retry_on_conflict<F, Fut>(poll: Duration, timeout: Duration, what: &str, mut attempt: F) -> MeshResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MeshResult<()>>,
{
    let deadline = Instant::now() + timeout;
    let mut retries = 0u32;
    loop {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() => {
                counter!("mesh_header_conflict_retries_total", 1u64);
                retries += 1;
                if Instant::now() >= deadline {
                    return Err(e.context(format!("{} gave up after {} retries", what, retries)));
                }
                debug!(what, retries, error = %e, "conflict; re-reading");
                tokio::time::sleep(poll).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshdev_core::MeshError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn conflicts_retry_then_succeed() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let res = retry_on_conflict(Duration::from_millis(100), Duration::from_secs(8), "t", || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(MeshError::Conflict("stale".into()))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(res.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn conflicts_stop_at_the_ceiling() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let res = retry_on_conflict(Duration::from_millis(100), Duration::from_millis(500), "t", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(MeshError::Conflict("stale".into()))
        })
        .await;
        assert!(res.unwrap_err().is_conflict());
        assert!((5..=7).contains(&calls.load(Ordering::SeqCst)));
    }

    #[tokio::test]
    async fn other_errors_abort_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let res = retry_on_conflict(Duration::from_millis(100), Duration::from_secs(8), "t", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(MeshError::Kube("forbidden".into()))
        })
        .await;
        assert!(matches!(res, Err(MeshError::Kube(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
