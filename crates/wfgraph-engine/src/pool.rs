//! Runner capacity per label.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Bounded pools keyed by runner label. Labels without a pool are unbounded,
/// as hosted runners are.
#[derive(Clone, Default)]
pub struct RunnerPools {
    pools: BTreeMap<String, Arc<Semaphore>>,
}

/// Slots held on every bounded pool a job's labels select.
#[derive(Debug)]
pub struct RunnerLease {
    _permits: Vec<OwnedSemaphorePermit>,
}

impl RunnerPools {
    pub fn new(capacities: &BTreeMap<String, usize>) -> Self {
        Self {
            pools: capacities
                .iter()
                .map(|(label, cap)| (label.clone(), Arc::new(Semaphore::new(*cap))))
                .collect(),
        }
    }

    /// Free slots for `label`, or `None` if the label is unbounded.
    pub fn available(&self, label: &str) -> Option<usize> {
        self.pools.get(label).map(|s| s.available_permits())
    }

    /// Wait for one slot on each bounded pool among `labels`. Pools are
    /// taken in label order so concurrent acquirers cannot deadlock.
    /// Returns `None` if `cancel` fires first.
    pub async fn acquire(&self, labels: &[String], cancel: &CancellationToken) -> Option<RunnerLease> {
        let mut permits = Vec::new();
        for (label, pool) in &self.pools {
            if !labels.iter().any(|l| l == label) {
                continue;
            }
            let permit = tokio::select! {
                permit = pool.clone().acquire_owned() => permit.ok()?,
                _ = cancel.cancelled() => return None,
            };
            permits.push(permit);
        }
        Some(RunnerLease { _permits: permits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_bounded_label_limits_leases() {
        let pools = RunnerPools::new(&BTreeMap::from([("dmount-v2".to_string(), 1)]));
        let cancel = CancellationToken::new();
        let selector = labels(&["self-hosted", "linux", "x64", "dmount-v2"]);

        let first = pools.acquire(&selector, &cancel).await.unwrap();
        assert_eq!(pools.available("dmount-v2"), Some(0));

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            pools.acquire(&selector, &cancel),
        )
        .await;
        assert!(blocked.is_err());

        drop(first);
        assert_eq!(pools.available("dmount-v2"), Some(1));
    }

    #[tokio::test]
    async fn test_unbounded_labels_never_wait() {
        let pools = RunnerPools::new(&BTreeMap::new());
        let cancel = CancellationToken::new();
        let _a = pools.acquire(&labels(&["ubuntu-22.04"]), &cancel).await.unwrap();
        let _b = pools.acquire(&labels(&["ubuntu-22.04"]), &cancel).await.unwrap();
        assert_eq!(pools.available("ubuntu-22.04"), None);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let pools = RunnerPools::new(&BTreeMap::from([("dev".to_string(), 1)]));
        let cancel = CancellationToken::new();
        let _held = pools.acquire(&labels(&["dev"]), &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        assert!(pools.acquire(&labels(&["dev"]), &waiter_cancel).await.is_none());
    }
}
