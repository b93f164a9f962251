//! Reconciliation loop: fill to the floor, heal, evict idle containers.

use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ContainerPool, ContainerStatus};
use crate::retry::Backoff;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: usize,
    pub creation_failures: usize,
    pub unhealthy_removed: usize,
    pub idle_evicted: usize,
}

impl ContainerPool {
    /// Run reconciliation until cancelled. Call this from a spawned task.
    ///
    /// Sleeps `reconcile_interval` between passes, doubling up to
    /// `max_reconcile_interval` for each consecutive pass in which container
    /// creation failed.
    pub(super) async fn run_reconcile_loop(&self, cancel_token: CancellationToken) {
        let backoff = Backoff::Exponential {
            initial: self.config.reconcile_interval,
            max: self.config.max_reconcile_interval,
        };
        let mut failing_passes = 0u32;

        loop {
            let report = self.reconcile_once().await;
            if report.creation_failures > 0 {
                failing_passes = failing_passes.saturating_add(1);
            } else {
                failing_passes = 0;
            }
            let delay = backoff.delay_after(failing_passes);
            if failing_passes > 0 {
                warn!(
                    failures = report.creation_failures,
                    failing_passes,
                    delay_ms = delay.as_millis() as u64,
                    "Container creation failing, backing off"
                );
            }

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Pool reconcile loop cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run one reconciliation pass.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.fill_to_min(&mut report).await;
        self.remove_unhealthy(&mut report).await;
        self.evict_idle(&mut report).await;

        if report != ReconcileReport::default() {
            info!(
                created = report.created,
                creation_failures = report.creation_failures,
                unhealthy_removed = report.unhealthy_removed,
                idle_evicted = report.idle_evicted,
                "Pool reconciled"
            );
        }
        report
    }

    async fn fill_to_min(&self, report: &mut ReconcileReport) {
        let reserved = {
            let mut store = self.store.lock().await;
            let deficit = self.config.min_size.saturating_sub(store.live());
            (0..deficit)
                .take_while(|_| store.reserve(self.config.max_size))
                .count()
        };
        if reserved == 0 {
            return;
        }

        let results = join_all((0..reserved).map(|_| self.create_reserved(ContainerStatus::Idle))).await;
        for result in results {
            match result {
                Ok(_) => report.created += 1,
                Err(e) => {
                    warn!(error = ?e, "Failed to create pooled container");
                    report.creation_failures += 1;
                }
            }
        }
    }

    async fn remove_unhealthy(&self, report: &mut ReconcileReport) {
        let ids = self.store.lock().await.ids();
        let checks = join_all(ids.into_iter().map(|id| async move {
            let running = self.engine.is_running(&id).await;
            (id, running)
        }))
        .await;

        let mut unhealthy = Vec::new();
        for (id, running) in checks {
            match running {
                Ok(true) => {}
                Ok(false) => unhealthy.push(id),
                // An unreachable engine says nothing about the container.
                Err(e) => warn!(container_id = %id, error = ?e, "Health check failed"),
            }
        }
        if unhealthy.is_empty() {
            return;
        }

        {
            let mut store = self.store.lock().await;
            for id in &unhealthy {
                store.mark_unhealthy(id);
            }
        }
        for id in &unhealthy {
            warn!(container_id = %id, "Pooled container is not running, removing");
            self.remove(id).await;
        }
        report.unhealthy_removed = unhealthy.len();
    }

    async fn evict_idle(&self, report: &mut ReconcileReport) {
        // Selected and dropped under one lock so acquire cannot race us.
        let evicted: Vec<String> = {
            let mut store = self.store.lock().await;
            let expired = store.idle_expired(self.config.idle_timeout, self.config.min_size);
            expired
                .into_iter()
                .filter(|id| store.take(id).is_some())
                .collect()
        };

        for id in &evicted {
            self.destroy(id).await;
            info!(
                container_id = %id,
                idle_timeout_secs = self.config.idle_timeout.as_secs(),
                event = "container_evicted",
                "Evicted idle container"
            );
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Idle eviction done");
        }
        report.idle_evicted = evicted.len();
    }
}
