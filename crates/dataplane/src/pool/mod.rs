//! Warm container pool.
//!
//! A bounded set of pre-started containers for one language image. Callers
//! `acquire` a container, run code in it, and `release` it with the
//! execution's stats. A reconciliation loop keeps the pool at `min_size`,
//! heals containers that stopped running, and evicts idle ones. An optional
//! warm-up loop keeps idle containers fresh.
//!
//! All bookkeeping lives in one [`PoolStore`] behind a single mutex. Engine
//! calls are always made with the lock released.

mod reconciler;
mod types;
mod warm_up;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use futures_util::future::join_all;
use tokio::{
    sync::{Mutex, Notify},
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

pub use self::{
    reconciler::ReconcileReport,
    types::{
        ContainerMetrics,
        ContainerRecord,
        ContainerSnapshot,
        ContainerStatus,
        ExecutionStats,
        PoolConfig,
        PoolMetrics,
    },
    warm_up::CachedFunction,
};
use self::{types::PoolStore, warm_up::FunctionCache};
use crate::{
    engine::{ContainerEngine, ContainerRole, ContainerSpec, container_labels},
    retry::poll_until_deadline,
};

/// Containers tried by one `acquire` before giving up.
pub const MAX_ACQUIRE_ATTEMPTS: usize = 3;

const RESTART_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What `acquire` obtained from the store.
enum Claim {
    /// An idle container, already marked Busy.
    Pooled(String),
    /// A reserved creation slot.
    Create,
}

pub struct ContainerPool {
    config: PoolConfig,
    engine: Arc<dyn ContainerEngine>,
    store: Mutex<PoolStore>,
    /// Signalled whenever a container is pushed onto the available queue.
    available: Notify,
    function_cache: FunctionCache,
    cancel_token: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl ContainerPool {
    pub fn new(config: PoolConfig, engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        anyhow::ensure!(config.max_size > 0, "pool max_size must be positive");
        anyhow::ensure!(
            config.min_size <= config.max_size,
            "pool min_size ({}) exceeds max_size ({})",
            config.min_size,
            config.max_size
        );
        anyhow::ensure!(
            !config.reconcile_interval.is_zero(),
            "pool reconcile_interval must be positive"
        );
        anyhow::ensure!(
            !config.warm_up_enabled || !config.warm_up_interval.is_zero(),
            "pool warm_up_interval must be positive when warm-up is enabled"
        );

        Ok(Self {
            config,
            engine,
            store: Mutex::new(PoolStore::default()),
            available: Notify::new(),
            function_cache: FunctionCache::default(),
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Spawn the reconciliation loop, and the warm-up loop when enabled.
    pub async fn start(self: &Arc<Self>) {
        let span = tracing::info_span!("container_pool", language = %self.config.language);
        let mut tasks = self.tasks.lock().await;

        tasks.spawn({
            let pool = self.clone();
            let cancel_token = self.cancel_token.clone();
            async move { pool.run_reconcile_loop(cancel_token).await }.instrument(span.clone())
        });

        if self.config.warm_up_enabled {
            tasks.spawn({
                let pool = self.clone();
                let cancel_token = self.cancel_token.clone();
                async move { pool.run_warm_up_loop(cancel_token).await }.instrument(span)
            });
        }

        info!(
            language = %self.config.language,
            min_size = self.config.min_size,
            max_size = self.config.max_size,
            warm_up = self.config.warm_up_enabled,
            "Container pool started"
        );
    }

    /// Hand out a running container marked Busy.
    ///
    /// Waits up to `acquire_timeout` for an idle container, then creates one
    /// if the pool is below `max_size`. Returns `None` when the pool is at
    /// capacity or no healthy container could be obtained; the caller should
    /// fall back to an ephemeral container.
    pub async fn acquire(&self) -> Option<String> {
        if self.cancel_token.is_cancelled() {
            return None;
        }
        let deadline = Instant::now() + self.config.acquire_timeout;

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            match self.claim(deadline).await? {
                Claim::Pooled(id) => {
                    // Reconciliation may have dropped it while we checked.
                    if self.ensure_running(&id).await && self.store.lock().await.contains(&id) {
                        debug!(container_id = %id, attempt, "Acquired pooled container");
                        return Some(id);
                    }
                    warn!(
                        container_id = %id,
                        attempt,
                        "Pooled container is not running, removing"
                    );
                    self.remove(&id).await;
                }
                Claim::Create => {
                    return match self.create_reserved(ContainerStatus::Busy).await {
                        Ok(id) => {
                            debug!(container_id = %id, "Acquired newly created container");
                            Some(id)
                        }
                        Err(e) => {
                            warn!(error = ?e, "Failed to create container on acquire");
                            None
                        }
                    };
                }
            }
        }

        warn!(
            attempts = MAX_ACQUIRE_ATTEMPTS,
            "No healthy pooled container available"
        );
        None
    }

    /// Wait for a queued container until `deadline`, then fall back to
    /// reserving a creation slot.
    async fn claim(&self, deadline: Instant) -> Option<Claim> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed.
            notified.as_mut().enable();

            if let Some(id) = self.store.lock().await.pop_best() {
                return Some(Claim::Pooled(id));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let mut store = self.store.lock().await;
        if let Some(id) = store.pop_best() {
            return Some(Claim::Pooled(id));
        }
        if store.reserve(self.config.max_size) {
            return Some(Claim::Create);
        }
        debug!(
            live = store.live(),
            max_size = self.config.max_size,
            "Pool at capacity"
        );
        None
    }

    /// Return a container to the pool.
    ///
    /// Unknown ids and containers that are not Busy are ignored, so a
    /// release is never counted twice. A container that stopped running and
    /// cannot be restarted is removed instead of recirculated.
    pub async fn release(&self, id: &str, stats: Option<ExecutionStats>) {
        if !self.store.lock().await.complete(id, stats.as_ref()) {
            debug!(container_id = %id, "Ignoring release of unknown or idle container");
            return;
        }

        if !self.ensure_running(id).await {
            warn!(container_id = %id, "Released container is not running, removing");
            self.remove(id).await;
            return;
        }

        if self.store.lock().await.push_available(id) {
            self.available.notify_one();
            debug!(container_id = %id, "Released container to pool");
        }
    }

    /// Stop and remove a container, dropping its record and metrics.
    /// Unknown ids are a no-op.
    pub async fn remove(&self, id: &str) {
        let Some((record, metrics)) = self.store.lock().await.take(id) else {
            return;
        };
        self.destroy(id).await;
        info!(
            container_id = %id,
            status = %record.status,
            executions = metrics.executions,
            errors = metrics.error_count,
            event = "container_removed",
            "Removed pooled container"
        );
    }

    /// Snapshot of pool and per-container metrics.
    pub async fn metrics(&self) -> PoolMetrics {
        self.store.lock().await.snapshot()
    }

    /// Stop the background loops and remove every container.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        let joined = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result &&
                    e.is_panic()
                {
                    error!(error = %e, "Pool background task panicked");
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs_f64(),
                "Pool loops did not stop in time, aborting"
            );
            tasks.abort_all();
        }

        let ids = self.store.lock().await.ids();
        let count = ids.len();
        join_all(ids.iter().map(|id| self.remove(id))).await;
        info!(removed = count, "Container pool shut down");
    }

    /// Check a container runs, restarting it once if it does not.
    async fn ensure_running(&self, id: &str) -> bool {
        match self.engine.is_running(id).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                warn!(container_id = %id, error = ?e, "Failed to check container status");
            }
        }

        info!(container_id = %id, "Container not running, restarting");
        if let Err(e) = self.engine.start(id).await {
            warn!(container_id = %id, error = ?e, "Failed to restart container");
            return false;
        }
        poll_until_deadline(
            self.config.restart_grace,
            RESTART_POLL_INTERVAL,
            "restarted container running",
            || self.engine.is_running(id),
        )
        .await
    }

    /// Create and start a container for a slot already reserved in the
    /// store, then track it with the given status.
    async fn create_reserved(&self, status: ContainerStatus) -> Result<String> {
        let created = self.spawn_container().await;

        let mut store = self.store.lock().await;
        store.unreserve();
        let id = created?;

        if self.cancel_token.is_cancelled() {
            drop(store);
            self.destroy(&id).await;
            anyhow::bail!("Container pool is shutting down");
        }

        store.insert(ContainerRecord::new(
            id.clone(),
            self.config.language,
            status,
        ));
        if store.push_available(&id) {
            self.available.notify_one();
        }
        Ok(id)
    }

    async fn spawn_container(&self) -> Result<String> {
        let spec = ContainerSpec {
            name: ContainerRole::Pool.container_name(),
            image: self.config.base_image.clone(),
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            limits: self.config.limits.clone(),
            network_disabled: true,
            labels: container_labels(self.config.language, ContainerRole::Pool),
            ..Default::default()
        };
        let name = spec.name.clone();

        let id = self.engine.create(spec).await?;
        if let Err(e) = self.engine.start(&id).await {
            if let Err(remove_err) = self.engine.remove(&id).await {
                warn!(container_id = %id, error = ?remove_err, "Failed to remove unstarted container");
            }
            return Err(e.context(format!("Failed to start pooled container {}", name)));
        }

        info!(
            container_id = %id,
            container = %name,
            image = %self.config.base_image,
            event = "container_created",
            "Created pooled container"
        );
        Ok(id)
    }

    /// Stop (bounded) and force-remove a container at the engine.
    async fn destroy(&self, id: &str) {
        if let Err(e) = self.engine.stop(id, self.config.stop_timeout).await {
            warn!(container_id = %id, error = ?e, "Failed to stop container");
        }
        if let Err(e) = self.engine.remove(id).await {
            warn!(container_id = %id, error = ?e, "Failed to remove container");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;

    use super::*;
    use crate::engine::{ContainerOutput, ExecOutput};

    /// In-memory engine with programmable failures.
    #[derive(Default)]
    pub(crate) struct MockEngine {
        pub running: StdMutex<HashSet<String>>,
        pub created: AtomicUsize,
        pub removed: StdMutex<Vec<String>>,
        pub starts: AtomicUsize,
        pub fail_create: AtomicBool,
        /// When set, `start` succeeds but the container never runs.
        pub dead_on_start: AtomicBool,
        pub fail_status_checks: AtomicBool,
        pub execs: StdMutex<Vec<(String, Vec<(String, String)>)>>,
        pub copies: StdMutex<Vec<(String, String, Vec<u8>)>>,
        pub exec_output: StdMutex<ExecOutput>,
        pub exec_delay: StdMutex<Duration>,
        pub fail_copy: AtomicBool,
        pub wait_output: StdMutex<ContainerOutput>,
        pub wait_delay: StdMutex<Duration>,
        pub specs: StdMutex<Vec<ContainerSpec>>,
        pub runtimes: StdMutex<Vec<String>>,
        pub fail_runtimes: AtomicBool,
        counter: AtomicUsize,
    }

    impl MockEngine {
        pub fn kill(&self, id: &str) {
            self.running.lock().unwrap().remove(id);
        }

        pub fn is_alive(&self, id: &str) -> bool {
            self.running.lock().unwrap().contains(id)
        }

        pub fn removed_count(&self) -> usize {
            self.removed.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ContainerEngine for MockEngine {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn ensure_image(&self, _image: &str) -> Result<()> {
            Ok(())
        }

        async fn create(&self, spec: ContainerSpec) -> Result<String> {
            if self.fail_create.load(Ordering::SeqCst) {
                anyhow::bail!("create failed");
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            self.specs.lock().unwrap().push(spec);
            Ok(format!("container-{}", n))
        }

        async fn start(&self, id: &str) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if !self.dead_on_start.load(Ordering::SeqCst) {
                self.running.lock().unwrap().insert(id.to_string());
            }
            Ok(())
        }

        async fn is_running(&self, id: &str) -> Result<bool> {
            if self.fail_status_checks.load(Ordering::SeqCst) {
                anyhow::bail!("engine unavailable");
            }
            Ok(self.is_alive(id))
        }

        async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
            self.kill(id);
            Ok(())
        }

        async fn remove(&self, id: &str) -> Result<()> {
            self.kill(id);
            self.removed.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn copy_file(
            &self,
            id: &str,
            dir: &str,
            file_name: &str,
            contents: &[u8],
        ) -> Result<()> {
            if self.fail_copy.load(Ordering::SeqCst) {
                anyhow::bail!("copy failed");
            }
            self.copies.lock().unwrap().push((
                id.to_string(),
                format!("{}/{}", dir, file_name),
                contents.to_vec(),
            ));
            Ok(())
        }

        async fn exec(
            &self,
            id: &str,
            _cmd: Vec<String>,
            env: Vec<(String, String)>,
        ) -> Result<ExecOutput> {
            self.execs.lock().unwrap().push((id.to_string(), env));
            let delay = *self.exec_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(self.exec_output.lock().unwrap().clone())
        }

        async fn wait(&self, id: &str) -> Result<ContainerOutput> {
            let delay = *self.wait_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.kill(id);
            Ok(self.wait_output.lock().unwrap().clone())
        }

        async fn runtimes(&self) -> Result<Vec<String>> {
            if self.fail_runtimes.load(Ordering::SeqCst) {
                anyhow::bail!("info failed");
            }
            Ok(self.runtimes.lock().unwrap().clone())
        }

        async fn list_managed(&self) -> Result<Vec<String>> {
            Ok(self.running.lock().unwrap().iter().cloned().collect())
        }
    }

    pub(crate) fn test_config(min_size: usize, max_size: usize) -> PoolConfig {
        PoolConfig {
            min_size,
            max_size,
            acquire_timeout: Duration::from_millis(50),
            restart_grace: Duration::from_millis(20),
            reconcile_interval: Duration::from_millis(20),
            max_reconcile_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn pool(min_size: usize, max_size: usize) -> (Arc<ContainerPool>, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::default());
        let pool = ContainerPool::new(test_config(min_size, max_size), engine.clone()).unwrap();
        (Arc::new(pool), engine)
    }

    #[test]
    fn test_rejects_min_above_max() {
        let engine = Arc::new(MockEngine::default());
        assert!(ContainerPool::new(test_config(4, 2), engine.clone()).is_err());
        assert!(ContainerPool::new(test_config(0, 0), engine).is_err());
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let engine = Arc::new(MockEngine::default());
        let config = PoolConfig {
            reconcile_interval: Duration::ZERO,
            ..test_config(1, 2)
        };
        assert!(ContainerPool::new(config, engine.clone()).is_err());

        let config = PoolConfig {
            warm_up_enabled: true,
            warm_up_interval: Duration::ZERO,
            ..test_config(1, 2)
        };
        assert!(ContainerPool::new(config, engine.clone()).is_err());

        let config = PoolConfig {
            warm_up_interval: Duration::ZERO,
            ..test_config(1, 2)
        };
        assert!(ContainerPool::new(config, engine).is_ok());
    }

    #[tokio::test]
    async fn test_reconcile_fills_to_min_size() {
        let (pool, engine) = pool(3, 5);

        let report = pool.reconcile_once().await;
        assert_eq!(report.created, 3);

        let metrics = pool.metrics().await;
        assert_eq!(metrics.total_containers, 3);
        assert_eq!(metrics.idle_containers, 3);
        assert_eq!(metrics.queue_size, 3);
        assert_eq!(engine.created.load(Ordering::SeqCst), 3);

        // Already at the floor: nothing more to create.
        assert_eq!(pool.reconcile_once().await.created, 0);

        let specs = engine.specs.lock().unwrap();
        assert!(specs.iter().all(|s| s.network_disabled));
        assert!(specs.iter().all(|s| s.name.starts_with("faas-pool-")));
        assert_eq!(
            specs[0].command,
            Some(vec!["sleep".to_string(), "infinity".to_string()])
        );
    }

    #[tokio::test]
    async fn test_acquire_marks_busy_and_dequeues() {
        let (pool, _engine) = pool(2, 4);
        pool.reconcile_once().await;

        let id = pool.acquire().await.unwrap();
        let metrics = pool.metrics().await;
        assert_eq!(metrics.busy_containers, 1);
        assert_eq!(metrics.queue_size, 1);
        assert_eq!(
            metrics.per_container_metrics[&id].status,
            ContainerStatus::Busy
        );
    }

    #[tokio::test]
    async fn test_acquire_creates_when_empty_and_below_max() {
        let (pool, engine) = pool(0, 1);

        let id = pool.acquire().await.unwrap();
        assert_eq!(engine.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().await.busy_containers, 1);

        // At capacity with nothing idle: backpressure.
        assert!(pool.acquire().await.is_none());

        pool.release(&id, None).await;
        assert_eq!(pool.acquire().await.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_acquire_returns_none_when_creation_fails() {
        let (pool, engine) = pool(0, 2);
        engine.fail_create.store(true, Ordering::SeqCst);
        assert!(pool.acquire().await.is_none());
        assert_eq!(pool.metrics().await.total_containers, 0);
        // The reservation was returned.
        engine.fail_create.store(false, Ordering::SeqCst);
        assert!(pool.acquire().await.is_some());
    }

    #[tokio::test]
    async fn test_acquire_restarts_stopped_container() {
        let (pool, engine) = pool(1, 1);
        pool.reconcile_once().await;
        let id = pool.metrics().await.per_container_metrics.keys().next().cloned().unwrap();
        engine.kill(&id);

        assert_eq!(pool.acquire().await.as_deref(), Some(id.as_str()));
        assert!(engine.is_alive(&id));
        assert_eq!(engine.removed_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_removes_containers_that_will_not_restart() {
        let (pool, engine) = pool(1, 1);
        pool.reconcile_once().await;
        let id = pool.metrics().await.per_container_metrics.keys().next().cloned().unwrap();
        engine.kill(&id);
        engine.dead_on_start.store(true, Ordering::SeqCst);

        // The dead container is removed and a fresh one created in its slot.
        assert!(pool.acquire().await.is_some_and(|new_id| new_id != id));
        assert!(engine.removed.lock().unwrap().contains(&id));
    }

    #[tokio::test]
    async fn test_acquire_gives_up_after_retry_cap() {
        let (pool, engine) = pool(4, 4);
        pool.reconcile_once().await;
        for id in pool.metrics().await.per_container_metrics.keys() {
            engine.kill(id);
        }
        engine.dead_on_start.store(true, Ordering::SeqCst);

        assert!(pool.acquire().await.is_none());
        assert_eq!(engine.removed_count(), MAX_ACQUIRE_ATTEMPTS);
        assert_eq!(pool.metrics().await.total_containers, 4 - MAX_ACQUIRE_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_release_records_execution_metrics() {
        let (pool, _engine) = pool(1, 1);
        pool.reconcile_once().await;

        let id = pool.acquire().await.unwrap();
        pool.release(&id, Some(ExecutionStats::success(Duration::from_millis(200))))
            .await;
        let id = pool.acquire().await.unwrap();
        pool.release(
            &id,
            Some(ExecutionStats::failure(Duration::from_millis(600), "ValueError: bad")),
        )
        .await;

        let metrics = pool.metrics().await;
        let container = &metrics.per_container_metrics[&id];
        assert_eq!(container.status, ContainerStatus::Idle);
        assert_eq!(container.metrics.executions, 2);
        assert!((container.metrics.total_exec_time_seconds - 0.8).abs() < 1e-9);
        assert!((container.metrics.avg_response_time_seconds - 0.4).abs() < 1e-9);
        assert_eq!(container.metrics.error_count, 1);
        assert_eq!(container.metrics.last_error.as_deref(), Some("ValueError: bad"));
        assert_eq!(metrics.queue_size, 1);
    }

    #[tokio::test]
    async fn test_release_without_stats_keeps_metrics() {
        let (pool, _engine) = pool(1, 1);
        pool.reconcile_once().await;

        let id = pool.acquire().await.unwrap();
        pool.release(
            &id,
            Some(ExecutionStats::failure(Duration::from_millis(300), "boom")),
        )
        .await;
        let before = pool.metrics().await.per_container_metrics[&id].metrics.clone();
        assert_eq!(before.error_count, 1);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again, id);
        pool.release(&again, None).await;

        let metrics = pool.metrics().await;
        let container = &metrics.per_container_metrics[&id];
        assert_eq!(container.status, ContainerStatus::Idle);
        assert_eq!(container.metrics, before);
        assert_eq!(metrics.queue_size, 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (pool, _engine) = pool(1, 2);
        pool.reconcile_once().await;

        let id = pool.acquire().await.unwrap();
        let stats = ExecutionStats::success(Duration::from_millis(100));
        pool.release(&id, Some(stats.clone())).await;
        pool.release(&id, Some(stats.clone())).await;
        pool.release("no-such-container", Some(stats)).await;

        let metrics = pool.metrics().await;
        assert_eq!(metrics.total_containers, 1);
        assert_eq!(metrics.queue_size, 1);
        assert_eq!(metrics.per_container_metrics[&id].metrics.executions, 1);
    }

    #[tokio::test]
    async fn test_release_removes_dead_container() {
        let (pool, engine) = pool(1, 1);
        pool.reconcile_once().await;
        let id = pool.acquire().await.unwrap();

        engine.kill(&id);
        engine.dead_on_start.store(true, Ordering::SeqCst);
        pool.release(&id, None).await;

        let metrics = pool.metrics().await;
        assert_eq!(metrics.total_containers, 0);
        assert_eq!(metrics.queue_size, 0);
        assert!(engine.removed.lock().unwrap().contains(&id));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (pool, engine) = pool(1, 1);
        pool.reconcile_once().await;
        let id = pool.acquire().await.unwrap();

        pool.remove(&id).await;
        pool.remove(&id).await;
        assert_eq!(engine.removed_count(), 1);
        assert_eq!(pool.metrics().await.total_containers, 0);
    }

    #[tokio::test]
    async fn test_waiting_acquire_gets_released_container() {
        let engine = Arc::new(MockEngine::default());
        let config = PoolConfig {
            acquire_timeout: Duration::from_secs(5),
            ..test_config(1, 1)
        };
        let pool = Arc::new(ContainerPool::new(config, engine).unwrap());
        pool.reconcile_once().await;
        let id = pool.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(&id, None).await;

        assert_eq!(waiter.await.unwrap().as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_shutdown_drains_everything() {
        let (pool, engine) = pool(2, 4);
        pool.start().await;
        pool.reconcile_once().await;
        let _busy = pool.acquire().await.unwrap();

        pool.shutdown().await;

        assert_eq!(pool.metrics().await.total_containers, 0);
        assert!(engine.running.lock().unwrap().is_empty());
        assert!(pool.acquire().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_share_a_container() {
        let (pool, _engine) = pool(3, 6);
        pool.reconcile_once().await;

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire().await })
            })
            .collect();

        let mut seen = HashMap::new();
        for handle in handles {
            let id = handle.await.unwrap().unwrap();
            *seen.entry(id).or_insert(0) += 1;
        }
        assert_eq!(seen.len(), 6);
        assert!(seen.values().all(|count| *count == 1));
        assert_eq!(pool.metrics().await.busy_containers, 6);
    }
}
