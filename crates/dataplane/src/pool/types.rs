//! Container records, per-container metrics and the store guarding both.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{engine::ResourceLimits, language::Language};

// ---------------------------------------------------------------------------
// PoolConfig
// ---------------------------------------------------------------------------

/// Pool configuration. Immutable once the pool is built.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub language: Language,
    pub base_image: String,
    pub min_size: usize,
    pub max_size: usize,
    /// Idle containers older than this are evicted while the pool stays at
    /// or above `min_size`.
    pub idle_timeout: Duration,
    pub warm_up_enabled: bool,
    /// How long `acquire` waits for an idle container before creating one.
    pub acquire_timeout: Duration,
    pub reconcile_interval: Duration,
    /// Cap on the reconcile sleep while container creation keeps failing.
    pub max_reconcile_interval: Duration,
    pub warm_up_interval: Duration,
    /// Containers idle for less than this are not touched by warm-up.
    pub warm_up_grace: Duration,
    /// How long to wait for a restarted container to report running.
    pub restart_grace: Duration,
    /// Graceful stop period before a container is killed on removal.
    pub stop_timeout: Duration,
    /// Bound on joining the background loops at shutdown.
    pub shutdown_timeout: Duration,
    pub limits: ResourceLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let language = Language::default();
        Self {
            language,
            base_image: language.default_image().to_string(),
            min_size: 3,
            max_size: 10,
            idle_timeout: Duration::from_secs(300),
            warm_up_enabled: false,
            acquire_timeout: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(5),
            max_reconcile_interval: Duration::from_secs(60),
            warm_up_interval: Duration::from_secs(30),
            warm_up_grace: Duration::from_secs(10),
            restart_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            limits: ResourceLimits::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ContainerRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ContainerStatus {
    /// Running and waiting in the available queue.
    Idle,
    /// Handed out by `acquire` and not yet released.
    Busy,
    /// Found not running; about to be removed.
    Unhealthy,
}

/// A pooled container tracked by the store.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub status: ContainerStatus,
    pub language: Language,
    pub created_at: Instant,
    pub last_used_at: Instant,
}

impl ContainerRecord {
    pub fn new(id: String, language: Language, status: ContainerStatus) -> Self {
        let now = Instant::now();
        Self {
            id,
            status,
            language,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }
}

// ---------------------------------------------------------------------------
// ContainerMetrics
// ---------------------------------------------------------------------------

/// Outcome of one execution, reported when a container is released.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub execution_time: Duration,
    /// Set when the execution failed.
    pub error: Option<String>,
}

impl ExecutionStats {
    pub fn success(execution_time: Duration) -> Self {
        Self {
            execution_time,
            error: None,
        }
    }

    pub fn failure(execution_time: Duration, error: impl Into<String>) -> Self {
        Self {
            execution_time,
            error: Some(error.into()),
        }
    }
}

/// Performance counters for one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerMetrics {
    pub executions: u64,
    pub total_exec_time_seconds: f64,
    pub avg_response_time_seconds: f64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl ContainerMetrics {
    pub fn record(&mut self, stats: &ExecutionStats) {
        self.executions += 1;
        self.total_exec_time_seconds += stats.execution_time.as_secs_f64();
        self.avg_response_time_seconds = self.total_exec_time_seconds / self.executions as f64;
        if let Some(error) = &stats.error {
            self.error_count += 1;
            self.last_error = Some(error.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Point-in-time view of one container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSnapshot {
    pub status: ContainerStatus,
    pub language: Language,
    pub age_seconds: f64,
    pub idle_seconds: f64,
    #[serde(flatten)]
    pub metrics: ContainerMetrics,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub total_containers: usize,
    pub idle_containers: usize,
    pub busy_containers: usize,
    pub queue_size: usize,
    pub per_container_metrics: HashMap<String, ContainerSnapshot>,
}

// ---------------------------------------------------------------------------
// PoolStore
// ---------------------------------------------------------------------------

/// Records, metrics and the available queue.
///
/// Always accessed under the pool's single mutex. A record and its metrics
/// are inserted and removed together. An id is in `available` only while its
/// record is Idle.
#[derive(Default)]
pub(super) struct PoolStore {
    records: HashMap<String, ContainerRecord>,
    metrics: HashMap<String, ContainerMetrics>,
    available: VecDeque<String>,
    /// Creations in flight, counted against `max_size`.
    pending: usize,
}

impl PoolStore {
    /// Containers tracked plus creations in flight.
    pub fn live(&self) -> usize {
        self.records.len() + self.pending
    }

    #[cfg(test)]
    pub fn queue_len(&self) -> usize {
        self.available.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&ContainerRecord> {
        self.records.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// Reserve a creation slot if the pool is below `max_size`.
    pub fn reserve(&mut self, max_size: usize) -> bool {
        if self.live() >= max_size {
            return false;
        }
        self.pending += 1;
        true
    }

    pub fn unreserve(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    /// Insert a new record with empty metrics.
    pub fn insert(&mut self, record: ContainerRecord) {
        self.metrics
            .insert(record.id.clone(), ContainerMetrics::default());
        self.records.insert(record.id.clone(), record);
    }

    /// Drop a record, its metrics and its queue entry.
    pub fn take(&mut self, id: &str) -> Option<(ContainerRecord, ContainerMetrics)> {
        let record = self.records.remove(id)?;
        let metrics = self.metrics.remove(id).unwrap_or_default();
        self.available.retain(|queued| queued != id);
        Some((record, metrics))
    }

    /// Queue an Idle container. Returns false if the id is unknown, not
    /// Idle, or already queued.
    pub fn push_available(&mut self, id: &str) -> bool {
        let idle = self
            .records
            .get(id)
            .is_some_and(|r| r.status == ContainerStatus::Idle);
        if !idle || self.available.iter().any(|queued| queued == id) {
            return false;
        }
        self.available.push_back(id.to_string());
        true
    }

    /// Take the best queued container and mark it Busy.
    ///
    /// Candidates are ranked by lowest average response time, then lowest
    /// error count, then queue position.
    pub fn pop_best(&mut self) -> Option<String> {
        let (index, _) = self
            .available
            .iter()
            .enumerate()
            .map(|(index, id)| {
                let metrics = self.metrics.get(id);
                let avg = metrics.map_or(0.0, |m| m.avg_response_time_seconds);
                let errors = metrics.map_or(0, |m| m.error_count);
                (index, (avg, errors))
            })
            .min_by(|(ia, (avg_a, err_a)), (ib, (avg_b, err_b))| {
                avg_a
                    .total_cmp(avg_b)
                    .then(err_a.cmp(err_b))
                    .then(ia.cmp(ib))
            })?;

        let id = self.available.remove(index)?;
        if let Some(record) = self.records.get_mut(&id) {
            record.status = ContainerStatus::Busy;
            record.last_used_at = Instant::now();
        }
        Some(id)
    }

    /// Record execution stats and mark the container Idle.
    ///
    /// Returns false, changing nothing, when the id is unknown or the
    /// container is not Busy.
    pub fn complete(&mut self, id: &str, stats: Option<&ExecutionStats>) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.status != ContainerStatus::Busy {
            return false;
        }
        record.status = ContainerStatus::Idle;
        record.last_used_at = Instant::now();
        if let Some(stats) = stats {
            self.metrics.entry(id.to_string()).or_default().record(stats);
        }
        true
    }

    /// Mark a container Unhealthy and withdraw it from the queue.
    pub fn mark_unhealthy(&mut self, id: &str) {
        if let Some(record) = self.records.get_mut(id) {
            record.status = ContainerStatus::Unhealthy;
            self.available.retain(|queued| queued != id);
        }
    }

    /// Take a specific queued container and mark it Busy, without touching
    /// `last_used_at`.
    pub fn claim(&mut self, id: &str) -> bool {
        let Some(index) = self.available.iter().position(|queued| queued == id) else {
            return false;
        };
        self.available.remove(index);
        if let Some(record) = self.records.get_mut(id) {
            record.status = ContainerStatus::Busy;
        }
        true
    }

    pub fn touch(&mut self, id: &str) {
        if let Some(record) = self.records.get_mut(id) {
            record.last_used_at = Instant::now();
        }
    }

    /// Queued containers idle longer than `idle_timeout`, oldest first,
    /// limited so that at least `min_size` containers remain.
    pub fn idle_expired(&self, idle_timeout: Duration, min_size: usize) -> Vec<String> {
        let mut expired: Vec<&ContainerRecord> = self
            .available
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.status == ContainerStatus::Idle && r.idle_for() > idle_timeout)
            .collect();
        expired.sort_by_key(|r| r.last_used_at);

        let removable = self.records.len().saturating_sub(min_size);
        expired
            .into_iter()
            .take(removable)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Up to `limit` queued containers idle for at least `grace`, most
    /// recently used first.
    pub fn idle_beyond(&self, grace: Duration, limit: usize) -> Vec<String> {
        let mut idle: Vec<&ContainerRecord> = self
            .available
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.idle_for() >= grace)
            .collect();
        idle.sort_by_key(|r| std::cmp::Reverse(r.last_used_at));
        idle.into_iter().take(limit).map(|r| r.id.clone()).collect()
    }

    pub fn snapshot(&self) -> PoolMetrics {
        let per_container_metrics: HashMap<String, ContainerSnapshot> = self
            .records
            .values()
            .map(|r| {
                let snapshot = ContainerSnapshot {
                    status: r.status,
                    language: r.language,
                    age_seconds: r.created_at.elapsed().as_secs_f64(),
                    idle_seconds: r.idle_for().as_secs_f64(),
                    metrics: self.metrics.get(&r.id).cloned().unwrap_or_default(),
                };
                (r.id.clone(), snapshot)
            })
            .collect();

        let count = |status| {
            self.records
                .values()
                .filter(|r| r.status == status)
                .count()
        };

        PoolMetrics {
            total_containers: self.records.len(),
            idle_containers: count(ContainerStatus::Idle),
            busy_containers: count(ContainerStatus::Busy),
            queue_size: self.available.len(),
            per_container_metrics,
        }
    }
}
