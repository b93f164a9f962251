//! Warm-up loop.
//!
//! Keeps idle containers fresh. Without a cached function it only refreshes
//! `last_used_at`; once a function has been remembered it runs that function
//! inside each idle container instead, so interpreter caches stay hot.
//!
//! At most `min_size` containers are kept warm per pass. Containers above the
//! floor are left alone so idle eviction can still shrink the pool.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ContainerPool;
use crate::language::FUNCTION_DIR;

const WARM_UP_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// A function replayed by the warm-up loop.
#[derive(Debug, Clone)]
pub struct CachedFunction {
    pub code: String,
    pub function_name: String,
    pub input: serde_json::Value,
}

#[derive(Default)]
pub(super) struct FunctionCache(Mutex<Option<CachedFunction>>);

impl ContainerPool {
    /// Remember a function for the warm-up loop to replay.
    pub async fn remember_function(&self, function: CachedFunction) {
        *self.function_cache.0.lock().await = Some(function);
    }

    pub(super) async fn run_warm_up_loop(&self, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.warm_up_interval);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Pool warm-up loop cancelled");
                    return;
                }
                _ = interval.tick() => {
                    let warmed = self.warm_up_once().await;
                    if warmed > 0 {
                        debug!(warmed, "Warm-up pass done");
                    }
                }
            }
        }
    }

    /// Run one warm-up pass and return how many containers were warmed.
    pub async fn warm_up_once(&self) -> usize {
        let candidates = self
            .store
            .lock()
            .await
            .idle_beyond(self.config.warm_up_grace, self.config.min_size);
        if candidates.is_empty() {
            return 0;
        }

        let cached = self.function_cache.0.lock().await.clone();
        let Some(function) = cached else {
            let mut store = self.store.lock().await;
            for id in &candidates {
                store.touch(id);
            }
            return candidates.len();
        };

        let mut warmed = 0;
        for id in candidates {
            // Claimed like an acquire so no execution can use it meanwhile.
            if !self.store.lock().await.claim(&id) {
                continue;
            }
            match self.invoke_cached(&id, &function).await {
                Ok(()) => warmed += 1,
                Err(e) => warn!(container_id = %id, error = ?e, "Warm-up invocation failed"),
            }
            self.release(&id, None).await;
        }
        warmed
    }

    async fn invoke_cached(&self, id: &str, function: &CachedFunction) -> Result<()> {
        let language = self.config.language;
        self.engine
            .copy_file(
                id,
                FUNCTION_DIR,
                &language.code_file_name(),
                function.code.as_bytes(),
            )
            .await?;

        let env = language.host_env(
            &language.container_code_path(),
            &function.function_name,
            &function.input,
        );
        let output = tokio::time::timeout(
            WARM_UP_EXEC_TIMEOUT,
            self.engine.exec(id, language.host_command(), env),
        )
        .await
        .context("Warm-up invocation timed out")??;

        if output.exit_code.unwrap_or(0) != 0 {
            anyhow::bail!("Warm-up invocation exited with {:?}", output.exit_code);
        }
        Ok(())
    }
}
