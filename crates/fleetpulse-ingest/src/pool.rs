//! Consumer Pool
//!
//! Runs `workers` [`StreamWorker`]s in one consumer group. Worker `i` is
//! named `{consumer}-{i}`. Each worker gets its own append-log connection so
//! a blocking read never holds up another worker.
//!
//! Drivers are split by the group's member list, which spans every pool
//! sharing the group. `start()` announces all of its workers at once, so
//! siblings never take each other's drivers, and if members of another
//! pool are live it waits out one join grace before spawning.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ──► start() ──► [workers running] ──► shutdown()
//!            │ heartbeat all names              │ cancel
//!            │ join grace if others are live    │
//!                                              │ each worker flushes and
//!                                              │ acknowledges its batch
//!                                              ▼ join (workers leave the group)
//! ```
//!
//! Names are deterministic, so a restarted pool with the same consumer
//! prefix resumes the exact pending lists its predecessor left behind.

use std::sync::Arc;

use fleetpulse_cache::AppendLog;
use fleetpulse_store::BatchPersister;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{IngestError, Result};
use crate::worker::{StreamWorker, WorkerConfig, WorkerHandle, WorkerStats};

pub struct ConsumerPool {
    template: WorkerConfig,
    workers: usize,
    log: Arc<dyn AppendLog>,
    persister: Arc<dyn BatchPersister>,
    cancel: CancellationToken,
    running: RwLock<Running>,
}

#[derive(Default)]
struct Running {
    tasks: Vec<JoinHandle<Result<()>>>,
    handles: Vec<WorkerHandle>,
}

impl ConsumerPool {
    /// `template.consumer` is the prefix of the worker names.
    pub fn new(
        template: WorkerConfig,
        workers: usize,
        log: Arc<dyn AppendLog>,
        persister: Arc<dyn BatchPersister>,
    ) -> Self {
        Self {
            template,
            workers: workers.max(1),
            log,
            persister,
            cancel: CancellationToken::new(),
            running: RwLock::new(Running::default()),
        }
    }

    pub fn worker_names(&self) -> Vec<String> {
        (0..self.workers)
            .map(|i| format!("{}-{}", self.template.consumer, i))
            .collect()
    }

    /// Spawn the workers.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if !running.tasks.is_empty() {
            return Err(IngestError::Worker("consumer pool already started".into()));
        }
        if self.cancel.is_cancelled() {
            return Err(IngestError::Worker("consumer pool was shut down".into()));
        }

        let names = self.worker_names();
        self.join(&names).await?;

        for name in names {
            let log = self.log.dedicated().await?;
            let config = WorkerConfig {
                consumer: name,
                ..self.template.clone()
            };
            let worker = StreamWorker::new(config, log, Arc::clone(&self.persister)).joined();
            running.handles.push(worker.handle());
            running.tasks.push(tokio::spawn(worker.run(self.cancel.child_token())));
        }

        info!(
            group = %self.template.group,
            workers = self.workers,
            prefix = %self.template.consumer,
            "Consumer pool started"
        );
        Ok(())
    }

    async fn join(&self, names: &[String]) -> Result<()> {
        let group = &self.template.group;
        for name in names {
            self.log.heartbeat(group, name).await?;
        }

        let others = self
            .log
            .live_members(group, self.template.member_ttl)
            .await?
            .into_iter()
            .filter(|m| !names.contains(m))
            .count();
        if others > 0 {
            let grace = self.template.join_grace();
            info!(
                group = %group,
                members = others,
                grace_ms = grace.as_millis() as u64,
                "Joining a live group, waiting for handover"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => {}
            }
        }
        Ok(())
    }

    /// Stop every worker and wait for their in-flight batches.
    ///
    /// Returns the first worker failure, after all workers have stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut self.running.write().await.tasks);
        let mut first_error = None;
        for joined in futures::future::join_all(tasks).await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(IngestError::from(e)),
            };
            if let Err(e) = outcome {
                error!(error = %e, "Stream worker failed");
                first_error.get_or_insert(e);
            }
        }

        let stats = self.stats().await;
        info!(
            group = %self.template.group,
            read = stats.read,
            persisted = stats.persisted,
            dropped = stats.dropped,
            dead_lettered = stats.dead_lettered,
            "Consumer pool stopped"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Handles of the started workers.
    pub async fn workers(&self) -> Vec<WorkerHandle> {
        self.running.read().await.handles.clone()
    }

    /// Counters summed over all workers.
    pub async fn stats(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for handle in self.running.read().await.handles.iter() {
            total += handle.stats();
        }
        total
    }
}
