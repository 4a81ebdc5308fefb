//! Pool manager
//!
//! Exclusive owner of the active-connection set and the worker `JoinSet`.
//! Nothing mutates pool state from outside this task: the monitor (and any
//! other caller) reaches it through `PoolCommand` messages on the handle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::config::{EndpointConfig, WorkerConfig};
use crate::models::ProxyEndpoint;
use crate::pool::health::HealthTracker;
use crate::pool::selection::ProxySelector;
use crate::session::worker::{SessionWorker, WorkerExit};

/// Commands accepted by the pool manager task
#[derive(Debug)]
pub enum PoolCommand {
    /// Launch workers for roster proxies absent from the active set
    TopUp,
    /// Report the current pool status
    Status(oneshot::Sender<PoolStatus>),
}

/// Snapshot of the pool, for observability only
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    pub active: usize,
    pub capacity: usize,
    pub roster: usize,
}

/// Cheap-clone command front for the pool manager task
#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::Sender<PoolCommand>,
}

impl PoolHandle {
    /// Create a handle and the receiver the manager's `run` loop consumes
    pub fn channel() -> (Self, mpsc::Receiver<PoolCommand>) {
        let (tx, rx) = mpsc::channel(16);
        (Self { commands: tx }, rx)
    }

    pub async fn top_up(&self) {
        let _ = self.commands.send(PoolCommand::TopUp).await;
    }

    /// None when the manager task is gone
    pub async fn status(&self) -> Option<PoolStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(PoolCommand::Status(tx)).await.ok()?;
        rx.await.ok()
    }
}

/// One running worker, keyed in the active set by its proxy's URL string.
///
/// A duplicate launch for the same proxy overwrites the previous entry while
/// both tasks keep running; completions are therefore matched by task id.
struct ActiveEntry {
    proxy: Arc<ProxyEndpoint>,
    task_id: tokio::task::Id,
    handle: AbortHandle,
}

/// Supervises the worker pool: launch, replacement, top-up, shutdown
pub struct PoolManager {
    capacity: usize,
    roster: Vec<Arc<ProxyEndpoint>>,
    user_id: String,
    worker_config: WorkerConfig,
    endpoint: EndpointConfig,
    selector: Arc<dyn ProxySelector>,
    health: Arc<HealthTracker>,
    active: HashMap<String, ActiveEntry>,
    workers: JoinSet<WorkerExit>,
}

impl PoolManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        roster: Vec<ProxyEndpoint>,
        user_id: String,
        capacity: usize,
        worker_config: WorkerConfig,
        endpoint: EndpointConfig,
        selector: Arc<dyn ProxySelector>,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            capacity,
            roster: roster.into_iter().map(Arc::new).collect(),
            user_id,
            worker_config,
            endpoint,
            selector,
            health,
            active: HashMap::new(),
            workers: JoinSet::new(),
        }
    }

    /// Run the supervision loop until shutdown.
    ///
    /// Reacts to the first worker completion per iteration (removing the dead
    /// entry and launching a replacement) and to handle commands.
    #[instrument(skip(self, commands, shutdown), fields(capacity = self.capacity))]
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<PoolCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(roster = self.roster.len(), "starting pool manager");
        self.fill_initial().await;

        loop {
            tokio::select! {
                Some(result) = self.workers.join_next_with_id() => {
                    self.reap(result).await;
                }
                Some(command) = commands.recv() => match command {
                    PoolCommand::TopUp => self.top_up(),
                    PoolCommand::Status(reply) => {
                        let _ = reply.send(self.status());
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("pool manager shutting down");
                        break;
                    }
                }
            }
        }

        // Stop every outstanding worker before returning.
        for entry in self.active.values() {
            entry.handle.abort();
        }
        self.workers.shutdown().await;
    }

    /// Initial fill: selector-chosen launches up to the cap
    async fn fill_initial(&mut self) {
        let target = self.capacity.min(self.roster.len());
        for _ in 0..target {
            match self.selector.select().await {
                Ok(proxy) => self.launch(proxy),
                Err(e) => {
                    warn!(error = %e, "cannot fill pool");
                    break;
                }
            }
        }
        info!(active = self.active.len(), "initial fill complete");
    }

    /// Remove the completed worker's entry and launch a replacement
    async fn reap(&mut self, result: Result<(tokio::task::Id, WorkerExit), JoinError>) {
        let (task_id, exit) = match result {
            Ok((id, exit)) => (id, Some(exit)),
            Err(e) => {
                warn!(error = %e, "worker task failed");
                (e.id(), None)
            }
        };

        // Match by task identity: a duplicate launch may have overwritten
        // this proxy's entry with a newer task, which stays untouched.
        let key = self
            .active
            .iter()
            .find(|(_, entry)| entry.task_id == task_id)
            .map(|(key, _)| key.clone());

        let Some(key) = key else {
            debug!("completed worker had no active entry");
            return;
        };

        if let Some(entry) = self.active.remove(&key) {
            match exit {
                Some(exit) => info!(
                    proxy = %entry.proxy,
                    reason = ?exit.reason,
                    "worker finished, launching replacement"
                ),
                None => info!(proxy = %entry.proxy, "worker aborted, launching replacement"),
            }
            match self.selector.select().await {
                Ok(replacement) => self.launch(replacement),
                Err(e) => warn!(error = %e, "no replacement available"),
            }
        }
    }

    /// Spawn a worker for the proxy and install its active entry
    fn launch(&mut self, proxy: Arc<ProxyEndpoint>) {
        if self.active.len() >= self.capacity {
            warn!(proxy = %proxy, capacity = self.capacity, "pool at capacity, not launching");
            return;
        }

        let worker = SessionWorker::new(
            proxy.clone(),
            self.user_id.clone(),
            self.worker_config.clone(),
            self.endpoint.clone(),
            self.health.clone(),
        );
        let handle = self.workers.spawn(worker.run());
        debug!(proxy = %proxy, "launched worker");

        self.active.insert(
            proxy.as_str().to_string(),
            ActiveEntry {
                proxy,
                task_id: handle.id(),
                handle,
            },
        );
    }

    /// Launch every roster proxy absent from the active set, capacity permitting
    fn top_up(&mut self) {
        let missing: Vec<Arc<ProxyEndpoint>> = self
            .roster
            .iter()
            .filter(|proxy| !self.active.contains_key(proxy.as_str()))
            .cloned()
            .collect();

        for proxy in missing {
            if self.active.len() >= self.capacity {
                break;
            }
            self.launch(proxy);
        }
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            active: self.active.len(),
            capacity: self.capacity,
            roster: self.roster.len(),
        }
    }
}
