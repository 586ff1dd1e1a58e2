//! Worker process lifecycle.
//!
//! Provides the worker service runner with signal handling and graceful
//! drain of in-flight jobs.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BackendKind, ControlConfig, DatabaseConfig, ToolKind};
use crate::error::ControlResult;
use crate::queue::{JobQueue, MemoryQueue, PostgresQueue};
use crate::reconcile::Reconciler;
use crate::registry::StrategyRegistry;
use crate::store::{DeploymentStore, MemoryStore, PostgresStore};
use crate::worker::{Worker, WorkerSettings};

/// Open a connection pool owned by this process.
pub async fn connect_pool(config: &DatabaseConfig) -> ControlResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await?;
    Ok(pool)
}

/// Deployment store and job queue a process works against.
#[derive(Debug, Clone)]
pub struct Backends {
    /// Deployment records.
    pub store: Arc<dyn DeploymentStore>,
    /// Job queue.
    pub queue: Arc<dyn JobQueue>,
}

impl Backends {
    /// Build the backends named in configuration.
    ///
    /// PostgreSQL backends get a pool of their own; nothing is shared with
    /// other processes except the database itself.
    pub async fn connect(config: &ControlConfig) -> ControlResult<Self> {
        match config.queue.backend {
            BackendKind::Memory => {
                warn!("using in-memory store and queue, state is lost on exit");
                Ok(Self::memory())
            }
            BackendKind::Postgres => {
                let pool = connect_pool(&config.database).await?;
                info!(
                    max_connections = config.database.max_connections,
                    "connected to PostgreSQL"
                );

                let store = PostgresStore::from_pool(pool.clone()).await?;
                let queue =
                    PostgresQueue::new(pool, config.queue.table.clone(), config.queue.name.clone())
                        .await?;

                Ok(Self {
                    store: Arc::new(store),
                    queue: Arc::new(queue),
                })
            }
        }
    }

    /// Fresh in-memory backends.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            queue: Arc::new(MemoryQueue::new()),
        }
    }
}

/// The worker service.
///
/// Manages the lifecycle of a worker process, including:
/// - Store and queue connections
/// - The worker pool
/// - The optional reconciliation sweep
/// - Signal handling and graceful drain
pub struct WorkerService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl WorkerService {
    /// Create a new worker service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the worker service until a shutdown signal.
    pub async fn run(&self) -> ControlResult<()> {
        let backends = Backends::connect(&self.config).await?;
        let registry = StrategyRegistry::from_config(&self.config.provisioning);
        info!(
            tool = ?self.config.provisioning.tool,
            work_dir = %self.config.provisioning.work_dir.display(),
            "provisioning tool configured"
        );
        if self.config.provisioning.tool == ToolKind::Terraform
            && self.config.provisioning.state_backend.is_none()
        {
            warn!("no shared state backend, teardown must run on the host that provisioned");
        }

        self.run_with(backends, registry).await
    }

    /// Run against existing backends and registry.
    pub async fn run_with(
        &self,
        backends: Backends,
        registry: StrategyRegistry,
    ) -> ControlResult<()> {
        let worker = Arc::new(Worker::new(
            Arc::clone(&backends.store),
            registry,
            backends.queue,
            WorkerSettings::from_config(&self.config),
        ));

        // Stops receiving; running jobs are never cancelled through this.
        let stop = CancellationToken::new();
        let mut pool = tokio::spawn(Arc::clone(&worker).run(stop.clone()));

        let sweeper = self.config.worker.reconcile_interval_secs.map(|secs| {
            let reconciler = Reconciler::new(
                Arc::clone(&backends.store),
                self.config.deployment.stale_after(),
            );
            tokio::spawn(reconcile_loop(
                reconciler,
                Duration::from_secs(secs),
                stop.clone(),
            ))
        });

        info!(
            concurrency = self.config.worker.concurrency,
            "datalake worker running"
        );

        shutdown_signal(self.cancel.clone()).await;
        stop.cancel();

        let drain = self.config.worker.drain_timeout();
        info!(drain_timeout = ?drain, "draining in-flight jobs");
        match tokio::time::timeout(drain, &mut pool).await {
            Ok(Ok(())) => info!("in-flight jobs drained"),
            Ok(Err(e)) => error!(error = %e, "worker pool task failed"),
            Err(_) => {
                warn!("drain timeout elapsed, abandoning in-flight jobs to redelivery");
                pool.abort();
            }
        }

        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                error!(error = %e, "reconciliation task failed");
            }
        }

        info!("datalake worker shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn reconcile_loop(reconciler: Reconciler, interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = reconciler.sweep().await {
                    warn!(error = %e, "reconciliation sweep failed");
                }
            }
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
