//! Datalake worker binary.
//!
//! Runs the worker pool that executes deploy, destroy and cleanup jobs.

use tracing::info;
use tracing_subscriber::EnvFilter;

use datalake_control::{ControlConfig, WorkerService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("datalake_control=info".parse()?),
        )
        .init();

    info!("datalake worker starting");

    let config = ControlConfig::load()?;

    info!(
        backend = ?config.queue.backend,
        queue = %config.queue.name,
        tool = ?config.provisioning.tool,
        concurrency = config.worker.concurrency,
        retention = ?config.deployment.retention,
        "configuration loaded"
    );

    WorkerService::new(config).run().await?;

    Ok(())
}
