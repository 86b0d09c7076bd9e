//! Pipeline stage trait
//!
//! Stages run in their own task and talk to the rest of the pipeline over
//! channels handed to them before `run` is called.

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info};
use tokio::task::JoinHandle;

/// Trait for long running pipeline stages
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Run the stage until its input closes or it is cancelled
    async fn run(&mut self) -> Result<()>;

    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;

    /// Gracefully shutdown the stage
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Spawn a stage on the runtime, logging how it ended.
///
/// The stage is handed back when it finishes so its final state can be
/// inspected.
pub fn spawn_stage<S>(mut stage: S) -> JoinHandle<S>
where
    S: PipelineStage + 'static,
{
    tokio::spawn(async move {
        let name = stage.name();
        match stage.run().await {
            Ok(()) => info!("{}: stopped", name),
            Err(e) => error!("{} error: {:#}", name, e),
        }
        if let Err(e) = stage.shutdown().await {
            error!("{} shutdown error: {:#}", name, e);
        }
        stage
    })
}
