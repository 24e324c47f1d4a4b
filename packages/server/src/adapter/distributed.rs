//! Distributed execution: deployments run as named workers on a substrate
//! and are reached only through message-passing handles.

use std::sync::Arc;

use async_trait::async_trait;
use framex_core::consts::BACKEND_NAME;
use futures_util::future::BoxFuture;
use tracing::info;

use super::{
    Deployable, DeploymentUnit, ExecutionAdapter, Placement, SharedHandle, StreamCache,
};
use crate::config::AdapterMode;
use crate::error::InvokeError;
use crate::plugin::DeploymentInit;

/// Requests a worker processes at once when nothing else is configured.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 100;

/// Scheduling options of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Messages processed concurrently. `1` serializes the worker.
    pub concurrency: usize,
    /// Bounded mailbox size; senders wait when it is full.
    pub mailbox_capacity: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            mailbox_capacity: 256,
        }
    }
}

/// Deferred construction of a deployment instance, run by the worker.
pub type Constructor = BoxFuture<'static, anyhow::Result<SharedHandle>>;

// ---------------------------------------------------------------------------
// Substrate
// ---------------------------------------------------------------------------

/// The worker runtime a distributed adapter places deployments on.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Spawns a named worker that builds its instance with `constructor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or construction fails.
    async fn spawn(
        &self,
        name: &str,
        constructor: Constructor,
        options: WorkerOptions,
    ) -> anyhow::Result<SharedHandle>;

    /// Handle of a running worker.
    fn get_handle(&self, name: &str) -> Option<SharedHandle>;

    /// Stops every worker.
    async fn shutdown(&self);
}

// ---------------------------------------------------------------------------
// DistributedAdapter
// ---------------------------------------------------------------------------

pub struct DistributedAdapter {
    substrate: Arc<dyn Substrate>,
    options: WorkerOptions,
    stream_cache: StreamCache,
}

impl DistributedAdapter {
    #[must_use]
    pub fn new(substrate: Arc<dyn Substrate>, options: WorkerOptions) -> Self {
        Self {
            substrate,
            options,
            stream_cache: StreamCache::default(),
        }
    }
}

#[async_trait]
impl ExecutionAdapter for DistributedAdapter {
    fn mode(&self) -> AdapterMode {
        AdapterMode::Distributed
    }

    fn prepare_for_deployment(&self, unit: Arc<dyn DeploymentUnit>) -> Deployable {
        Deployable {
            name: unit.name().to_string(),
            unit,
            placement: Placement::Worker(self.options),
        }
    }

    async fn instantiate(
        &self,
        deployable: &Deployable,
        init: DeploymentInit,
    ) -> anyhow::Result<SharedHandle> {
        let options = match deployable.placement {
            Placement::Worker(options) => options,
            Placement::InProcess => self.options,
        };
        let unit = Arc::clone(&deployable.unit);
        let handle = self
            .substrate
            .spawn(
                &deployable.name,
                Box::pin(async move { unit.create(init).await }),
                options,
            )
            .await?;
        info!(
            deployment = %deployable.name,
            concurrency = options.concurrency,
            "deployment spawned as worker"
        );
        Ok(handle)
    }

    fn resolve_handle(&self, target: &str) -> Result<SharedHandle, InvokeError> {
        self.substrate
            .get_handle(target)
            .ok_or_else(|| InvokeError::MissingHandle {
                target: target.to_string(),
            })
    }

    /// The registrar runs as a serial worker so route registrations never
    /// interleave.
    async fn install_backend(&self, backend: SharedHandle) -> anyhow::Result<()> {
        let options = WorkerOptions {
            concurrency: 1,
            ..self.options
        };
        self.substrate
            .spawn(BACKEND_NAME, Box::pin(async move { Ok(backend) }), options)
            .await?;
        Ok(())
    }

    fn stream_cache(&self) -> &StreamCache {
        &self.stream_cache
    }

    async fn shutdown(&self) {
        self.substrate.shutdown().await;
    }
}
