//! Task-based worker substrate.
//!
//! Every worker is an independently scheduled tokio task that owns its
//! deployment instance and is reached only through a bounded mailbox. Calls
//! carry a oneshot reply channel; streams are relayed chunk by chunk through
//! a bounded channel and stop as soon as the consumer goes away.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use framex_core::Kwargs;
use futures_util::stream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::distributed::{Constructor, Substrate, WorkerOptions};
use super::{ChunkStream, ExecutionHandle, SharedHandle};
use crate::error::InvokeError;

/// Chunks buffered between a streaming worker and its consumer.
const STREAM_BUFFER: usize = 16;

// ---------------------------------------------------------------------------
// WorkerMessage
// ---------------------------------------------------------------------------

enum WorkerMessage {
    Call {
        function: String,
        kwargs: Kwargs,
        reply: oneshot::Sender<Result<Value, InvokeError>>,
    },
    Stream {
        function: String,
        kwargs: Kwargs,
        accepted: oneshot::Sender<Result<(), InvokeError>>,
        chunks: mpsc::Sender<Result<String, InvokeError>>,
    },
    Start {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

// ---------------------------------------------------------------------------
// WorkerHandle
// ---------------------------------------------------------------------------

/// Caller-side handle of a worker: a mailbox sender and nothing else.
#[derive(Clone)]
pub struct WorkerHandle {
    target: String,
    tx: mpsc::Sender<WorkerMessage>,
}

impl WorkerHandle {
    fn closed(&self) -> InvokeError {
        InvokeError::WorkerClosed {
            target: self.target.clone(),
        }
    }

    async fn send(&self, message: WorkerMessage) -> Result<(), InvokeError> {
        self.tx.send(message).await.map_err(|_| self.closed())
    }
}

#[async_trait]
impl ExecutionHandle for WorkerHandle {
    fn target(&self) -> &str {
        &self.target
    }

    async fn call(&self, function: &str, kwargs: Kwargs) -> Result<Value, InvokeError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerMessage::Call {
            function: function.to_string(),
            kwargs,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    async fn call_stream(
        &self,
        function: &str,
        kwargs: Kwargs,
    ) -> Result<ChunkStream, InvokeError> {
        let (accepted, accepted_rx) = oneshot::channel();
        let (chunks, chunks_rx) = mpsc::channel(STREAM_BUFFER);
        self.send(WorkerMessage::Stream {
            function: function.to_string(),
            kwargs,
            accepted,
            chunks,
        })
        .await?;
        accepted_rx.await.map_err(|_| self.closed())??;

        Ok(Box::pin(stream::unfold(chunks_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn start(&self) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerMessage::Start { reply }).await?;
        rx.await.map_err(|_| self.closed())?
    }
}

// ---------------------------------------------------------------------------
// TaskSubstrate
// ---------------------------------------------------------------------------

struct WorkerSlot {
    handle: Arc<WorkerHandle>,
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Substrate running each worker as a tokio task.
#[derive(Default)]
pub struct TaskSubstrate {
    workers: DashMap<String, WorkerSlot>,
}

impl TaskSubstrate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the running workers.
    #[must_use]
    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Substrate for TaskSubstrate {
    async fn spawn(
        &self,
        name: &str,
        constructor: Constructor,
        options: WorkerOptions,
    ) -> anyhow::Result<SharedHandle> {
        if self.workers.contains_key(name) {
            anyhow::bail!("worker `{name}` is already running");
        }

        let (tx, rx) = mpsc::channel(options.mailbox_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let join = tokio::spawn(run_worker(
            name.to_string(),
            constructor,
            options.concurrency,
            rx,
            shutdown_rx,
            ready_tx,
        ));

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.context(format!("worker `{name}` failed to start"))),
            Err(_) => anyhow::bail!("worker `{name}` exited during construction"),
        }

        let handle = Arc::new(WorkerHandle {
            target: name.to_string(),
            tx,
        });
        self.workers.insert(
            name.to_string(),
            WorkerSlot {
                handle: Arc::clone(&handle),
                shutdown_tx,
                join,
            },
        );
        info!(worker = name, concurrency = options.concurrency, "worker started");
        Ok(handle)
    }

    fn get_handle(&self, name: &str) -> Option<SharedHandle> {
        self.workers
            .get(name)
            .map(|slot| Arc::clone(&slot.handle) as SharedHandle)
    }

    async fn shutdown(&self) {
        let names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, slot)) = self.workers.remove(&name) {
                let _ = slot.shutdown_tx.send(());
                let _ = slot.join.await;
            }
        }
    }
}

/// Worker task: builds the instance, then serves the mailbox until shutdown
/// or until every handle is dropped.
async fn run_worker(
    name: String,
    constructor: Constructor,
    concurrency: usize,
    mut rx: mpsc::Receiver<WorkerMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
    ready: oneshot::Sender<anyhow::Result<()>>,
) {
    let instance = match constructor.await {
        Ok(instance) => {
            let _ = ready.send(Ok(()));
            instance
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));

    // A message leaves the mailbox only once a permit is held, so a
    // saturated worker queues in order and still observes shutdown.
    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => {
                let Ok(permit) = permit else { break };
                permit
            }
            _ = &mut shutdown_rx => break,
        };
        let message = tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                message
            }
            _ = &mut shutdown_rx => break,
        };
        let instance = Arc::clone(&instance);
        tokio::spawn(async move {
            handle_message(instance, message).await;
            drop(permit);
        });
    }
    debug!(worker = %name, "worker stopped");
}

async fn handle_message(instance: SharedHandle, message: WorkerMessage) {
    match message {
        WorkerMessage::Call {
            function,
            kwargs,
            reply,
        } => {
            let _ = reply.send(instance.call(&function, kwargs).await);
        }
        WorkerMessage::Stream {
            function,
            kwargs,
            accepted,
            chunks,
        } => {
            let mut stream = match instance.call_stream(&function, kwargs).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = accepted.send(Err(err));
                    return;
                }
            };
            if accepted.send(Ok(())).is_err() {
                return;
            }
            loop {
                tokio::select! {
                    item = stream.next() => {
                        let Some(item) = item else { break };
                        if chunks.send(item).await.is_err() {
                            break;
                        }
                    }
                    () = chunks.closed() => break,
                }
            }
        }
        WorkerMessage::Start { reply } => {
            let _ = reply.send(instance.start().await);
        }
    }
}
