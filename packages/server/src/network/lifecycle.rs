//! Host lifecycle: readiness gated on deployment start hooks, and draining
//! of in-flight invocations on shutdown.
//!
//! The host is `starting` until the listener serves *and* every deployment's
//! start hook has returned. A start hook that fails is reported per
//! deployment but does not hold readiness back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tracing::info;

/// Health reported by the probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Not serving yet, or start hooks still running.
    Starting,
    Ready,
    /// Shutdown requested; in-flight invocations are finishing.
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Progress of one deployment's start hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartState {
    Starting,
    Started,
    Failed,
}

impl StartState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Booting,
    Serving,
    Draining,
    Stopped,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Lifecycle shared by the runtime, the dispatcher and the health endpoints.
#[derive(Debug)]
pub struct HostLifecycle {
    phase: watch::Sender<Phase>,
    starts: DashMap<String, StartState>,
    in_flight: Arc<InFlight>,
}

impl Default for HostLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl HostLifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Booting);
        Self {
            phase,
            starts: DashMap::new(),
            in_flight: Arc::default(),
        }
    }

    /// Records that `target`'s start hook has been launched.
    pub fn expect_start(&self, target: &str) {
        self.starts.insert(target.to_string(), StartState::Starting);
    }

    /// Records the outcome of `target`'s start hook.
    pub fn start_finished(&self, target: &str, succeeded: bool) {
        let state = if succeeded {
            StartState::Started
        } else {
            StartState::Failed
        };
        self.starts.insert(target.to_string(), state);
        if self.health_state() == HealthState::Ready {
            info!("every deployment started, host ready");
        }
    }

    /// The listener is accepting connections.
    pub fn mark_serving(&self) {
        self.phase.send_if_modified(|phase| {
            let booting = *phase == Phase::Booting;
            if booting {
                *phase = Phase::Serving;
            }
            booting
        });
    }

    /// Stops reporting readiness; [`HostLifecycle::drain`] follows.
    pub fn begin_drain(&self) {
        self.phase.send_replace(Phase::Draining);
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        match *self.phase.borrow() {
            Phase::Booting => HealthState::Starting,
            Phase::Serving if self.pending_starts() > 0 => HealthState::Starting,
            Phase::Serving => HealthState::Ready,
            Phase::Draining => HealthState::Draining,
            Phase::Stopped => HealthState::Stopped,
        }
    }

    fn pending_starts(&self) -> usize {
        self.starts
            .iter()
            .filter(|entry| *entry.value() == StartState::Starting)
            .count()
    }

    /// Start-hook progress by deployment target.
    #[must_use]
    pub fn deployments(&self) -> BTreeMap<String, StartState> {
        self.starts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Counts an invocation until the returned guard is dropped. Streaming
    /// responses keep their guard until the last frame.
    #[must_use]
    pub fn invocation_guard(&self) -> InvocationGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InvocationGuard(Arc::clone(&self.in_flight))
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for in-flight invocations to finish. On success
    /// the host is `stopped`; on timeout it stays `draining`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.in_flight.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(timeout, idle).await.is_err() {
            return false;
        }
        self.phase.send_replace(Phase::Stopped);
        true
    }
}

/// Held for the duration of one invocation.
#[derive(Debug)]
pub struct InvocationGuard(Arc<InFlight>);

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
