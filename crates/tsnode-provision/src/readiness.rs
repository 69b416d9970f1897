//! Polling a remote resource until it settles.
//!
//! A [`Readiness`] machine turns one observation into [`Progress`]; a
//! [`Poller`] feeds it observations at a fixed interval. There is no overall
//! deadline: a machine that keeps answering [`Progress::Pending`] is polled
//! forever. Each individual fetch is bounded by the poller's call timeout.

use crate::error::{ProvisionError, ProvisionResult};
use crate::provider::{BootStatus, InstanceDescriptor};
use std::future::Future;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Done,
    Failed(String),
}

pub trait Readiness {
    type Observation;

    fn observe(&mut self, observation: &Self::Observation) -> Progress;
}

// ─── Boot ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Unknown,
    Initializing,
    Ready,
    Failed,
}

/// Waits for `ok/passed`.
///
/// An empty status before any status was seen means the provider has not
/// started reporting yet. An empty status after one was seen means the
/// instance was lost.
#[derive(Debug, Clone)]
pub struct BootReadiness {
    state: BootState,
    seen_status: bool,
}

impl BootReadiness {
    pub fn new() -> Self {
        Self {
            state: BootState::Unknown,
            seen_status: false,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }
}

impl Default for BootReadiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness for BootReadiness {
    type Observation = Option<BootStatus>;

    fn observe(&mut self, observation: &Option<BootStatus>) -> Progress {
        let Some(status) = observation else {
            if self.seen_status {
                self.state = BootState::Failed;
                return Progress::Failed("instance status disappeared after being reported".into());
            }
            return Progress::Pending;
        };

        self.seen_status = true;
        if status.is_initializing() {
            self.state = BootState::Initializing;
            Progress::Pending
        } else if status.is_ready() {
            self.state = BootState::Ready;
            Progress::Done
        } else {
            self.state = BootState::Failed;
            Progress::Failed(format!(
                "unexpected status {}/{}",
                status.status, status.detail
            ))
        }
    }
}

// ─── Termination ─────────────────────────────────────────────────────────────

/// Done once the tagged instance reports `terminated` or no longer shows up.
#[derive(Debug, Clone, Default)]
pub struct TerminationReadiness {
    last_state: Option<String>,
}

impl TerminationReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_state(&self) -> Option<&str> {
        self.last_state.as_deref()
    }
}

impl Readiness for TerminationReadiness {
    type Observation = Option<InstanceDescriptor>;

    fn observe(&mut self, observation: &Option<InstanceDescriptor>) -> Progress {
        match observation {
            None => Progress::Done,
            Some(instance) => {
                self.last_state = Some(instance.state.clone());
                if instance.is_terminated() {
                    Progress::Done
                } else {
                    Progress::Pending
                }
            }
        }
    }
}

// ─── Poller ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub call_timeout: Duration,
}

impl Default for Poller {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl Poller {
    pub fn new(interval: Duration, call_timeout: Duration) -> Self {
        Self {
            interval,
            call_timeout,
        }
    }

    /// Fetch and observe until the machine settles.
    ///
    /// Returns `Ok(Progress::Done)` or `Ok(Progress::Failed(reason))`; fetch
    /// errors and call timeouts are returned as errors straight away.
    pub async fn run<M, F, Fut>(
        &self,
        operation: &'static str,
        machine: &mut M,
        mut fetch: F,
    ) -> ProvisionResult<Progress>
    where
        M: Readiness,
        M::Observation: std::fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = ProvisionResult<M::Observation>>,
    {
        let start = std::time::Instant::now();
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let observation = tokio::time::timeout(self.call_timeout, fetch())
                .await
                .map_err(|elapsed| ProvisionError::remote(operation, elapsed))??;

            match machine.observe(&observation) {
                Progress::Pending => {
                    info!(
                        operation,
                        attempt,
                        elapsed_s = start.elapsed().as_secs(),
                        ?observation,
                        "continuing to wait"
                    );
                    tokio::time::sleep(self.interval).await;
                }
                settled => return Ok(settled),
            }
        }
    }
}
