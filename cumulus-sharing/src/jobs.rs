//! Background jobs.
//!
//! `track`, `replicate` and `upload` are independently queued units of
//! work. The engine only needs a [`JobScheduler`] to enqueue them;
//! [`ChannelScheduler`] and [`JobRunner`] provide an in-process runtime
//! with per-worker concurrency limits and execution counts, and
//! [`MemoryScheduler`] records requests without running them.

use crate::engine::SharingEngine;
use crate::error::{SharingError, SharingResult};
use crate::shared::TrackRequest;
use async_trait::async_trait;
use cumulus_types::SharingId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

/// The worker a job is executed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerKind {
    #[serde(rename = "share-track")]
    Track,
    #[serde(rename = "share-replicate")]
    Replicate,
    #[serde(rename = "share-upload")]
    Upload,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 3] = [Self::Track, Self::Replicate, Self::Upload];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Track => "share-track",
            Self::Replicate => "share-replicate",
            Self::Upload => "share-upload",
        }
    }
}

/// Payload of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "worker", rename_all = "snake_case")]
pub enum JobMessage {
    Track(TrackRequest),
    /// `errors` counts the previous failed attempts.
    Replicate { sharing_id: SharingId, errors: u32 },
    Upload { sharing_id: SharingId, errors: u32 },
}

impl JobMessage {
    pub fn worker(&self) -> WorkerKind {
        match self {
            Self::Track(_) => WorkerKind::Track,
            Self::Replicate { .. } => WorkerKind::Replicate,
            Self::Upload { .. } => WorkerKind::Upload,
        }
    }

    /// The follow-up job after a failure, if this kind is retried that way.
    pub fn retry(&self) -> Option<(Self, u32)> {
        match self {
            Self::Track(_) => None,
            Self::Replicate { sharing_id, errors } => Some((
                Self::Replicate {
                    sharing_id: sharing_id.clone(),
                    errors: errors + 1,
                },
                *errors,
            )),
            Self::Upload { sharing_id, errors } => Some((
                Self::Upload {
                    sharing_id: sharing_id.clone(),
                    errors: errors + 1,
                },
                *errors,
            )),
        }
    }
}

/// A job to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub message: JobMessage,
    /// Run no earlier than this delay from now.
    pub delay: Option<Duration>,
}

impl JobRequest {
    pub fn now(message: JobMessage) -> Self {
        Self { message, delay: None }
    }

    pub fn delayed(message: JobMessage, delay: Duration) -> Self {
        Self {
            message,
            delay: Some(delay),
        }
    }
}

/// Enqueues background jobs.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn push(&self, job: JobRequest) -> SharingResult<()>;
}

/// Records pushed jobs without running them.
#[derive(Debug, Default)]
pub struct MemoryScheduler {
    jobs: Mutex<Vec<JobRequest>>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs pushed so far.
    pub fn jobs(&self) -> Vec<JobRequest> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Removes and returns the jobs pushed so far.
    pub fn take(&self) -> Vec<JobRequest> {
        std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl JobScheduler for MemoryScheduler {
    async fn push(&self, job: JobRequest) -> SharingResult<()> {
        debug!("Queued {} job", job.message.worker().as_str());
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).push(job);
        Ok(())
    }
}

/// Sends jobs to a [`JobRunner`].
#[derive(Debug, Clone)]
pub struct ChannelScheduler {
    tx: mpsc::UnboundedSender<JobRequest>,
}

impl ChannelScheduler {
    /// Creates a scheduler and the receiving end to give to a runner.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobScheduler for ChannelScheduler {
    async fn push(&self, job: JobRequest) -> SharingResult<()> {
        self.tx.send(job).map_err(|_| SharingError::ChannelClosed)
    }
}

/// Executes queued jobs against an engine.
///
/// Each worker kind has its own concurrency limit. A failed execution is
/// attempted again, immediately, until the kind's `max_exec_count`;
/// replicate and upload jobs keep theirs at 1 and rely on retry jobs
/// instead.
pub struct JobRunner {
    engine: Arc<SharingEngine>,
    rx: mpsc::UnboundedReceiver<JobRequest>,
}

impl JobRunner {
    pub fn new(engine: Arc<SharingEngine>, rx: mpsc::UnboundedReceiver<JobRequest>) -> Self {
        Self { engine, rx }
    }

    /// Runs until every scheduler handle is dropped.
    pub async fn run(mut self) {
        let limits: HashMap<WorkerKind, Arc<Semaphore>> = WorkerKind::ALL
            .into_iter()
            .map(|kind| {
                let permits = self.engine.config().job(kind).concurrency.max(1);
                (kind, Arc::new(Semaphore::new(permits)))
            })
            .collect();

        while let Some(job) = self.rx.recv().await {
            let kind = job.message.worker();
            let Some(limit) = limits.get(&kind).cloned() else {
                continue;
            };
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                if let Some(delay) = job.delay {
                    tokio::time::sleep(delay).await;
                }
                let Ok(_permit) = limit.acquire_owned().await else {
                    return;
                };
                let max_exec = engine.config().job(kind).max_exec_count.max(1);
                for attempt in 1..=max_exec {
                    match engine.run_job(job.message.clone()).await {
                        Ok(()) => break,
                        Err(e) if attempt < max_exec && e.is_retryable() => {
                            warn!("{} job failed (attempt {}): {}", kind.as_str(), attempt, e);
                        }
                        Err(e) => {
                            warn!("{} job failed: {}", kind.as_str(), e);
                            break;
                        }
                    }
                }
            });
        }
        debug!("Job queue closed");
    }
}
