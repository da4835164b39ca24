//! Engine configuration.

use crate::jobs::WorkerKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduling limits of one worker kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Jobs of this kind running at the same time.
    pub concurrency: usize,
    /// Executions of a single job before it is given up.
    pub max_exec_count: u32,
    /// Maximum duration of one execution.
    pub timeout_secs: u64,
    /// Base delay of a retry job; doubled for every previous failure.
    pub retry_delay_secs: u64,
}

impl JobConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before the retry following `errors` failures.
    pub fn backoff(&self, errors: u32) -> Duration {
        let factor = 1u64 << errors.min(16);
        Duration::from_secs(self.retry_delay_secs.saturating_mul(factor))
    }
}

/// Configuration for the sharing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Public URL of this instance.
    pub instance_url: String,
    /// Namespace of the advisory locks.
    pub domain: String,
    /// Documents per bulk push.
    pub batch_size: usize,
    /// Files per upload batch.
    pub upload_batch_size: usize,
    /// Shared refs read per page of the changes feed.
    pub changes_limit: usize,
    /// Timeout of every peer request.
    pub http_timeout_secs: u64,
    /// How long the dispatcher caches the active sharings of a doctype.
    pub cache_ttl_secs: u64,
    pub track: JobConfig,
    pub replicate: JobConfig,
    pub upload: JobConfig,
    /// Retry jobs scheduled after replicate and upload failures.
    pub max_retries: u32,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            instance_url: "http://localhost:8080".to_string(),
            domain: "localhost".to_string(),
            batch_size: 100,
            upload_batch_size: 100,
            changes_limit: 1000,
            http_timeout_secs: 30,
            cache_ttl_secs: 300,
            track: JobConfig {
                concurrency: 4,
                max_exec_count: 2,
                timeout_secs: 30,
                retry_delay_secs: 1,
            },
            replicate: JobConfig {
                concurrency: 4,
                max_exec_count: 1,
                timeout_secs: 5 * 60,
                retry_delay_secs: 30,
            },
            upload: JobConfig {
                concurrency: 2,
                max_exec_count: 1,
                timeout_secs: 60 * 60,
                retry_delay_secs: 30,
            },
            max_retries: 5,
        }
    }
}

impl SharingConfig {
    /// Limits of a worker kind.
    pub fn job(&self, kind: WorkerKind) -> &JobConfig {
        match kind {
            WorkerKind::Track => &self.track,
            WorkerKind::Replicate => &self.replicate,
            WorkerKind::Upload => &self.upload,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
