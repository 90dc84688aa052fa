//! Background job scheduling.
//!
//! Work is produced by long-lived [`JobSource`]s that the [`JobScheduler`]
//! polls every cycle. Each source hands back short-lived [`Job`]s that the
//! scheduler runs on a bounded worker pool.

pub mod exif_source;
pub mod indexing;
pub mod scheduler;

use anyhow::Result;
use async_trait::async_trait;

pub use exif_source::{ExifJobSource, ExifWriteJob, EXIF_SOURCE_NAME};
pub use indexing::{IndexingJobSource, ReindexJob, INDEXING_SOURCE_NAME};
pub use scheduler::{CycleReport, JobScheduler, SchedulerStatus};

/// Unique identifier for a scheduled job, used to track it while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl JobId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        JobId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// Priority of a job source. Higher priorities are queued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobPriority {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Lowest => "lowest",
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Highest => "highest",
        }
    }
}

/// A single unit of background work.
#[async_trait]
pub trait Job: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Human-readable summary, shown while the job runs.
    fn description(&self) -> String;

    /// Checked right before the job runs. A job that cannot run is dropped
    /// for this cycle.
    fn can_process(&self) -> bool {
        true
    }

    async fn process(&self) -> Result<()>;
}

/// Long-lived producer of jobs, registered with the scheduler once.
#[async_trait]
pub trait JobSource: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> JobPriority;

    /// Up to `max_count` jobs that are ready to run now.
    async fn get_pending_jobs(&self, max_count: usize) -> Result<Vec<Box<dyn Job>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::Highest > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Low > JobPriority::Lowest);
        assert_eq!(JobPriority::High.as_str(), "high");
    }
}
