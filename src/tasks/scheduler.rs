//! Polling scheduler that drains job sources on a bounded worker pool.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::{Job, JobId, JobPriority, JobSource};
use crate::config::SchedulerConfig;

/// Outcome counts for one scheduling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub jobs_polled: usize,
    pub sources_failed: usize,
    /// Jobs whose `can_process` check failed.
    pub jobs_skipped: usize,
    /// Jobs beyond the queue bound.
    pub jobs_dropped: usize,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerStatus {
    pub cycles: u64,
    pub sources: Vec<String>,
    pub last_cycle: Option<CycleReport>,
    pub running: Vec<String>,
}

type RunningJobs = Arc<Mutex<HashMap<JobId, String>>>;

/// Removes a job from the running set however its task ends.
struct RunningGuard {
    running: RunningJobs,
    id: JobId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        running.remove(&self.id);
    }
}

pub struct JobScheduler {
    sources: RwLock<Vec<Arc<dyn JobSource>>>,
    max_queue_size: usize,
    workers: usize,
    poll_interval: Duration,
    wake: Notify,
    flagged: Mutex<BTreeSet<String>>,
    running: RunningJobs,
    cycles: AtomicU64,
    last_cycle: Mutex<Option<CycleReport>>,
}

impl JobScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            sources: RwLock::new(Vec::new()),
            max_queue_size: config.max_queue_size.max(1),
            workers: config.workers.max(1),
            poll_interval: config.poll_interval(),
            wake: Notify::new(),
            flagged: Mutex::new(BTreeSet::new()),
            running: Arc::new(Mutex::new(HashMap::new())),
            cycles: AtomicU64::new(0),
            last_cycle: Mutex::new(None),
        }
    }

    /// Register a source. Sources live as long as the scheduler.
    pub fn add_job_source(&self, source: Arc<dyn JobSource>) {
        info!(
            source = source.name(),
            priority = source.priority().as_str(),
            "Registered job source"
        );
        let mut sources = self.sources.write().unwrap_or_else(|p| p.into_inner());
        sources.push(source);
    }

    /// Ask for an early poll. Requests made while a cycle is running start
    /// the next cycle as soon as it finishes.
    pub fn flag_new_jobs(&self, source_name: &str) {
        {
            let mut flagged = self.flagged.lock().unwrap_or_else(|p| p.into_inner());
            flagged.insert(source_name.to_string());
        }
        self.wake.notify_one();
    }

    pub fn status(&self) -> SchedulerStatus {
        let sources = self
            .sources
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        let mut running: Vec<String> = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        running.sort();

        SchedulerStatus {
            cycles: self.cycles.load(Ordering::Relaxed),
            sources,
            last_cycle: *self.last_cycle.lock().unwrap_or_else(|p| p.into_inner()),
            running,
        }
    }

    /// Spawn the scheduling loop onto the current runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Poll, drain and sleep forever.
    pub async fn run(self: Arc<Self>) {
        info!(
            workers = self.workers,
            max_queue_size = self.max_queue_size,
            poll_interval_secs = self.poll_interval.as_secs(),
            "Job scheduler started"
        );

        loop {
            self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wake.notified() => {
                    let flagged: Vec<String> = {
                        let mut flagged = self.flagged.lock().unwrap_or_else(|p| p.into_inner());
                        std::mem::take(&mut *flagged).into_iter().collect()
                    };
                    debug!(?flagged, "Woken early for new jobs");
                }
            }
        }
    }

    /// Run one poll-and-drain cycle. Never fails: every error is contained
    /// and counted in the report.
    pub async fn run_cycle(&self) -> CycleReport {
        let start = Instant::now();
        let mut report = CycleReport::default();

        let queue = self.poll_sources(&mut report).await;
        self.drain(queue, &mut report).await;

        self.cycles.fetch_add(1, Ordering::Relaxed);
        *self.last_cycle.lock().unwrap_or_else(|p| p.into_inner()) = Some(report);

        if report.jobs_polled > 0 || report.sources_failed > 0 {
            info!(
                polled = report.jobs_polled,
                succeeded = report.jobs_succeeded,
                failed = report.jobs_failed,
                skipped = report.jobs_skipped,
                dropped = report.jobs_dropped,
                sources_failed = report.sources_failed,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Scheduler cycle complete"
            );
        }
        report
    }

    async fn poll_sources(&self, report: &mut CycleReport) -> Vec<Box<dyn Job>> {
        let sources: Vec<Arc<dyn JobSource>> = self
            .sources
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if sources.is_empty() {
            return Vec::new();
        }

        let per_source = (self.max_queue_size / sources.len()).max(1);
        let mut polled: Vec<(JobPriority, Box<dyn Job>)> = Vec::new();

        for source in &sources {
            match source.get_pending_jobs(per_source).await {
                Ok(jobs) => {
                    if !jobs.is_empty() {
                        debug!(source = source.name(), jobs = jobs.len(), "Polled job source");
                    }
                    let priority = source.priority();
                    polled.extend(jobs.into_iter().map(|job| (priority, job)));
                }
                Err(e) => {
                    report.sources_failed += 1;
                    warn!(source = source.name(), error = %e, "Failed to poll job source");
                }
            }
        }
        report.jobs_polled = polled.len();

        // Stable: jobs from equal-priority sources keep their polled order.
        polled.sort_by(|a, b| b.0.cmp(&a.0));
        if polled.len() > self.max_queue_size {
            report.jobs_dropped = polled.len() - self.max_queue_size;
            warn!(
                dropped = report.jobs_dropped,
                max_queue_size = self.max_queue_size,
                "Job queue full, dropping jobs until next cycle"
            );
            polled.truncate(self.max_queue_size);
        }

        polled.into_iter().map(|(_, job)| job).collect()
    }

    async fn drain(&self, queue: Vec<Box<dyn Job>>, report: &mut CycleReport) {
        if queue.is_empty() {
            return;
        }

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for job in queue {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };

            if !job.can_process() {
                debug!(job = job.name(), "Job cannot be processed, skipping");
                report.jobs_skipped += 1;
                continue;
            }

            let id = JobId::new();
            let description = job.description();
            self.running
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(id, description.clone());
            let guard = RunningGuard {
                running: Arc::clone(&self.running),
                id,
            };

            tasks.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                let result = job.process().await;
                (job.name().to_string(), description, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, description, Ok(()))) => {
                    report.jobs_succeeded += 1;
                    debug!(job = %description, "Job finished");
                }
                Ok((name, description, Err(e))) => {
                    report.jobs_failed += 1;
                    error!(job = %name, description = %description, error = %e, "Job failed");
                }
                Err(e) => {
                    report.jobs_failed += 1;
                    error!(error = %e, "Job panicked");
                }
            }
        }
    }
}
