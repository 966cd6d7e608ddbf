//! Interval job scheduler
//!
//! A `Scheduler` is constructed, given jobs, started and stopped explicitly.
//! Each job runs on its own tokio task: the first run happens at start, later
//! runs on every interval tick. A job never overlaps itself; ticks that fall
//! due while it is still running are skipped.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Scheduler error types
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("job {0} is already registered")]
    DuplicateJob(String),

    #[error("job {0} has a zero interval")]
    ZeroInterval(String),

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler is not running")]
    NotRunning,
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// A unit of recurring work. Failures are logged and counted; the job keeps
/// its schedule.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

/// Adapts an async closure into a `Job`.
pub struct FnJob<F> {
    f: F,
}

impl<F> FnJob<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self) -> anyhow::Result<()> {
        (self.f)().await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub id: String,
    pub name: String,
    pub interval_ms: u64,
    pub runs: u64,
    pub failures: u64,
    pub in_progress: bool,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_duration_ms: u64,
    pub last_error: Option<String>,
}

struct ScheduledJob {
    id: String,
    name: String,
    interval: Duration,
    job: Arc<dyn Job>,
}

pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    stats: Arc<DashMap<String, JobStats>>,
    running: Arc<AtomicBool>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            stats: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Register a job. Jobs can only be added while stopped.
    pub fn add_job<J>(&mut self, name: &str, interval: Duration, job: J) -> SchedulerResult<String>
    where
        J: Job + 'static,
    {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(name.to_string()));
        }
        if self.stats.contains_key(name) {
            return Err(SchedulerError::DuplicateJob(name.to_string()));
        }

        let id = nanoid::nanoid!(10);
        self.stats.insert(
            name.to_string(),
            JobStats {
                id: id.clone(),
                name: name.to_string(),
                interval_ms: interval.as_millis() as u64,
                runs: 0,
                failures: 0,
                in_progress: false,
                last_started_at: None,
                last_duration_ms: 0,
                last_error: None,
            },
        );
        self.jobs.push(ScheduledJob {
            id: id.clone(),
            name: name.to_string(),
            interval,
            job: Arc::new(job),
        });

        info!(job = name, interval_ms = interval.as_millis() as u64, "registered job");
        Ok(id)
    }

    pub fn start(&mut self) -> SchedulerResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (tx, rx) = watch::channel(false);
        for job in &self.jobs {
            let handle = tokio::spawn(run_job_loop(
                job.name.clone(),
                job.interval,
                job.job.clone(),
                self.stats.clone(),
                rx.clone(),
            ));
            debug!(job = %job.name, id = %job.id, "spawned job loop");
            self.tasks.push(handle);
        }
        self.shutdown = Some(tx);

        info!(jobs = self.jobs.len(), "scheduler started");
        Ok(())
    }

    /// Signal every job loop to exit and wait for them. A job that is mid-run
    /// finishes that run first.
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        for result in join_all(self.tasks.drain(..)).await {
            if let Err(e) = result {
                error!(error = %e, "job loop ended abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);

        info!("scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of every job's counters, in registration order.
    pub fn job_stats(&self) -> Vec<JobStats> {
        self.jobs
            .iter()
            .filter_map(|job| self.stats.get(&job.name).map(|s| s.clone()))
            .collect()
    }

    pub fn job_stats_for(&self, name: &str) -> Option<JobStats> {
        self.stats.get(name).map(|s| s.clone())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_job_loop(
    name: String,
    interval: Duration,
    job: Arc<dyn Job>,
    stats: Arc<DashMap<String, JobStats>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if let Some(mut entry) = stats.get_mut(&name) {
            entry.in_progress = true;
            entry.last_started_at = Some(Utc::now());
        }

        let started = Instant::now();
        let result = job.run().await;
        let elapsed = started.elapsed();

        if let Some(mut entry) = stats.get_mut(&name) {
            entry.in_progress = false;
            entry.runs += 1;
            entry.last_duration_ms = elapsed.as_millis() as u64;
            match &result {
                Ok(()) => entry.last_error = None,
                Err(e) => {
                    entry.failures += 1;
                    entry.last_error = Some(format!("{e:#}"));
                }
            }
        }

        match result {
            Ok(()) => debug!(job = %name, elapsed_ms = elapsed.as_millis() as u64, "job run finished"),
            Err(e) => error!(job = %name, error = %format!("{e:#}"), "job run failed"),
        }
    }

    debug!(job = %name, "job loop exited");
}
