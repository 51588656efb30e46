//! Bounded worker pool for per-object analysis jobs.
//!
//! A job is a pure function applied to one argument record. Backends:
//!
//! - `Thread`: tokio blocking threads, bounded by a semaphore
//! - `Process`: a dedicated rayon CPU pool of the same size
//! - `Sequential`: one blocking thread at a time, with the same timeout
//!
//! Every dispatched job holds a semaphore permit for as long as its function
//! runs, so the per-job timeout starts when a worker slot is free. A timed-out
//! job is reported as `JobTimeoutError` and not retried; the worker finishes
//! in the background and its result is discarded.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, Stream};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{PoolBackend, PoolConfig};

/// A job exceeded its time budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job} timed out after {timeout:?}")]
pub struct JobTimeoutError {
    pub job: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error(transparent)]
    Timeout(#[from] JobTimeoutError),

    #[error("job {job} panicked")]
    Panicked { job: String },

    #[error("job {job} failed: {message}")]
    Job { job: String, message: String },

    #[error("failed to start worker pool: {0}")]
    Build(String),

    #[error("worker pool closed")]
    Closed,
}

/// Named argument record for one job.
#[derive(Debug, Clone)]
pub struct Job<A> {
    pub name: String,
    pub arg: A,
}

impl<A> Job<A> {
    pub fn new(name: impl Into<String>, arg: A) -> Self {
        Self { name: name.into(), arg }
    }
}

#[derive(Debug)]
pub struct JobResult<R> {
    pub name: String,
    pub outcome: Result<R, PoolError>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job: String,
    pub error: String,
}

/// Counters over every job the pool has run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub jobs: usize,
    pub failures: usize,
    pub failed: Vec<JobFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
}

pub struct WorkerPool {
    backend: PoolBackend,
    size: usize,
    timeout: Duration,
    permits: Arc<Semaphore>,
    cpu: Option<Arc<rayon::ThreadPool>>,
    stats: Mutex<PoolStats>,
}

/// Available CPUs, capped by `max_workers`.
pub fn pool_size(max_workers: Option<usize>) -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    max_workers.map_or(cpus, |m| cpus.min(m)).max(1)
}

impl WorkerPool {
    pub fn new(backend: PoolBackend, max_workers: Option<usize>, timeout: Duration) -> Result<Self, PoolError> {
        let size = if backend == PoolBackend::Sequential { 1 } else { pool_size(max_workers) };
        let cpu = match backend {
            PoolBackend::Process => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(size)
                    .thread_name(|i| format!("pool-worker-{}", i))
                    .build()
                    .map_err(|e| PoolError::Build(e.to_string()))?,
            )),
            _ => None,
        };
        info!(backend = %backend, size, timeout_secs = timeout.as_secs(), "Worker pool ready");
        Ok(Self {
            backend,
            size,
            timeout,
            permits: Arc::new(Semaphore::new(size)),
            cpu,
            stats: Mutex::new(PoolStats::default()),
        })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        Self::new(config.backend, config.max_workers, Duration::from_secs(config.job_timeout_secs))
    }

    pub fn backend(&self) -> PoolBackend {
        self.backend
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record<R>(&self, result: &JobResult<R>, started: DateTime<Utc>) {
        let Ok(mut stats) = self.stats.lock() else { return };
        let finished = Utc::now();
        stats.jobs += 1;
        let first = *stats.started_at.get_or_insert(started);
        let first = first.min(started);
        stats.started_at = Some(first);
        stats.finished_at = Some(stats.finished_at.map_or(finished, |f| f.max(finished)));
        if let Some(end) = stats.finished_at {
            stats.elapsed_secs = (end - first).num_microseconds().map_or(0.0, |us| us as f64 / 1e6);
        }
        if let Err(e) = &result.outcome {
            stats.failures += 1;
            stats.failed.push(JobFailure { job: result.name.clone(), error: e.to_string() });
        }
    }

    async fn run_one<A, R, E, F>(&self, f: Arc<F>, job: Job<A>) -> JobResult<R>
    where
        A: Send + 'static,
        R: Send + 'static,
        E: Display + Send + 'static,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        let Job { name, arg } = job;
        let started = Utc::now();
        let clock = Instant::now();
        let to_outcome = |r: Result<R, E>, job: &str| r.map_err(|e| PoolError::Job { job: job.to_string(), message: e.to_string() });

        let outcome = match self.backend {
            // Sequential holds the single permit, so jobs still run one by one
            PoolBackend::Sequential | PoolBackend::Thread => match Arc::clone(&self.permits).acquire_owned().await {
                Err(_) => Err(PoolError::Closed),
                Ok(permit) => {
                    let handle = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        f(arg)
                    });
                    match tokio::time::timeout(self.timeout, handle).await {
                        Ok(Ok(r)) => to_outcome(r, &name),
                        Ok(Err(_)) => Err(PoolError::Panicked { job: name.clone() }),
                        Err(_) => Err(JobTimeoutError { job: name.clone(), timeout: self.timeout }.into()),
                    }
                }
            },
            PoolBackend::Process => match (&self.cpu, Arc::clone(&self.permits).acquire_owned().await) {
                (Some(cpu), Ok(permit)) => {
                    let (tx, rx) = oneshot::channel();
                    cpu.spawn(move || {
                        let _permit = permit;
                        let _ = tx.send(catch_unwind(AssertUnwindSafe(|| f(arg))));
                    });
                    match tokio::time::timeout(self.timeout, rx).await {
                        Ok(Ok(Ok(r))) => to_outcome(r, &name),
                        Ok(Ok(Err(_)) | Err(_)) => Err(PoolError::Panicked { job: name.clone() }),
                        Err(_) => Err(JobTimeoutError { job: name.clone(), timeout: self.timeout }.into()),
                    }
                }
                _ => Err(PoolError::Closed),
            },
        };

        let result = JobResult { name, outcome, elapsed: clock.elapsed() };
        match &result.outcome {
            Ok(_) => debug!(job = %result.name, elapsed_ms = result.elapsed.as_millis() as u64, "Job finished"),
            Err(e) => warn!(job = %result.name, error = %e, "Job failed"),
        }
        self.record(&result, started);
        result
    }

    /// Run every job; results are aligned with `jobs`.
    pub async fn map_ordered<A, R, E, F>(&self, f: F, jobs: Vec<Job<A>>) -> Vec<JobResult<R>>
    where
        A: Send + 'static,
        R: Send + 'static,
        E: Display + Send + 'static,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        futures::future::join_all(jobs.into_iter().map(|job| self.run_one(Arc::clone(&f), job))).await
    }

    /// Run every job, yielding results in completion order.
    pub fn as_completed<'a, A, R, E, F>(&'a self, f: F, jobs: Vec<Job<A>>) -> impl Stream<Item = JobResult<R>> + 'a
    where
        A: Send + 'static,
        R: Send + 'static,
        E: Display + Send + 'static,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        jobs.into_iter()
            .map(|job| self.run_one(Arc::clone(&f), job))
            .collect::<FuturesUnordered<_>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn square(x: u64) -> Result<u64, String> {
        if x == 13 {
            Err("unlucky".to_string())
        } else {
            Ok(x * x)
        }
    }

    fn jobs(n: u64) -> Vec<Job<u64>> {
        (0..n).map(|i| Job::new(format!("job-{}", i), i)).collect()
    }

    #[tokio::test]
    async fn test_ordered_results_on_every_backend() {
        for backend in [PoolBackend::Thread, PoolBackend::Process, PoolBackend::Sequential] {
            let pool = WorkerPool::new(backend, Some(3), Duration::from_secs(10)).unwrap();
            let results = pool.map_ordered(square, jobs(16)).await;
            assert_eq!(results.len(), 16);
            for (i, r) in results.iter().enumerate() {
                assert_eq!(r.name, format!("job-{}", i));
                if i == 13 {
                    assert!(matches!(r.outcome, Err(PoolError::Job { .. })), "{}", backend);
                } else {
                    assert_eq!(*r.outcome.as_ref().unwrap(), (i * i) as u64);
                }
            }
            let stats = pool.stats();
            assert_eq!(stats.jobs, 16);
            assert_eq!(stats.failures, 1);
            assert_eq!(stats.failed[0].job, "job-13");
            assert!(stats.started_at.unwrap() <= stats.finished_at.unwrap());
        }
    }

    #[tokio::test]
    async fn test_as_completed_yields_fast_jobs_first() {
        let pool = WorkerPool::new(PoolBackend::Thread, Some(4), Duration::from_secs(10)).unwrap();
        let delays = vec![Job::new("slow", 300u64), Job::new("fast", 10u64)];
        let sleepy = |ms: u64| -> Result<u64, String> {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(ms)
        };
        let names: Vec<String> = pool.as_completed(sleepy, delays).map(|r| r.name).collect().await;
        if pool.size() >= 2 {
            assert_eq!(names, vec!["fast", "slow"]);
        } else {
            assert_eq!(names.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_not_retried() {
        for backend in [PoolBackend::Thread, PoolBackend::Process, PoolBackend::Sequential] {
            let pool = WorkerPool::new(backend, Some(2), Duration::from_millis(50)).unwrap();
            let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            let slow = move |_: ()| -> Result<(), String> {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            };
            let results = pool.map_ordered(slow, vec![Job::new("long", ())]).await;
            match &results[0].outcome {
                Err(PoolError::Timeout(e)) => assert_eq!(e.job, "long"),
                other => panic!("expected timeout, got {:?}", other),
            }
            assert_eq!(pool.stats().failures, 1);
            assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_panics_become_failures() {
        let pool = WorkerPool::new(PoolBackend::Thread, Some(1), Duration::from_secs(5)).unwrap();
        let boom = |x: u32| -> Result<u32, String> {
            if x == 1 {
                panic!("boom");
            }
            Ok(x)
        };
        let results = pool.map_ordered(boom, vec![Job::new("a", 0), Job::new("b", 1)]).await;
        assert!(results[0].outcome.is_ok());
        assert!(matches!(results[1].outcome, Err(PoolError::Panicked { .. })));
    }

    #[test]
    fn test_sequential_runs_one_job_at_a_time() {
        let pool = WorkerPool::new(PoolBackend::Sequential, Some(8), Duration::from_secs(5)).unwrap();
        assert_eq!(pool.size(), 1);
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let tracked = move |x: u64| -> Result<u64, String> {
            let now = r.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            p.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            r.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            square(x)
        };
        let results = tokio_test::block_on(pool.map_ordered(tracked, jobs(4)));
        let values: Vec<u64> = results.into_iter().map(|r| r.outcome.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 4, 9]);
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(pool.stats().failures, 0);
    }

    #[tokio::test]
    async fn test_sequential_timeout_is_reported_and_the_next_job_runs() {
        let pool = WorkerPool::new(PoolBackend::Sequential, None, Duration::from_millis(50)).unwrap();
        let sleepy = |ms: u64| -> Result<u64, String> {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(ms)
        };
        let results = pool.map_ordered(sleepy, vec![Job::new("stuck", 300u64), Job::new("quick", 1u64)]).await;
        assert!(matches!(&results[0].outcome, Err(PoolError::Timeout(e)) if e.job == "stuck"));
        assert_eq!(*results[1].outcome.as_ref().unwrap(), 1);
        assert_eq!(pool.stats().failures, 1);
    }

    #[test]
    fn test_pool_size_cap() {
        assert_eq!(pool_size(Some(1)), 1);
        assert!(pool_size(None) >= 1);
    }
}
