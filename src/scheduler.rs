//! Interval scheduler shared by everything that needs periodic work.
//!
//! A `Scheduler` is a cheap handle: clones observe the same interval, running
//! flag and subscriber list, so one instance constructed at startup and
//! injected where needed gives "one timer per process" without a global.
//!
//! The loop sleeps a fixed one-second tick and dispatches when the configured
//! interval has elapsed since the previous dispatch. Subscribers run
//! concurrently on a supervised `JoinSet`; a failing (or panicking) job is
//! logged and never cancels its siblings or the loop.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const TICK: Duration = Duration::from_secs(1);
/// How long a stopping scheduler waits for in-flight jobs before aborting them.
pub const DRAIN_GRACE: Duration = Duration::from_secs(10);

type JobFn = dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

#[derive(Clone)]
pub struct Job {
    name: String,
    run: Arc<JobFn>,
}

impl Job {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move || Box::pin(f()) as BoxFuture<'static, anyhow::Result<()>>),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

struct Inner {
    interval_secs: AtomicU64,
    running: AtomicBool,
    subscribers: RwLock<Vec<Job>>,
    last_dispatch: Mutex<Option<Instant>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        info!(interval_secs = interval.as_secs(), "scheduler interval configured");
        Self {
            inner: Arc::new(Inner {
                interval_secs: AtomicU64::new(interval.as_secs().max(1)),
                running: AtomicBool::new(false),
                subscribers: RwLock::new(Vec::new()),
                last_dispatch: Mutex::new(None),
            }),
        }
    }

    #[cfg(test)]
    fn same_as(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Appends a job. Subscribing the same job twice runs it twice per tick.
    pub fn subscribe(&self, job: Job) {
        info!(job = job.name(), "subscribed scheduler job");
        self.inner.subscribers.write().push(job);
    }

    pub fn clear_subscribers(&self) {
        self.inner.subscribers.write().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn set_interval(&self, interval: Duration) {
        self.inner.interval_secs.store(interval.as_secs().max(1), Ordering::Relaxed);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.inner.interval_secs.load(Ordering::Relaxed))
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Clears the schedule; a running loop exits at its next tick.
    pub fn stop(&self) {
        *self.inner.last_dispatch.lock() = None;
        self.inner.running.store(false, Ordering::Release);
    }

    fn snapshot(&self) -> Vec<Job> {
        self.inner.subscribers.read().clone()
    }

    fn spawn_jobs(&self, set: &mut JoinSet<(String, anyhow::Result<()>)>) -> usize {
        let jobs = self.snapshot();
        if jobs.is_empty() {
            debug!("no subscribers to dispatch");
            return 0;
        }
        info!(subscribers = jobs.len(), "dispatching scheduler subscribers");
        for job in &jobs {
            let name = job.name.clone();
            let fut = (job.run)();
            set.spawn(async move { (name, fut.await) });
        }
        jobs.len()
    }

    pub async fn dispatch_now(&self) -> DispatchReport {
        let mut set = JoinSet::new();
        self.spawn_jobs(&mut set);
        let mut report = DispatchReport::default();
        while let Some(joined) = set.join_next().await {
            record(joined, &mut report);
        }
        report
    }

    /// Runs the tick loop until `stop()` is called or `shutdown` flips to true.
    /// Returns the outcome of every job dispatched by this loop; jobs aborted
    /// after the grace period count as failed.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> DispatchReport {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            warn!("scheduler already started, can't start it again");
            return DispatchReport::default();
        }
        *self.inner.last_dispatch.lock() = Some(Instant::now());
        let mut in_flight: JoinSet<(String, anyhow::Result<()>)> = JoinSet::new();
        let mut report = DispatchReport::default();

        while self.is_running() {
            tokio::select! {
                _ = tokio::time::sleep(TICK) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler cancelled, exiting task loop");
                        self.stop();
                        break;
                    }
                }
            }
            while let Some(joined) = in_flight.try_join_next() {
                record(joined, &mut report);
            }
            if !self.is_running() {
                break;
            }
            let due = {
                let mut last = self.inner.last_dispatch.lock();
                let now = Instant::now();
                let started = *last.get_or_insert(now);
                if now.duration_since(started) >= self.interval() {
                    *last = Some(now);
                    true
                } else {
                    false
                }
            };
            if due {
                self.spawn_jobs(&mut in_flight);
            }
        }

        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while let Some(joined) = in_flight.join_next().await {
                record(joined, &mut report);
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = in_flight.len(), "aborting scheduler jobs still running after grace period");
            report.failed += in_flight.len();
            in_flight.shutdown().await;
        }
        info!(succeeded = report.succeeded, failed = report.failed, "scheduler finished cleanup");
        report
    }
}

fn record(
    joined: Result<(String, anyhow::Result<()>), tokio::task::JoinError>,
    report: &mut DispatchReport,
) {
    match joined {
        Ok((_, Ok(()))) => report.succeeded += 1,
        Ok((name, Err(err))) => {
            report.failed += 1;
            error!(job = %name, error = %err, "scheduler job failed");
        }
        Err(err) => {
            report.failed += 1;
            error!(error = %err, "scheduler job panicked or was aborted");
        }
    }
}
