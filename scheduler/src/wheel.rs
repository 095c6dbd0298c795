use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::shutdown::ShutdownSignal;

/// A single-shot scheduled job.
struct Job {
    fire_at: Instant,
    task: BoxFuture<'static, ()>,
}

// [`BinaryHeap`] is a max-heap, so the ordering is reversed to keep the
// earliest deadline on top. Ties are broken arbitrarily.
impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        other.fire_at.cmp(&self.fire_at)
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}

impl Eq for Job {}

/// Runs submitted tasks at (or as soon as possible after) their scheduled
/// instant.
///
/// A single worker sleeps until the earliest deadline, then dispatches
/// every due job onto its own tokio task, so a slow job never delays the
/// worker or other jobs. Jobs scheduled for the past run immediately.
/// Running jobs may submit new jobs, including a resubmission of
/// themselves.
///
/// After the shutdown signal the worker stops dispatching; jobs that were
/// already dispatched run to completion, and later submissions are
/// silently dropped.
#[derive(Clone)]
pub struct TimerWheel {
    submit_tx: mpsc::UnboundedSender<Job>,
}

impl TimerWheel {
    /// Create the wheel and spawn its worker.
    pub fn spawn(shutdown: ShutdownSignal) -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(submit_rx, shutdown));
        Self { submit_tx }
    }

    /// Run `task` at (or as soon as possible after) `at`.
    pub fn run_at(
        &self,
        at: Instant,
        task: impl Future<Output = ()> + Send + 'static,
    ) {
        // After shutdown the worker is gone and the job is dropped,
        // which is the contract.
        let _ = self.submit_tx.send(Job {
            fire_at: at,
            task: Box::pin(task),
        });
    }

    /// Run `task` once `delay` has passed.
    pub fn run_in(
        &self,
        delay: Duration,
        task: impl Future<Output = ()> + Send + 'static,
    ) {
        self.run_at(Instant::now() + delay, task);
    }
}

/// The worker loop: sleep until the heap minimum or a new submission,
/// dispatch everything due, repeat until shutdown.
async fn worker(
    mut submit_rx: mpsc::UnboundedReceiver<Job>,
    mut shutdown: ShutdownSignal,
) {
    let mut jobs = BinaryHeap::new();
    loop {
        let next_deadline = jobs.peek().map(|job: &Job| job.fire_at);
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            maybe_job = submit_rx.recv() => match maybe_job {
                Some(job) => jobs.push(job),
                // Every wheel handle was dropped; nothing can ever be
                // submitted again.
                None => break,
            },
            () = sleep_until_deadline(next_deadline) =>
                dispatch_due(&mut jobs),
        }
    }
    debug!("Timer wheel worker stopped");
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Pop and dispatch every job whose deadline has passed.
fn dispatch_due(jobs: &mut BinaryHeap<Job>) {
    let now = Instant::now();
    while let Some(job) = jobs.peek() {
        if job.fire_at > now {
            return;
        }
        let job = jobs.pop().expect("peek just returned Some");
        trace!("Dispatching scheduled job");
        tokio::spawn(job.task);
    }
}
