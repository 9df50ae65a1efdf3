use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::{Job, JobPriority};

/// Error returned by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("job pool `{0}` is locked")]
    Locked(String),
    #[error("job pool `{0}` is stopped")]
    Stopped(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Workers exist but are parked until [`Pool::start`].
    Created,
    Running,
    /// Stop requested; workers finish whatever is queued, then exit.
    Draining,
    /// Stop requested; queues were discarded, workers exit at once.
    Halting,
}

struct QueueState {
    queues: [VecDeque<Job>; 5],
    phase: Phase,
    locked: bool,
    title: String,
}

struct Shared {
    state: Mutex<QueueState>,
    signal: Condvar,
}

struct Worker {
    primary: JobPriority,
    retired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// A pool of worker threads multiplexing five FIFO job queues.
///
/// Workers are added with [`Pool::add_worker`] and stay parked until
/// [`Pool::start`]. Every queue operation is guarded by one mutex; pushes
/// broadcast on a single condvar and each woken worker re-checks the queues
/// it serves.
pub struct Pool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<Worker>>,
}

impl Pool {
    pub fn new(title: impl Into<String>) -> Self {
        Pool {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queues: std::array::from_fn(|_| VecDeque::new()),
                    phase: Phase::Created,
                    locked: false,
                    title: title.into(),
                }),
                signal: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one worker serving `classes` in the given order. The first class
    /// is the worker's primary class, used by [`Pool::remove_workers`].
    ///
    /// Workers added before [`Pool::start`] park until the pool runs.
    pub fn add_worker(&self, classes: &[JobPriority]) {
        if classes.is_empty() {
            tracing::warn!("refusing to add a worker with no priority classes");
            return;
        }

        let title = self.shared.state.lock().title.clone();
        let primary = classes[0];
        let retired = Arc::new(AtomicBool::new(false));

        let shared = Arc::clone(&self.shared);
        let classes = classes.to_vec();
        let worker_retired = Arc::clone(&retired);
        let handle = match thread::Builder::new()
            .name(format!("{title}:{primary}"))
            .spawn(move || worker_loop(shared, classes, worker_retired))
        {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!("cannot spawn a worker thread for `{title}`: {err}");
                return;
            }
        };

        self.workers.lock().push(Worker {
            primary,
            retired,
            handle,
        });
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Queue a job under its priority class and wake waiting workers.
    /// Fails when the pool is locked or stopping.
    pub fn push(&self, job: Job) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if state.locked {
            return Err(PoolError::Locked(state.title.clone()));
        }
        match state.phase {
            Phase::Created | Phase::Running => {
                state.queues[job.priority().index()].push_back(job);
                self.shared.signal.notify_all();
                Ok(())
            }
            Phase::Draining | Phase::Halting => Err(PoolError::Stopped(state.title.clone())),
        }
    }

    /// Transition parked workers to running. Idempotent while the pool is
    /// alive; fails once the pool has been stopped.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        match state.phase {
            Phase::Created => {
                state.phase = Phase::Running;
                self.shared.signal.notify_all();
                Ok(())
            }
            Phase::Running => Ok(()),
            Phase::Draining | Phase::Halting => Err(PoolError::Stopped(state.title.clone())),
        }
    }

    /// When locked, [`Pool::push`] fails; running workers are unaffected.
    /// Used during controlled teardown to cut off new work.
    pub fn lock(&self, locked: bool) {
        self.shared.state.lock().locked = locked;
    }

    /// Stop the pool and join every worker. With `drain`, queued jobs are
    /// finished first; otherwise the queues are discarded.
    ///
    /// Idempotent. A worker stuck inside a `LongTerm` job is only joined once
    /// that job returns, so drivers must be cancelled before stopping their
    /// pool.
    pub fn stop(&self, drain: bool) {
        {
            let mut state = self.shared.state.lock();
            match state.phase {
                Phase::Halting => {}
                Phase::Draining if drain => {}
                _ => {
                    state.phase = if drain { Phase::Draining } else { Phase::Halting };
                    if !drain {
                        for queue in &mut state.queues {
                            queue.clear();
                        }
                    }
                }
            }
            self.shared.signal.notify_all();
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.handle.join();
        }
    }

    /// Detach and terminate every worker whose primary class is `priority`.
    pub fn remove_workers(&self, priority: JobPriority) {
        let removed: Vec<Worker> = {
            let mut workers = self.workers.lock();
            let (gone, keep) = workers.drain(..).partition(|w| w.primary == priority);
            *workers = keep;
            gone
        };
        for worker in &removed {
            worker.retired.store(true, Ordering::Relaxed);
        }
        self.shared.signal.notify_all();
        for worker in removed {
            let _ = worker.handle.join();
        }
    }

    /// Retitle the pool. Worker OS threads are named at spawn, so the new
    /// title applies to workers added afterwards and to log events.
    pub fn thread_title(&self, title: impl Into<String>) {
        self.shared.state.lock().title = title.into();
    }

    pub fn title(&self) -> String {
        self.shared.state.lock().title.clone()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.stop(false);
    }
}

fn worker_loop(shared: Arc<Shared>, classes: Vec<JobPriority>, retired: Arc<AtomicBool>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if retired.load(Ordering::Relaxed) {
                    return;
                }
                match state.phase {
                    Phase::Halting => return,
                    Phase::Draining => match pop_next(&mut state, &classes) {
                        Some(job) => break job,
                        None => return,
                    },
                    Phase::Created => shared.signal.wait(&mut state),
                    Phase::Running => match pop_next(&mut state, &classes) {
                        Some(job) => break job,
                        None => shared.signal.wait(&mut state),
                    },
                }
            }
        };

        let label = job.label().to_string();
        if let Err(err) = job.run() {
            tracing::error!("job `{label}` failed: {err}");
        }
    }
}

/// Pop the next job in the worker's configured class order. Higher-configured
/// classes starve lower ones on purpose.
fn pop_next(state: &mut QueueState, classes: &[JobPriority]) -> Option<Job> {
    for class in classes {
        if let Some(job) = state.queues[class.index()].pop_front() {
            return Some(job);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobError;
    use std::sync::mpsc;
    use std::time::Duration;

    fn recv_all(rx: &mpsc::Receiver<usize>, count: usize) -> Vec<usize> {
        (0..count)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("job timed out"))
            .collect()
    }

    #[test]
    fn fifo_within_one_class() {
        let pool = Pool::new("fifo-test");
        pool.add_worker(&[JobPriority::Normal]);

        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.push(Job::new(JobPriority::Normal, format!("job-{i}"), move || {
                tx.send(i).ok();
                Ok(())
            }))
            .unwrap();
        }
        pool.start().unwrap();

        assert_eq!(recv_all(&rx, 10), (0..10).collect::<Vec<_>>());
        pool.stop(true);
    }

    #[test]
    fn worker_drains_classes_in_configured_order() {
        let pool = Pool::new("order-test");
        pool.add_worker(&[JobPriority::Normal, JobPriority::High]);

        // Queue High before Normal; the worker must still drain Normal first.
        let (tx, rx) = mpsc::channel();
        for (i, priority) in [
            (0usize, JobPriority::High),
            (1, JobPriority::High),
            (2, JobPriority::Normal),
            (3, JobPriority::Normal),
        ] {
            let tx = tx.clone();
            pool.push(Job::new(priority, format!("job-{i}"), move || {
                tx.send(i).ok();
                Ok(())
            }))
            .unwrap();
        }
        pool.start().unwrap();

        assert_eq!(recv_all(&rx, 4), vec![2, 3, 0, 1]);
        pool.stop(true);
    }

    #[test]
    fn failed_job_does_not_kill_worker() {
        let pool = Pool::new("failure-test");
        pool.add_worker(&[JobPriority::Normal]);
        pool.start().unwrap();

        let (tx, rx) = mpsc::channel();
        pool.push(Job::new(JobPriority::Normal, "failing", || {
            Err(JobError::new("intentional"))
        }))
        .unwrap();
        pool.push(Job::new(JobPriority::Normal, "after-failure", move || {
            tx.send(1).ok();
            Ok(())
        }))
        .unwrap();

        assert_eq!(recv_all(&rx, 1), vec![1]);
        pool.stop(true);
    }

    #[test]
    fn push_fails_when_locked_or_stopped() {
        let pool = Pool::new("gate-test");
        pool.add_worker(&[JobPriority::Normal]);
        pool.start().unwrap();

        pool.lock(true);
        let err = pool
            .push(Job::new(JobPriority::Normal, "locked-out", || Ok(())))
            .unwrap_err();
        assert!(matches!(err, PoolError::Locked(_)));
        pool.lock(false);

        pool.stop(true);
        let err = pool
            .push(Job::new(JobPriority::Normal, "stopped-out", || Ok(())))
            .unwrap_err();
        assert!(matches!(err, PoolError::Stopped(_)));
        assert!(pool.start().is_err());
    }

    #[test]
    fn stop_with_drain_finishes_queued_jobs() {
        let pool = Pool::new("drain-test");
        pool.add_worker(&[JobPriority::Low]);

        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            pool.push(Job::new(JobPriority::Low, format!("drain-{i}"), move || {
                tx.send(i).ok();
                Ok(())
            }))
            .unwrap();
        }
        pool.start().unwrap();
        pool.stop(true);

        assert_eq!(recv_all(&rx, 5), (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn stop_without_drain_discards_queues() {
        let pool = Pool::new("discard-test");
        pool.add_worker(&[JobPriority::Low]);

        let (tx, rx) = mpsc::channel::<usize>();
        for i in 0..5 {
            let tx = tx.clone();
            pool.push(Job::new(JobPriority::Low, format!("ghost-{i}"), move || {
                tx.send(i).ok();
                Ok(())
            }))
            .unwrap();
        }
        // Never started; discard-stop must not run anything.
        pool.stop(false);
        drop(tx);

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn remove_workers_matches_primary_class() {
        let pool = Pool::new("remove-test");
        pool.add_worker(&[JobPriority::Low, JobPriority::High]);
        pool.add_worker(&[JobPriority::High]);
        pool.start().unwrap();
        assert_eq!(pool.worker_count(), 2);

        pool.remove_workers(JobPriority::Low);
        assert_eq!(pool.worker_count(), 1);

        // The surviving High worker still executes.
        let (tx, rx) = mpsc::channel();
        pool.push(Job::new(JobPriority::High, "survivor", move || {
            tx.send(7).ok();
            Ok(())
        }))
        .unwrap();
        assert_eq!(recv_all(&rx, 1), vec![7]);
        pool.stop(true);
    }

    #[test]
    fn payload_jobs_receive_their_bytes() {
        let pool = Pool::new("payload-test");
        pool.add_worker(&[JobPriority::Normal]);
        pool.start().unwrap();

        let (tx, rx) = mpsc::channel();
        pool.push(Job::with_payload(
            JobPriority::Normal,
            "payload",
            vec![1, 2, 3],
            move |bytes| {
                tx.send(bytes.len()).ok();
                Ok(())
            },
        ))
        .unwrap();

        assert_eq!(recv_all(&rx, 1), vec![3]);
        pool.stop(true);
    }
}
