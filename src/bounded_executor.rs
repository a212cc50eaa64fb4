use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::error::{Result, StepError};
use crate::slots::SlotManager;

const POLL: Duration = Duration::from_millis(20);

const RUNNING: u8 = 0;
const TERMINATE: u8 = 1;
const KILL: u8 = 2;

/// Cooperative cancellation shared by the driver, the pool and running bodies.
///
/// Levels only move forward: terminate asks bodies to stop, kill demands it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        let _ = self
            .0
            .compare_exchange(RUNNING, TERMINATE, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn escalate(&self) {
        self.0.store(KILL, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) >= TERMINATE
    }

    pub fn should_kill(&self) -> bool {
        self.0.load(Ordering::SeqCst) >= KILL
    }
}

pub type BoxedJob<T> = Box<dyn FnOnce() -> T + Send + 'static>;

struct Job<T> {
    index: usize,
    run: BoxedJob<T>,
}

enum Msg<T> {
    Done(usize, T),
    Panicked(usize),
    Exited,
}

type Queue<T> = Arc<Mutex<VecDeque<Job<T>>>>;

fn make_queue<T>(jobs: Vec<BoxedJob<T>>) -> Queue<T> {
    Arc::new(Mutex::new(
        jobs.into_iter()
            .enumerate()
            .map(|(index, run)| Job { index, run })
            .collect(),
    ))
}

fn spawn_worker<T: Send + 'static>(queue: Queue<T>, tx: Sender<Msg<T>>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        loop {
            let job = match queue.lock() {
                Ok(mut q) => q.pop_front(),
                Err(_) => None,
            };
            let Some(job) = job else {
                break;
            };
            let msg = match catch_unwind(AssertUnwindSafe(job.run)) {
                Ok(out) => Msg::Done(job.index, out),
                Err(_) => Msg::Panicked(job.index),
            };
            if tx.send(msg).is_err() {
                return;
            }
        }
        let _ = tx.send(Msg::Exited);
    })
}

fn pending<T>(queue: &Queue<T>) -> usize {
    queue.lock().map(|q| q.len()).unwrap_or(0)
}

fn collect<T>(results: Vec<Option<T>>) -> Result<Vec<T>> {
    let expected = results.len();
    let out: Vec<T> = results.into_iter().flatten().collect();
    if out.len() != expected {
        return Err(StepError::Invariant(format!(
            "worker pool output count mismatch (expected {expected}, got {})",
            out.len()
        )));
    }
    Ok(out)
}

/// Run `jobs` on at most `max_parallel` threads, returning outputs in job order.
pub fn run_bounded<T: Send + 'static>(
    max_parallel: usize,
    jobs: Vec<BoxedJob<T>>,
) -> anyhow::Result<Vec<T>> {
    if max_parallel == 0 {
        return Err(anyhow!("max_parallel must be >= 1"));
    }
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let total = jobs.len();
    let queue = make_queue(jobs);
    let (tx, rx) = mpsc::channel();
    let handles: Vec<_> = (0..max_parallel.min(total))
        .map(|_| spawn_worker(Arc::clone(&queue), tx.clone()))
        .collect();
    drop(tx);

    let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
    let mut panicked = Vec::new();
    for msg in rx {
        match msg {
            Msg::Done(i, v) => results[i] = Some(v),
            Msg::Panicked(i) => panicked.push(i),
            Msg::Exited => {}
        }
    }
    for h in handles {
        let _ = h.join();
    }

    if !panicked.is_empty() {
        panicked.sort_unstable();
        return Err(anyhow!("bounded executor job(s) {panicked:?} panicked"));
    }
    Ok(collect(results)?)
}

/// Elastic pool drawing workers from a shared slot budget.
///
/// Starts with the slots available now (waiting for at least one), grows
/// while jobs are still queued and slots free up, and hands each slot back
/// as its worker exits. On cancellation the queue is dropped, running bodies
/// get `grace` to stop before the token escalates to kill, every held slot
/// is released, and `Interrupted` is returned.
pub fn run_pool<T: Send + 'static>(
    jobs: Vec<BoxedJob<T>>,
    slots: &dyn SlotManager,
    max_procs: usize,
    cancel: &CancelToken,
    grace: Duration,
) -> Result<Vec<T>> {
    if max_procs == 0 {
        return Err(StepError::validation("max_procs must be >= 1"));
    }
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let total = jobs.len();
    let mut held = 0usize;
    while held == 0 {
        if cancel.is_cancelled() {
            return Err(StepError::Interrupted);
        }
        held = slots.acquire(total, max_procs);
        if held == 0 {
            thread::sleep(POLL);
        }
    }

    let queue = make_queue(jobs);
    let (tx, rx) = mpsc::channel();
    let mut handles: Vec<_> = (0..held)
        .map(|_| spawn_worker(Arc::clone(&queue), tx.clone()))
        .collect();
    let mut live = held;
    debug!(workers = live, jobs = total, "started substep pool");

    let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
    let mut panicked: Vec<usize> = Vec::new();
    let mut finished = 0usize;

    while finished < total || live > 0 {
        if cancel.is_cancelled() {
            if let Ok(mut q) = queue.lock() {
                q.clear();
            }
            teardown(&rx, &mut live, &mut held, slots, cancel, grace);
            slots.release(held);
            warn!("substep pool interrupted; released all worker slots");
            return Err(StepError::Interrupted);
        }

        match rx.recv_timeout(POLL) {
            Ok(Msg::Done(i, v)) => {
                results[i] = Some(v);
                finished += 1;
            }
            Ok(Msg::Panicked(i)) => {
                panicked.push(i);
                finished += 1;
            }
            Ok(Msg::Exited) => {
                live -= 1;
                held -= 1;
                slots.release(1);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let waiting = pending(&queue);
        if waiting > 0 {
            let extra = slots.acquire(waiting, max_procs);
            if extra > 0 {
                debug!(extra, "growing substep pool");
                for _ in 0..extra {
                    handles.push(spawn_worker(Arc::clone(&queue), tx.clone()));
                }
                live += extra;
                held += extra;
            }
        }
    }

    slots.release(held);
    for h in handles {
        let _ = h.join();
    }

    if let Some(i) = panicked.iter().min() {
        return Err(StepError::Execution(format!("substep {i} worker panicked")));
    }
    collect(results)
}

fn teardown<T>(
    rx: &mpsc::Receiver<Msg<T>>,
    live: &mut usize,
    held: &mut usize,
    slots: &dyn SlotManager,
    cancel: &CancelToken,
    grace: Duration,
) {
    drain_exits(rx, live, held, slots, Instant::now() + grace);
    if *live > 0 {
        warn!(workers = *live, "pool workers still running after grace period; killing");
        cancel.escalate();
        drain_exits(rx, live, held, slots, Instant::now() + grace);
    }
}

fn drain_exits<T>(
    rx: &mpsc::Receiver<Msg<T>>,
    live: &mut usize,
    held: &mut usize,
    slots: &dyn SlotManager,
    deadline: Instant,
) {
    while *live > 0 && Instant::now() < deadline {
        if let Ok(Msg::Exited) = rx.recv_timeout(POLL) {
            *live -= 1;
            *held -= 1;
            slots.release(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::LocalSlots;
    use std::sync::atomic::AtomicUsize;

    fn boxed<T, F>(f: F) -> BoxedJob<T>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Box::new(f)
    }

    #[test]
    fn run_bounded_rejects_zero_parallelism() {
        let err = run_bounded::<usize>(0, vec![]).unwrap_err();
        assert!(err.to_string().contains("max_parallel"), "{err:#}");
    }

    #[test]
    fn run_bounded_keeps_job_order() {
        let jobs = vec![boxed(|| 10usize), boxed(|| 20), boxed(|| 30)];
        assert_eq!(run_bounded(2, jobs).unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn run_bounded_names_panicking_job() {
        let jobs = vec![boxed(|| 1usize), boxed(|| panic!("boom")), boxed(|| 3)];
        let err = run_bounded(2, jobs).unwrap_err();
        assert!(err.to_string().contains("[1]"), "{err:#}");
    }

    #[test]
    fn pool_respects_slot_budget_and_releases_slots() {
        let slots = LocalSlots::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<BoxedJob<usize>> = (0..8usize)
            .map(|i| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                boxed(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                    i
                })
            })
            .collect();

        let out = run_pool(jobs, &slots, 3, &CancelToken::new(), Duration::from_secs(1)).unwrap();
        assert_eq!(out, (0..8).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(slots.in_use(), 0);
    }

    #[test]
    fn pool_waits_for_free_slots() {
        let slots = Arc::new(LocalSlots::new());
        assert_eq!(slots.acquire(2, 2), 2);
        let other = Arc::clone(&slots);
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            other.release(2);
        });

        let jobs: Vec<BoxedJob<usize>> = (0..4usize)
            .map(|i| {
                boxed(move || {
                    thread::sleep(Duration::from_millis(10));
                    i
                })
            })
            .collect();
        let out = run_pool(jobs, &*slots, 2, &CancelToken::new(), Duration::from_secs(1))
            .unwrap();
        releaser.join().unwrap();
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(slots.in_use(), 0);
    }

    #[test]
    fn interrupt_releases_slots_and_escalates() {
        let slots = LocalSlots::new();
        let cancel = CancelToken::new();
        let jobs: Vec<BoxedJob<()>> = (0..4)
            .map(|_| {
                let cancel = cancel.clone();
                boxed(move || {
                    // Ignores terminate; only stops once killed.
                    while !cancel.should_kill() {
                        thread::sleep(Duration::from_millis(5));
                    }
                })
            })
            .collect();

        let trigger = cancel.clone();
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.interrupt();
        });
        let err = run_pool(jobs, &slots, 2, &cancel, Duration::from_millis(50)).unwrap_err();
        interrupter.join().unwrap();
        assert!(matches!(err, StepError::Interrupted));
        assert!(cancel.should_kill());
        assert_eq!(slots.in_use(), 0);
    }
}
