//! Single-threaded timer used for call deadlines and periodic state ticks.
//!
//! All timers of every breaker, group and bucket share one thread, so their
//! callbacks run one after the other. A slow callback delays the others.
//!
//! Dropping the [`Scheduler`] runs every pending one-shot task right away and
//! discards the periodic ones, so a deadline never leaves its call hanging.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::mem;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

// Deadlines too far out to represent are clamped to this horizon.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

type OnceTask = Box<dyn FnOnce() + Send + 'static>;
type PeriodicTask = Box<dyn FnMut() -> ControlFlow<()> + Send + 'static>;

enum Job {
    Once(OnceTask),
    Periodic { period: Duration, tick: PeriodicTask },
}

struct Entry {
    due: Instant,
    seq: u64,
    job: Job,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

impl Queue {
    fn push(&mut self, mut entry: Entry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(entry);
    }
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Handle to a scheduled task.
///
/// Cancelling is best-effort: a task that already started keeps running.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevents any further run of the task. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A single-threaded scheduler for one-shot and fixed-rate tasks.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Starts a scheduler whose thread is called `name`.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&worker))?;

        debug!(thread = name, "scheduler started");
        Ok(Self { shared })
    }

    /// Runs `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(delay, Job::Once(Box::new(task)))
    }

    /// Runs `tick` after `initial_delay` and then every `period` until it
    /// returns [`ControlFlow::Break`] or the handle is cancelled.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        tick: F,
    ) -> TimerHandle
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        self.enqueue(
            initial_delay,
            Job::Periodic {
                period,
                tick: Box::new(tick),
            },
        )
    }

    /// Number of queued tasks, including cancelled ones not yet discarded.
    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    fn enqueue(&self, delay: Duration, job: Job) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            due: deadline(Instant::now(), delay),
            seq: 0,
            job,
            cancelled: Arc::clone(&cancelled),
        };

        self.shared.queue.lock().push(entry);
        self.shared.available.notify_one();

        TimerHandle { cancelled }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

fn deadline(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

fn run(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            let pending = mem::take(&mut queue.heap);
            drop(queue);
            drain(pending);
            debug!("scheduler stopped");
            return;
        }

        match queue.heap.peek().map(|entry| entry.due) {
            None => shared.available.wait(&mut queue),
            Some(due) if due > Instant::now() => {
                shared.available.wait_until(&mut queue, due);
            }
            Some(_) => {
                let Some(entry) = queue.heap.pop() else {
                    continue;
                };
                if entry.cancelled.load(Ordering::Acquire) {
                    continue;
                }
                let next = MutexGuard::unlocked(&mut queue, || fire(entry));
                if let Some(next) = next {
                    queue.push(next);
                }
            }
        }
    }
}

// Runs the one-shot tasks left behind at shutdown, earliest first.
fn drain(pending: BinaryHeap<Entry>) {
    for entry in pending.into_sorted_vec().into_iter().rev() {
        if entry.cancelled.load(Ordering::Acquire) {
            continue;
        }
        if let Job::Once(task) = entry.job {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                warn!("scheduled task panicked");
            }
        }
    }
}

/// Runs a due entry and returns it again if it must be rescheduled.
fn fire(entry: Entry) -> Option<Entry> {
    let Entry {
        due,
        job,
        cancelled,
        ..
    } = entry;

    match job {
        Job::Once(task) => {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                warn!("scheduled task panicked");
            }
            None
        }
        Job::Periodic { period, mut tick } => {
            match panic::catch_unwind(AssertUnwindSafe(&mut tick)) {
                Ok(ControlFlow::Continue(())) if !cancelled.load(Ordering::Acquire) => {
                    Some(Entry {
                        due: deadline(due, period),
                        seq: 0,
                        job: Job::Periodic { period, tick },
                        cancelled,
                    })
                }
                Ok(_) => None,
                Err(_) => {
                    warn!("periodic task panicked, unscheduling it");
                    None
                }
            }
        }
    }
}
