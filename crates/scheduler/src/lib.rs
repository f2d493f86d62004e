//! A monotonic-clock priority queue scheduler (§4.G). Entries never
//! reorder relative to other entries with an equal deadline; cancelled
//! entries are dropped on pop without invocation; drift is not
//! accumulated because callers reschedule their own successor from their
//! own wake-up time.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

type Callable = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    callable: Callable,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline (and,
        // for ties, the earliest-inserted entry) sorts first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A handle to a scheduled entry. Dropping it does not cancel the entry;
/// call [`ScheduleHandle::cancel`] explicitly.
#[derive(Clone)]
pub struct ScheduleHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduleHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Entry>>,
    notify: Notify,
    seq: AtomicU64,
    stopped: AtomicBool,
}

/// The scheduler itself. Cloning shares the same underlying queue and
/// worker task.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Spawns the worker task and returns a handle to the queue.
    pub fn start() -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });
        let scheduler = Scheduler { shared: shared.clone() };
        tokio::spawn(run_worker(shared));
        scheduler
    }

    pub fn schedule(&self, delay: std::time::Duration, callable: Callable) -> ScheduleHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let seq = self.shared.seq.fetch_add(1, AtomicOrdering::SeqCst);
        let entry = Entry {
            deadline: Instant::now() + delay,
            seq,
            cancelled: cancelled.clone(),
            callable,
        };
        self.shared.heap.lock().push(entry);
        self.shared.notify.notify_one();
        ScheduleHandle { cancelled }
    }

    /// Stops the worker loop after its current wake-up cycle.
    pub fn stop(&self) {
        self.shared.stopped.store(true, AtomicOrdering::SeqCst);
        self.shared.notify.notify_one();
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        if shared.stopped.load(AtomicOrdering::SeqCst) {
            return;
        }

        let next_deadline = { shared.heap.lock().peek().map(|e| e.deadline) };

        match next_deadline {
            None => shared.notify.notified().await,
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = shared.notify.notified() => continue,
                }
            }
        }

        if shared.stopped.load(AtomicOrdering::SeqCst) {
            return;
        }

        let due = drain_due(&shared);
        for entry in due {
            if !entry.cancelled.load(AtomicOrdering::SeqCst) {
                (entry.callable)();
            } else {
                trace!("dropping cancelled scheduler entry");
            }
        }
    }
}

fn drain_due(shared: &Shared) -> Vec<Entry> {
    let now = Instant::now();
    let mut heap = shared.heap.lock();
    let mut due = Vec::new();
    while let Some(entry) = heap.peek() {
        if entry.deadline > now {
            break;
        }
        due.push(heap.pop().unwrap());
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn earliest_deadline_runs_first() {
        let scheduler = Scheduler::start();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        scheduler.schedule(Duration::from_millis(50), Box::new(move || o1.lock().push(1)));
        let o2 = order.clone();
        scheduler.schedule(Duration::from_millis(10), Box::new(move || o2.lock().push(2)));

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        assert_eq!(*order.lock(), vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_entry_is_dropped_on_pop() {
        let scheduler = Scheduler::start();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let handle = scheduler.schedule(Duration::from_millis(10), Box::new(move || {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        }));
        handle.cancel();

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_deadlines_preserve_insertion_order() {
        let scheduler = Scheduler::start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let deadline = Duration::from_millis(10);

        for i in 0..5 {
            let o = order.clone();
            scheduler.schedule(deadline, Box::new(move || o.lock().push(i)));
        }

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_after_start_wakes_the_sleeping_worker() {
        let scheduler = Scheduler::start();
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        scheduler.schedule(Duration::from_millis(5), Box::new(move || {
            let _ = tx.take().unwrap().send(());
        }));
        tokio::time::advance(Duration::from_millis(20)).await;
        rx.await.unwrap();
    }
}
