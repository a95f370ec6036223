use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

/// Deadline used for delays too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A deferred callback. Runs at most once.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Deferred-callback facility. One instance backs one scheduling epoch of a
/// sequencer and is thrown away on stop.
pub trait Timer: Send + Sync {
    fn schedule_once_after(&self, delay_millis: u64, task: Task);

    /// Drops every task that has not started running yet. The timer accepts
    /// no further work afterwards.
    fn cancel_all_pending(&self);
}

/// Source of "now" and of fresh timers.
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> u64;

    fn new_timer(&self) -> Box<dyn Timer>;
}

/// Wall-clock time backed by [`ThreadTimer`]s.
#[derive(Debug, Clone)]
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn new_timer(&self) -> Box<dyn Timer> {
        Box::new(ThreadTimer::new())
    }
}

enum TimerCommand {
    Schedule { due: Instant, task: Task },
    CancelAll,
}

struct Entry {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap pops the earliest deadline first, and the
    // earliest scheduled among equal deadlines.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Timer with its own dispatch thread, spawned on first use.
pub struct ThreadTimer {
    sender: Mutex<Option<Sender<TimerCommand>>>,
    cancelled: Mutex<bool>,
}

impl ThreadTimer {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            cancelled: Mutex::new(false),
        }
    }
}

impl Default for ThreadTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for ThreadTimer {
    fn schedule_once_after(&self, delay_millis: u64, task: Task) {
        if *self.cancelled.lock() {
            return;
        }
        let now = Instant::now();
        // Delays past what an Instant can hold are parked far out instead.
        let Some(due) = now
            .checked_add(Duration::from_millis(delay_millis))
            .or_else(|| now.checked_add(FAR_FUTURE))
        else {
            return;
        };
        let mut sender = self.sender.lock();
        let tx = sender.get_or_insert_with(|| {
            let (tx, rx) = channel::unbounded();
            thread::spawn(move || dispatch_loop(rx));
            tx
        });
        let _ = tx.send(TimerCommand::Schedule { due, task });
    }

    fn cancel_all_pending(&self) {
        *self.cancelled.lock() = true;
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(TimerCommand::CancelAll);
        }
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.cancel_all_pending();
    }
}

fn dispatch_loop(rx: channel::Receiver<TimerCommand>) {
    let mut queue: BinaryHeap<Entry> = BinaryHeap::new();
    let mut next_seq = 0u64;

    loop {
        let command = match queue.peek() {
            Some(next) => rx.recv_deadline(next.due),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(TimerCommand::Schedule { due, task }) => {
                queue.push(Entry {
                    due,
                    seq: next_seq,
                    task,
                });
                next_seq += 1;
            }
            Ok(TimerCommand::CancelAll) | Err(RecvTimeoutError::Disconnected) => {
                tracing::trace!(dropped = queue.len(), "timer discarded");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                while queue.peek().is_some_and(|entry| entry.due <= now) {
                    if let Some(entry) = queue.pop() {
                        run_task(entry.task);
                    }
                }
            }
        }
    }
}

fn run_task(task: Task) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(%message, "scheduled callback panicked");
    }
}
