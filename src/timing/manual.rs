use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::clock::{Task, TimeSource, Timer};

struct Pending {
    due: u64,
    seq: u64,
    live: Arc<AtomicBool>,
    task: Task,
}

#[derive(Default)]
struct Shared {
    now: AtomicU64,
    next_seq: AtomicU64,
    queue: Mutex<Vec<Pending>>,
}

/// Virtual clock whose time only moves when [`ManualClock::advance`] is
/// called. Every timer it hands out shares its queue, so nested sequencers
/// driven by the same clock interleave deterministically.
#[derive(Clone, Default)]
pub struct ManualClock {
    shared: Arc<Shared>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.shared.now.load(Ordering::SeqCst)
    }

    /// Number of tasks waiting on live timers.
    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .iter()
            .filter(|p| p.live.load(Ordering::SeqCst))
            .count()
    }

    /// Moves time forward, running every task that falls due on the way in
    /// `(deadline, scheduling order)`. Tasks scheduled while advancing run in
    /// the same call if they fall due before the target.
    pub fn advance(&self, millis: u64) {
        let target = self.now().saturating_add(millis);
        loop {
            let next = {
                let mut queue = self.shared.queue.lock();
                let index = queue
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.due <= target)
                    .min_by_key(|(_, p)| (p.due, p.seq))
                    .map(|(i, _)| i);
                index.map(|i| queue.remove(i))
            };
            let Some(pending) = next else {
                break;
            };
            self.shared.now.fetch_max(pending.due, Ordering::SeqCst);
            if pending.live.load(Ordering::SeqCst) {
                (pending.task)();
            }
        }
        self.shared.now.fetch_max(target, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now()
    }

    fn new_timer(&self) -> Box<dyn Timer> {
        Box::new(ManualTimer {
            shared: self.shared.clone(),
            live: Arc::new(AtomicBool::new(true)),
        })
    }
}

pub struct ManualTimer {
    shared: Arc<Shared>,
    live: Arc<AtomicBool>,
}

impl Timer for ManualTimer {
    fn schedule_once_after(&self, delay_millis: u64, task: Task) {
        if !self.live.load(Ordering::SeqCst) {
            return;
        }
        let pending = Pending {
            due: self.shared.now.load(Ordering::SeqCst).saturating_add(delay_millis),
            seq: self.shared.next_seq.fetch_add(1, Ordering::SeqCst),
            live: self.live.clone(),
            task,
        };
        self.shared.queue.lock().push(pending);
    }

    fn cancel_all_pending(&self) {
        self.live.store(false, Ordering::SeqCst);
        // Dropped tasks may own sequencers whose own timers lock the queue on
        // drop, so release the lock before dropping them.
        let discarded: Vec<Pending> = {
            let mut queue = self.shared.queue.lock();
            let (discarded, kept) = std::mem::take(&mut *queue)
                .into_iter()
                .partition(|p| Arc::ptr_eq(&p.live, &self.live));
            *queue = kept;
            discarded
        };
        drop(discarded);
    }
}

impl Drop for ManualTimer {
    fn drop(&mut self) {
        self.cancel_all_pending();
    }
}
