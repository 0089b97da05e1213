//! Deadline bookkeeping for a loop: sleeps, idle waits and I/O timeouts each
//! keep a `TimerSet` of `Moment`s ordered by absolute millisecond deadline.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use crate::task::{self, Task};

/// A scheduled deadline associated with a suspended task.
///
/// Moments are stack-allocated by the waiting task and inserted/removed by
/// raw pointer around the suspension; exactly one of the outcome flags is
/// set by the time the task resumes.
pub(crate) struct Moment {
    pub(crate) deadline: u64,
    pub(crate) task: *mut Task,
    seq: Cell<u64>,
    pub(crate) reached: Cell<bool>,
    pub(crate) removed: Cell<bool>,
    pub(crate) shutdown: Cell<bool>,
}

impl Moment {
    pub(crate) fn new(deadline: u64, task: *mut Task) -> Moment {
        Moment {
            deadline,
            task,
            seq: Cell::new(0),
            reached: Cell::new(false),
            removed: Cell::new(false),
            shutdown: Cell::new(false),
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut Moment {
        self as *const Moment as *mut Moment
    }
}

/// Ordered set of moments. Entries with equal deadlines fire in insertion
/// order; callers must not rely on that.
pub(crate) struct TimerSet {
    entries: RefCell<BTreeMap<(u64, u64), *mut Moment>>,
    next_seq: Cell<u64>,
}

impl TimerSet {
    pub(crate) fn new() -> TimerSet {
        TimerSet {
            entries: RefCell::new(BTreeMap::new()),
            next_seq: Cell::new(0),
        }
    }

    /// O(log n). The moment must stay pinned until it is detached by
    /// `remove`, `tick` or `shutdown`.
    pub(crate) fn add(&self, moment: *mut Moment) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);

        let moment_ref = unsafe { &*moment };
        moment_ref.seq.set(seq);
        moment_ref.reached.set(false);
        moment_ref.removed.set(false);
        moment_ref.shutdown.set(false);

        self.entries
            .borrow_mut()
            .insert((moment_ref.deadline, seq), moment);
    }

    /// O(log n). Marks the moment `removed` if it was still pending; a
    /// moment already detached by `tick` or `shutdown` keeps its outcome.
    pub(crate) fn remove(&self, moment: *mut Moment) {
        let moment = unsafe { &*moment };
        let key = (moment.deadline, moment.seq.get());

        if self.entries.borrow_mut().remove(&key).is_some() {
            moment.removed.set(true);
        }
    }

    /// Detach every moment with `deadline <= now`, mark it reached and
    /// resume its task, in deadline order. Returns how many fired.
    ///
    /// Detaching happens before the first resume: a resumed task is free to
    /// add or remove moments on this same set.
    pub(crate) fn tick(&self, now: u64) -> u64 {
        let due: Vec<*mut Moment> = {
            let mut entries = self.entries.borrow_mut();
            let pending = entries.split_off(&(now + 1, 0));
            let due = std::mem::replace(&mut *entries, pending);
            due.into_values().collect()
        };

        let count = due.len() as u64;
        for moment in due {
            unsafe {
                (*moment).reached.set(true);
                // The moment lives on the resumed task's stack; it is gone
                // the moment the task runs, so no touching it afterwards.
                task::resume((*moment).task);
            }
        }

        count
    }

    /// Detach everything, marking each moment `shutdown` and resuming its
    /// task so it can observe the cancellation.
    pub(crate) fn shutdown(&self) {
        let all: Vec<*mut Moment> = {
            let mut entries = self.entries.borrow_mut();
            std::mem::take(&mut *entries).into_values().collect()
        };

        for moment in all {
            unsafe {
                (*moment).shutdown.set(true);
                task::resume((*moment).task);
            }
        }
    }

    /// Minimum pending deadline, or 0 when the set is empty.
    pub(crate) fn nearest(&self) -> u64 {
        self.entries
            .borrow()
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::{Moment, TimerSet};
    use std::ptr;

    #[test]
    fn nearest_tracks_minimum() {
        let set = TimerSet::new();
        assert_eq!(set.nearest(), 0);

        let m1 = Moment::new(300, ptr::null_mut());
        let m2 = Moment::new(100, ptr::null_mut());
        let m3 = Moment::new(200, ptr::null_mut());

        set.add(m1.as_ptr());
        assert_eq!(set.nearest(), 300);
        set.add(m2.as_ptr());
        assert_eq!(set.nearest(), 100);
        set.add(m3.as_ptr());
        assert_eq!(set.nearest(), 100);

        set.remove(m2.as_ptr());
        assert!(m2.removed.get());
        assert_eq!(set.nearest(), 200);
    }

    #[test]
    fn remove_is_idempotent_after_detach() {
        let set = TimerSet::new();
        let moment = Moment::new(50, ptr::null_mut());

        set.add(moment.as_ptr());
        set.remove(moment.as_ptr());
        assert!(moment.removed.get());

        // A second remove finds nothing and must not disturb the outcome.
        moment.removed.set(false);
        set.remove(moment.as_ptr());
        assert!(!moment.removed.get());
    }

    #[test]
    fn equal_deadlines_keep_distinct_entries() {
        let set = TimerSet::new();
        let m1 = Moment::new(100, ptr::null_mut());
        let m2 = Moment::new(100, ptr::null_mut());

        set.add(m1.as_ptr());
        set.add(m2.as_ptr());

        set.remove(m1.as_ptr());
        assert!(m1.removed.get());
        assert!(!m2.removed.get());
        assert_eq!(set.nearest(), 100);
    }
}
