//! Worker pool for genuinely blocking calls.
//!
//! File opens, closes, stats and the Linux file read/write path run here so
//! the loop thread never blocks. A work item carries the originating loop
//! and task; the worker runs the item's entry to completion, and the entry
//! finishes by reposting the task to its loop.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{trace, warn};

use crate::event_loop::Loop;
use crate::task::Task;
use crate::util::{not_on_loop, SendPtr};

pub(crate) const DEFAULT_WORKERS: usize = 4;

/// One unit of blocking work. Stack-allocated by the submitting task; the
/// pointer stays valid because the submitter suspends until the entry
/// reposted it.
pub(crate) struct Work {
    pub(crate) entry: unsafe fn(&mut Work),
    pub(crate) owner: *const Loop,
    pub(crate) task: *mut Task,
    pub(crate) arg: *mut (),
}

impl Work {
    pub(crate) fn new(entry: unsafe fn(&mut Work), arg: *mut ()) -> Work {
        Work {
            entry,
            owner: std::ptr::null(),
            task: std::ptr::null_mut(),
            arg,
        }
    }
}

struct State {
    queue: VecDeque<SendPtr>,
    idle: usize,
    workers: Vec<JoinHandle<()>>,
}

struct Pool {
    state: Mutex<State>,
    condition: Condvar,
    shutdown: AtomicBool,
}

struct Registry {
    users: usize,
    pool: Option<Arc<Pool>>,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    users: 0,
    pool: None,
});

fn spawn_pool(threads: usize) -> io::Result<Arc<Pool>> {
    let pool = Arc::new(Pool {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            idle: 0,
            workers: Vec::new(),
        }),
        condition: Condvar::new(),
        shutdown: AtomicBool::new(false),
    });

    let mut workers = Vec::with_capacity(threads);
    for _ in 0..threads {
        let pool = Arc::clone(&pool);
        workers.push(
            thread::Builder::new()
                .name("corio-worker".to_owned())
                .spawn(move || worker(pool))?,
        );
    }
    pool.state.lock().unwrap().workers = workers;

    Ok(pool)
}

/// Bring the pool up with `threads` workers, counting the caller as a user.
/// Subsequent inits share the running pool.
pub(crate) fn init(threads: usize) -> io::Result<()> {
    let mut registry = REGISTRY.lock().unwrap();
    if registry.pool.is_none() {
        registry.pool = Some(spawn_pool(threads)?);
    }
    registry.users += 1;
    Ok(())
}

/// Drop one usage; the last user tears the pool down. Workers finish their
/// current item and exit; pending items are not guaranteed to run.
pub(crate) fn shutdown() {
    let pool = {
        let mut registry = REGISTRY.lock().unwrap();
        if registry.users == 0 {
            return;
        }
        registry.users -= 1;
        if registry.users > 0 {
            return;
        }
        registry.pool.take()
    };

    let Some(pool) = pool else { return };

    pool.shutdown.store(true, Ordering::Release);
    let workers = {
        let mut state = pool.state.lock().unwrap();
        pool.condition.notify_all();
        std::mem::take(&mut state.workers)
    };

    for worker in workers {
        if worker.join().is_err() {
            warn!("worker thread panicked during shutdown");
        }
    }
}

fn handle() -> io::Result<Arc<Pool>> {
    let mut registry = REGISTRY.lock().unwrap();
    if registry.pool.is_none() {
        // Lazily created pools are process-lived; only counted users from
        // the run harness participate in teardown.
        registry.pool = Some(spawn_pool(DEFAULT_WORKERS)?);
    }
    Ok(Arc::clone(registry.pool.as_ref().expect("pool just created")))
}

/// Submit `work` on behalf of the calling task. The caller must suspend
/// right after; the entry reposts the task when the work is done.
pub(crate) fn post(work: *mut Work) -> io::Result<()> {
    let lp = Loop::current().ok_or_else(not_on_loop)?;

    unsafe {
        (*work).owner = lp;
        (*work).task = lp.current_task();
    }

    let pool = handle()?;
    let mut state = pool.state.lock().unwrap();
    state.queue.push_back(SendPtr(work as *mut ()));
    if state.idle > 0 {
        pool.condition.notify_one();
    }

    Ok(())
}

/// Return a finished work item's task to its loop. Entries call this last.
pub(crate) unsafe fn finish(work: &mut Work) {
    let lp = &*work.owner;
    if let Err(err) = lp.post_task(work.task) {
        warn!("failed to repost worker task: {}", err);
    }
}

fn worker(pool: Arc<Pool>) {
    loop {
        let work = {
            let mut state = pool.state.lock().unwrap();
            loop {
                if pool.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(work) = state.queue.pop_front() {
                    break work;
                }

                state.idle += 1;
                state = pool.condition.wait(state).unwrap();
                state.idle -= 1;
            }
        };

        if pool.shutdown.load(Ordering::Acquire) {
            return;
        }

        trace!("worker: running item");
        unsafe {
            let work = work.0 as *mut Work;
            ((*work).entry)(&mut *work);
        }
    }
}
