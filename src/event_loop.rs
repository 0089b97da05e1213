//! Per-thread cooperative scheduler driving a readiness/completion backend.
//!
//! A `Loop` is pinned to one OS thread for its lifetime. All of its mutable
//! state is owned by that thread; the only externally writable pieces are
//! the shutdown flag, the reference count and the MPSC inbox, which is how
//! other threads hand it work.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use log::{trace, warn};

use crate::queue::Queue;
use crate::sys;
use crate::task::{self, Entry, Task};
use crate::time;
use crate::timer::{Moment, TimerSet};
use crate::util::{not_on_loop, SendPtr};
use crate::Config;

thread_local! {
    static CURRENT_LOOP: Cell<*const Loop> = const { Cell::new(ptr::null()) };
}

/// Dispatch record for a handle registered with a loop's selector. The
/// record's address is the registration token; it must stay pinned while
/// the handle is registered.
pub(crate) struct Registration {
    dispatch: Cell<unsafe fn(*mut (), &sys::Event)>,
    data: Cell<*mut ()>,
}

impl Registration {
    pub(crate) fn new(dispatch: unsafe fn(*mut (), &sys::Event)) -> Registration {
        Registration {
            dispatch: Cell::new(dispatch),
            data: Cell::new(ptr::null_mut()),
        }
    }

    pub(crate) fn set_data(&self, data: *mut ()) {
        self.data.set(data);
    }

    /// Redirect future events, used when a connecting socket becomes a
    /// regular stream.
    pub(crate) fn set_dispatch(&self, dispatch: unsafe fn(*mut (), &sys::Event)) {
        self.dispatch.set(dispatch);
    }

    pub(crate) fn token(&self) -> u64 {
        self as *const Registration as u64
    }
}

unsafe fn dispatch_event(token: u64, event: &sys::Event) {
    let registration = token as usize as *const Registration;
    ((*registration).dispatch.get())((*registration).data.get(), event);
}

/// A per-thread event-driven scheduler owning a poll backend, three timer
/// sets and an inbox of cross-thread work.
pub struct Loop {
    refs: AtomicU64,
    shutdown: AtomicU64,
    last_activity: Cell<u64>,

    // Task scheduler state; owning thread only.
    current: Cell<*mut Task>,
    prev: Cell<*mut Task>,
    main: UnsafeCell<Task>,
    yield_slot: Cell<*mut ()>,

    pub(crate) sleeps: TimerSet,
    pub(crate) idles: TimerSet,
    pub(crate) timeouts: TimerSet,

    inbox: Queue,

    pub(crate) selector: sys::Selector,
    waker: sys::Waker,

    entry: UnsafeCell<Option<Entry>>,
    stack_size: usize,
    events_capacity: usize,
}

// The cross-thread surface is `refs`, `shutdown` and the inbox; everything
// else is only touched by the owning thread. See the module docs.
unsafe impl Send for Loop {}
unsafe impl Sync for Loop {}

impl Loop {
    pub(crate) fn new(config: &Config) -> io::Result<Box<Loop>> {
        let selector = sys::Selector::new()?;
        let waker = sys::Waker::new()?;

        let lp = Box::new(Loop {
            refs: AtomicU64::new(1),
            shutdown: AtomicU64::new(0),
            last_activity: Cell::new(0),
            current: Cell::new(ptr::null_mut()),
            prev: Cell::new(ptr::null_mut()),
            main: UnsafeCell::new(Task::main_stub()),
            yield_slot: Cell::new(ptr::null_mut()),
            sleeps: TimerSet::new(),
            idles: TimerSet::new(),
            timeouts: TimerSet::new(),
            inbox: Queue::new(),
            selector,
            waker,
            entry: UnsafeCell::new(None),
            stack_size: config.stack_size,
            events_capacity: config.events_capacity,
        });

        lp.selector.register_waker(&lp.waker)?;

        unsafe {
            (*lp.main.get()).owner.set(&*lp);
            lp.current.set(lp.main.get());
        }

        Ok(lp)
    }

    /// The loop bound to the calling thread, if any.
    pub(crate) fn current<'a>() -> Option<&'a Loop> {
        let ptr = CURRENT_LOOP.with(|current| current.get());
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    fn current_ptr() -> *const Loop {
        CURRENT_LOOP.with(|current| current.get())
    }

    /// Spawn a fresh OS thread running a new loop; the returned handle keeps
    /// the loop alive until dropped.
    pub fn start() -> io::Result<LoopRef> {
        Loop::start_config(Config::default())
    }

    pub fn start_config(config: Config) -> io::Result<LoopRef> {
        is_send::<LoopRef>();
        is_sync::<LoopRef>();

        let lp = Loop::new(&config)?;
        let raw = Box::into_raw(lp);

        // One reference for the loop thread (released when `run` exits) was
        // taken at construction; one more for the handle we hand back.
        unsafe { (*raw).ref_() };
        let handle = LoopRef {
            ptr: unsafe { NonNull::new_unchecked(raw) },
        };

        let send = SendPtr(raw as *mut ());
        let spawned = thread::Builder::new()
            .name("corio-loop".to_owned())
            .spawn(move || {
                let send = send;
                let lp = send.0 as *mut Loop;
                unsafe { (*lp).run() };
            });

        if let Err(err) = spawned {
            // Nothing is running; reclaim both references.
            unsafe {
                (*raw).unref();
                (*raw).unref();
            }
            std::mem::forget(handle);
            return Err(err);
        }

        Ok(handle)
    }

    /// Request shutdown. Non-blocking: sets the flag and wakes the loop so
    /// it can observe it; the flag only ever goes 0 → 1.
    pub fn stop(&self) {
        let first = self
            .shutdown
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if first && !ptr::eq(Loop::current_ptr(), self) {
            if let Err(err) = self.waker.wake() {
                warn!("failed to wake loop for shutdown: {}", err);
            }
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) != 0
    }

    pub(crate) fn ref_(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unref(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last reference anywhere; reclaim the allocation.
            unsafe { drop(Box::from_raw(self as *const Loop as *mut Loop)) };
        }
    }

    /// Enqueue `entry` as a new task. Always asynchronous, even when posting
    /// to the calling thread's own loop.
    pub fn post<F>(&self, entry: F) -> io::Result<()>
    where
        F: FnOnce(&Loop) + Send + 'static,
    {
        let task = task::create(Box::new(entry), self.stack_size)?;
        self.post_task(task)
    }

    /// Enqueue an existing task for resumption and wake the loop. This is
    /// the path worker threads and the event dispatcher use to return a
    /// suspended task to its loop.
    pub(crate) fn post_task(&self, task: *mut Task) -> io::Result<()> {
        self.inbox.push(task::node_ptr(task));
        self.waker.wake()
    }

    /// Run `f` on this loop and return once it completed.
    ///
    /// On the loop's own thread the closure is called inline. From a task on
    /// another loop, a trampoline task is posted here and the caller
    /// suspends until its own loop gets it back.
    pub fn exec<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&Loop) + Send,
    {
        if ptr::eq(Loop::current_ptr(), self) {
            f(self);
            return Ok(());
        }

        let origin = Loop::current().ok_or_else(not_on_loop)?;

        struct ExecRequest {
            origin: *const Loop,
            task: *mut Task,
            f: *mut (),
            call: unsafe fn(*mut (), &Loop),
        }

        unsafe fn call<F: FnOnce(&Loop)>(f: *mut (), destination: &Loop) {
            let f = (*(f as *mut Option<F>))
                .take()
                .expect("exec closure already consumed");
            f(destination);
        }

        let mut f = Some(f);
        let request = ExecRequest {
            origin,
            task: origin.current_task(),
            f: &mut f as *mut Option<F> as *mut (),
            call: call::<F>,
        };

        // The request and closure live in this task's frame, which stays
        // alive across the suspension below; the destination loop reposts
        // the task only after the closure ran, so the erased pointers never
        // outlive their referents.
        let request_ptr = SendPtr(&request as *const ExecRequest as *mut ());
        self.post(move |destination: &Loop| unsafe {
            let request_ptr = request_ptr;
            let request = &*(request_ptr.0 as *const ExecRequest);
            (request.call)(request.f, destination);
            if let Err(err) = (*request.origin).post_task(request.task) {
                warn!("failed to return exec caller to its loop: {}", err);
            }
        })?;

        unsafe { task::suspend(origin.current_task()) }
    }

    /// Suspend the calling task until the loop has seen no events for
    /// `milliseconds`. The idle timer only advances on poll timeouts, never
    /// while real I/O is flowing.
    pub fn idle(&self, milliseconds: u64) -> io::Result<()> {
        if !ptr::eq(Loop::current_ptr(), self) {
            return Err(not_on_loop());
        }

        self.wait_on(&self.idles, milliseconds)
    }

    fn wait_on(&self, set: &TimerSet, milliseconds: u64) -> io::Result<()> {
        let current = self.current_task();
        if current == self.main_task() {
            return Err(io::Error::from_raw_os_error(sys::ecode::EDEADLK));
        }

        let moment = Moment::new(time::now_ms() + milliseconds, current);
        set.add(moment.as_ptr());

        if let Err(err) = unsafe { task::suspend(current) } {
            set.remove(moment.as_ptr());
            return Err(err);
        }

        if moment.removed.get() || moment.shutdown.get() {
            return Err(io::Error::from_raw_os_error(sys::ecode::ECANCELED));
        }

        // Reached.
        Ok(())
    }

    /// Drive the loop on the calling thread until shutdown.
    pub(crate) fn run(&self) {
        CURRENT_LOOP.with(|current| current.set(self));

        if let Some(entry) = unsafe { (*self.entry.get()).take() } {
            if let Err(err) = self.post(move |lp| entry(lp)) {
                warn!("failed to post loop entry: {}", err);
            }
        }

        let mut events = sys::Events::with_capacity(self.events_capacity);
        let mut now = time::now_ms();
        self.last_activity.set(now);

        loop {
            if self.sleeps.tick(now) > 0 {
                now = time::now_ms();
                self.last_activity.set(now);
            }

            let timeout = self.nearest_event_delta(now);

            if self.is_shutdown() {
                break;
            }

            let polled = self.selector.select(&mut events, timeout);
            now = time::now_ms();

            match polled {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("selector failed, shutting loop down: {}", err);
                    break;
                }
            }

            if !events.is_empty() {
                for event in events.iter() {
                    let token = sys::event::token(event);
                    if token == sys::WAKER_TOKEN {
                        self.waker.drain();
                    } else {
                        unsafe { dispatch_event(token, event) };
                    }

                    self.last_activity.set(time::now_ms());
                }

                self.process_inbox();

                now = time::now_ms();
                self.last_activity.set(now);
            } else {
                // Poll timeout with no events: the loop is idle.
                if self.idles.tick(now) > 0 {
                    now = time::now_ms();
                    self.last_activity.set(now);
                }
            }

            self.timeouts.tick(now);
        }

        // Release pending waiters so they can observe the shutdown: timer
        // moments resume with their shutdown flag set, queued tasks run and
        // see the flag at their next suspension point.
        self.sleeps.shutdown();
        self.idles.shutdown();
        self.timeouts.shutdown();
        self.process_inbox();

        CURRENT_LOOP.with(|current| current.set(ptr::null()));
        self.unref();
    }

    fn process_inbox(&self) {
        loop {
            let node = unsafe { self.inbox.pop() };
            if node.is_null() {
                break;
            }

            let task = task::from_node(node);
            unsafe {
                if (*task).owner.get() == self as *const Loop {
                    trace!("inbox: waking suspended task");
                    task::resume(task);
                } else {
                    trace!("inbox: starting posted task");
                    task::post(task, self);
                }
            }
        }
    }

    /// Milliseconds until the nearest pending deadline, or `None` when no
    /// timer is armed and the poll may block indefinitely.
    fn nearest_event_delta(&self, now: u64) -> Option<u64> {
        let mut nearest = 0;
        for candidate in [
            self.sleeps.nearest(),
            self.idles.nearest(),
            self.timeouts.nearest(),
        ] {
            if candidate > 0 && (nearest == 0 || candidate < nearest) {
                nearest = candidate;
            }
        }

        if nearest == 0 {
            None
        } else {
            Some(nearest.saturating_sub(now))
        }
    }

    /// Timestamp (loop time, milliseconds) of the last observed activity.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.get()
    }

    pub(crate) fn set_entry(&self, entry: Entry) {
        unsafe { *self.entry.get() = Some(entry) };
    }

    pub(crate) fn current_task(&self) -> *mut Task {
        self.current.get()
    }

    pub(crate) fn set_current(&self, task: *mut Task) {
        self.current.set(task);
    }

    pub(crate) fn prev_task(&self) -> *mut Task {
        self.prev.get()
    }

    pub(crate) fn set_prev(&self, task: *mut Task) {
        self.prev.set(task);
    }

    pub(crate) fn main_task(&self) -> *mut Task {
        self.main.get()
    }

    pub(crate) fn set_yield_value(&self, value: *mut ()) {
        self.yield_slot.set(value);
    }

    pub(crate) fn yield_value(&self) -> *mut () {
        self.yield_slot.get()
    }

    #[cfg(test)]
    pub(crate) fn bind_current_for_test(&self) -> impl Drop {
        struct Unbind;
        impl Drop for Unbind {
            fn drop(&mut self) {
                CURRENT_LOOP.with(|current| current.set(ptr::null()));
            }
        }

        CURRENT_LOOP.with(|current| current.set(self));
        Unbind
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Loop")
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Counted handle to a loop running on another thread. Cloning takes a
/// reference, dropping releases it; the loop is freed when the running
/// thread has exited and the last handle is gone.
pub struct LoopRef {
    ptr: NonNull<Loop>,
}

unsafe impl Send for LoopRef {}
unsafe impl Sync for LoopRef {}

impl std::ops::Deref for LoopRef {
    type Target = Loop;

    fn deref(&self) -> &Loop {
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for LoopRef {
    fn clone(&self) -> LoopRef {
        self.ref_();
        LoopRef { ptr: self.ptr }
    }
}

impl Drop for LoopRef {
    fn drop(&mut self) {
        unsafe { self.ptr.as_ref().unref() };
    }
}

impl fmt::Debug for LoopRef {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("LoopRef").finish()
    }
}

/// Suspend the calling task for at least `milliseconds`. Returns
/// `ECANCELED` when the wait was cancelled or the loop shut down.
pub fn sleep(milliseconds: u64) -> io::Result<()> {
    let lp = Loop::current().ok_or_else(not_on_loop)?;
    lp.wait_on(&lp.sleeps, milliseconds)
}

fn is_send<T: Send>() {}
fn is_sync<T: Sync>() {}
