//! Stackful tasks and the context-switch discipline between them.
//!
//! A task is a coroutine with its own guarded stack. Exactly one task per
//! loop is running at any time; the others are suspended at a context swap.
//! All switching happens on the loop's owning thread.

use std::cell::{Cell, UnsafeCell};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use log::error;

use crate::event_loop::Loop;
use crate::queue;
use crate::sys;

pub(crate) type Entry = Box<dyn FnOnce(&Loop) + Send>;

#[repr(C)]
pub(crate) struct Task {
    // Intrusive inbox link; must stay the first field so node and task
    // addresses coincide.
    node: queue::Node,
    context: sys::Context,
    pub(crate) owner: Cell<*const Loop>,
    parent: Cell<*mut Task>,
    // The main task borrows the thread's own stack and has none of its own.
    stack: Option<sys::Stack>,
    entry: UnsafeCell<Option<Entry>>,
    pub(crate) done: Cell<bool>,
    posted: Cell<bool>,
    inherit_error_state: Cell<bool>,
}

impl Task {
    /// Stub for a loop's embedded main task: no stack, no entry. Its context
    /// is filled in by the first swap away from it.
    pub(crate) fn main_stub() -> Task {
        Task {
            node: queue::Node::new(),
            context: sys::Context::new(),
            owner: Cell::new(ptr::null()),
            parent: Cell::new(ptr::null_mut()),
            stack: None,
            entry: UnsafeCell::new(None),
            done: Cell::new(false),
            posted: Cell::new(false),
            inherit_error_state: Cell::new(false),
        }
    }
}

pub(crate) fn node_ptr(task: *mut Task) -> *mut queue::Node {
    unsafe { std::ptr::addr_of_mut!((*task).node) }
}

pub(crate) fn from_node(node: *mut queue::Node) -> *mut Task {
    node as *mut Task
}

/// First frame on every task stack.
///
/// Entered through the initial swap into the task's prepared context; the
/// loop has already been published as the thread's current loop and the task
/// as its current task.
extern "C" fn trampoline() {
    let lp = Loop::current().expect("task entered outside of a loop");

    unsafe {
        let task = lp.current_task();

        let entry = (*(*task).entry.get())
            .take()
            .expect("task entry already consumed");

        // Unwinding across a context switch is undefined; contain it here.
        if panic::catch_unwind(AssertUnwindSafe(|| entry(lp))).is_err() {
            error!("task entry panicked; task completes as done");
        }

        (*task).done.set(true);
        lp.set_prev(task);

        // Hand control back to whoever ran us last. The parent resumes
        // inside its own swap and reaps us there if we were posted.
        sys::Context::set(&(*(*task).parent.get()).context);
    }
}

pub(crate) fn create(entry: Entry, stack_size: usize) -> io::Result<*mut Task> {
    let stack = sys::Stack::new(stack_size)?;

    let task = Box::into_raw(Box::new(Task {
        node: queue::Node::new(),
        context: sys::Context::new(),
        owner: Cell::new(ptr::null()),
        parent: Cell::new(ptr::null_mut()),
        stack: Some(stack),
        entry: UnsafeCell::new(Some(entry)),
        done: Cell::new(false),
        posted: Cell::new(false),
        inherit_error_state: Cell::new(false),
    }));

    unsafe {
        let stack = (*task).stack.as_ref().expect("task stack just installed");
        if let Err(err) = (*task).context.prepare(stack, trampoline) {
            drop(Box::from_raw(task));
            return Err(err);
        }
    }

    Ok(task)
}

/// Release a task's stack and storage. Fails with `EDEADLK` for the task
/// currently running on its loop; a task cannot free the stack it stands on.
pub(crate) unsafe fn delete(task: *mut Task) -> io::Result<()> {
    let owner = (*task).owner.get();
    if !owner.is_null() && (*owner).current_task() == task {
        return Err(io::Error::from_raw_os_error(sys::ecode::EDEADLK));
    }

    drop(Box::from_raw(task));
    Ok(())
}

/// Switch from `current` to `other`, maintaining the loop's current/previous
/// task pointers, reaping completed posted tasks, and preserving the error
/// state of the outgoing side unless it opted into inheritance.
pub(crate) unsafe fn swap(current: *mut Task, other: *mut Task) {
    let lp = &*(*current).owner.get();

    let saved_errno = sys::errno();

    lp.set_prev(current);
    lp.set_current(other);
    (*current).context.swap(&(*other).context);
    lp.set_current(current);

    // If the task that just gave us control was posted and ran to
    // completion, it is nobody's to free but ours.
    let prev = lp.prev_task();
    if !prev.is_null() && (*prev).posted.get() && (*prev).done.get() {
        lp.set_prev(ptr::null_mut());
        let _ = delete(prev);
    }

    if !(*current).inherit_error_state.get() {
        sys::set_errno(saved_errno);
    }
}

/// Run `task` from the current context, parenting it to the caller. The
/// caller regains control when the task suspends, yields or completes, and
/// sees the task's error state through the return.
pub(crate) unsafe fn exec(task: *mut Task, lp: &Loop) -> io::Result<*mut ()> {
    if (*task).done.get() {
        return Err(io::Error::from_raw_os_error(sys::ecode::EALREADY));
    }

    (*task).owner.set(lp);

    let current = lp.current_task();
    let saved_inherit = (*current).inherit_error_state.get();

    (*task).parent.set(current);
    (*task).posted.set(false);

    (*current).inherit_error_state.set(true);
    swap(current, task);
    (*current).inherit_error_state.set(saved_inherit);

    Ok(lp.yield_value())
}

/// Run `task` parented to the loop's main context and marked posted: when it
/// completes, the swap wrapper frees it.
pub(crate) unsafe fn post(task: *mut Task, lp: &Loop) {
    (*task).owner.set(lp);
    (*task).parent.set(lp.main_task());
    (*task).posted.set(true);

    swap(lp.current_task(), task);
}

/// Park the current task and give control back to the loop's main context.
/// Fails with `EDEADLK` from the main task itself.
pub(crate) unsafe fn suspend(current: *mut Task) -> io::Result<()> {
    let lp = &*(*current).owner.get();

    if current == lp.main_task() {
        return Err(io::Error::from_raw_os_error(sys::ecode::EDEADLK));
    }

    swap(current, lp.main_task());

    Ok(())
}

/// Switch from whatever is running on the task's loop directly into `task`.
/// The task must already belong to this loop; cross-thread wakeups travel
/// through the loop's inbox instead.
pub(crate) unsafe fn resume(task: *mut Task) {
    let lp = &*(*task).owner.get();
    swap(lp.current_task(), task);
}

/// Hand `value` and control to the parent task. Fails with `EDEADLK` from
/// the main task, which has no parent.
pub(crate) unsafe fn yield_value(current: *mut Task, value: *mut ()) -> io::Result<()> {
    let lp = &*(*current).owner.get();

    if current == lp.main_task() {
        return Err(io::Error::from_raw_os_error(sys::ecode::EDEADLK));
    }

    lp.set_yield_value(value);
    swap(current, (*current).parent.get());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[test]
    fn exec_yield_resume_roundtrip() {
        let lp = Loop::new(&Config::default()).unwrap();
        let _guard = lp.bind_current_for_test();

        let task = create(
            Box::new(|_lp: &Loop| {
                let current = Loop::current().unwrap().current_task();
                let mut value = 7usize;
                unsafe {
                    yield_value(current, &mut value as *mut usize as *mut ()).unwrap();
                }
            }),
            64 * 1024,
        )
        .unwrap();

        unsafe {
            // First exec runs until the yield.
            let yielded = exec(task, &lp).unwrap();
            assert_eq!(*(yielded as *mut usize), 7);
            assert!(!(*task).done.get());

            // Resume lets the entry return.
            resume(task);
            assert!((*task).done.get());

            // A completed task cannot be executed again.
            let err = exec(task, &lp).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EALREADY));

            delete(task).unwrap();
        }
    }

    #[test]
    fn delete_running_task_is_refused() {
        let lp = Loop::new(&Config::default()).unwrap();
        let _guard = lp.bind_current_for_test();

        let main = lp.main_task();
        unsafe {
            let err = delete(main).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EDEADLK));
        }
    }

    #[test]
    fn errno_preserved_across_exec_unless_inherited() {
        let lp = Loop::new(&Config::default()).unwrap();
        let _guard = lp.bind_current_for_test();

        let task = create(
            Box::new(|_lp: &Loop| {
                sys::set_errno(libc::ENOENT);
            }),
            64 * 1024,
        )
        .unwrap();

        sys::set_errno(0);
        unsafe {
            exec(task, &lp).unwrap();
        }
        // exec inherits the callee's error state through the return.
        assert_eq!(sys::errno(), libc::ENOENT);

        unsafe { delete(task).unwrap() };
    }
}
