//! Process-wide named wait/notify service.
//!
//! One dispatcher thread owns every event's waiter list and consumes
//! commands from a shared MPSC queue. Callers fill a stack command, ring
//! the dispatcher and suspend; the dispatcher acknowledges by reposting the
//! calling task to its loop. A WAIT is only acknowledged by a later NOTIFY
//! or DELETE: that wake *is* the acknowledgement.
//!
//! Ordering: a WAIT that reaches the dispatcher before a NOTIFY is woken by
//! it; a WAIT racing a NOTIFY may or may not be. This is a rendezvous
//! primitive, not a synchronization barrier.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{trace, warn};

use crate::event_loop::Loop;
use crate::queue::{Node, Queue};
use crate::sys;
use crate::task::{self, Task};
use crate::util::{not_on_loop, SendPtr};

/// Handle to a named condition. Create is local; wait, notify and delete
/// suspend the calling task until the dispatcher has processed them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    id: u64,
}

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

impl Event {
    pub fn create() -> Event {
        Event {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Park the calling task until someone notifies this event. Returns
    /// `ECANCELED` if the event is deleted while waiting, or was already.
    pub fn wait(&self) -> io::Result<()> {
        submit(CommandKind::Wait, self.id)
    }

    /// Wake every task currently waiting on this event. The notifier
    /// returns before the waiters resume.
    pub fn notify(&self) -> io::Result<()> {
        submit(CommandKind::Notify, self.id)
    }

    /// Tear the event down, waking all waiters with `ECANCELED`.
    pub fn delete(self) -> io::Result<()> {
        submit(CommandKind::Delete, self.id)
    }
}

#[derive(Clone, Copy)]
enum CommandKind {
    Wait,
    Notify,
    Delete,
    Shutdown,
}

#[repr(C)]
struct Command {
    // Intrusive queue link; must stay the first field.
    node: Node,
    kind: CommandKind,
    event: u64,
    owner: *const Loop,
    task: *mut Task,
    // Written by the dispatcher strictly before the repost, read by the
    // caller strictly after resuming; the inbox hand-off orders the two.
    error: Cell<i32>,
}

struct Shared {
    commands: Queue,
    doorbell: sys::Notifier,
}

struct Registry {
    users: usize,
    service: Option<Service>,
}

struct Service {
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    users: 0,
    service: None,
});

fn spawn_service() -> io::Result<Service> {
    let shared = Arc::new(Shared {
        commands: Queue::new(),
        doorbell: sys::Notifier::new()?,
    });

    let dispatcher = {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("corio-events".to_owned())
            .spawn(move || dispatcher(shared))?
    };

    Ok(Service { shared, dispatcher })
}

/// Bring the dispatcher up, counting the caller as a user.
pub(crate) fn init() -> io::Result<()> {
    let mut registry = REGISTRY.lock().unwrap();
    if registry.service.is_none() {
        registry.service = Some(spawn_service()?);
    }
    registry.users += 1;
    Ok(())
}

/// Drop one usage; the last user stops and joins the dispatcher.
pub(crate) fn shutdown() {
    let service = {
        let mut registry = REGISTRY.lock().unwrap();
        if registry.users == 0 {
            return;
        }
        registry.users -= 1;
        if registry.users > 0 {
            return;
        }
        registry.service.take()
    };

    let Some(service) = service else { return };

    // A heap command: nobody suspends on shutdown, the harness thread is no
    // task. The dispatcher frees it.
    let stop = Box::into_raw(Box::new(Command {
        node: Node::new(),
        kind: CommandKind::Shutdown,
        event: 0,
        owner: std::ptr::null(),
        task: std::ptr::null_mut(),
        error: Cell::new(0),
    }));
    service.shared.commands.push(stop as *mut Node);
    if service.shared.doorbell.notify().is_err() {
        warn!("failed to ring event dispatcher for shutdown");
    }

    if service.dispatcher.join().is_err() {
        warn!("event dispatcher panicked during shutdown");
    }
}

fn handle() -> io::Result<Arc<Shared>> {
    let mut registry = REGISTRY.lock().unwrap();
    if registry.service.is_none() {
        registry.service = Some(spawn_service()?);
    }
    Ok(Arc::clone(
        &registry.service.as_ref().expect("service just created").shared,
    ))
}

fn submit(kind: CommandKind, event: u64) -> io::Result<()> {
    let lp = Loop::current().ok_or_else(not_on_loop)?;
    let current = lp.current_task();
    if current == lp.main_task() {
        return Err(io::Error::from_raw_os_error(sys::ecode::EDEADLK));
    }

    let shared = handle()?;

    let command = Command {
        node: Node::new(),
        kind,
        event,
        owner: lp,
        task: current,
        error: Cell::new(0),
    };

    // The command lives in this frame until the dispatcher reposted us.
    shared
        .commands
        .push(&command.node as *const Node as *mut Node);
    shared.doorbell.notify()?;

    unsafe { task::suspend(current)? };

    match command.error.get() {
        0 => Ok(()),
        code => Err(io::Error::from_raw_os_error(code)),
    }
}

/// Acknowledge a command by returning its task to its loop.
unsafe fn acknowledge(command: *const Command, error: i32) {
    (*command).error.set(error);
    if let Err(err) = (*(*command).owner).post_task((*command).task) {
        warn!("failed to acknowledge event command: {}", err);
    }
}

fn dispatcher(shared: Arc<Shared>) {
    // All waiter state lives here, on the dispatcher thread, and nowhere
    // else. A waiter entry is the suspended WAIT command itself.
    let mut waiters: HashMap<u64, Vec<SendPtr>> = HashMap::new();
    let mut deleted: HashSet<u64> = HashSet::new();

    loop {
        if shared.doorbell.wait().is_err() {
            break;
        }

        let mut stop = false;
        loop {
            let node = unsafe { shared.commands.pop() };
            if node.is_null() {
                break;
            }

            let command = node as *mut Command;
            unsafe {
                match (*command).kind {
                    CommandKind::Wait => {
                        let id = (*command).event;
                        if deleted.contains(&id) {
                            acknowledge(command, sys::ecode::ECANCELED);
                        } else {
                            trace!("event {}: task waiting", id);
                            waiters
                                .entry(id)
                                .or_default()
                                .push(SendPtr(command as *mut ()));
                        }
                    }
                    CommandKind::Notify => {
                        let id = (*command).event;
                        if deleted.contains(&id) {
                            acknowledge(command, sys::ecode::ECANCELED);
                        } else {
                            // The notifier is acknowledged first: on a shared
                            // loop it returns from notify before any waiter
                            // resumes.
                            acknowledge(command, 0);
                            if let Some(list) = waiters.get_mut(&id) {
                                trace!("event {}: waking {} waiter(s)", id, list.len());
                                for waiter in list.drain(..) {
                                    acknowledge(waiter.0 as *const Command, 0);
                                }
                            }
                        }
                    }
                    CommandKind::Delete => {
                        let id = (*command).event;
                        deleted.insert(id);
                        acknowledge(command, 0);
                        if let Some(list) = waiters.remove(&id) {
                            trace!("event {}: deleting with {} waiter(s)", id, list.len());
                            for waiter in list {
                                acknowledge(waiter.0 as *const Command, sys::ecode::ECANCELED);
                            }
                        }
                    }
                    CommandKind::Shutdown => {
                        drop(Box::from_raw(command));
                        stop = true;
                    }
                }
            }
        }

        if stop {
            break;
        }
    }
}
