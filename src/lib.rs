//! Corio is an asynchronous I/O runtime with a synchronous programming
//! model: tasks are stackful coroutines, so application code reads and
//! writes as if the calls blocked while the per-thread event loop suspends
//! and resumes tasks around the kernel's readiness (epoll) or completion
//! (IOCP) notifications.
//!
//! The pieces:
//!
//! * [`run`]: build one loop on the calling thread, run `entry` as its
//!   first task and block until the loop stops.
//! * [`Loop`]: a per-thread scheduler. [`Loop::start`] spawns one on a new
//!   thread; [`Loop::post`] and [`Loop::exec`] move work onto it.
//! * [`stream`]: memory, file and TCP byte streams with per-direction
//!   timeouts, accounting and a user-extensible filter chain.
//! * [`net`]: TCP listen/accept/connect.
//! * [`fs`]: files, paths and directories, made asynchronous through a
//!   worker pool.
//! * [`Event`]: process-wide named rendezvous between tasks on any loop.
//!
//! # Example
//!
//! An echo server and its client in two tasks on one loop:
//!
//! ```no_run
//! use corio::net;
//!
//! corio::run(|lp| {
//!     let mut listener = net::listen("127.0.0.1", 9000, 16).unwrap();
//!
//!     lp.post(|lp| {
//!         let mut client = net::connect("127.0.0.1", 9000, 1000).unwrap();
//!         client.write(b"PING");
//!
//!         let mut reply = [0u8; 4];
//!         client.read(&mut reply, true);
//!         assert_eq!(&reply, b"PING");
//!
//!         client.close().unwrap();
//!         lp.stop();
//!     })
//!     .unwrap();
//!
//!     let mut peer = listener.accept().unwrap();
//!     let mut buffer = [0u8; 1024];
//!     let n = peer.read(&mut buffer, false);
//!     peer.write(&buffer[..n]);
//!     peer.close().unwrap();
//! })
//! .unwrap();
//! ```
//!
//! # Suspension points
//!
//! Exactly these operations suspend the calling task: stream reads, writes
//! and pipes, TCP accept and connect, file and path operations, event
//! wait/notify/delete, [`sleep`], [`Loop::idle`] and cross-loop
//! [`Loop::exec`]. Everything else returns without yielding; there is no
//! implicit preemption inside a loop.

#![deny(missing_debug_implementations)]

#[macro_use]
mod macros;

mod event;
mod event_loop;
pub mod fs;
pub mod net;
mod pool;
mod queue;
pub mod stream;
mod sys;
mod task;
mod time;
mod timer;
mod util;

pub use event::Event;
pub use event_loop::{sleep, Loop, LoopRef};
pub use stream::Stream;

use std::io;

/// Tunables for a loop and the shared worker pool. The defaults mirror the
/// runtime's fixed constants: 60-event poll batches, 1 MiB task stacks,
/// 4 worker threads.
#[derive(Debug, Clone)]
pub struct Config {
    events_capacity: usize,
    stack_size: usize,
    worker_threads: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            events_capacity: 60,
            stack_size: 1024 * 1024,
            worker_threads: 4,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Maximum events taken from the kernel per poll.
    pub fn events_capacity(mut self, capacity: usize) -> Config {
        self.events_capacity = capacity.max(1);
        self
    }

    /// Stack reservation per task. The stack is guard-protected and
    /// committed on demand, so generous sizes cost address space, not
    /// memory.
    pub fn stack_size(mut self, bytes: usize) -> Config {
        self.stack_size = bytes;
        self
    }

    /// Threads in the blocking-work pool. Only the first initialization of
    /// the pool picks this up.
    pub fn worker_threads(mut self, threads: usize) -> Config {
        self.worker_threads = threads.max(1);
        self
    }
}

/// Run `entry` as the first task of a loop on the calling thread and block
/// until the loop stops. Subsystems come up in dependency order (TCP,
/// worker pool, event service, loop) and are torn down symmetrically on the
/// way out.
pub fn run<F>(entry: F) -> io::Result<()>
where
    F: FnOnce(&Loop) + Send + 'static,
{
    run_config(Config::default(), entry)
}

/// [`run`] with explicit [`Config`].
pub fn run_config<F>(config: Config, entry: F) -> io::Result<()>
where
    F: FnOnce(&Loop) + Send + 'static,
{
    net::tcp::init()?;

    if let Err(err) = pool::init(config.worker_threads) {
        net::tcp::cleanup();
        return Err(err);
    }

    if let Err(err) = event::init() {
        pool::shutdown();
        net::tcp::cleanup();
        return Err(err);
    }

    let lp = match Loop::new(&config) {
        Ok(lp) => lp,
        Err(err) => {
            event::shutdown();
            pool::shutdown();
            net::tcp::cleanup();
            return Err(err);
        }
    };

    lp.set_entry(Box::new(entry));

    // The loop consumes its own reference when `run` returns; the box must
    // not be dropped here on top of that.
    let raw = Box::into_raw(lp);
    unsafe { (*raw).run() };

    event::shutdown();
    pool::shutdown();
    net::tcp::cleanup();

    Ok(())
}
