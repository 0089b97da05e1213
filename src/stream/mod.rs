//! Byte streams with a synchronous-looking interface.
//!
//! A stream is a handle to an I/O endpoint: an in-memory buffer, a file or
//! a TCP socket (UDP, TTY and pipe exist at the type level only). Reads and
//! writes appear to block; under the hood the calling task suspends and the
//! owning loop resumes it when the backend is ready.
//!
//! Every operation funnels through the filter chain: user filters first,
//! head to tail, then the built-in operations stage that talks to the
//! backend. Once a terminal status bit is set, all further I/O returns 0
//! without touching the backend; the info block says why.

mod filter;
mod memory;

pub use self::filter::{Filter, FilterToken, NextFilter};

use std::cell::Cell;
use std::fmt;
use std::io;
use std::mem;
use std::ptr::{self, NonNull};

use crate::event_loop::{Loop, Registration};
use crate::fs;
use crate::sys;
use crate::util::not_on_loop;

use self::filter::FilterSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Memory,
    File,
    Tcp,
    Udp,
    Tty,
    Pipe,
}

/// Stream condition as independent flags plus a platform error code.
/// Terminal bits are absorbing: once set they are never cleared, and any
/// read or write against a terminal stream returns 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    pub eof: bool,
    pub closed: bool,
    pub peer_closed: bool,
    pub shutdown: bool,
    pub read_timeout: bool,
    pub write_timeout: bool,
    pub error: i32,
}

impl Status {
    /// True when no further reads can make progress.
    pub fn read_terminal(&self) -> bool {
        self.read_timeout
            || self.eof
            || self.error != 0
            || self.closed
            || self.peer_closed
            || self.shutdown
    }

    /// True when no further writes can make progress.
    pub fn write_terminal(&self) -> bool {
        self.write_timeout
            || self.error != 0
            || self.closed
            || self.peer_closed
            || self.shutdown
    }
}

/// Per-direction accounting and configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectionInfo {
    /// Operation timeout in milliseconds; 0 disables.
    pub timeout: u64,
    /// Total bytes transferred in this direction.
    pub bytes: u64,
    /// Total nanoseconds spent in backend operations.
    pub period: u64,
    /// Stream position: the file cursor for files, a running byte count
    /// otherwise.
    pub position: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub kind: StreamKind,
    pub status: Status,
    pub read: DirectionInfo,
    pub write: DirectionInfo,
}

impl StreamInfo {
    fn new(kind: StreamKind) -> StreamInfo {
        StreamInfo {
            kind,
            status: Status::default(),
            read: DirectionInfo::default(),
            write: DirectionInfo::default(),
        }
    }
}

pub(crate) struct StreamInner {
    pub(crate) reg: Registration,
    pub(crate) fd: sys::FileHandle,
    pub(crate) info: StreamInfo,
    pub(crate) owner: Cell<*const Loop>,
    /// Extra selector interest currently armed, on top of the base set.
    pub(crate) armed: Cell<u32>,
    filters: Vec<FilterSlot>,
    next_filter_id: u64,
    unread: Vec<u8>,
    unread_offset: usize,
    pub(crate) read_req: Cell<*mut ()>,
    pub(crate) write_req: Cell<*mut ()>,
    pub(crate) memory: Option<memory::Chunks>,
    #[cfg(windows)]
    pub(crate) platform: sys::StreamState,
}

unsafe fn inert_processor(_data: *mut (), _event: &sys::Event) {}

/// Handle to a stream.
///
/// A stream binds to a loop on its first operation and belongs to that
/// loop's thread from then on. Before binding it may move freely; the
/// accept-then-post pattern hands a fresh connection to the task that will
/// serve it. Operating on a bound stream from any other thread is a
/// contract violation.
pub struct Stream {
    inner: NonNull<StreamInner>,
}

// Movable until bound; see the type-level contract above. All post-binding
// access is funneled to the owning loop's thread by the runtime's own
// scheduling.
unsafe impl Send for Stream {}

impl Stream {
    /// A memory stream with the default 64 KiB bucket size.
    pub fn memory() -> Stream {
        Stream::memory_with_bucket(memory::DEFAULT_BUCKET_SIZE)
    }

    /// A memory stream growing in multiples of `bucket_size` bytes.
    pub fn memory_with_bucket(bucket_size: usize) -> Stream {
        let inner = Stream::allocate(StreamKind::Memory, sys::INVALID_HANDLE, inert_processor);
        unsafe {
            (*inner.as_ptr()).memory = Some(memory::Chunks::new(bucket_size));
        }
        Stream { inner }
    }

    pub(crate) fn allocate(
        kind: StreamKind,
        fd: sys::FileHandle,
        dispatch: unsafe fn(*mut (), &sys::Event),
    ) -> NonNull<StreamInner> {
        let inner = Box::into_raw(Box::new(StreamInner {
            reg: Registration::new(dispatch),
            fd,
            info: StreamInfo::new(kind),
            owner: Cell::new(ptr::null()),
            armed: Cell::new(0),
            filters: Vec::new(),
            next_filter_id: 0,
            unread: Vec::new(),
            unread_offset: 0,
            read_req: Cell::new(ptr::null_mut()),
            write_req: Cell::new(ptr::null_mut()),
            memory: None,
            #[cfg(windows)]
            platform: sys::StreamState::new(),
        }));

        unsafe {
            (*inner).reg.set_data(inner as *mut ());
            NonNull::new_unchecked(inner)
        }
    }

    /// Allocate a stream whose kind never receives selector events.
    pub(crate) fn allocate_plain(kind: StreamKind, fd: sys::FileHandle) -> NonNull<StreamInner> {
        Stream::allocate(kind, fd, inert_processor)
    }

    pub(crate) fn from_inner(inner: NonNull<StreamInner>) -> Stream {
        Stream { inner }
    }

    pub(crate) fn as_inner(&self) -> *mut StreamInner {
        self.inner.as_ptr()
    }

    /// The stream's info block: kind, status and per-direction counters.
    pub fn info(&self) -> &StreamInfo {
        unsafe { &(*self.inner.as_ptr()).info }
    }

    /// Deadline for a single read, in milliseconds; 0 disables.
    pub fn set_read_timeout(&mut self, milliseconds: u64) {
        unsafe { (*self.inner.as_ptr()).info.read.timeout = milliseconds };
    }

    /// Deadline for a single write, in milliseconds; 0 disables.
    pub fn set_write_timeout(&mut self, milliseconds: u64) {
        unsafe { (*self.inner.as_ptr()).info.write.timeout = milliseconds };
    }

    /// Read up to `buffer.len()` bytes; with `exact`, keep reading until the
    /// buffer is full or a read stops making progress. Returns the bytes
    /// copied; 0 means end of stream, timeout, error or terminal status,
    /// discriminated by `info().status`.
    pub fn read(&mut self, buffer: &mut [u8], exact: bool) -> usize {
        if buffer.is_empty() {
            return 0;
        }

        if exact {
            let mut offset = 0;
            while offset < buffer.len() {
                let n = self.read_once(&mut buffer[offset..]);
                offset += n;
                if n == 0 {
                    break;
                }
            }
            return offset;
        }

        self.read_once(buffer)
    }

    fn read_once(&mut self, buffer: &mut [u8]) -> usize {
        let stream = self.inner.as_ptr();
        unsafe {
            if (*stream).info.status.read_terminal() {
                return 0;
            }

            if let Err(err) = bind(stream) {
                (*stream).info.status.error =
                    err.raw_os_error().unwrap_or(sys::ecode::EIO);
                return 0;
            }

            let owner = (*stream).owner.get();
            if !owner.is_null() && (*owner).is_shutdown() {
                (*stream).info.status.shutdown = true;
                fire_status(stream);
                return 0;
            }

            // Pushed-back data is served before the backend is consulted.
            let pending = (*stream).unread.len() - (*stream).unread_offset;
            if pending > 0 {
                let count = pending.min(buffer.len());
                let offset = (*stream).unread_offset;
                buffer[..count].copy_from_slice(&(&(*stream).unread)[offset..offset + count]);

                if count == pending {
                    (*stream).unread.clear();
                    (*stream).unread_offset = 0;
                } else {
                    (*stream).unread_offset += count;
                }
                return count;
            }

            chain_read(stream, 0, buffer)
        }
    }

    /// Push data back in front of the stream; the next read drains it
    /// before touching the backend. Replaces any previously unread data.
    pub fn unread(&mut self, buffer: &[u8]) -> usize {
        if buffer.is_empty() {
            return 0;
        }

        let stream = self.inner.as_ptr();
        unsafe {
            (*stream).unread.clear();
            (*stream).unread.extend_from_slice(buffer);
            (*stream).unread_offset = 0;
        }
        buffer.len()
    }

    /// Write all of `buffer`, suspending as needed, until done or a
    /// terminal status (including the write timeout) interferes. Returns
    /// the bytes actually written.
    pub fn write(&mut self, buffer: &[u8]) -> usize {
        if buffer.is_empty() {
            return 0;
        }

        let stream = self.inner.as_ptr();
        unsafe {
            if (*stream).info.status.write_terminal() {
                return 0;
            }

            if let Err(err) = bind(stream) {
                (*stream).info.status.error =
                    err.raw_os_error().unwrap_or(sys::ecode::EIO);
                return 0;
            }

            let owner = (*stream).owner.get();
            if !owner.is_null() && (*owner).is_shutdown() {
                (*stream).info.status.shutdown = true;
                fire_status(stream);
                return 0;
            }

            chain_write(stream, 0, buffer)
        }
    }

    /// Attach `filter` at the head of the chain, in front of every filter
    /// attached earlier.
    pub fn attach(&mut self, filter: Box<dyn Filter + Send>) -> FilterToken {
        let inner = unsafe { &mut *self.inner.as_ptr() };
        let id = inner.next_filter_id;
        inner.next_filter_id += 1;
        inner.filters.insert(0, FilterSlot { id, filter });
        FilterToken(id)
    }

    /// Remove a previously attached filter, giving it back.
    pub fn detach(&mut self, token: FilterToken) -> Option<Box<dyn Filter + Send>> {
        let inner = unsafe { &mut *self.inner.as_ptr() };
        let index = inner.filters.iter().position(|slot| slot.id == token.0)?;
        Some(inner.filters.remove(index).filter)
    }

    /// Close the stream: deregister from the backend, close the OS handle,
    /// raise `closed` through the filter chain and release the loop
    /// reference.
    pub fn close(self) -> io::Result<()> {
        let inner = self.inner;
        mem::forget(self);
        unsafe { close_inner(inner.as_ptr(), true) }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Best effort, without the worker-pool round-trip a task could make.
        let _ = unsafe { close_inner(self.inner.as_ptr(), false) };
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Stream")
            .field("kind", &self.info().kind)
            .field("status", &self.info().status)
            .finish()
    }
}

/// Copy `from` into `to` in `chunk_size`-byte reads until the source is
/// exhausted; a `chunk_size` below 64 falls back to 8192. `transferred`
/// receives the bytes that reached the destination; the result reflects the
/// destination's error state.
pub fn pipe(
    from: &mut Stream,
    to: &mut Stream,
    chunk_size: usize,
    transferred: &mut u64,
) -> io::Result<()> {
    let chunk_size = if chunk_size < 64 { 8 * 1024 } else { chunk_size };

    let mut buffer = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let n_read = from.read(&mut buffer, false);
        if n_read == 0 {
            break;
        }

        let n_wrote = to.write(&buffer[..n_read]);
        total += n_wrote as u64;

        if n_wrote < n_read {
            break;
        }
    }

    *transferred = total;

    match to.info().status.error {
        0 => Ok(()),
        code => Err(io::Error::from_raw_os_error(code)),
    }
}

/// Bind the stream to the calling thread's loop on first use: register the
/// handle with the selector (sockets only) and take a loop reference.
/// Memory streams work unbound when no loop is running.
pub(crate) unsafe fn bind(stream: *mut StreamInner) -> io::Result<()> {
    if !(*stream).owner.get().is_null() {
        return Ok(());
    }

    let lp = match Loop::current() {
        Some(lp) => lp,
        None if (*stream).info.kind == StreamKind::Memory => return Ok(()),
        None => return Err(not_on_loop()),
    };

    if lp.is_shutdown() {
        (*stream).info.status.shutdown = true;
        fire_status(stream);
        return Err(io::Error::from_raw_os_error(sys::ecode::ECANCELED));
    }

    // Sockets register with the selector; on the completion backend file
    // handles are associated with the port as well.
    let needs_backend = (*stream).info.kind == StreamKind::Tcp
        || (cfg!(windows) && (*stream).info.kind == StreamKind::File);
    if needs_backend {
        sys::stream_attach(stream, lp)?;
    }

    (*stream).owner.set(lp);
    lp.ref_();

    Ok(())
}

pub(crate) unsafe fn close_inner(
    stream: *mut StreamInner,
    may_suspend: bool,
) -> io::Result<()> {
    let mut result = Ok(());

    match (*stream).info.kind {
        StreamKind::Memory => {
            if let Some(chunks) = (*stream).memory.as_mut() {
                chunks.clear();
            }
            (*stream).info.status.closed = true;
        }
        StreamKind::File => {
            (*stream).info.status.closed = true;
            result = fs::close_file_stream(stream, may_suspend);
        }
        StreamKind::Tcp => {
            if !(*stream).owner.get().is_null() {
                let _ = sys::stream_deregister(stream);
            }
            (*stream).info.status.closed = true;
            result = sys::close_socket(sys::handle_to_socket((*stream).fd));
        }
        _ => {
            (*stream).info.status.closed = true;
        }
    }

    fire_status(stream);

    let owner = (*stream).owner.get();
    if !owner.is_null() {
        (*stream).owner.set(ptr::null());
        (*owner).unref();
    }

    drop(Box::from_raw(stream));

    result
}

pub(crate) unsafe fn chain_read(
    stream: *mut StreamInner,
    index: usize,
    buffer: &mut [u8],
) -> usize {
    if index < (*stream).filters.len() {
        let filter: *mut (dyn Filter + Send) = &mut *(&mut (*stream).filters)[index].filter;
        let mut next = NextFilter::new(stream, index + 1);
        (*filter).on_read(&mut next, buffer)
    } else {
        // Operations stage: the backend itself.
        match (*stream).info.kind {
            StreamKind::Memory => memory::read(stream, buffer),
            StreamKind::File => sys::file_read(stream, buffer),
            StreamKind::Tcp => sys::tcp_read(stream, buffer),
            _ => 0,
        }
    }
}

pub(crate) unsafe fn chain_write(
    stream: *mut StreamInner,
    index: usize,
    buffer: &[u8],
) -> usize {
    if index < (*stream).filters.len() {
        let filter: *mut (dyn Filter + Send) = &mut *(&mut (*stream).filters)[index].filter;
        let mut next = NextFilter::new(stream, index + 1);
        (*filter).on_write(&mut next, buffer)
    } else {
        match (*stream).info.kind {
            StreamKind::Memory => memory::write(stream, buffer),
            StreamKind::File => sys::file_write(stream, buffer),
            StreamKind::Tcp => sys::tcp_write(stream, buffer),
            _ => 0,
        }
    }
}

pub(crate) unsafe fn chain_status(stream: *mut StreamInner, index: usize) {
    if index < (*stream).filters.len() {
        let filter: *mut (dyn Filter + Send) = &mut *(&mut (*stream).filters)[index].filter;
        let mut next = NextFilter::new(stream, index + 1);
        (*filter).on_status(&mut next);
    }
    // The operations stage has nothing to do on status changes.
}

/// Run the filter chain's status callbacks, head to tail. Called whenever a
/// backend raises a status bit.
pub(crate) unsafe fn fire_status(stream: *mut StreamInner) {
    chain_status(stream, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn memory_roundtrip_fifo() {
        let mut stream = Stream::memory_with_bucket(64);

        assert_eq!(stream.write(b"hello "), 6);
        assert_eq!(stream.write(b"world"), 5);
        assert_eq!(stream.info().write.bytes, 11);

        let mut buffer = [0u8; 16];
        let n = stream.read(&mut buffer, false);
        assert_eq!(&buffer[..n], b"hello world");

        // Drained, but not eof: memory streams only end on close.
        assert_eq!(stream.read(&mut buffer, false), 0);
        assert!(!stream.info().status.eof);
    }

    #[test]
    fn memory_write_spans_buckets() {
        let mut stream = Stream::memory_with_bucket(64);

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(stream.write(&payload), payload.len());

        let mut output = vec![0u8; payload.len()];
        assert_eq!(stream.read(&mut output, true), payload.len());
        assert_eq!(output, payload);
    }

    #[test]
    fn unread_is_served_first_and_replaced() {
        let mut stream = Stream::memory();
        stream.write(b"backend");

        assert_eq!(stream.unread(b"front"), 5);

        let mut buffer = [0u8; 3];
        assert_eq!(stream.read(&mut buffer, false), 3);
        assert_eq!(&buffer, b"fro");

        // A new unread replaces the remainder.
        stream.unread(b"xy");
        let mut buffer = [0u8; 16];
        let n = stream.read(&mut buffer, false);
        assert_eq!(&buffer[..n], b"xy");

        let n = stream.read(&mut buffer, false);
        assert_eq!(&buffer[..n], b"backend");
    }

    #[test]
    fn filters_run_head_to_tail() {
        struct Tag {
            label: u8,
            order: Arc<Mutex<Vec<u8>>>,
        }

        impl Filter for Tag {
            fn on_write(&mut self, next: &mut NextFilter<'_>, buffer: &[u8]) -> usize {
                self.order.lock().unwrap().push(self.label);
                next.write(buffer)
            }
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stream = Stream::memory();

        stream.attach(Box::new(Tag {
            label: 1,
            order: Arc::clone(&order),
        }));
        // Attached later, so it sits at the head and runs first.
        stream.attach(Box::new(Tag {
            label: 2,
            order: Arc::clone(&order),
        }));

        stream.write(b"x");
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn detach_returns_the_filter() {
        struct Marker;
        impl Filter for Marker {}

        let mut stream = Stream::memory();
        let token = stream.attach(Box::new(Marker));

        assert!(stream.detach(token).is_some());
        assert!(stream.detach(token).is_none());
    }

    #[test]
    fn pipe_between_memory_streams() {
        let mut from = Stream::memory();
        let mut to = Stream::memory();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i & 0xff) as u8).collect();
        from.write(&payload);

        let mut transferred = 0;
        pipe(&mut from, &mut to, 4096, &mut transferred).unwrap();
        assert_eq!(transferred, payload.len() as u64);

        let mut output = vec![0u8; payload.len()];
        assert_eq!(to.read(&mut output, true), payload.len());
        assert_eq!(output, payload);
    }

    #[test]
    fn pipe_rejects_tiny_chunks() {
        let mut from = Stream::memory();
        let mut to = Stream::memory();
        from.write(b"data");

        // chunk_size below 64 falls back to 8192 rather than failing.
        let mut transferred = 0;
        pipe(&mut from, &mut to, 1, &mut transferred).unwrap();
        assert_eq!(transferred, 4);
    }
}
