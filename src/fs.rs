//! Files, paths and directories.
//!
//! Everything that would block (opens, closes, stats, directory walks)
//! runs on the worker pool while the calling task suspends, so the
//! loop thread stays responsive. File streams read and write through the
//! same pool at explicit per-direction cursors.

use std::io;
use std::ops::BitOr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::event_loop::Loop;
use crate::pool::{self, Work};
use crate::stream::{Stream, StreamInner, StreamKind};
use crate::sys;
use crate::task;
use crate::util::not_on_loop;

/// How to open a file; combine with `|`. An empty set opens an existing
/// file for reading and writing.
///
/// `CREATE` creates the file if missing and opens it write-only; `APPEND`
/// positions every write at the current end of file; `TRUNCATE` drops
/// existing contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOptions(u8);

impl FileOptions {
    pub const NONE: FileOptions = FileOptions(0);
    pub const CREATE: FileOptions = FileOptions(1);
    pub const APPEND: FileOptions = FileOptions(2);
    pub const TRUNCATE: FileOptions = FileOptions(4);

    pub fn contains(self, other: FileOptions) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for FileOptions {
    type Output = FileOptions;

    fn bitor(self, other: FileOptions) -> FileOptions {
        FileOptions(self.0 | other.0)
    }
}

/// Metadata of a filesystem entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathInfo {
    pub size: u64,
    /// Seconds since the Unix epoch; 0 when the filesystem cannot say.
    pub time_create: u64,
    pub time_access: u64,
    pub time_modified: u64,
    /// Unix permission bits, Windows file attributes.
    pub attributes: u32,
    pub is_file: bool,
}

fn info_from_metadata(metadata: &std::fs::Metadata) -> PathInfo {
    fn seconds(time: io::Result<SystemTime>) -> u64 {
        time.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    #[cfg(unix)]
    let attributes = {
        use std::os::unix::fs::MetadataExt;
        metadata.mode()
    };
    #[cfg(windows)]
    let attributes = {
        use std::os::windows::fs::MetadataExt;
        metadata.file_attributes()
    };

    PathInfo {
        size: metadata.len(),
        time_create: seconds(metadata.created()),
        time_access: seconds(metadata.accessed()),
        time_modified: seconds(metadata.modified()),
        attributes,
        is_file: metadata.is_file(),
    }
}

/// Post `entry` to the worker pool on behalf of the calling task and
/// suspend until the worker reposted it.
fn submit(entry: unsafe fn(&mut Work), arg: *mut ()) -> io::Result<()> {
    let lp = Loop::current().ok_or_else(not_on_loop)?;
    let current = lp.current_task();
    if current == lp.main_task() {
        return Err(io::Error::from_raw_os_error(sys::ecode::EDEADLK));
    }

    let mut work = Work::new(entry, arg);
    pool::post(&mut work)?;
    unsafe { task::suspend(current) }
}

unsafe fn request_path<'a>(path: *const u8, length: usize) -> &'a str {
    std::str::from_utf8_unchecked(std::slice::from_raw_parts(path, length))
}

fn os_error(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(sys::ecode::EIO)
}

struct OpenRequest {
    path: *const u8,
    path_len: usize,
    options: FileOptions,
    fd: sys::FileHandle,
    size: u64,
    error: i32,
}

unsafe fn open_entry(work: &mut Work) {
    let request = &mut *(work.arg as *mut OpenRequest);
    let path = request_path(request.path, request.path_len);

    let mut options = std::fs::OpenOptions::new();
    if request.options.contains(FileOptions::CREATE) {
        options.create(true).write(true);
    } else {
        options.read(true).write(true);
    }
    if request.options.contains(FileOptions::APPEND) {
        options.append(true);
    }
    if request.options.contains(FileOptions::TRUNCATE) {
        options.write(true).truncate(true);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NONBLOCK);
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_FLAG_OVERLAPPED; reads and writes go through the port.
        options.custom_flags(0x4000_0000);
    }

    match options.open(path) {
        Ok(file) => {
            if request.options.contains(FileOptions::APPEND) {
                // Seed the write cursor from the current end of file.
                request.size = file.metadata().map(|m| m.len()).unwrap_or(0);
            }
            request.fd = sys::file_into_handle(file);
        }
        Err(err) => request.error = os_error(&err),
    }

    pool::finish(work);
}

/// Open a file as a stream. The stream keeps independent read and write
/// cursors; with [`FileOptions::APPEND`] the write cursor starts at the end
/// of the file.
pub fn open(path: &str, options: FileOptions) -> io::Result<Stream> {
    let mut request = OpenRequest {
        path: path.as_ptr(),
        path_len: path.len(),
        options,
        fd: sys::INVALID_HANDLE,
        size: 0,
        error: 0,
    };

    submit(open_entry, &mut request as *mut OpenRequest as *mut ())?;

    if request.error != 0 {
        return Err(io::Error::from_raw_os_error(request.error));
    }

    let inner = Stream::allocate_plain(StreamKind::File, request.fd);
    let stream = Stream::from_inner(inner);
    if options.contains(FileOptions::APPEND) {
        unsafe { (*stream.as_inner()).info.write.position = request.size };
    }

    Ok(stream)
}

struct CloseRequest {
    fd: sys::FileHandle,
    error: i32,
}

unsafe fn close_entry(work: &mut Work) {
    let request = &mut *(work.arg as *mut CloseRequest);

    if let Err(err) = sys::close_fd(request.fd) {
        request.error = os_error(&err);
    }

    pool::finish(work);
}

/// Close a file stream's handle, through the pool when the caller can
/// suspend, inline otherwise (drops, non-task threads).
pub(crate) unsafe fn close_file_stream(
    stream: *mut StreamInner,
    may_suspend: bool,
) -> io::Result<()> {
    let fd = (*stream).fd;
    if fd == sys::INVALID_HANDLE {
        return Ok(());
    }

    if may_suspend {
        if let Some(lp) = Loop::current() {
            if lp.current_task() != lp.main_task() {
                let mut request = CloseRequest { fd, error: 0 };
                return match submit(close_entry, &mut request as *mut CloseRequest as *mut ()) {
                    Ok(()) if request.error == 0 => Ok(()),
                    Ok(()) => Err(io::Error::from_raw_os_error(request.error)),
                    Err(err) => Err(err),
                };
            }
        }
    }

    sys::close_fd(fd)
}

struct StatRequest {
    path: *const u8,
    path_len: usize,
    info: *mut PathInfo,
    error: i32,
}

unsafe fn stat_entry(work: &mut Work) {
    let request = &mut *(work.arg as *mut StatRequest);
    let path = request_path(request.path, request.path_len);

    match std::fs::metadata(path) {
        Ok(metadata) => *request.info = info_from_metadata(&metadata),
        Err(err) => request.error = os_error(&err),
    }

    pool::finish(work);
}

/// Stat a path.
pub fn path_info(path: &str) -> io::Result<PathInfo> {
    let mut info = PathInfo::default();
    let mut request = StatRequest {
        path: path.as_ptr(),
        path_len: path.len(),
        info: &mut info,
        error: 0,
    };

    submit(stat_entry, &mut request as *mut StatRequest as *mut ())?;

    if request.error != 0 {
        return Err(io::Error::from_raw_os_error(request.error));
    }
    Ok(info)
}

struct SetInfoRequest {
    path: *const u8,
    path_len: usize,
    info: *const PathInfo,
    error: i32,
}

unsafe fn set_info_entry(work: &mut Work) {
    let request = &mut *(work.arg as *mut SetInfoRequest);
    let path = request_path(request.path, request.path_len);
    let info = &*request.info;

    let times = std::fs::FileTimes::new()
        .set_accessed(UNIX_EPOCH + Duration::from_secs(info.time_access))
        .set_modified(UNIX_EPOCH + Duration::from_secs(info.time_modified));

    let result = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_times(times));
    if let Err(err) = result {
        request.error = os_error(&err);
        pool::finish(work);
        return;
    }

    #[cfg(unix)]
    if info.attributes != 0 {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) =
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(info.attributes))
        {
            request.error = os_error(&err);
        }
    }

    pool::finish(work);
}

/// Apply timestamps (and, on Unix, permission bits) to a path.
pub fn set_path_info(path: &str, info: &PathInfo) -> io::Result<()> {
    let mut request = SetInfoRequest {
        path: path.as_ptr(),
        path_len: path.len(),
        info,
        error: 0,
    };

    submit(set_info_entry, &mut request as *mut SetInfoRequest as *mut ())?;

    if request.error != 0 {
        return Err(io::Error::from_raw_os_error(request.error));
    }
    Ok(())
}

struct PathRequest {
    path: *const u8,
    path_len: usize,
    recursive: bool,
    error: i32,
}

impl PathRequest {
    fn new(path: &str) -> PathRequest {
        PathRequest {
            path: path.as_ptr(),
            path_len: path.len(),
            recursive: false,
            error: 0,
        }
    }
}

unsafe fn run_path_request(
    work: &mut Work,
    operation: fn(&str, bool) -> io::Result<()>,
) {
    let request = &mut *(work.arg as *mut PathRequest);
    let path = request_path(request.path, request.path_len);

    if let Err(err) = operation(path, request.recursive) {
        request.error = os_error(&err);
    }

    pool::finish(work);
}

unsafe fn create_file_entry(work: &mut Work) {
    run_path_request(work, |path, _| {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map(|_| ())
    });
}

unsafe fn delete_file_entry(work: &mut Work) {
    run_path_request(work, |path, _| std::fs::remove_file(path));
}

unsafe fn create_dir_entry(work: &mut Work) {
    run_path_request(work, |path, _| std::fs::create_dir(path));
}

unsafe fn delete_dir_entry(work: &mut Work) {
    run_path_request(work, |path, recursive| {
        if recursive {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_dir(path)
        }
    });
}

fn path_operation(
    entry: unsafe fn(&mut Work),
    path: &str,
    recursive: bool,
) -> io::Result<()> {
    let mut request = PathRequest::new(path);
    request.recursive = recursive;

    submit(entry, &mut request as *mut PathRequest as *mut ())?;

    if request.error != 0 {
        return Err(io::Error::from_raw_os_error(request.error));
    }
    Ok(())
}

/// Create an empty file (or open an existing one) without keeping it open.
pub fn create_file(path: &str) -> io::Result<()> {
    path_operation(create_file_entry, path, false)
}

pub fn delete_file(path: &str) -> io::Result<()> {
    path_operation(delete_file_entry, path, false)
}

pub fn create_dir(path: &str) -> io::Result<()> {
    path_operation(create_dir_entry, path, false)
}

/// Remove a directory; with `recursive`, its contents too.
pub fn delete_dir(path: &str, recursive: bool) -> io::Result<()> {
    path_operation(delete_dir_entry, path, recursive)
}

/// Directory change notification. Declared for interface completeness; not
/// implemented on any platform.
pub fn listen_dir(_path: &str, _timeout: u64) -> io::Result<()> {
    Err(io::Error::from_raw_os_error(sys::ecode::ENOSYS))
}

struct EnumOpenRequest {
    path: *const u8,
    path_len: usize,
    iterator: *mut Option<std::fs::ReadDir>,
    error: i32,
}

unsafe fn enum_open_entry(work: &mut Work) {
    let request = &mut *(work.arg as *mut EnumOpenRequest);
    let path = request_path(request.path, request.path_len);

    match std::fs::read_dir(path) {
        Ok(iterator) => *request.iterator = Some(iterator),
        Err(err) => request.error = os_error(&err),
    }

    pool::finish(work);
}

struct EnumNextRequest {
    iterator: *mut std::fs::ReadDir,
    name: *mut String,
    info: *mut PathInfo,
    end: bool,
    error: i32,
}

unsafe fn enum_next_entry(work: &mut Work) {
    let request = &mut *(work.arg as *mut EnumNextRequest);

    match (*request.iterator).next() {
        None => request.end = true,
        Some(Err(err)) => request.error = os_error(&err),
        Some(Ok(entry)) => {
            *request.name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata() {
                Ok(metadata) => *request.info = info_from_metadata(&metadata),
                Err(err) => request.error = os_error(&err),
            }
        }
    }

    pool::finish(work);
}

/// Walks a directory one entry per call. Dropping it releases the handle.
#[derive(Debug)]
pub struct DirectoryEnum {
    iterator: Option<std::fs::ReadDir>,
}

impl DirectoryEnum {
    pub fn open(path: &str) -> io::Result<DirectoryEnum> {
        let mut iterator = None;
        let mut request = EnumOpenRequest {
            path: path.as_ptr(),
            path_len: path.len(),
            iterator: &mut iterator,
            error: 0,
        };

        submit(enum_open_entry, &mut request as *mut EnumOpenRequest as *mut ())?;

        if request.error != 0 {
            return Err(io::Error::from_raw_os_error(request.error));
        }
        Ok(DirectoryEnum { iterator })
    }

    /// The next entry as `(name, info)`, or `None` at the end.
    pub fn next_entry(&mut self) -> io::Result<Option<(String, PathInfo)>> {
        let Some(iterator) = self.iterator.as_mut() else {
            return Ok(None);
        };

        let mut name = String::new();
        let mut info = PathInfo::default();
        let mut request = EnumNextRequest {
            iterator,
            name: &mut name,
            info: &mut info,
            end: false,
            error: 0,
        };

        submit(enum_next_entry, &mut request as *mut EnumNextRequest as *mut ())?;

        if request.error != 0 {
            return Err(io::Error::from_raw_os_error(request.error));
        }
        if request.end {
            return Ok(None);
        }
        Ok(Some((name, info)))
    }
}

#[cfg(test)]
mod tests {
    use super::FileOptions;

    #[test]
    fn options_combine_bitwise() {
        let options = FileOptions::CREATE | FileOptions::TRUNCATE;
        assert!(options.contains(FileOptions::CREATE));
        assert!(options.contains(FileOptions::TRUNCATE));
        assert!(!options.contains(FileOptions::APPEND));

        // An empty set contains nothing, not everything.
        assert!(!FileOptions::NONE.contains(FileOptions::CREATE));
        assert!(!FileOptions::NONE.contains(FileOptions::NONE));
    }
}
