//! Platform-specific file primitives
//!
//! Two concerns live here: durable sync (every OS spells "this write
//! survives power loss" differently) and positioned reads (so the read path
//! can fetch a record under a shared lock, without seeking a shared handle).

use std::fs::File;
use std::io;

/// Ensure file data is durably written to persistent storage before returning.
///
/// Linux uses fdatasync(): data reaches the device without forcing a
/// metadata flush. macOS/iOS need fcntl(F_FULLFSYNC) — plain fsync() there
/// only reaches the drive's volatile cache. Windows maps to
/// FlushFileBuffers(). Everything else falls back to sync_data().
///
/// May block for milliseconds under heavy I/O; callers must not hold locks
/// that a reader needs for progress unless that is the intended ordering.
pub fn durable_sync(file: &File) -> io::Result<()> {
    sync_impl(file)
}

#[cfg(target_os = "linux")]
fn sync_impl(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: fdatasync operates on the fd of a live File borrow.
    let rc = unsafe { libc::fdatasync(file.as_raw_fd()) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn sync_impl(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: fcntl(F_FULLFSYNC) operates on the fd of a live File borrow.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

#[cfg(target_os = "windows")]
fn sync_impl(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::FlushFileBuffers;
    // SAFETY: FlushFileBuffers operates on the handle of a live File borrow.
    let rc = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
    if rc != 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "windows"
)))]
fn sync_impl(file: &File) -> io::Result<()> {
    file.sync_data()
}

/// Read exactly `buf.len()` bytes at `offset` without moving any shared
/// file cursor. Fails with UnexpectedEof if the file ends first.
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    read_at_impl(file, buf, offset)
}

#[cfg(unix)]
fn read_at_impl(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_at_impl(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut pos = 0usize;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }
        pos += n;
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn read_at_impl(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut handle = file.try_clone()?;
    handle.seek(SeekFrom::Start(offset))?;
    handle.read_exact(buf)
}
