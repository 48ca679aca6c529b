//! Thin safe wrappers over the kernel advisory-lock calls.
//!
//! Everything else in the crate does file I/O through `std` (`FileExt` for
//! positional reads and writes); only the `flock(2)` whole-file locks and the
//! `fcntl(2)` byte-range locks have no std surface and go through `libc`
//! here.

use std::{
    fs::File,
    io,
    os::unix::io::AsRawFd,
};

/// Whole-file advisory lock modes for [`flock`]/[`try_flock`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FlockMode {
    Shared,
    Exclusive,
}

impl FlockMode {
    fn operation(self) -> libc::c_int {
        match self {
            FlockMode::Shared => libc::LOCK_SH,
            FlockMode::Exclusive => libc::LOCK_EX,
        }
    }
}

/// Byte-range lock kinds for [`try_lock_range`]/[`lock_range_wait`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RangeLockKind {
    Read,
    Write,
    Unlock,
}

impl RangeLockKind {
    fn lock_type(self) -> libc::c_short {
        #[allow(clippy::cast_possible_truncation)]
        let ty = match self {
            RangeLockKind::Read => libc::F_RDLCK,
            RangeLockKind::Write => libc::F_WRLCK,
            RangeLockKind::Unlock => libc::F_UNLCK,
        } as libc::c_short;
        ty
    }
}

/// Takes a whole-file `flock`, blocking until it is granted.
///
/// Also used to downgrade an exclusive lock to a shared one; the kernel may
/// briefly release the lock during the conversion.
pub(crate) fn flock(file: &File, mode: FlockMode) -> io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), mode.operation()) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Attempts a whole-file `flock` without blocking.
///
/// Returns `Ok(false)` if another descriptor holds a conflicting lock.
pub(crate) fn try_flock(file: &File, mode: FlockMode) -> io::Result<bool> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), mode.operation() | libc::LOCK_NB) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

/// Releases a whole-file `flock`.
pub(crate) fn funlock(file: &File) -> io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn flock_struct(kind: RangeLockKind, start: u64, len: u64) -> io::Result<libc::flock> {
    let mut flk: libc::flock = unsafe { std::mem::zeroed() };
    flk.l_type = kind.lock_type();
    #[allow(clippy::cast_possible_truncation)]
    {
        flk.l_whence = libc::SEEK_SET as libc::c_short;
    }
    flk.l_start = libc::off_t::try_from(start)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "lock offset out of range"))?;
    flk.l_len = libc::off_t::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "lock length out of range"))?;
    Ok(flk)
}

/// Attempts a non-blocking `fcntl` byte-range lock.
///
/// Returns `Ok(false)` if another *process* holds a conflicting lock. Range
/// locks are process-wide: a conflicting lock held by another thread of this
/// process is invisible here, which is why callers serialize in-process
/// first.
pub(crate) fn try_lock_range(
    file: &File,
    kind: RangeLockKind,
    start: u64,
    len: u64,
) -> io::Result<bool> {
    let flk = flock_struct(kind, start, len)?;
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &flk) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        // POSIX permits either errno for a held lock.
        if matches!(err.raw_os_error(), Some(libc::EAGAIN | libc::EACCES)) {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

/// Takes an `fcntl` byte-range lock, blocking until it is granted.
///
/// A zero `len` locks from `start` to the end of the file, however far it
/// grows.
pub(crate) fn lock_range_wait(
    file: &File,
    kind: RangeLockKind,
    start: u64,
    len: u64,
) -> io::Result<()> {
    let flk = flock_struct(kind, start, len)?;
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &flk) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Drops an `fcntl` byte-range lock.
pub(crate) fn unlock_range(file: &File, start: u64, len: u64) -> io::Result<()> {
    let flk = flock_struct(RangeLockKind::Unlock, start, len)?;
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &flk) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
