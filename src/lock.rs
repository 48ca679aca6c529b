//! Per-section reader/writer locks for threads of this process, layered
//! under the `fcntl` range locks that arbitrate between processes.
//!
//! Kernel range locks are process-wide: every thread of a process "holds"
//! them at once, so they cannot order threads against each other. Each
//! section therefore also has an in-process slot, a signed counter (`0`
//! free, `k > 0` readers, `-1` writer) living in 128-slot pages that grow
//! lock-free as higher section indexes appear. The in-process slot is always
//! taken *before* the kernel lock and released after it; otherwise a sibling
//! thread's unlock would drop the kernel lock out from under us.
//!
//! Both layers are non-blocking: an incompatible slot or a held kernel lock
//! produces [`LockError::WouldBlock`], the soft-fail that sends the lease
//! walk to another section.

use std::{
    io,
    sync::atomic::{AtomicI32, AtomicPtr, Ordering},
};

use crossbeam_utils::Backoff;
use snafu::{ResultExt, Snafu};

use crate::{
    common::LOG_ENTRY_LEN,
    log::SectionLog,
    sys::{self, RangeLockKind},
};

const SLOTS_PER_PAGE: u32 = 128;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LockMode {
    /// Shared. Read leases pin a length snapshot instead of locking, so
    /// nothing in the lease path takes this today; the slot protocol
    /// supports it for any cross-process reader that needs a stable entry.
    #[allow(dead_code)]
    Read,
    Write,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum LockError {
    /// The section is locked in an incompatible mode, here or in another
    /// process. Not an error: the caller tries another section.
    #[snafu(display("section is locked in an incompatible mode"))]
    WouldBlock,

    /// The kernel rejected the range lock for a real reason.
    #[snafu(display("section lock I/O error: {source}"))]
    Io { source: io::Error },
}

/// One page of lock slots covering sections `[start, start + 128)`.
struct Page {
    start: u32,
    slots: [AtomicI32; SLOTS_PER_PAGE as usize],
    next: AtomicPtr<Page>,
}

impl Page {
    fn new(start: u32, next: *mut Page) -> Self {
        Self {
            start,
            slots: std::array::from_fn(|_| AtomicI32::new(0)),
            next: AtomicPtr::new(next),
        }
    }
}

/// The connection's lock table.
///
/// Pages are installed at the list head with a compare-and-swap and are
/// never freed while the table is alive, so a slot reference stays valid for
/// the borrow of the table. The page count is bounded by the section count,
/// which only grows.
pub(crate) struct LockTable {
    head: AtomicPtr<Page>,
}

// SAFETY: pages are only ever installed (never unlinked) while shared, and
// all slot access is through atomics; the raw pointers are freed only with
// exclusive access in `Drop`.
unsafe impl Send for LockTable {}
unsafe impl Sync for LockTable {}

impl LockTable {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    fn entry_range(index: u32) -> (u64, u64) {
        (SectionLog::entry_offset(index), u64::from(LOG_ENTRY_LEN))
    }

    /// Finds the slot for `index`, installing its page first if needed.
    fn slot(&self, index: u32) -> &AtomicI32 {
        let start = index - (index % SLOTS_PER_PAGE);
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);

            let mut cursor = head;
            while !cursor.is_null() {
                // SAFETY: pages are never freed while the table is shared.
                let page = unsafe { &*cursor };
                if page.start == start {
                    return &page.slots[(index - start) as usize];
                }
                cursor = page.next.load(Ordering::Acquire);
            }

            // No page covers this section yet; try to install one at the
            // head. Losing the race drops our candidate and rewalks, so a
            // start index can never appear twice.
            let candidate = Box::into_raw(Box::new(Page::new(start, head)));
            match self
                .head
                .compare_exchange(head, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    trace!(start, "Installed lock page.");
                    // SAFETY: successfully published; never freed while shared.
                    return unsafe { &(*candidate).slots[(index - start) as usize] };
                }
                Err(_) => {
                    // SAFETY: the candidate was never published.
                    drop(unsafe { Box::from_raw(candidate) });
                    backoff.spin();
                }
            }
        }
    }

    fn undo_slot(slot: &AtomicI32, mode: LockMode) {
        match mode {
            LockMode::Read => slot.fetch_sub(1, Ordering::AcqRel),
            LockMode::Write => slot.fetch_add(1, Ordering::AcqRel),
        };
    }

    /// Acquires the section lock at both layers, in order.
    ///
    /// # Errors
    ///
    /// [`LockError::WouldBlock`] if either layer is held incompatibly;
    /// [`LockError::Io`] if the kernel call itself failed.
    pub fn acquire(&self, log: &SectionLog, index: u32, mode: LockMode) -> Result<(), LockError> {
        let slot = self.slot(index);
        let backoff = Backoff::new();
        let mut value = slot.load(Ordering::Acquire);
        loop {
            let desired = match mode {
                LockMode::Read if value >= 0 => value + 1,
                LockMode::Write if value == 0 => -1,
                _ => return WouldBlockSnafu.fail(),
            };
            match slot.compare_exchange_weak(value, desired, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => {
                    value = current;
                    backoff.spin();
                }
            }
        }

        // The slot is ours; now the cross-process layer. The lock covers the
        // log entry, not the section's data bytes: the entry is the
        // authority on the section's valid length, so serializing on it
        // serializes the operations that matter without blocking readers of
        // already-recorded bytes.
        let kind = match mode {
            LockMode::Read => RangeLockKind::Read,
            LockMode::Write => RangeLockKind::Write,
        };
        let (lock_start, lock_len) = Self::entry_range(index);
        match sys::try_lock_range(log.file(), kind, lock_start, lock_len) {
            Ok(true) => Ok(()),
            Ok(false) => {
                Self::undo_slot(slot, mode);
                WouldBlockSnafu.fail()
            }
            Err(e) => {
                Self::undo_slot(slot, mode);
                Err(e).context(IoSnafu)
            }
        }
    }

    /// Releases both layers, kernel lock first.
    pub fn release(&self, log: &SectionLog, index: u32, mode: LockMode) {
        let (lock_start, lock_len) = Self::entry_range(index);
        if let Err(e) = sys::unlock_range(log.file(), lock_start, lock_len) {
            warn!(index, error = %e, "Failed to release section range lock.");
        }
        Self::undo_slot(self.slot(index), mode);
    }
}

impl Drop for LockTable {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // SAFETY: `&mut self` means no outstanding slot borrows remain.
            let page = unsafe { Box::from_raw(cursor) };
            cursor = page.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use temp_dir::TempDir;

    use super::{LockError, LockMode, LockTable};
    use crate::log::SectionLog;

    fn test_log(dir: &TempDir) -> SectionLog {
        let db = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.child("db"))
            .expect("open should not fail");
        let log = SectionLog::create(&dir.child("db-log"), &db).expect("create should not fail");
        for _ in 0..4 {
            log.append_section().expect("append should not fail");
        }
        log
    }

    #[test]
    fn readers_share_and_writers_exclude() {
        let dir = TempDir::new().expect("creating temp dir should not fail");
        let log = test_log(&dir);
        let table = LockTable::new();

        table.acquire(&log, 0, LockMode::Read).expect("read lock should not fail");
        table.acquire(&log, 0, LockMode::Read).expect("second read lock should not fail");
        assert!(matches!(
            table.acquire(&log, 0, LockMode::Write),
            Err(LockError::WouldBlock)
        ));

        table.release(&log, 0, LockMode::Read);
        table.release(&log, 0, LockMode::Read);
        table.acquire(&log, 0, LockMode::Write).expect("write lock should not fail");
        assert!(matches!(
            table.acquire(&log, 0, LockMode::Read),
            Err(LockError::WouldBlock)
        ));
        assert!(matches!(
            table.acquire(&log, 0, LockMode::Write),
            Err(LockError::WouldBlock)
        ));
        table.release(&log, 0, LockMode::Write);
    }

    #[test]
    fn sections_lock_independently() {
        let dir = TempDir::new().expect("creating temp dir should not fail");
        let log = test_log(&dir);
        let table = LockTable::new();

        table.acquire(&log, 0, LockMode::Write).expect("write lock should not fail");
        table.acquire(&log, 1, LockMode::Write).expect("write lock should not fail");
        table.release(&log, 0, LockMode::Write);
        table.release(&log, 1, LockMode::Write);
    }

    #[test]
    fn pages_grow_past_the_first() {
        let dir = TempDir::new().expect("creating temp dir should not fail");
        let log = test_log(&dir);
        let table = LockTable::new();

        // Indexes three pages apart; exercises install and walk.
        for index in [0u32, 130, 300] {
            table.acquire(&log, index, LockMode::Write).expect("write lock should not fail");
        }
        for index in [0u32, 130, 300] {
            table.release(&log, index, LockMode::Write);
        }
    }

    #[test]
    fn contended_slots_recover_after_release() {
        let dir = TempDir::new().expect("creating temp dir should not fail");
        let log = test_log(&dir);
        let table = LockTable::new();

        table.acquire(&log, 2, LockMode::Write).expect("write lock should not fail");
        assert!(matches!(
            table.acquire(&log, 2, LockMode::Read),
            Err(LockError::WouldBlock)
        ));
        table.release(&log, 2, LockMode::Write);
        table.acquire(&log, 2, LockMode::Read).expect("read lock should not fail");
        table.release(&log, 2, LockMode::Read);
    }
}
