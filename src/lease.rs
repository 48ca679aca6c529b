//! Leases: scoped reservations of a byte range inside one section.
//!
//! A read lease pins the section's valid length as of acquisition, so a
//! scan never observes bytes committed after it entered the section. A write
//! lease owns the free tail of a section, found by walking the most recent
//! log entries backwards and appending a fresh section when none of them has
//! room. Contention at either lock layer is a soft failure that simply sends
//! the walk elsewhere; only real I/O errors surface.
//!
//! Every lease holds the connection's shared latch for its lifetime, which
//! is what keeps `close` from folding the log while a lease is in flight.

use bytes::Bytes;
use parking_lot::MappedRwLockReadGuard;
use snafu::{OptionExt, ResultExt};

use crate::{
    common::MAX_WALK,
    connection::{section_offset, Inner},
    lock::{LockError, LockMode},
    IoSnafu, LeaseExhaustedSnafu, LengthOverflowSnafu, LogSnafu, Result, TooLargeSnafu,
    MAX_SECTION_PAYLOAD,
};

use std::os::unix::fs::FileExt;

/// A movable cursor over a leased byte range of one section.
pub(crate) struct Lease<'conn> {
    inner: MappedRwLockReadGuard<'conn, Inner>,
    index: u32,
    /// Current position within the section.
    offset: u32,
    /// Bytes left on the lease from `offset`.
    remaining: u32,
    /// `Some` only for write leases; read leases are bounded by their length
    /// snapshot and take no lock.
    lock: Option<LockMode>,
}

impl<'conn> Lease<'conn> {
    /// Acquires a read lease on `index` starting at `offset`, bounded by the
    /// section's valid length at this instant.
    ///
    /// # Errors
    ///
    /// Fails if `offset` is at or past the section's valid length, or on I/O
    /// failure reading the log entry.
    pub fn acquire_read(
        inner: MappedRwLockReadGuard<'conn, Inner>,
        index: u32,
        offset: u32,
    ) -> Result<Lease<'conn>> {
        let entry = u32::from(inner.log.read_entry(index).context(LogSnafu)?.unwrap_or(0));
        if offset >= entry {
            return LeaseExhaustedSnafu {
                requested: offset,
                remaining: entry,
            }
            .fail();
        }
        trace!(section = index, offset, snapshot = entry, "Acquired read lease.");
        Ok(Lease {
            inner,
            index,
            offset,
            remaining: entry - offset,
            lock: None,
        })
    }

    /// Acquires a write lease over `size` bytes of free tail in some
    /// section, never older than section `min_index`.
    ///
    /// The walk starts at the most recent section and moves backwards up to
    /// [`MAX_WALK`] entries, taking the first with room; walking backwards
    /// keeps sections dense. When nothing in the window fits, a new empty
    /// section is appended and the walk restarts; a racing appender may
    /// claim it first, in which case the next round finds its entry and
    /// appends again, so no writer starves.
    ///
    /// `min_index` is each writer's ordering fence: scans return sections in
    /// index order, so a thread that never moves to an older section keeps
    /// its own commits in order no matter how the walk window shifts.
    ///
    /// # Errors
    ///
    /// Fails if `size` can never fit in one section, or on I/O failure.
    /// Lock contention is consumed internally by the walk.
    pub fn acquire_write(
        inner: MappedRwLockReadGuard<'conn, Inner>,
        size: u32,
        min_index: u32,
    ) -> Result<Lease<'conn>> {
        if size == 0 || size > MAX_SECTION_PAYLOAD {
            return TooLargeSnafu {
                size: u64::from(size),
                limit: MAX_SECTION_PAYLOAD,
            }
            .fail();
        }

        // Sections that soft-failed this round; retried only after the log
        // grows.
        let mut skip: Vec<u32> = Vec::new();

        let (index, start) = loop {
            let count = inner.log.section_count().context(LogSnafu)?;
            let low = count.saturating_sub(MAX_WALK).max(min_index.min(count));
            let mut candidate = None;
            for index in (low..count).rev() {
                if skip.contains(&index) {
                    continue;
                }
                let entry =
                    u32::from(inner.log.read_entry(index).context(LogSnafu)?.unwrap_or(0));
                if MAX_SECTION_PAYLOAD.saturating_sub(entry) >= size {
                    candidate = Some(index);
                    break;
                }
            }

            let Some(index) = candidate else {
                trace!(sections = count, size, "No walked section has room; appending one.");
                inner.log.append_section().context(LogSnafu)?;
                skip.clear();
                continue;
            };

            match inner.locks.acquire(&inner.log, index, LockMode::Write) {
                Ok(()) => {}
                Err(LockError::WouldBlock) => {
                    skip.push(index);
                    continue;
                }
                Err(LockError::Io { source }) => return Err(source).context(IoSnafu),
            }

            // The walk read the entry without the lock; re-check now that we
            // hold it.
            let entry = match inner.log.read_entry(index) {
                Ok(entry) => u32::from(entry.unwrap_or(0)),
                Err(e) => {
                    inner.locks.release(&inner.log, index, LockMode::Write);
                    return Err(e).context(LogSnafu);
                }
            };
            if MAX_SECTION_PAYLOAD.saturating_sub(entry) < size {
                inner.locks.release(&inner.log, index, LockMode::Write);
                skip.push(index);
                continue;
            }

            break (index, entry);
        };

        trace!(section = index, offset = start, size, "Acquired write lease.");
        Ok(Lease {
            inner,
            index,
            offset: start,
            remaining: size,
            lock: Some(LockMode::Write),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Current position within the section; after a commit's writes this is
    /// the section's new valid length.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// The connection state this lease pins.
    pub fn inner(&self) -> &Inner {
        &self.inner
    }

    fn absolute(&self) -> u64 {
        section_offset(self.index) + u64::from(self.offset)
    }

    fn bounds_check(&self, len: u32) -> Result<()> {
        if len > self.remaining {
            return LeaseExhaustedSnafu {
                requested: len,
                remaining: self.remaining,
            }
            .fail();
        }
        Ok(())
    }

    /// Reads `len` bytes at the cursor and advances past them.
    ///
    /// # Errors
    ///
    /// Fails if `len` exceeds the remaining lease, or on I/O failure.
    pub fn read(&mut self, len: u32) -> Result<Bytes> {
        self.bounds_check(len)?;
        let mut buf = vec![0u8; len as usize];
        self.inner
            .db
            .read_exact_at(&mut buf, self.absolute())
            .context(IoSnafu)?;
        self.offset += len;
        self.remaining -= len;
        Ok(Bytes::from(buf))
    }

    /// Writes `data` at the cursor and advances past it.
    ///
    /// # Errors
    ///
    /// Fails if `data` exceeds the remaining lease, or on I/O failure.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .ok()
            .context(LengthOverflowSnafu)?;
        self.bounds_check(len)?;
        debug_assert_eq!(self.lock, Some(LockMode::Write));
        self.inner
            .db
            .write_all_at(data, self.absolute())
            .context(IoSnafu)?;
        self.offset += len;
        self.remaining -= len;
        Ok(())
    }

    /// Advances the cursor `len` bytes without touching the file, for
    /// callers that want a record's value without reading its key.
    ///
    /// # Errors
    ///
    /// Fails if `len` exceeds the remaining lease.
    #[allow(dead_code)]
    pub fn seek(&mut self, len: u32) -> Result<()> {
        self.bounds_check(len)?;
        self.offset += len;
        self.remaining -= len;
        Ok(())
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(mode) = self.lock.take() {
            self.inner.locks.release(&self.inner.log, self.index, mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Lease;
    use crate::{
        tests::{count_records, put_str, scratch_db},
        Connection,
    };

    #[test]
    fn read_lease_pins_a_snapshot_and_bounds_io() {
        let (_dir, path) = scratch_db();
        let conn = Connection::create(&path).expect("create should not fail");
        put_str(&conn, "k", "abc"); // one 12-byte record in section 0

        let guard = conn.inner().expect("connection should be open");
        let mut lease = Lease::acquire_read(guard, 0, 0).expect("lease should not fail");
        assert_eq!(lease.remaining(), 12);

        lease.seek(8).expect("seek should not fail"); // past the record header
        assert_eq!(lease.read(1).expect("read should not fail").as_ref(), b"k");
        assert_eq!(lease.read(3).expect("read should not fail").as_ref(), b"abc");
        assert_eq!(lease.remaining(), 0);
        assert!(lease.read(1).is_err());
        assert!(lease.seek(1).is_err());
        drop(lease);

        conn.close().expect("close should not fail");
    }

    #[test]
    fn read_lease_requires_committed_bytes() {
        let (_dir, path) = scratch_db();
        let conn = Connection::create(&path).expect("create should not fail");

        let guard = conn.inner().expect("connection should be open");
        assert!(Lease::acquire_read(guard, 0, 0).is_err());
        conn.close().expect("close should not fail");
    }

    #[test]
    fn write_lease_starts_at_the_recorded_tail() {
        let (_dir, path) = scratch_db();
        let conn = Connection::create(&path).expect("create should not fail");
        put_str(&conn, "k", "v"); // 10 bytes committed to section 0

        let guard = conn.inner().expect("connection should be open");
        let mut lease = Lease::acquire_write(guard, 5, 0).expect("lease should not fail");
        assert_eq!(lease.index(), 0);
        assert_eq!(lease.offset(), 10);
        lease.write(b"hello").expect("write should not fail");
        assert_eq!(lease.offset(), 15);
        assert!(lease.write(b"x").is_err());
        drop(lease);

        // The entry was never updated, so the unpublished bytes stay
        // invisible.
        assert_eq!(count_records(&conn), 1);
        conn.close().expect("close should not fail");
    }

    #[test]
    fn contended_write_leases_land_on_distinct_sections() {
        let (_dir, path) = scratch_db();
        let conn = Connection::create(&path).expect("create should not fail");
        put_str(&conn, "k", "v");

        let lease_a =
            Lease::acquire_write(conn.inner().expect("connection should be open"), 100, 0)
                .expect("lease should not fail");
        // Section 0 is locked; the walk must soft-fail past it and append a
        // fresh section.
        let lease_b =
            Lease::acquire_write(conn.inner().expect("connection should be open"), 100, 0)
                .expect("lease should not fail");
        assert_ne!(lease_a.index(), lease_b.index());

        drop(lease_b);
        drop(lease_a);
        conn.close().expect("close should not fail");
    }

    #[test]
    fn min_index_fences_the_walk_forward() {
        let (_dir, path) = scratch_db();
        let conn = Connection::create(&path).expect("create should not fail");
        put_str(&conn, "k", "v"); // section 0 has plenty of room

        let guard = conn.inner().expect("connection should be open");
        let lease = Lease::acquire_write(guard, 100, 1).expect("lease should not fail");
        assert!(lease.index() >= 1, "fence must keep the lease off section 0");
        drop(lease);
        conn.close().expect("close should not fail");
    }
}
