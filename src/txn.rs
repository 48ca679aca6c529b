//! Thread-local nested transactions.
//!
//! Each thread keeps at most one transaction stack per connection, rooted in
//! a thread-local registry keyed by connection id. `put` appends to the
//! innermost open transaction (or commits immediately through a one-shot
//! implicit transaction); committing a nested transaction splices its rope
//! into the enclosing one; only the outermost commit touches disk. The
//! registry is dropped at thread exit, which rolls back anything left open:
//! buffered records that never reached a lease simply never existed.

use std::{cell::RefCell, collections::HashMap};

use parking_lot::MappedRwLockReadGuard;
use snafu::ResultExt;

use crate::{
    buffer::Buf,
    connection::Inner,
    lease::Lease,
    IoSnafu, LogSnafu, NoActiveTransactionSnafu, Result, MAX_SECTION_PAYLOAD,
};

#[derive(Default)]
struct Txn {
    buf: Buf,
}

thread_local! {
    /// This thread's transaction stacks, keyed by connection id.
    static STACKS: RefCell<HashMap<u64, Vec<Txn>>> = RefCell::new(HashMap::new());

    /// Per connection, the section this thread last committed into. Feeding
    /// it back into the lease walk as a lower bound keeps each thread's
    /// commits in non-decreasing section order, which is what lets a scan
    /// (section order) reproduce every thread's write order.
    static WRITE_FLOOR: RefCell<HashMap<u64, u32>> = RefCell::new(HashMap::new());
}

/// Opens a transaction nested inside whatever this thread has open.
pub(crate) fn begin(conn_id: u64) {
    STACKS.with(|stacks| {
        stacks
            .borrow_mut()
            .entry(conn_id)
            .or_default()
            .push(Txn::default());
    });
}

/// Buffers one record into the innermost open transaction, or commits it
/// straight through an implicit transaction when none is open. The implicit
/// transaction closes whatever the outcome.
pub(crate) fn put(
    conn_id: u64,
    inner: MappedRwLockReadGuard<'_, Inner>,
    record: Buf,
) -> Result<()> {
    STACKS.with(|stacks| {
        let mut stacks = stacks.borrow_mut();
        match stacks.get_mut(&conn_id).and_then(|stack| stack.last_mut()) {
            Some(top) => top.buf.append(&record),
            None => write_outer(conn_id, inner, &record),
        }
    })
}

/// Commits this thread's current transaction.
///
/// A nested commit splices into the enclosing transaction; the outermost
/// commit writes through a lease. An outermost commit that fails stays open
/// so the caller can retry or roll back.
pub(crate) fn commit(conn_id: u64, inner: MappedRwLockReadGuard<'_, Inner>) -> Result<()> {
    STACKS.with(|stacks| {
        let mut stacks = stacks.borrow_mut();
        let Some(stack) = stacks.get_mut(&conn_id) else {
            return NoActiveTransactionSnafu.fail();
        };
        match stack.as_mut_slice() {
            [] => return NoActiveTransactionSnafu.fail(),
            [outermost] => {
                write_outer(conn_id, inner, &outermost.buf)?;
            }
            [.., outer, innermost] => {
                outer.buf.append(&innermost.buf)?;
            }
        }
        stack.pop();
        if stack.is_empty() {
            stacks.remove(&conn_id);
        }
        Ok(())
    })
}

/// Rolls back this thread's innermost transaction.
pub(crate) fn rollback(conn_id: u64) -> Result<()> {
    STACKS.with(|stacks| {
        let mut stacks = stacks.borrow_mut();
        let Some(stack) = stacks.get_mut(&conn_id) else {
            return NoActiveTransactionSnafu.fail();
        };
        if stack.pop().is_none() {
            return NoActiveTransactionSnafu.fail();
        }
        if stack.is_empty() {
            stacks.remove(&conn_id);
        }
        Ok(())
    })
}

/// Drops every transaction the current thread has open on the connection.
/// Used by `close`; stacks on other threads are abandoned to their threads'
/// exit cleanup.
pub(crate) fn discard_stack(conn_id: u64) {
    STACKS.with(|stacks| {
        if let Some(stack) = stacks.borrow_mut().remove(&conn_id) {
            if !stack.is_empty() {
                debug!(
                    depth = stack.len(),
                    "Rolling back transactions left open at close."
                );
            }
        }
    });
    WRITE_FLOOR.with(|floors| {
        floors.borrow_mut().remove(&conn_id);
    });
}

/// The outermost commit: lease, write, sync, publish.
fn write_outer(conn_id: u64, inner: MappedRwLockReadGuard<'_, Inner>, buf: &Buf) -> Result<()> {
    let len = buf.len();
    if len == 0 {
        return Ok(());
    }

    let floor = WRITE_FLOOR.with(|floors| floors.borrow().get(&conn_id).copied()).unwrap_or(0);
    let mut lease = Lease::acquire_write(inner, len, floor)?;
    for fragment in buf.fragments() {
        lease.write(fragment)?;
    }

    // Data reaches disk before the entry that makes it visible; a crash in
    // between leaves the bytes beyond the recorded length, invisible.
    if !lease.inner().no_sync {
        lease.inner().db.sync_all().context(IoSnafu)?;
    }

    let new_len = lease.offset();
    debug_assert!(new_len <= MAX_SECTION_PAYLOAD);
    let entry = u16::try_from(new_len).expect("lease bounds entries to the section payload cap");
    lease
        .inner()
        .log
        .write_entry(lease.index(), entry)
        .context(LogSnafu)?;

    // Best-effort: the entry is ordered after its data either way; a lost
    // sync costs recency, not consistency.
    if !lease.inner().no_sync {
        if let Err(e) = lease.inner().log.sync() {
            warn!(error = %e, "Failed to sync section log after commit.");
        }
    }

    WRITE_FLOOR.with(|floors| {
        floors.borrow_mut().insert(conn_id, lease.index());
    });

    trace!(section = lease.index(), bytes = len, new_len, "Committed transaction.");
    Ok(())
}
