//! # LogDB: append-oriented key/value storage over two files.
//!
//! LogDB is an embedded store backed by a **data file** and a sidecar **log
//! file** on a POSIX filesystem. The data file is a fixed header followed by
//! fixed-size *sections* of [`SECTION_SIZE`] bytes, each holding a run of
//! variable-length records packed from offset zero. The sidecar log holds one
//! 16-bit entry per section recording how many bytes of that section are
//! valid. A key may be stored any number of times; a scan returns every
//! record in insertion order. There is no secondary index and no key lookup.
//!
//! ## Design constraints
//!
//! - records never span sections, and never exceed [`MAX_SECTION_PAYLOAD`]
//!   bytes including their header
//! - section bytes below the recorded valid length are immutable
//! - a section's log entry only ever grows, until the log is folded back into
//!   the data file at close
//! - all on-disk integers are little-endian
//!
//! ## Concurrency model
//!
//! Many threads of one process share a single [`Connection`]; many processes
//! on one host cooperate through kernel advisory locks. A whole-file `flock`
//! serializes open and close-with-fold; per-section `fcntl` range locks on
//! the log entries serialize appenders across processes. Within the process,
//! a lock table of signed counters plays the same role for threads, and is
//! always taken before the kernel lock it shadows.
//!
//! Writers operate through *leases*: a write lease reserves the free tail of
//! some section found by walking the most recent log entries backwards, and a
//! read lease pins a length snapshot so scans are bounded against concurrent
//! appenders.
//!
//! ## Durability
//!
//! A commit writes record bytes into the leased section, syncs the data file
//! (unless the connection was opened with `no_sync`), then writes the new
//! valid length into the sidecar log. Only once the log entry is written is
//! the commit visible; bytes beyond the recorded length are undefined and
//! never surfaced. The last connection to close folds the log image onto the
//! end of the data file and unlinks the sidecar; the next opener recreates
//! the sidecar from the fold block.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

use snafu::Snafu;

mod buffer;
pub use buffer::Buf;

mod common;
pub use common::{OpenOptions, MAX_SECTION_PAYLOAD, SECTION_SIZE};

mod connection;
pub use connection::Connection;

mod iter;
pub use iter::Scan;

mod lease;
mod lock;

mod log;
pub use log::LogError;

mod record;
mod sys;
mod txn;

#[cfg(test)]
mod tests;

/// Error surfaced by the public connection operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A kernel call failed.
    #[snafu(display("I/O error: {source}"))]
    Io { source: std::io::Error },

    /// The file at the given path is not a LogDB file of a version we
    /// understand. With the create flag, such a file is overwritten instead.
    #[snafu(display("{file} has a missing, invalid, or unsupported header"))]
    InvalidFormat { file: &'static str },

    /// The sidecar log could not be opened, created, or folded.
    #[snafu(display("section log error: {source}"))]
    Log { source: LogError },

    /// A record (or a transaction's accumulated records) cannot fit in the
    /// free tail of any section.
    #[snafu(display("payload of {size} bytes exceeds the section capacity of {limit} bytes"))]
    TooLarge { size: u64, limit: u32 },

    /// A buffer chain grew past the on-disk size type.
    #[snafu(display("buffer length overflows the on-disk size type"))]
    LengthOverflow,

    /// `commit` or `rollback` with no transaction open on this thread.
    #[snafu(display("no transaction is active on this thread"))]
    NoActiveTransaction,

    /// Operation on a connection that has already been closed.
    #[snafu(display("connection is closed"))]
    Closed,

    /// A lease-bounded read, write, or seek ran past the leased range.
    #[snafu(display(
        "operation of {requested} bytes exceeds the {remaining} bytes left on the lease"
    ))]
    LeaseExhausted { requested: u32, remaining: u32 },

    /// A section's recorded length does not cover a whole number of records.
    #[snafu(display("section {index} contains a truncated record"))]
    TruncatedRecord { index: u32 },
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
