//! Connection lifecycle: open/verify/create, the cross-process `flock`
//! protocol, close-with-fold, and the public record operations.

use std::{
    fmt,
    fs::{self, File},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use snafu::ResultExt;

use crate::{
    common::{OpenOptions, DATA_MAGIC, FILE_HEADER_LEN, LOG_FILE_SUFFIX, SECTION_SIZE},
    iter::Scan,
    lock::LockTable,
    log::{encode_header, header_is_valid, LogError, SectionLog},
    record::RecordHeader,
    sys::{self, FlockMode},
    txn, Buf, ClosedSnafu, InvalidFormatSnafu, IoSnafu, LogSnafu, Result, TooLargeSnafu,
    MAX_SECTION_PAYLOAD,
};

/// Connection ids are process-unique and never reused, so a transaction
/// stack orphaned on another thread by `close` can never alias a later
/// connection.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// File offset where section `index` begins.
pub(crate) fn section_offset(index: u32) -> u64 {
    u64::from(FILE_HEADER_LEN) + u64::from(index) * u64::from(SECTION_SIZE)
}

/// State behind the connection latch, torn down by `close`.
pub(crate) struct Inner {
    pub db: File,
    pub log: SectionLog,
    pub locks: LockTable,
    pub no_sync: bool,
}

/// An open LogDB database.
///
/// A single `Connection` is safely shared by many threads without external
/// locking; share it by reference or behind an `Arc`. Opening multiple
/// connections to the same file within one process is not supported (the
/// kernel locks that arbitrate sections are process-wide). Across processes,
/// connections cooperate through advisory file locks.
pub struct Connection {
    id: u64,
    path: PathBuf,
    latch: RwLock<Option<Inner>>,
}

impl Connection {
    /// Opens an existing database. Fails if the file is missing or does not
    /// validate.
    ///
    /// # Errors
    ///
    /// See [`OpenOptions::open`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        OpenOptions::new().open(path)
    }

    /// Opens a database, creating it if missing and overwriting an invalid
    /// existing file.
    ///
    /// # Errors
    ///
    /// See [`OpenOptions::open`].
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        OpenOptions::new().create(true).open(path)
    }

    pub(crate) fn open_with(path: &Path, options: &OpenOptions) -> Result<Self> {
        let mut fs_options = fs::OpenOptions::new();
        fs_options.read(true).write(true);
        if options.create {
            fs_options.create(true);
        }
        let db = fs_options.open(path).context(IoSnafu)?;
        validate_or_init_data_header(&db, options.create)?;

        let log_path = sidecar_path(path);
        let log = open_or_create_log(&db, &log_path)?;

        debug!(path = %path.display(), "Opened database connection.");
        Ok(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
            latch: RwLock::new(Some(Inner {
                db,
                log,
                locks: LockTable::new(),
                no_sync: options.no_sync,
            })),
        })
    }

    /// Takes the shared latch and projects to the live state, failing if the
    /// connection was closed. Every public operation goes through here, so
    /// `close` (which takes the latch exclusively) cannot tear the state
    /// down under a running operation.
    pub(crate) fn inner(&self) -> Result<MappedRwLockReadGuard<'_, Inner>> {
        RwLockReadGuard::try_map(self.latch.read(), Option::as_ref)
            .map_err(|_| ClosedSnafu.build())
    }

    /// Writes a key/value record.
    ///
    /// With no transaction open on this thread, the record is committed (and
    /// durable, unless `no_sync`) before this returns. Inside a transaction
    /// it is buffered until the outermost commit.
    ///
    /// # Errors
    ///
    /// Fails if the record cannot fit in a section, or on any I/O failure
    /// along the commit path; an implicit transaction is closed either way.
    pub fn put(&self, key: &Buf, value: &Buf) -> Result<()> {
        let header = RecordHeader {
            key_len: key.len(),
            value_len: value.len(),
        };
        let record_len = header.record_len();
        if record_len > u64::from(MAX_SECTION_PAYLOAD) {
            return TooLargeSnafu {
                size: record_len,
                limit: MAX_SECTION_PAYLOAD,
            }
            .fail();
        }

        let mut record = Buf::copy_from(&header.encode())?;
        record.append(key)?;
        record.append(value)?;

        let inner = self.inner()?;
        txn::put(self.id, inner, record)
    }

    /// Begins a transaction on this thread. Transactions nest: an inner
    /// commit merges into the enclosing transaction, and only the outermost
    /// commit reaches disk.
    ///
    /// # Errors
    ///
    /// Fails only if the connection is closed.
    pub fn begin(&self) -> Result<()> {
        let _inner = self.inner()?;
        txn::begin(self.id);
        Ok(())
    }

    /// Commits the current transaction on this thread.
    ///
    /// On failure the transaction stays open: retry the commit or roll it
    /// back.
    ///
    /// # Errors
    ///
    /// Fails if no transaction is open on this thread, or on any I/O failure
    /// along the commit path.
    pub fn commit(&self) -> Result<()> {
        let inner = self.inner()?;
        txn::commit(self.id, inner)
    }

    /// Rolls back the current (innermost) transaction on this thread; its
    /// buffered records never reach disk.
    ///
    /// # Errors
    ///
    /// Fails if no transaction is open on this thread.
    pub fn rollback(&self) -> Result<()> {
        let _inner = self.inner()?;
        txn::rollback(self.id)
    }

    /// Returns an iterator over every record, in section order.
    ///
    /// The scan snapshots each section's valid length as it enters it, so
    /// records committed to a section after the scan passed it are not
    /// observed.
    pub fn scan(&self) -> Scan<'_> {
        Scan::new(self)
    }

    /// Closes the connection.
    ///
    /// Open transactions on the calling thread are rolled back; transactions
    /// on other threads are abandoned to their threads' exit cleanup. If
    /// this connection is the last opener of the file on this host, the
    /// sidecar log is folded into the data file and unlinked.
    ///
    /// Dropping the connection closes it too; call `close` to observe fold
    /// errors.
    ///
    /// # Errors
    ///
    /// Fails if the fold could not be completed; the sidecar is left behind
    /// in that case and the next open recovers from it.
    pub fn close(&self) -> Result<()> {
        txn::discard_stack(self.id);

        let mut latch = self.latch.write();
        let Some(inner) = latch.take() else {
            return Ok(());
        };
        let Inner { db, log, locks, .. } = inner;
        drop(locks);

        let result = match sys::try_flock(&db, FlockMode::Exclusive) {
            Ok(true) => {
                debug!(path = %self.path.display(), "Last opener; folding section log.");
                log.fold_into(&db).context(LogSnafu)
            }
            Ok(false) => {
                // Peers remain; the sidecar stays live for them.
                drop(log);
                Ok(())
            }
            Err(e) => {
                drop(log);
                Err(e).context(IoSnafu)
            }
        };

        if let Err(e) = sys::funlock(&db) {
            warn!(error = %e, "Failed to release data file lock on close.");
        }
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.latch.get_mut().is_some() {
            if let Err(e) = self.close() {
                warn!(path = %self.path.display(), error = %e, "Error while closing connection on drop.");
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("closed", &self.latch.read().is_none())
            .finish()
    }
}

/// Derives the sidecar log path from the database path.
fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(LOG_FILE_SUFFIX);
    PathBuf::from(name)
}

/// Validates the data-file header, initializing or overwriting it when the
/// create flag permits.
fn validate_or_init_data_header(db: &File, create: bool) -> Result<()> {
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    let valid = match db.read_exact_at(&mut header, 0) {
        Ok(()) => header_is_valid(&header, DATA_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e).context(IoSnafu),
    };
    if valid {
        return Ok(());
    }
    if !create {
        return InvalidFormatSnafu { file: "data file" }.fail();
    }

    // The create flag turns an invalid file into a fresh database.
    db.set_len(0).context(IoSnafu)?;
    db.write_all_at(&encode_header(DATA_MAGIC), 0).context(IoSnafu)?;
    db.sync_all().context(IoSnafu)?;
    Ok(())
}

/// The open-time `flock` protocol:
///
/// 1. Try a non-blocking exclusive lock. The winner is the sole opener on
///    this host: it recovers or creates the sidecar, then downgrades to
///    shared so peers may join.
/// 2. Losers take the shared lock (blocking) and open the sidecar the winner
///    maintains.
/// 3. If the sidecar has vanished, the peer folded and closed between our
///    two lock calls; drop the lock and race for exclusivity exactly once
///    more.
fn open_or_create_log(db: &File, log_path: &Path) -> Result<SectionLog> {
    let mut retried = false;
    loop {
        if sys::try_flock(db, FlockMode::Exclusive).context(IoSnafu)? {
            let log = match SectionLog::open(log_path) {
                Ok(log) => {
                    // Newest committed state wins: a valid sidecar left by a
                    // crashed process supersedes any fold block.
                    debug!(path = %log_path.display(), "Using existing sidecar log.");
                    log
                }
                Err(LogError::Io { source }) if source.kind() == io::ErrorKind::NotFound => {
                    SectionLog::create(log_path, db).context(LogSnafu)?
                }
                Err(LogError::InvalidHeader) => {
                    warn!(
                        path = %log_path.display(),
                        "Sidecar log failed to validate; rebuilding from the data file."
                    );
                    fs::remove_file(log_path).context(IoSnafu)?;
                    SectionLog::create(log_path, db).context(LogSnafu)?
                }
                Err(e) => return Err(e).context(LogSnafu),
            };
            sys::flock(db, FlockMode::Shared).context(IoSnafu)?;
            return Ok(log);
        }

        sys::flock(db, FlockMode::Shared).context(IoSnafu)?;
        match SectionLog::open(log_path) {
            Ok(log) => return Ok(log),
            Err(LogError::Io { source })
                if source.kind() == io::ErrorKind::NotFound && !retried =>
            {
                debug!("Sidecar log vanished under us; retrying the open handshake.");
                retried = true;
                sys::funlock(db).context(IoSnafu)?;
            }
            Err(e) => return Err(e).context(LogSnafu),
        }
    }
}
