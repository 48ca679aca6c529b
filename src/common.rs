use std::path::Path;

use crate::{connection::Connection, Result};

/// Size of one data-file section. Fixed at build time; changing it makes
/// existing files unreadable.
pub const SECTION_SIZE: u32 = 65_536;

/// Version stamped into both file headers. Bump on any layout change.
pub(crate) const FORMAT_VERSION: u16 = 1;

/// Magic cookie at byte 0 of the data file.
pub(crate) const DATA_MAGIC: &[u8; 4] = b"LDBF";

/// Magic cookie at byte 0 of the sidecar log file.
pub(crate) const LOG_MAGIC: &[u8; 4] = b"LDBL";

/// Both file headers are a 4-byte magic followed by a `u16` version.
pub(crate) const FILE_HEADER_LEN: u32 = 6;

/// Each sidecar log entry is a single little-endian `u16`.
pub(crate) const LOG_ENTRY_LEN: u32 = 2;

/// The fold trailer is a single little-endian `u64`.
pub(crate) const FOLD_TRAILER_LEN: u32 = 8;

/// The most valid bytes a section can ever hold. Every record pays an 8-byte
/// header, so a section can never be packed past this and the 16-bit log
/// entries lose nothing.
pub const MAX_SECTION_PAYLOAD: u32 = SECTION_SIZE - crate::record::RECORD_HEADER_LEN;

/// How many recent sections a write lease walks before appending a new one.
/// Walking backwards keeps writes dense; the bound keeps the search cheap.
pub(crate) const MAX_WALK: u32 = 4;

/// Suffix appended to the database path to derive the sidecar log path.
pub(crate) const LOG_FILE_SUFFIX: &str = "-log";

/// Debug-only hook: when set, log creation aborts after the body write and
/// before the header write, simulating a crash mid-create. Release builds
/// never check it.
pub(crate) const TEST_LOG_CREATE_RETURN_EARLY: &str = "LOGDB_TEST_LOG_CREATE_RETURN_EARLY";

/// Options controlling how a database file is opened.
///
/// The defaults match opening an existing database: the file must already be
/// a valid LogDB database, and every commit syncs the data file before the
/// write becomes visible.
#[derive(Clone, Debug, Default)]
pub struct OpenOptions {
    pub(crate) create: bool,
    pub(crate) no_sync: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the database file if it does not exist. An existing file that
    /// is not a valid LogDB database is overwritten.
    ///
    /// Defaults to `false`: opening fails unless the file exists and carries
    /// a valid header.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Skip the data-file sync on commit.
    ///
    /// Commits remain atomic (the log entry is still written only after the
    /// data write), but after a crash the records written since the last sync
    /// the OS performed on its own may be lost.
    ///
    /// Defaults to `false`.
    pub fn no_sync(mut self, no_sync: bool) -> Self {
        self.no_sync = no_sync;
        self
    }

    /// Opens a connection to the database at `path` with these options.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created, if its
    /// header does not validate (without the create flag), or if the sidecar
    /// log cannot be opened or rebuilt.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Connection> {
        Connection::open_with(path.as_ref(), &self)
    }
}

#[cfg(test)]
mod tests {
    use super::{MAX_SECTION_PAYLOAD, SECTION_SIZE};

    #[test]
    fn section_payload_fits_the_entry_type() {
        // The log stores valid lengths as u16; the record header overhead
        // guarantees every legal value is representable.
        assert!(MAX_SECTION_PAYLOAD <= u32::from(u16::MAX));
        assert_eq!(MAX_SECTION_PAYLOAD, SECTION_SIZE - 8);
    }
}
