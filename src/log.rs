//! The sidecar section log: one 16-bit valid-length entry per section.
//!
//! The log is the authority on which data-file bytes hold committed records.
//! It is created when the first connection on a host opens the database,
//! lives beside the data file while any connection is open, and is folded
//! back onto the end of the data file when the last connection closes.
//!
//! Creation writes the entry body *before* the header: a creator that
//! crashes in between leaves a file that fails validation and is rebuilt by
//! the next opener instead of being trusted.

use std::{
    fs::{self, File},
    io::{self, Write as _},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use bytes::{BufMut, BytesMut};
use snafu::{ResultExt, Snafu};

use crate::{
    common::{FILE_HEADER_LEN, FOLD_TRAILER_LEN, FORMAT_VERSION, LOG_ENTRY_LEN, LOG_MAGIC, SECTION_SIZE},
    sys::{self, RangeLockKind},
};

/// Error raised by sidecar log operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LogError {
    /// A general I/O error occurred.
    #[snafu(display("log I/O error: {source}"))]
    Io { source: io::Error },

    /// The file exists but its header is missing, carries the wrong magic,
    /// or names a version we do not understand. Openers respond by
    /// rebuilding the log from the data file.
    #[snafu(display("log header failed to validate"))]
    InvalidHeader,

    /// Creation was cut short by the debug-only crash-simulation hook,
    /// leaving a body-only file behind exactly as a real crash would.
    #[snafu(display("log creation aborted by test hook"))]
    CreateAborted,
}

/// Encodes the 6-byte file header used by both the sidecar and the fold
/// image.
pub(crate) fn encode_header(magic: &[u8; 4]) -> [u8; FILE_HEADER_LEN as usize] {
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    header[..4].copy_from_slice(magic);
    header[4..].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header
}

/// Checks a 6-byte header against the expected magic and version.
pub(crate) fn header_is_valid(header: &[u8], magic: &[u8; 4]) -> bool {
    header.len() == FILE_HEADER_LEN as usize
        && &header[..4] == magic
        && header[4..] == FORMAT_VERSION.to_le_bytes()
}

/// Handle to the open sidecar log.
pub(crate) struct SectionLog {
    /// Positional reads and writes, and the anchor for `fcntl` range locks.
    file: File,
    /// Second descriptor in append mode, used only to create sections:
    /// `pwrite` ignores the offset argument on an `O_APPEND` descriptor, so
    /// positional entry updates cannot share it.
    appender: File,
    path: PathBuf,
}

impl SectionLog {
    /// File offset of the entry for section `index`.
    pub fn entry_offset(index: u32) -> u64 {
        u64::from(FILE_HEADER_LEN) + u64::from(index) * u64::from(LOG_ENTRY_LEN)
    }

    /// Translates a log-file offset (typically the file length) back to a
    /// section index, rounding down over a partially appended entry.
    pub fn index_from_offset(offset: u64) -> u32 {
        let offset = offset.saturating_sub(u64::from(FILE_HEADER_LEN));
        u32::try_from(offset / u64::from(LOG_ENTRY_LEN)).unwrap_or(u32::MAX)
    }

    /// Opens and validates an existing sidecar log.
    ///
    /// # Errors
    ///
    /// [`LogError::InvalidHeader`] if the file is shorter than a header or
    /// the header does not validate; [`LogError::Io`] otherwise (including
    /// the file not existing).
    pub fn open(path: &Path) -> Result<Self, LogError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .context(IoSnafu)?;

        let mut header = [0u8; FILE_HEADER_LEN as usize];
        match file.read_exact_at(&mut header, 0) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return InvalidHeaderSnafu.fail();
            }
            Err(e) => return Err(e).context(IoSnafu),
        }
        if !header_is_valid(&header, LOG_MAGIC) {
            return InvalidHeaderSnafu.fail();
        }

        let appender = fs::OpenOptions::new().append(true).open(path).context(IoSnafu)?;
        Ok(Self {
            file,
            appender,
            path: path.to_path_buf(),
        })
    }

    /// Creates the sidecar log for the database open on `db`.
    ///
    /// If the data file ends in a fold block, the entries are resurrected
    /// from it; otherwise every physical section derived from the data-file
    /// length starts out empty. The body is written before the header so a
    /// crash mid-create leaves an invalid file, and a partial file from a
    /// *failed* create is unlinked rather than left around.
    ///
    /// # Errors
    ///
    /// [`LogError::Io`] on any underlying failure, including the file
    /// already existing (`create_new` semantics).
    pub fn create(path: &Path, db: &File) -> Result<Self, LogError> {
        let entries = match read_folded_entries(db)? {
            Some(entries) => {
                debug!(
                    sections = entries.len() / LOG_ENTRY_LEN as usize,
                    "Rebuilding section log from fold block."
                );
                entries
            }
            None => {
                let db_len = db.metadata().context(IoSnafu)?.len();
                let sections = db_len
                    .saturating_sub(u64::from(FILE_HEADER_LEN))
                    .div_ceil(u64::from(SECTION_SIZE));
                debug!(sections, "Data file has no fold block; starting all sections empty.");
                vec![0u8; usize::try_from(sections * u64::from(LOG_ENTRY_LEN)).unwrap_or(0)]
            }
        };

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .context(IoSnafu)?;

        match Self::write_body_then_header(&file, &entries) {
            Ok(()) => {}
            Err(e @ LogError::CreateAborted) => {
                // Simulated crash: the partial file stays behind on purpose.
                return Err(e);
            }
            Err(e) => {
                if let Err(unlink_err) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %unlink_err, "Failed to unlink partial log file.");
                }
                return Err(e);
            }
        }

        let appender = fs::OpenOptions::new().append(true).open(path).context(IoSnafu)?;
        Ok(Self {
            file,
            appender,
            path: path.to_path_buf(),
        })
    }

    fn write_body_then_header(file: &File, entries: &[u8]) -> Result<(), LogError> {
        if !entries.is_empty() {
            file.write_all_at(entries, u64::from(FILE_HEADER_LEN))
                .context(IoSnafu)?;
        }

        #[cfg(debug_assertions)]
        if std::env::var_os(crate::common::TEST_LOG_CREATE_RETURN_EARLY).is_some() {
            debug!("Aborting log creation before the header write.");
            return CreateAbortedSnafu.fail();
        }

        file.write_all_at(&encode_header(LOG_MAGIC), 0).context(IoSnafu)?;
        file.sync_all().context(IoSnafu)
    }

    /// Number of sections currently represented in the log, derived from the
    /// file length so it needs no shared cursor.
    pub fn section_count(&self) -> Result<u32, LogError> {
        let len = self.file.metadata().context(IoSnafu)?.len();
        Ok(Self::index_from_offset(len))
    }

    /// Reads the entry for section `index`, or `None` past the end of the
    /// log.
    pub fn read_entry(&self, index: u32) -> Result<Option<u16>, LogError> {
        let mut buf = [0u8; LOG_ENTRY_LEN as usize];
        match self.file.read_exact_at(&mut buf, Self::entry_offset(index)) {
            Ok(()) => Ok(Some(u16::from_le_bytes(buf))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e).context(IoSnafu),
        }
    }

    /// Positionally overwrites the entry for section `index`. The caller
    /// must hold the write lock on that section.
    pub fn write_entry(&self, index: u32, value: u16) -> Result<(), LogError> {
        self.file
            .write_all_at(&value.to_le_bytes(), Self::entry_offset(index))
            .context(IoSnafu)
    }

    /// Creates a new, empty section by appending a zero entry.
    ///
    /// The append descriptor makes this atomic against concurrent creators
    /// in this and other processes; racing appenders simply produce two new
    /// empty sections, and the loser of the race finds the winner's entry on
    /// its next walk.
    pub fn append_section(&self) -> Result<(), LogError> {
        let mut appender = &self.appender;
        appender.write_all(&[0u8; LOG_ENTRY_LEN as usize]).context(IoSnafu)
    }

    /// Syncs the log file itself.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// The log file descriptor, used to anchor per-entry range locks.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Folds the log into the data file and unlinks the sidecar, consuming
    /// the handle.
    ///
    /// Trailing empty sections are dropped from the image and the data file
    /// is truncated to its last valid byte before the image and trailer are
    /// appended. The caller holds the exclusive data-file `flock`; a
    /// blocking whole-file range lock on the log additionally fences any
    /// straggling cross-process writer.
    ///
    /// # Errors
    ///
    /// On error the sidecar is left in place, so no committed state is lost:
    /// the next opener finds a valid sidecar and simply uses it.
    pub fn fold_into(self, db: &File) -> Result<(), LogError> {
        sys::lock_range_wait(&self.file, RangeLockKind::Write, 0, 0).context(IoSnafu)?;

        let len = self.file.metadata().context(IoSnafu)?.len();
        let count = Self::index_from_offset(len);
        let mut raw = vec![0u8; count as usize * LOG_ENTRY_LEN as usize];
        if count > 0 {
            self.file
                .read_exact_at(&mut raw, u64::from(FILE_HEADER_LEN))
                .context(IoSnafu)?;
        }
        let entries: Vec<u16> = raw
            .chunks_exact(LOG_ENTRY_LEN as usize)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        // Truncate the data file to its last valid byte: the unused tail of
        // every trailing section goes, and wholly empty trailing sections
        // drop out of the folded image too.
        let mut data_len =
            u64::from(FILE_HEADER_LEN) + u64::from(count) * u64::from(SECTION_SIZE);
        let mut image_count = count as usize;
        for &entry in entries.iter().rev() {
            data_len -= u64::from(SECTION_SIZE) - u64::from(entry);
            if entry == 0 {
                image_count -= 1;
            } else {
                break;
            }
        }

        db.set_len(data_len).context(IoSnafu)?;

        let image_len = FILE_HEADER_LEN as usize
            + image_count * LOG_ENTRY_LEN as usize
            + FOLD_TRAILER_LEN as usize;
        let mut image = BytesMut::with_capacity(image_len);
        image.put_slice(&encode_header(LOG_MAGIC));
        image.put_slice(&raw[..image_count * LOG_ENTRY_LEN as usize]);
        image.put_u64_le(image_len as u64);
        db.write_all_at(&image, data_len).context(IoSnafu)?;
        db.sync_all().context(IoSnafu)?;

        debug!(
            sections = image_count,
            data_len = data_len + image_len as u64,
            "Folded section log into data file."
        );

        // Best-effort: a leftover sidecar is valid and simply wins over the
        // fold block at the next open.
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to unlink folded log file.");
        }
        Ok(())
    }
}

/// Reads the folded log entries off the end of the data file, if the file
/// ends in a fold block that validates. Returns the raw entry bytes.
fn read_folded_entries(db: &File) -> Result<Option<Vec<u8>>, LogError> {
    let db_len = db.metadata().context(IoSnafu)?.len();
    let min_len = u64::from(FILE_HEADER_LEN) * 2 + u64::from(FOLD_TRAILER_LEN);
    if db_len < min_len {
        return Ok(None);
    }

    let mut trailer = [0u8; FOLD_TRAILER_LEN as usize];
    db.read_exact_at(&mut trailer, db_len - u64::from(FOLD_TRAILER_LEN))
        .context(IoSnafu)?;
    let log_offset = u64::from_le_bytes(trailer);

    let image_min = u64::from(FILE_HEADER_LEN) + u64::from(FOLD_TRAILER_LEN);
    if log_offset < image_min || log_offset > db_len - u64::from(FILE_HEADER_LEN) {
        debug!(log_offset, "Fold trailer offset out of range; ignoring fold block.");
        return Ok(None);
    }

    let image_start = db_len - log_offset;
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    db.read_exact_at(&mut header, image_start).context(IoSnafu)?;
    if !header_is_valid(&header, LOG_MAGIC) {
        debug!("Fold block header failed to validate; ignoring fold block.");
        return Ok(None);
    }

    let entries_len = log_offset - image_min;
    if entries_len % u64::from(LOG_ENTRY_LEN) != 0 {
        debug!(entries_len, "Fold block entry run is torn; ignoring fold block.");
        return Ok(None);
    }

    let Ok(entries_len) = usize::try_from(entries_len) else {
        return Ok(None);
    };
    let mut entries = vec![0u8; entries_len];
    db.read_exact_at(&mut entries, image_start + u64::from(FILE_HEADER_LEN))
        .context(IoSnafu)?;
    Ok(Some(entries))
}
