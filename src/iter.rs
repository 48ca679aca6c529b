//! Full-scan iteration: section at a time, bounded by read leases.

use bytes::Bytes;
use snafu::ResultExt;

use crate::{
    connection::Connection,
    lease::Lease,
    record::{RecordHeader, RECORD_HEADER_LEN},
    LogSnafu, Result, TruncatedRecordSnafu,
};

/// Iterator over every record of a database, in section order.
///
/// Within a section, records come back in insertion order. The scan takes a
/// read lease per non-empty section, pinning that section's valid length the
/// moment it enters it, and releases the lease at the section boundary;
/// concurrent commits to sections the scan already passed (or entered) are
/// not observed.
///
/// Returned by [`Connection::scan`].
pub struct Scan<'conn> {
    conn: &'conn Connection,
    lease: Option<Lease<'conn>>,
    next_index: u32,
    done: bool,
}

impl<'conn> Scan<'conn> {
    pub(crate) fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            lease: None,
            next_index: 0,
            done: false,
        }
    }

    fn next_record(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        loop {
            if let Some(lease) = self.lease.as_mut() {
                if lease.remaining() == 0 {
                    // Section boundary; drop the lease before hunting for
                    // the next one.
                    self.lease = None;
                    continue;
                }
                if lease.remaining() < RECORD_HEADER_LEN {
                    return TruncatedRecordSnafu {
                        index: lease.index(),
                    }
                    .fail();
                }

                let header = RecordHeader::decode(&lease.read(RECORD_HEADER_LEN)?);
                let body_len = u64::from(header.key_len) + u64::from(header.value_len);
                if body_len > u64::from(lease.remaining()) {
                    return TruncatedRecordSnafu {
                        index: lease.index(),
                    }
                    .fail();
                }

                let key = lease.read(header.key_len)?;
                let value = lease.read(header.value_len)?;
                return Ok(Some((key, value)));
            }

            // Hunt for the next non-empty section; EOF of the log ends the
            // scan.
            let inner = self.conn.inner()?;
            let index = loop {
                match inner.log.read_entry(self.next_index).context(LogSnafu)? {
                    None => return Ok(None),
                    Some(0) => self.next_index += 1,
                    Some(_) => break self.next_index,
                }
            };
            self.next_index = index + 1;
            self.lease = Some(Lease::acquire_read(inner, index, 0)?);
        }
    }
}

impl Iterator for Scan<'_> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
