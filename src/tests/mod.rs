use temp_dir::TempDir;

use crate::{Buf, Connection};

mod basic;

/// Creates a scratch directory and returns it with the database path inside.
pub(crate) fn scratch_db() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("creating temp dir should not fail");
    let path = dir.child("db");
    (dir, path)
}

pub(crate) fn buf(data: &str) -> Buf {
    Buf::copy_from(data.as_bytes()).expect("buffer should not fail")
}

pub(crate) fn put_str(conn: &Connection, key: &str, value: &str) {
    conn.put(&buf(key), &buf(value)).expect("put should not fail");
}

/// Scans the whole database into owned `(key, value)` string pairs.
pub(crate) fn collect(conn: &Connection) -> Vec<(String, String)> {
    conn.scan()
        .map(|entry| {
            let (key, value) = entry.expect("scan should not fail");
            (
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            )
        })
        .collect()
}

/// Scans and returns only the raw record count.
pub(crate) fn count_records(conn: &Connection) -> usize {
    conn.scan()
        .map(|entry| entry.expect("scan should not fail"))
        .count()
}
