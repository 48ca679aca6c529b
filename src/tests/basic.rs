use std::fs;

use super::{buf, collect, count_records, put_str, scratch_db};
use crate::{Connection, Error, OpenOptions};

#[test]
fn create_put_close_reopen_iterates_in_order() {
    let (_dir, path) = scratch_db();

    let conn = Connection::create(&path).expect("create should not fail");
    put_str(&conn, "a", "1");
    put_str(&conn, "a", "2");
    conn.close().expect("close should not fail");

    let conn = Connection::open(&path).expect("reopen should not fail");
    assert_eq!(
        collect(&conn),
        vec![
            ("a".to_string(), "1".to_string()),
            ("a".to_string(), "2".to_string()),
        ]
    );
    conn.close().expect("close should not fail");
}

#[test]
fn open_existing_rejects_foreign_file() {
    let (_dir, path) = scratch_db();
    fs::write(&path, b"XXXX not a database").expect("write should not fail");

    assert!(matches!(
        Connection::open(&path),
        Err(Error::InvalidFormat { .. })
    ));
}

#[test]
fn open_existing_rejects_missing_file() {
    let (_dir, path) = scratch_db();
    assert!(matches!(Connection::open(&path), Err(Error::Io { .. })));
}

#[test]
fn create_overwrites_invalid_file() {
    let (_dir, path) = scratch_db();
    fs::write(&path, b"XXXX garbage from some other tool").expect("write should not fail");

    let conn = Connection::create(&path).expect("create should overwrite");
    put_str(&conn, "k", "v");
    assert_eq!(collect(&conn), vec![("k".to_string(), "v".to_string())]);
    conn.close().expect("close should not fail");
}

#[test]
fn empty_database_scans_empty() {
    let (_dir, path) = scratch_db();
    let conn = Connection::create(&path).expect("create should not fail");
    assert_eq!(count_records(&conn), 0);
    conn.close().expect("close should not fail");
}

#[test]
fn put_is_visible_to_a_scan_on_the_same_connection() {
    let (_dir, path) = scratch_db();
    let conn = Connection::create(&path).expect("create should not fail");
    put_str(&conn, "k", "v");
    assert_eq!(collect(&conn), vec![("k".to_string(), "v".to_string())]);
    conn.close().expect("close should not fail");
}

#[test]
fn two_connections_share_the_file_and_the_last_close_folds() {
    let (dir, path) = scratch_db();

    // Mirrors two processes opening the same path: the first opener creates
    // the sidecar, the second joins it; only the last close folds.
    let first = Connection::create(&path).expect("first open should not fail");
    let second = Connection::create(&path).expect("second open should not fail");

    put_str(&first, "k", "v");
    put_str(&second, "k", "v");

    first.close().expect("close should not fail");
    assert!(
        dir.child("db-log").exists(),
        "sidecar must survive while a peer is open"
    );
    second.close().expect("close should not fail");
    assert!(
        !dir.child("db-log").exists(),
        "last close must fold the sidecar away"
    );

    let conn = Connection::open(&path).expect("reopen should not fail");
    assert_eq!(
        collect(&conn),
        vec![
            ("k".to_string(), "v".to_string()),
            ("k".to_string(), "v".to_string()),
        ]
    );
    conn.close().expect("close should not fail");
}

#[test]
fn operations_fail_cleanly_after_close() {
    let (_dir, path) = scratch_db();
    let conn = Connection::create(&path).expect("create should not fail");
    conn.close().expect("close should not fail");

    assert!(matches!(
        conn.put(&buf("k"), &buf("v")),
        Err(Error::Closed)
    ));
    assert!(matches!(conn.begin(), Err(Error::Closed)));
    assert!(matches!(conn.commit(), Err(Error::Closed)));
    let mut scan = conn.scan();
    assert!(matches!(scan.next(), Some(Err(Error::Closed))));
    // Closing twice is fine.
    conn.close().expect("second close should not fail");
}

#[test]
fn no_sync_connections_still_round_trip() {
    let (_dir, path) = scratch_db();
    let conn = OpenOptions::new()
        .create(true)
        .no_sync(true)
        .open(&path)
        .expect("open should not fail");
    for seq in 0..100 {
        put_str(&conn, "k", &seq.to_string());
    }
    conn.close().expect("close should not fail");

    let conn = Connection::open(&path).expect("reopen should not fail");
    let records = collect(&conn);
    assert_eq!(records.len(), 100);
    assert_eq!(records[99], ("k".to_string(), "99".to_string()));
    conn.close().expect("close should not fail");
}

#[test]
fn reopened_database_appends_into_the_partial_section() {
    let (_dir, path) = scratch_db();

    let conn = Connection::create(&path).expect("create should not fail");
    put_str(&conn, "old", "1");
    conn.close().expect("close should not fail");

    // The fold truncated the data file to the last valid byte; new records
    // land right after it in the same section.
    let conn = Connection::open(&path).expect("reopen should not fail");
    put_str(&conn, "new", "2");
    assert_eq!(
        collect(&conn),
        vec![
            ("old".to_string(), "1".to_string()),
            ("new".to_string(), "2".to_string()),
        ]
    );
    conn.close().expect("close should not fail");
}
