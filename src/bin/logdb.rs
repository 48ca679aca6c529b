//! Command-line companion for LogDB files: `dump` prints every record,
//! `stress` hammers a database with concurrent writers.

use std::{path::PathBuf, process::ExitCode, thread, time::Instant};

use clap::{Parser, Subcommand};
use logdb::{Buf, Connection, OpenOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "logdb", about = "Inspect and exercise LogDB database files.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every record in the database as `key: value` lines.
    Dump {
        /// Path to the database file.
        file: PathBuf,
    },
    /// Write records from many threads at once to shake out contention bugs.
    Stress {
        /// Path to the database file (created if missing).
        file: PathBuf,
        /// Each thread writes under the key `<key-prefix><thread-number>`.
        key_prefix: String,
        /// Number of writer threads to spawn.
        threads: u32,
        /// Records written per thread; values are the sequence numbers.
        count: u32,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let result = match Cli::parse().command {
        Command::Dump { file } => dump(&file),
        Command::Stress {
            file,
            key_prefix,
            threads,
            count,
        } => stress(&file, &key_prefix, threads, count),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("logdb: {e}");
            ExitCode::FAILURE
        }
    }
}

fn dump(file: &std::path::Path) -> logdb::Result<()> {
    let conn = Connection::open(file)?;
    for entry in conn.scan() {
        let (key, value) = entry?;
        println!(
            "{}: {}",
            String::from_utf8_lossy(&key),
            String::from_utf8_lossy(&value)
        );
    }
    conn.close()
}

fn stress(file: &std::path::Path, key_prefix: &str, threads: u32, count: u32) -> logdb::Result<()> {
    let conn = OpenOptions::new().create(true).open(file)?;
    let started = Instant::now();

    thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                let conn = &conn;
                let key = format!("{key_prefix}{t}");
                scope.spawn(move || -> logdb::Result<()> {
                    let key = Buf::copy_from(key.as_bytes())?;
                    for seq in 0..count {
                        let value = Buf::copy_from(seq.to_string().as_bytes())?;
                        conn.put(&key, &value)?;
                    }
                    Ok(())
                })
            })
            .collect();

        for worker in workers {
            worker
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
        }
        Ok(())
    })?;

    conn.close()?;
    println!(
        "wrote {} records across {threads} threads in {:?}",
        u64::from(threads) * u64::from(count),
        started.elapsed()
    );
    Ok(())
}
