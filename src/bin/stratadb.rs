//! Interactive shell for a stratadb data directory.
//!
//! A thin line parser over the engine API:
//!
//! ```text
//! SET <key> <value>     insert or overwrite
//! GET <key>             print the value or "not found"
//! DELETE <key>          write a tombstone
//! SCAN <start> <end>    print pairs, both ends inclusive
//! FLUSH                 force the memtable to disk
//! STATS                 per-level table counts and sizes
//! exit                  close and quit
//! ```
//!
//! `stratadb <dir> test` runs a scripted end-to-end battery against a
//! scratch subdirectory and exits non-zero on the first failure.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stratadb::{Db, DbConfig, DbError};

#[derive(Parser, Debug)]
#[command(name = "stratadb", version, about = "Embeddable leveled LSM key-value store")]
struct Cli {
    /// Data directory (created if missing).
    dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the self-test battery and exit non-zero on any failure.
    Test,
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Command::Test) => self_test(&cli.dir),
        None => shell(&cli.dir),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Interactive shell
// ------------------------------------------------------------------------------------------------

fn shell(dir: &PathBuf) -> Result<(), DbError> {
    let db = Db::open(dir, DbConfig::default())?;
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [] => continue,

            ["SET", key, value] => match db.put(key.as_bytes(), value.as_bytes()) {
                Ok(()) => println!("ok"),
                Err(e) => println!("error: {e}"),
            },

            ["GET", key] => match db.get(key.as_bytes()) {
                Ok(Some(value)) => println!("{}", String::from_utf8_lossy(&value)),
                Ok(None) => println!("not found"),
                Err(e) => println!("error: {e}"),
            },

            ["DELETE", key] => match db.delete(key.as_bytes()) {
                Ok(()) => println!("ok"),
                Err(e) => println!("error: {e}"),
            },

            ["SCAN", start, end] => match db.scan(start.as_bytes(), end.as_bytes()) {
                Ok(iter) => {
                    for (key, value) in iter {
                        println!(
                            "{} = {}",
                            String::from_utf8_lossy(&key),
                            String::from_utf8_lossy(&value)
                        );
                    }
                }
                Err(e) => println!("error: {e}"),
            },

            ["FLUSH"] => match db.flush() {
                Ok(()) => println!("ok"),
                Err(e) => println!("error: {e}"),
            },

            ["STATS"] => match db.stats() {
                Ok(stats) => {
                    println!(
                        "memtable: {} records, {} bytes",
                        stats.memtable_records, stats.memtable_bytes
                    );
                    for (i, level) in stats.levels.iter().enumerate() {
                        if level.tables > 0 {
                            println!("L{i}: {} tables, {} bytes", level.tables, level.bytes);
                        }
                    }
                    println!(
                        "cache: {} hits, {} misses",
                        stats.cache_hits, stats.cache_misses
                    );
                }
                Err(e) => println!("error: {e}"),
            },

            ["exit"] => break,

            _ => println!("usage: SET k v | GET k | DELETE k | SCAN a b | FLUSH | STATS | exit"),
        }
    }

    db.close()
}

// ------------------------------------------------------------------------------------------------
// Self-test battery
// ------------------------------------------------------------------------------------------------

fn self_test(dir: &PathBuf) -> Result<(), DbError> {
    let scratch = dir.join(format!(
        "selftest-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));
    std::fs::create_dir_all(&scratch)?;

    let mut failures = 0u32;
    let mut check = |name: &str, passed: bool| {
        if passed {
            println!("PASS {name}");
        } else {
            println!("FAIL {name}");
            failures += 1;
        }
    };

    let config = DbConfig {
        write_buffer_size: 4 * 1024,
        arena_capacity: 64 * 1024,
        l0_compaction_trigger: 1,
        max_key_size: 1024,
        max_value_size: 4096,
        ..DbConfig::default()
    };

    // Durability across a simulated crash.
    {
        let db = Db::open(&scratch, config.clone())?;
        db.put(b"User:100", b"Alice")?;
        drop(db);
        let db = Db::open(&scratch, config.clone())?;
        check(
            "durability",
            db.get(b"User:100")? == Some(b"Alice".to_vec()),
        );

        // Shadowing across memtable and disk.
        db.put(b"k", b"v1")?;
        db.flush()?;
        db.put(b"k", b"v2")?;
        check("shadowing", db.get(b"k")? == Some(b"v2".to_vec()));

        // Compaction preserves the newest version.
        db.put(b"k", b"v3")?;
        db.flush()?;
        while db.compact()? {}
        check("compaction", db.get(b"k")? == Some(b"v3".to_vec()));

        // Tombstones hide deleted keys.
        db.delete(b"k")?;
        check("tombstone", db.get(b"k")? == None);

        // Scan: ordered, deduplicated, tombstone-free, inclusive.
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
            db.put(k.as_bytes(), v.as_bytes())?;
        }
        db.flush()?;
        db.delete(b"b")?;
        let pairs: Vec<_> = db.scan(b"a", b"c")?.collect();
        check(
            "scan",
            pairs
                == vec![
                    (b"a".to_vec(), b"1".to_vec()),
                    (b"c".to_vec(), b"3".to_vec()),
                ],
        );

        db.close()?;
    }

    let _ = std::fs::remove_dir_all(&scratch);

    if failures > 0 {
        return Err(DbError::Internal(format!("{failures} self-tests failed")));
    }
    println!("all self-tests passed");
    Ok(())
}
