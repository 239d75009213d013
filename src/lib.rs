//! # StrataDB
//!
//! An embeddable, persistent, **ordered** key-value store built on a
//! leveled **Log-Structured Merge Tree (LSM-tree)**. Designed for fast
//! writes, crash-safe operation, and bounded read amplification through
//! background compaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                        Db                             │
//! │  ┌────────────┐   ┌──────────────────────────────┐    │
//! │  │  MemTable  │   │  Levels                      │    │
//! │  │ (skip-list │   │  L0: newest-first, may       │    │
//! │  │  + arena)  │   │      overlap                 │    │
//! │  │  + WAL     │   │  L1..Ln: disjoint key ranges │    │
//! │  └─────┬──────┘   └───────────┬──────────────────┘    │
//! │        │  flush               │  leveled compaction   │
//! │        └──────────► L0 ───────┘  (background worker)  │
//! │                                                       │
//! │  ┌──────────────┐  ┌─────────────┐  ┌─────────────┐   │
//! │  │ Block cache  │  │ Bloom       │  │ Manifest    │   │
//! │  │ (LRU, bytes) │  │ filters     │  │ (atomic)    │   │
//! │  └──────────────┘  └─────────────┘  └─────────────┘   │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Core storage engine — open, read, write, scan, flush |
//! | [`memtable`] | In-memory sorted write buffer (skip-list over an arena) |
//! | [`wal`] | Append-only redo log for the live memtable |
//! | [`sstable`] | Immutable sorted tables: writer, reader, iterator |
//! | [`filter`] | Per-table bloom filters for negative point lookups |
//! | [`cache`] | Bounded LRU cache of verified data blocks |
//! | [`manifest`] | Durable record of the live file set, saved atomically |
//! | [`compaction`] | Background leveled compaction worker |
//!
//! ## Key Properties
//!
//! - **Write-ahead logging** — every mutation is fsynced to the WAL before
//!   it is acknowledged; a crash never loses an acknowledged write.
//! - **Ordered iteration** — scans merge the memtable and every
//!   overlapping table into a single ascending, tombstone-free stream.
//! - **Leveled compaction** — L0 files may overlap; every deeper level
//!   holds disjoint key ranges, keeping point reads bounded.
//! - **Bloom filters** — each table carries a sibling filter file; a
//!   negative lookup usually costs zero block reads.
//! - **Atomic metadata** — the manifest is rewritten via temp-file +
//!   rename, so the visible file set is always a fully-written one.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratadb::{Db, DbConfig};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! db.put(b"hello", b"world").unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! db.delete(b"hello").unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), None);
//!
//! db.put(b"a", b"1").unwrap();
//! db.put(b"b", b"2").unwrap();
//! let pairs: Vec<_> = db.scan(b"a", b"z").unwrap().collect();
//!
//! db.close().unwrap();
//! ```

pub mod cache;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod entry;
pub mod filter;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use config::DbConfig;
pub use engine::{Db, DbError, DbStats};
pub use entry::Entry;
