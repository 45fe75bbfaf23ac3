//! # burrowdb - Embedded Single-File Key-Value Store
//!
//! burrowdb is an embedded, persistent, ordered key-value store backed by a
//! single file. It provides point lookups, insertions, and deletions over
//! variable-length binary keys and values through a durable copy-on-write
//! B+tree.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::Database;
//!
//! let mut db = Database::open("./data.db")?;
//! db.set(b"hello", b"world")?;
//!
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//!
//! db.delete(b"hello")?;
//! db.close()?;
//! ```
//!
//! ## Architecture
//!
//! burrowdb uses a layered architecture:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Public API (Database)         │
//! ├─────────────────────────────────────┤
//! │   Commit Protocol (two-fsync)       │
//! ├─────────────────────────────────────┤
//! │   Copy-on-Write B+Tree  │ Free List │
//! ├─────────────────────────────────────┤
//! │   Pager (staging + dirty pages)     │
//! ├─────────────────────────────────────┤
//! │   Memory-Mapped File I/O            │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Durability Model
//!
//! Every `set` and `delete` is one atomic commit. Mutations never overwrite
//! live pages: the B+tree rewrites changed nodes into freshly allocated
//! pages, old pages are recycled through an on-disk free list, and a
//! two-fsync protocol (data, then the meta page holding the root pointer)
//! makes the new tree visible atomically. A crash at any point leaves the
//! file describing the last fully committed state.
//!
//! ## Module Overview
//!
//! - [`storage`]: memory-mapped page access, staging pager, free list, meta page
//! - [`btree`]: copy-on-write B+tree with page-granular nodes
//! - `database`: the public [`Database`] handle and commit protocol

pub mod btree;
pub mod storage;

mod database;

pub use database::Database;
