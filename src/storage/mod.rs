//! # Storage Module
//!
//! This module provides the storage layer for burrowdb: a single backing
//! file, addressed in fixed-size pages, read through a read-only memory
//! mapping and written only at commit time.
//!
//! ## Architecture Overview
//!
//! The storage layer separates three concerns:
//!
//! - `mmap`: low-level file access. The file is mapped read-only in chunks
//!   that are appended as the file grows and never unmapped while the
//!   database is open, so page references handed out earlier stay valid.
//!   Writes bypass the mapping and go through the file descriptor
//!   (`pwritev` for the staged run, `pwrite` for in-place pages).
//! - `pager`: page-number resolution and write buffering. New pages are
//!   staged in memory with page numbers above the durable high-watermark;
//!   in-place mutations of committed pages (used only by the free list) are
//!   buffered in a dirty-page table. Nothing reaches the file until the
//!   commit protocol flushes both.
//! - `freelist` / `meta`: the on-disk free-page queue and the 64-byte meta
//!   page that anchors everything reachable in the file.
//!
//! ## Page Addressing
//!
//! All storage uses 4KB (4096 byte) pages addressed by a 64-bit page
//! number. Page number 0 holds the meta page and doubles as the nil page
//! reference: no live page is ever addressed as 0.
//!
//! ## File Layout
//!
//! ```text
//! Offset 0:       Meta page (64 bytes used, rest reserved)
//! Offset 4096:    Page 1 (initial free-list head)
//! Offset 8192:    Page 2 ...
//! ```
//!
//! Pages `1..flushed` are B+tree nodes, free-list nodes, or garbage left
//! behind by aborted commits; the meta page's `flushed` high-watermark is
//! the only authority on which bytes are meaningful.

mod freelist;
mod meta;
mod mmap;
mod pager;

pub use freelist::{FreeList, FREE_LIST_CAP, FREE_LIST_HEADER};
pub use meta::{Meta, DB_SIGNATURE, META_SIZE};
pub use mmap::MmapFile;
pub use pager::Pager;

pub const PAGE_SIZE: usize = 4096;

/// Smallest mmap chunk mapped at a time. Mapping generously ahead of the
/// file keeps chunk counts low; the excess is never touched until the file
/// grows under it.
pub const MIN_MMAP_CHUNK: usize = 64 << 20;
