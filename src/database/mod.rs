//! # Database Handle
//!
//! The public face of burrowdb: a single-file key-value store with point
//! `get` / `set` / `delete`. This layer wires the B+tree to the pager and
//! the free list, validates caller input, and owns the commit protocol
//! (see `commit`).
//!
//! ## Open Semantics
//!
//! `open` creates the file when missing. A fresh database reserves page 0
//! for the meta page and page 1 for the initial free-list node; neither is
//! written until the first commit, so a zero-length file and a file whose
//! first commit never completed both open as empty. An existing file must
//! carry a meta page with the correct signature; the meta page is the only
//! thing trusted at open time, and everything else is reconstructed from
//! the page numbers and cursors it holds.
//!
//! ## Key Policy
//!
//! Keys are 1 to 1000 bytes; values up to 3000 bytes. The empty key is
//! reserved for the tree's internal sentinel and is rejected on `set` and
//! `delete`; `get` of the empty key reports absence rather than exposing
//! the sentinel entry.

mod commit;

use std::path::{Path, PathBuf};

use eyre::{ensure, Result};
use tracing::info;

use crate::btree::{BTree, PageAlloc, PageRead, MAX_KEY_SIZE, MAX_VAL_SIZE};
use crate::storage::{FreeList, Meta, Pager, PAGE_SIZE};

/// An open burrowdb store. Single writer; reads see the last committed
/// state plus any mutation made through this handle.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    pager: Pager,
    free: FreeList,
    tree: BTree,
    failed: bool,
}

impl Database {
    /// Opens or creates the database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (mut pager, file_size) = Pager::open(&path)?;

        let (tree, free) = if file_size == 0 || Self::meta_is_blank(&pager)? {
            // fresh database (or one whose very first commit never landed):
            // page 0 is reserved for the meta page, page 1 for the initial
            // free-list node; both materialize with the first commit
            pager.set_flushed(2);
            info!(path = %path.display(), "created database");
            (BTree::new(0), FreeList::new(1, 0, 1, 0))
        } else {
            let meta = *Meta::from_bytes(pager.meta_page()?)?;
            let npages = file_size / PAGE_SIZE as u64;
            ensure!(
                meta.flushed() >= 2 && meta.flushed() <= npages,
                "corrupt meta: {} flushed pages in a {}-page file",
                meta.flushed(),
                npages
            );
            ensure!(
                meta.root() < meta.flushed(),
                "corrupt meta: root {} beyond {} flushed pages",
                meta.root(),
                meta.flushed()
            );
            ensure!(
                (1..meta.flushed()).contains(&meta.free_head_page())
                    && (1..meta.flushed()).contains(&meta.free_tail_page())
                    && meta.free_head_seq() <= meta.free_tail_seq(),
                "corrupt meta: bad free-list cursors"
            );

            pager.set_flushed(meta.flushed());
            let free = FreeList::new(
                meta.free_head_page(),
                meta.free_head_seq(),
                meta.free_tail_page(),
                meta.free_tail_seq(),
            );
            info!(
                path = %path.display(),
                root = meta.root(),
                pages = meta.flushed(),
                "opened database"
            );
            (BTree::new(meta.root()), free)
        };

        Ok(Self {
            path,
            pager,
            free,
            tree,
            failed: false,
        })
    }

    // A nonzero file whose meta page was never written (crash between the
    // first data write and the first meta write) reads as all zeroes.
    fn meta_is_blank(pager: &Pager) -> Result<bool> {
        Ok(pager.meta_page()?[..16].iter().all(|&b| b == 0))
    }

    /// Point lookup. Never changes any page or the root.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Ok(None);
        }
        self.tree.get(&self.pager, key)
    }

    /// Inserts or replaces one key as a single atomic commit.
    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        ensure!(!key.is_empty(), "empty key");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key too large: {} > {}",
            key.len(),
            MAX_KEY_SIZE
        );
        ensure!(
            val.len() <= MAX_VAL_SIZE,
            "value too large: {} > {}",
            val.len(),
            MAX_VAL_SIZE
        );

        self.mutate(|tree, store| tree.insert(store, key, val).map(|_| true))
            .map(|_| ())
    }

    /// Removes one key; returns whether it existed. A miss neither
    /// rewrites the tree nor touches the file.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        ensure!(!key.is_empty(), "empty key");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key too large: {} > {}",
            key.len(),
            MAX_KEY_SIZE
        );

        self.mutate(|tree, store| tree.delete(store, key))
    }

    /// Releases the file descriptor and every mmap chunk. Nothing new is
    /// synced: durability was established per commit.
    pub fn close(self) -> Result<()> {
        drop(self);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PageRead for Pager {
    fn page(&self, pn: u64) -> Result<&[u8]> {
        Pager::page(self, pn)
    }
}

/// The tree's storage capability: reads resolve through the pager,
/// allocation prefers the free list over appending, and released pages
/// queue at the free-list tail.
pub(crate) struct TreeStore<'a> {
    pager: &'a mut Pager,
    free: &'a mut FreeList,
}

impl PageRead for TreeStore<'_> {
    fn page(&self, pn: u64) -> Result<&[u8]> {
        self.pager.page(pn)
    }
}

impl PageAlloc for TreeStore<'_> {
    fn create(&mut self, page: &[u8]) -> Result<u64> {
        let pn = self.free.pop_head(self.pager)?;
        if pn != 0 {
            // recycled pages were freed by earlier commits; nothing live
            // points at them, so they may be rewritten in place
            self.pager.page_mut(pn)?.copy_from_slice(page);
            Ok(pn)
        } else {
            Ok(self.pager.append(page))
        }
    }

    fn release(&mut self, pn: u64) -> Result<()> {
        self.free.push_tail(self.pager, pn)
    }
}
