//! # Commit Protocol
//!
//! One `set` or `delete` is one atomic unit, carried by a two-fsync
//! sequence:
//!
//! 1. Snapshot the current meta state (root, high-watermark, free-list
//!    cursors) in memory.
//! 2. Open the free list's consumable range (`set_max_seq`), so the
//!    mutation cannot be handed a page it frees itself.
//! 3. Run the tree mutation. It stages new pages, dirties free-list pages,
//!    and moves the in-memory root; the file is untouched.
//! 4. Write the staged run (vectored, at the high-watermark) and the dirty
//!    pages, extending the mmap over the projected size first.
//! 5. fsync the data. Until this holds, the old meta still describes a
//!    fully intact tree.
//! 6. Write the new meta page at offset 0 and fsync again. The second
//!    fsync is the linearization point: before it, a crash recovers the
//!    old state; after it, the new one.
//!
//! ## Failure
//!
//! If any step fails, the in-memory state (root, watermark, cursors) is
//! restored from the snapshot, buffered writes are discarded, and a sticky
//! `failed` flag is set. Reads keep serving the pre-commit state. The next
//! mutation first rewrites the on-disk meta page from the reverted state
//! and fsyncs it: a failed data write may have scribbled past the old
//! high-watermark, and although such pages are unreachable, the meta
//! rewrite guarantees disk and memory agree before anything new lands.

use eyre::Result;
use tracing::{info, warn};
use zerocopy::IntoBytes;

use super::{Database, TreeStore};
use crate::btree::BTree;
use crate::storage::Meta;

impl Database {
    /// Runs one tree mutation as an atomic commit. `op` reports whether it
    /// changed anything; an unchanged tree (a deletion miss) skips the
    /// write path entirely.
    pub(crate) fn mutate<F>(&mut self, op: F) -> Result<bool>
    where
        F: FnOnce(&mut BTree, &mut TreeStore<'_>) -> Result<bool>,
    {
        let snapshot = self.meta();

        if self.failed {
            self.pager.write_meta(snapshot.as_bytes())?;
            self.pager.sync()?;
            self.failed = false;
            info!("restored meta page after failed commit");
        }

        self.free.set_max_seq();
        let changed = {
            let mut store = TreeStore {
                pager: &mut self.pager,
                free: &mut self.free,
            };
            op(&mut self.tree, &mut store)
        };
        let changed = match changed {
            Ok(changed) => changed,
            Err(e) => {
                // nothing reached the file; roll the in-memory state back
                self.revert(&snapshot);
                return Err(e);
            }
        };
        if !changed {
            return Ok(false);
        }

        match self.commit() {
            Ok(()) => Ok(true),
            Err(e) => {
                self.failed = true;
                self.revert(&snapshot);
                warn!("commit failed, reverted to previous root: {}", e);
                Err(e)
            }
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.pager.flush()?;
        self.pager.sync()?;

        let meta = self.meta();
        self.pager.write_meta(meta.as_bytes())?;
        self.pager.sync()
    }

    fn meta(&self) -> Meta {
        Meta::new(
            self.tree.root(),
            self.pager.flushed(),
            self.free.head_page(),
            self.free.head_seq(),
            self.free.tail_page(),
            self.free.tail_seq(),
        )
    }

    fn revert(&mut self, meta: &Meta) {
        self.tree.set_root(meta.root());
        self.pager.set_flushed(meta.flushed());
        self.free.reset(
            meta.free_head_page(),
            meta.free_head_seq(),
            meta.free_tail_page(),
            meta.free_tail_seq(),
        );
        self.pager.discard();
    }
}
