//! # Pager
//!
//! The pager gives the rest of the system a flat, page-numbered view of the
//! database file while keeping every mutation in memory until commit.
//!
//! ## Page Resolution
//!
//! A page number resolves against three layers, newest first:
//!
//! 1. **Staging list**: pages appended by the current operation. Page
//!    number `flushed + i` maps to staging slot `i`.
//! 2. **Dirty table**: committed pages mutated in place by the current
//!    operation. Only the free list does this: it owns its pages outright
//!    and its on-disk structure is bounded by the cursors in the meta page,
//!    so rewriting them never perturbs state reachable from the previous
//!    commit.
//! 3. **Mmap**: the committed file contents.
//!
//! ## High-Watermark
//!
//! `flushed` counts pages durably written by previous commits. Every staged
//! page receives the next number past the watermark, so the staged run is
//! contiguous and the commit can write it with one vectored `pwritev` at
//! `flushed * PAGE_SIZE`. After the data fsync the watermark advances and
//! both buffers clear; on failure `discard` throws both away and the
//! watermark is restored from the meta snapshot.

use eyre::{bail, ensure, Result};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

use super::{MmapFile, PAGE_SIZE};

#[derive(Debug)]
pub struct Pager {
    mmap: MmapFile,
    flushed: u64,
    staged: Vec<Box<[u8]>>,
    dirty: HashMap<u64, Box<[u8]>>,
    #[cfg(test)]
    pub(crate) fail_next_flush: bool,
}

impl Pager {
    /// Opens or creates the backing file. Returns the pager (with the
    /// high-watermark still unset) and the file size; the caller loads or
    /// initializes the meta state and calls [`Pager::set_flushed`].
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<(Self, u64)> {
        let (mmap, file_size) = MmapFile::open(path)?;
        Ok((
            Self {
                mmap,
                flushed: 0,
                staged: Vec::new(),
                dirty: HashMap::new(),
                #[cfg(test)]
                fail_next_flush: false,
            },
            file_size,
        ))
    }

    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    pub fn set_flushed(&mut self, flushed: u64) {
        self.flushed = flushed;
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Raw bytes of page 0, for meta loading at open time.
    pub fn meta_page(&self) -> Result<&[u8]> {
        self.mmap.page(0)
    }

    /// Immutable view of page `pn`.
    pub fn page(&self, pn: u64) -> Result<&[u8]> {
        if pn >= self.flushed {
            let slot = (pn - self.flushed) as usize;
            match self.staged.get(slot) {
                Some(page) => Ok(page),
                None => bail!(
                    "page {} beyond high-watermark {} + {} staged",
                    pn,
                    self.flushed,
                    self.staged.len()
                ),
            }
        } else if let Some(page) = self.dirty.get(&pn) {
            Ok(page)
        } else {
            self.mmap.page(pn)
        }
    }

    /// Stages a new page and returns its page number.
    pub fn append(&mut self, page: &[u8]) -> u64 {
        assert_eq!(page.len(), PAGE_SIZE);
        let pn = self.flushed + self.staged.len() as u64;
        self.staged.push(page.into());
        pn
    }

    /// Writable copy of page `pn`. A staged page is edited directly; a
    /// committed page is copied into the dirty table on first touch and
    /// rewritten in place at commit.
    pub fn page_mut(&mut self, pn: u64) -> Result<&mut [u8]> {
        if pn >= self.flushed {
            let slot = (pn - self.flushed) as usize;
            ensure!(
                slot < self.staged.len(),
                "page {} beyond high-watermark {} + {} staged",
                pn,
                self.flushed,
                self.staged.len()
            );
            return Ok(&mut self.staged[slot]);
        }
        match self.dirty.entry(pn) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let copy: Box<[u8]> = self.mmap.page(pn)?.into();
                Ok(entry.insert(copy))
            }
        }
    }

    /// Writes the staged run and the dirty pages to the file and advances
    /// the high-watermark. Does not sync; the commit protocol owns fsync
    /// ordering.
    pub fn flush(&mut self) -> Result<()> {
        #[cfg(test)]
        if self.fail_next_flush {
            self.fail_next_flush = false;
            bail!("injected flush failure");
        }

        let projected = (self.flushed as usize + self.staged.len()) * PAGE_SIZE;
        self.mmap.extend_to(projected)?;

        self.mmap
            .write_pages_at(&self.staged, self.flushed * PAGE_SIZE as u64)?;
        for (&pn, page) in &self.dirty {
            self.mmap.write_at(page, pn * PAGE_SIZE as u64)?;
        }

        self.flushed += self.staged.len() as u64;
        self.staged.clear();
        self.dirty.clear();
        Ok(())
    }

    /// Drops all buffered writes without touching the file.
    pub fn discard(&mut self) {
        self.staged.clear();
        self.dirty.clear();
    }

    /// Positional write of the meta page bytes at offset 0.
    pub fn write_meta(&self, meta: &[u8]) -> Result<()> {
        self.mmap.write_at(meta, 0)
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.sync()
    }
}
