//! # Memory-Mapped File Access
//!
//! This module implements `MmapFile`, the lowest layer of burrowdb's
//! storage: one backing file, read through read-only memory mappings and
//! written through the file descriptor.
//!
//! ## Chunked Mapping
//!
//! Remapping a file invalidates every pointer into the old mapping. Instead
//! of remapping on growth, `MmapFile` maps the file in an ordered list of
//! chunks: when the projected file size exceeds the mapped total, a new
//! chunk of `max(total, 64 MiB)` bytes (doubled until the projection fits)
//! is mapped at the current end and appended to the list. Chunks are never
//! unmapped while the file is open, so a page reference obtained earlier
//! can never dangle.
//!
//! Chunks need not be contiguous in virtual memory. Resolving a page number
//! linearly scans the chunk list for the chunk whose logical page range
//! contains it; the list stays short because chunk sizes double.
//!
//! A chunk may extend past the end of the file. That is safe as long as no
//! page beyond the durable high-watermark is read, which the pager and the
//! commit protocol guarantee: the file is extended by the data write before
//! the high-watermark advances.
//!
//! ## Write Path
//!
//! Writes never go through the mapping. The commit protocol writes the
//! staged page run with a single vectored positional write (`pwritev`) at
//! the high-watermark offset and rewrites in-place pages individually with
//! `pwrite`. Durability is established with `fsync`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{Mmap, MmapOptions};

use super::{MIN_MMAP_CHUNK, PAGE_SIZE};

// Linux caps a single pwritev at IOV_MAX (1024) segments.
const MAX_IOV: usize = 1024;

#[derive(Debug)]
pub struct MmapFile {
    file: File,
    total: usize,
    chunks: Vec<Mmap>,
}

impl MmapFile {
    /// Opens or creates the backing file and maps any existing contents.
    /// Returns the handle together with the file size in bytes.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Self, u64)> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let mut mmap = Self {
            file,
            total: 0,
            chunks: Vec::new(),
        };
        if file_size > 0 {
            mmap.extend_to(file_size as usize)?;
        }

        Ok((mmap, file_size))
    }

    /// Returns an immutable view of page `pn`.
    ///
    /// The caller is responsible for only asking for pages below the durable
    /// high-watermark; anything else is a structural error.
    pub fn page(&self, pn: u64) -> Result<&[u8]> {
        let mut start = 0u64;
        for chunk in &self.chunks {
            let end = start + (chunk.len() / PAGE_SIZE) as u64;
            if pn < end {
                let offset = (pn - start) as usize * PAGE_SIZE;
                return Ok(&chunk[offset..offset + PAGE_SIZE]);
            }
            start = end;
        }
        bail!("page {} beyond mapped range ({} pages)", pn, start);
    }

    /// Ensures at least `size` bytes of the file are covered by the mapping,
    /// mapping a new chunk at the current end if needed.
    pub fn extend_to(&mut self, size: usize) -> Result<()> {
        if size <= self.total {
            return Ok(());
        }

        let mut alloc = self.total.max(MIN_MMAP_CHUNK);
        while self.total + alloc < size {
            alloc *= 2;
        }

        // SAFETY: mapping a file that another process mutates concurrently is
        // undefined behavior. This is safe because:
        // 1. The database file is owned exclusively by this handle for its
        //    lifetime; burrowdb is a single-writer embedded store.
        // 2. The mapping is read-only; all writes go through the fd and the
        //    kernel keeps MAP_SHARED read views coherent with them.
        // 3. The chunk may extend past EOF, but pages past the high-watermark
        //    are never resolved, so no access faults on unbacked memory.
        let chunk = unsafe {
            MmapOptions::new()
                .offset(self.total as u64)
                .len(alloc)
                .map(&self.file)
                .wrap_err_with(|| format!("failed to map {} bytes at {}", alloc, self.total))?
        };

        self.total += alloc;
        self.chunks.push(chunk);
        Ok(())
    }

    /// Writes `pages` as one contiguous run starting at byte `offset`, using
    /// a vectored positional write.
    pub fn write_pages_at(&self, pages: &[Box<[u8]>], offset: u64) -> Result<()> {
        let mut offset = offset;
        for batch in pages.chunks(MAX_IOV) {
            let iovs: Vec<libc::iovec> = batch
                .iter()
                .map(|p| libc::iovec {
                    iov_base: p.as_ptr() as *mut libc::c_void,
                    iov_len: p.len(),
                })
                .collect();
            let want: usize = batch.iter().map(|p| p.len()).sum();

            // SAFETY: each iovec points into a live staged page buffer that
            // outlives the call, and iov_len matches the buffer length.
            let wrote = unsafe {
                libc::pwritev(
                    self.file.as_raw_fd(),
                    iovs.as_ptr(),
                    iovs.len() as libc::c_int,
                    offset as libc::off_t,
                )
            };

            if wrote < 0 {
                return Err(std::io::Error::last_os_error())
                    .wrap_err_with(|| format!("pwritev of {} pages at {}", batch.len(), offset));
            }
            ensure!(
                wrote as usize == want,
                "short pwritev at {}: {} of {} bytes",
                offset,
                wrote,
                want
            );
            offset += want as u64;
        }
        Ok(())
    }

    /// Positional write of a single buffer, used for in-place page updates
    /// and the meta page.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .wrap_err_with(|| format!("pwrite of {} bytes at {}", buf.len(), offset))
    }

    /// Flushes file data and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().wrap_err("fsync failed")
    }
}
