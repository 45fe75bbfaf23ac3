//! # Meta Page
//!
//! The first 64 bytes of page 0 anchor everything in the file. The commit
//! protocol is the sole writer; every other component reaches the file only
//! through page numbers recorded here.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  --------------------------------------
//! 0       16    signature       "mydb000000000000" (ASCII)
//! 16      8     root            B+tree root page number (0 = empty)
//! 24      8     flushed         page high-watermark
//! 32      8     free_head_page  free-list head node
//! 40      8     free_head_seq   next slot sequence to pop
//! 48      8     free_tail_page  free-list tail node
//! 56      8     free_tail_seq   next slot sequence to push
//! ```
//!
//! All integers little-endian. The remainder of page 0 is reserved. The
//! loader accepts a meta page only when the signature matches exactly.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const DB_SIGNATURE: &[u8; 16] = b"mydb000000000000";
pub const META_SIZE: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Meta {
    signature: [u8; 16],
    root: U64,
    flushed: U64,
    free_head_page: U64,
    free_head_seq: U64,
    free_tail_page: U64,
    free_tail_seq: U64,
}

const _: () = assert!(std::mem::size_of::<Meta>() == META_SIZE);

impl Meta {
    pub fn new(
        root: u64,
        flushed: u64,
        free_head_page: u64,
        free_head_seq: u64,
        free_tail_page: u64,
        free_tail_seq: u64,
    ) -> Self {
        Self {
            signature: *DB_SIGNATURE,
            root: U64::new(root),
            flushed: U64::new(flushed),
            free_head_page: U64::new(free_head_page),
            free_head_seq: U64::new(free_head_seq),
            free_tail_page: U64::new(free_tail_page),
            free_tail_seq: U64::new(free_tail_seq),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= META_SIZE,
            "buffer too small for meta page: {} < {}",
            bytes.len(),
            META_SIZE
        );

        let meta = Self::ref_from_bytes(&bytes[..META_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse meta page: {:?}", e))?;

        ensure!(
            &meta.signature == DB_SIGNATURE,
            "not a burrowdb file: bad signature"
        );

        Ok(meta)
    }

    pub fn root(&self) -> u64 {
        self.root.get()
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.get()
    }

    pub fn free_head_page(&self) -> u64 {
        self.free_head_page.get()
    }

    pub fn free_head_seq(&self) -> u64 {
        self.free_head_seq.get()
    }

    pub fn free_tail_page(&self) -> u64 {
        self.free_tail_page.get()
    }

    pub fn free_tail_seq(&self) -> u64 {
        self.free_tail_seq.get()
    }
}
