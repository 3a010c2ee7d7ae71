//! Fixed geometry shared by every component. These are constant for the
//! lifetime of a run; everything else is configured at construction.

pub const BLOCK_SIZE: u64 = 64;
pub const LOG2_BLOCK_SIZE: u32 = 6;

pub const PAGE_SIZE: u64 = 4096;
pub const LOG2_PAGE_SIZE: u32 = 12;

/// Size of one page-table entry in bytes.
pub const PTE_BYTES: u64 = 8;
