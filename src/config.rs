//! File-format and branching-factor constants.
//!
//! These are compile-time constants rather than open-ended configuration:
//! the on-disk layout is fixed by them, so changing one means picking a new
//! magic string too.

/// Branching factor minus one. The reference implementation uses 7.
pub const MAX_KEYS: usize = 7;

/// Keys are fixed-length 16-byte hashes.
pub const KEY_SIZE: usize = 16;

/// Tail-area growth granularity, in bytes.
pub const PREALLOC_SIZE: u64 = 512 * 1024;

/// Entries per free-list block.
pub const FREELIST_BLOCK_ITEMS: usize = 252;

/// Size in bytes of a single free-list block (header + items).
pub const FREELIST_BLOCK_SIZE: u64 = 2048;

/// Number of power-of-two size classes, indices 0..27 (2^4 .. 2^31).
pub const FREELIST_COUNT: usize = 28;

/// Smallest allocation size class exponent (extents are at least 16 bytes).
pub const MIN_SIZE_CLASS_EXP: u32 = 4;

pub const MAGIC: &[u8; 16] = b"REDBTREE00000000";

pub const HDR_MAGIC_POS: u64 = 0;
pub const HDR_FREE_POS: u64 = 16;
pub const HDR_FREEOFF_POS: u64 = 24;
pub const HDR_FREELIST_POS: u64 = 32;
pub const HDR_FREELIST_SIZE: u64 = FREELIST_COUNT as u64 * FREELIST_BLOCK_SIZE;
pub const HDR_ROOTPTR_POS: u64 = HDR_FREELIST_POS + HDR_FREELIST_SIZE;
pub const HDR_SIZE: u64 = HDR_ROOTPTR_POS + 8;
