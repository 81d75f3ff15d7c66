// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// The type of a physical block index.
pub type Ext2Bid = u32;

/// The pointers to blocks for an inode.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, FromZeroes, FromBytes, AsBytes)]
pub struct BlockPtrs {
    inner: [Ext2Bid; MAX_BLOCK_PTRS],
}

impl BlockPtrs {
    /// Returns the direct block ID.
    ///
    /// # Panics
    ///
    /// If the `idx` is out of bounds, this method will panic.
    pub fn direct(&self, idx: usize) -> Ext2Bid {
        assert!(DIRECT_RANGE.contains(&idx));
        self.inner[idx]
    }

    /// Sets the direct block ID.
    ///
    /// # Panics
    ///
    /// If the `idx` is out of bounds, this method will panic.
    pub fn set_direct(&mut self, idx: usize, bid: Ext2Bid) {
        assert!(DIRECT_RANGE.contains(&idx));
        self.inner[idx] = bid;
    }

    /// Returns the block ID of the single indirect block pointer.
    pub fn indirect(&self) -> Ext2Bid {
        self.inner[INDIRECT]
    }

    /// Sets the block ID of the single indirect block pointer.
    pub fn set_indirect(&mut self, bid: Ext2Bid) {
        self.inner[INDIRECT] = bid;
    }

    /// Returns the block ID of the double indirect block pointer.
    pub fn db_indirect(&self) -> Ext2Bid {
        self.inner[DB_INDIRECT]
    }

    /// Sets the block ID of the double indirect block pointer.
    pub fn set_db_indirect(&mut self, bid: Ext2Bid) {
        self.inner[DB_INDIRECT] = bid;
    }

    /// Returns the block ID of the treble indirect block pointer.
    pub fn tb_indirect(&self) -> Ext2Bid {
        self.inner[TB_INDIRECT]
    }

    /// Sets the block ID of the treble indirect block pointer.
    pub fn set_tb_indirect(&mut self, bid: Ext2Bid) {
        self.inner[TB_INDIRECT] = bid;
    }
}

/// Direct pointers to blocks.
pub const DIRECT_RANGE: core::ops::Range<usize> = 0..12;
/// The number of direct blocks.
pub const MAX_DIRECT_BLOCKS: usize = DIRECT_RANGE.end;

/// Indirect pointer to blocks.
pub const INDIRECT: usize = DIRECT_RANGE.end;

/// Doubly indirect pointer to blocks.
pub const DB_INDIRECT: usize = INDIRECT + 1;

/// Treble indirect pointer to blocks.
pub const TB_INDIRECT: usize = DB_INDIRECT + 1;

/// The number of block pointers.
pub const MAX_BLOCK_PTRS: usize = TB_INDIRECT + 1;

/// The size of a block id.
pub const BID_SIZE: usize = core::mem::size_of::<Ext2Bid>();
