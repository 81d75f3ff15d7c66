// SPDX-License-Identifier: MPL-2.0

use crate::block_ptr::Ext2Bid;
use crate::prelude::*;

/// The in-memory descriptor of a block group.
///
/// Blocks are clustered into block groups in order to reduce fragmentation
/// and minimise the amount of head seeking when reading a large amount of
/// consecutive data. Each group carries its own bitmaps and inode table,
/// located through this descriptor.
#[derive(Clone, Copy, Debug)]
pub struct GroupDescriptor {
    /// Blocks usage bitmap block.
    block_bitmap_bid: Ext2Bid,
    /// Inodes usage bitmap block.
    inode_bitmap_bid: Ext2Bid,
    /// Starting block of the inode table.
    inode_table_bid: Ext2Bid,
    /// Number of free blocks in the group.
    free_blocks_count: u16,
    /// Number of free inodes in the group.
    free_inodes_count: u16,
    /// Number of directories in the group.
    dirs_count: u16,
}

impl GroupDescriptor {
    /// Returns the block holding the block bitmap.
    pub fn block_bitmap_bid(&self) -> Ext2Bid {
        self.block_bitmap_bid
    }

    /// Returns the block holding the inode bitmap.
    pub fn inode_bitmap_bid(&self) -> Ext2Bid {
        self.inode_bitmap_bid
    }

    /// Returns the first block of the inode table.
    pub fn inode_table_bid(&self) -> Ext2Bid {
        self.inode_table_bid
    }

    /// Returns the number of free blocks in the group.
    pub fn free_blocks_count(&self) -> u16 {
        self.free_blocks_count
    }

    /// Returns the number of free inodes in the group.
    pub fn free_inodes_count(&self) -> u16 {
        self.free_inodes_count
    }

    /// Returns the number of directories in the group.
    pub fn dirs_count(&self) -> u16 {
        self.dirs_count
    }

    pub(crate) fn inc_free_blocks(&mut self) {
        self.free_blocks_count += 1;
    }

    pub(crate) fn dec_free_blocks(&mut self) {
        debug_assert!(self.free_blocks_count > 0);
        self.free_blocks_count -= 1;
    }

    pub(crate) fn inc_free_inodes(&mut self) {
        self.free_inodes_count += 1;
    }

    pub(crate) fn dec_free_inodes(&mut self) {
        debug_assert!(self.free_inodes_count > 0);
        self.free_inodes_count -= 1;
    }

    pub(crate) fn inc_dirs_count(&mut self) {
        self.dirs_count += 1;
    }
}

impl From<RawGroupDescriptor> for GroupDescriptor {
    fn from(desc: RawGroupDescriptor) -> Self {
        Self {
            block_bitmap_bid: desc.block_bitmap,
            inode_bitmap_bid: desc.inode_bitmap,
            inode_table_bid: desc.inode_table,
            free_blocks_count: desc.free_blocks_count,
            free_inodes_count: desc.free_inodes_count,
            dirs_count: desc.dirs_count,
        }
    }
}

const_assert!(core::mem::size_of::<RawGroupDescriptor>() == 32);

/// The raw block group descriptor.
///
/// The block group descriptor table starts on the first block following
/// the superblock.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromZeroes, FromBytes, AsBytes)]
pub(crate) struct RawGroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub dirs_count: u16,
    pad: u16,
    reserved: [u32; 3],
}

impl From<&GroupDescriptor> for RawGroupDescriptor {
    fn from(desc: &GroupDescriptor) -> Self {
        Self {
            block_bitmap: desc.block_bitmap_bid,
            inode_bitmap: desc.inode_bitmap_bid,
            inode_table: desc.inode_table_bid,
            free_blocks_count: desc.free_blocks_count,
            free_inodes_count: desc.free_inodes_count,
            dirs_count: desc.dirs_count,
            ..Default::default()
        }
    }
}
