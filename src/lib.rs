// SPDX-License-Identifier: MPL-2.0

//! A safe Rust Ext2 filesystem driver.
//!
//! The driver sits on top of a [`BlockDevice`] and exposes a
//! filesystem-level API: inode lookup, byte-level reads, whole-inode
//! rewrites, directory enumeration, creation of files and directories,
//! link-count maintenance, and allocation of blocks and inodes.
//!
//! Journaling, resizing an existing file's block list, and writing
//! indirect block trees on creation are out of scope.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![allow(dead_code)]

extern crate alloc;

pub use block_group::GroupDescriptor;
pub use block_io::{BlockDevice, SECTOR_SIZE};
pub use dir::{DirEntry, FileType, MAX_FNAME_LEN};
pub use error::{Errno, Error, Result};
pub use fs::{Ext2, InodeId, ROOT_INO};
pub use inode::{FilePerm, Inode, InodeType, Metadata, FAST_SYMLINK_MAX_LEN};
pub use super_block::{
    ErrorsBehaviour, FeatureCompatSet, FeatureInCompatSet, FeatureRoCompatSet, FsState, OsId,
    RevLevel, SuperBlock, MAGIC_NUM, SUPER_BLOCK_OFFSET,
};
pub use time::{RealTimeClock, UnixTime};

pub mod error;

mod bitmap;
mod block_group;
mod block_io;
mod block_ptr;
mod dir;
mod fs;
mod inode;
mod prelude;
mod super_block;
mod time;
mod utils;

#[cfg(test)]
mod test;
