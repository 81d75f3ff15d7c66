// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// The size of a device sector.
pub const SECTOR_SIZE: usize = 512;

/// A byte-addressable block device.
///
/// The filesystem performs all of its I/O through this trait: 512-byte
/// sector reads for the superblock and whole-block transfers for
/// everything else. A read must fill `buf` exactly and a write must
/// persist `buf` entirely, or fail.
pub trait BlockDevice: Send + Sync {
    /// Reads `buf.len()` bytes starting at `offset`.
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf` starting at `offset`.
    fn write_bytes(&self, offset: usize, buf: &[u8]) -> Result<()>;

    /// Returns the device capacity in sectors.
    fn sector_count(&self) -> usize;
}
