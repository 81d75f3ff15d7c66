// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};

use crate::bitmap::BitMap;
use crate::block_group::{GroupDescriptor, RawGroupDescriptor};
use crate::block_io::{BlockDevice, SECTOR_SIZE};
use crate::block_ptr::{Ext2Bid, BID_SIZE, MAX_DIRECT_BLOCKS};
use crate::dir::{self, DirEntry, FileType, MAX_FNAME_LEN};
use crate::inode::{FileFlags, FilePerm, Inode, InodeDesc, InodeType, Metadata, RawInode};
use crate::prelude::*;
use crate::super_block::{RawSuperBlock, SuperBlock, SUPER_BLOCK_SIZE};
use crate::time::{RealTimeClock, UnixTime};

/// The root inode number.
pub const ROOT_INO: u32 = 2;

static NEXT_FSID: AtomicU32 = AtomicU32::new(1);

/// Identifies an inode across mounted filesystems.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeId {
    pub fsid: u32,
    pub index: u32,
}

impl InodeId {
    pub const fn new(fsid: u32, index: u32) -> Self {
        Self { fsid, index }
    }

    /// Returns the sentinel identifier that names no inode.
    pub const fn invalid() -> Self {
        Self { fsid: 0, index: 0 }
    }

    pub const fn is_valid(&self) -> bool {
        self.index != 0
    }
}

/// The in-memory copies of the superblock and the block group descriptor
/// table.
///
/// Every three-surface update (bitmap bit, superblock counter, group
/// counter) runs under the write guard of this cache so that concurrent
/// allocators cannot tear the counters.
struct MetaCache {
    super_block: Dirty<SuperBlock>,
    group_descriptors: Vec<Dirty<GroupDescriptor>>,
}

/// The Ext2 filesystem.
pub struct Ext2 {
    fsid: u32,
    block_device: Arc<dyn BlockDevice>,
    block_size: usize,
    block_groups_count: u32,
    meta: RwLock<MetaCache>,
    inode_cache: Mutex<BTreeMap<u32, Weak<Inode>>>,
    clock: Arc<dyn RealTimeClock>,
    weak_self: Weak<Ext2>,
}

impl Ext2 {
    /// Opens and loads an Ext2 from the `block_device`.
    ///
    /// Validates the superblock magic, computes the number of block groups
    /// and pre-warms the descriptor table cache. The block size is fixed
    /// from this point on.
    pub fn open(
        block_device: Arc<dyn BlockDevice>,
        clock: Arc<dyn RealTimeClock>,
    ) -> Result<Arc<Self>> {
        let super_block = SuperBlock::try_from(Self::read_raw_super_block(block_device.as_ref())?)?;
        let block_size = super_block.block_size();

        let block_groups_count = super_block.block_groups_count();
        if block_groups_count == 0 {
            return_errno_with_message!(Errno::EINVAL, "no block groups");
        }

        let group_descriptors = {
            let table_len = block_groups_count as usize * core::mem::size_of::<RawGroupDescriptor>();
            let mut buf = vec![0u8; table_len.div_ceil(block_size) * block_size];
            let table_offset = super_block.group_descriptors_bid() as usize * block_size;
            block_device.read_bytes(table_offset, &mut buf)?;
            let mut group_descriptors = Vec::with_capacity(block_groups_count as usize);
            for raw in buf
                .chunks_exact(core::mem::size_of::<RawGroupDescriptor>())
                .take(block_groups_count as usize)
            {
                let raw_descriptor = RawGroupDescriptor::read_from(raw)
                    .ok_or(Error::with_message(Errno::EIO, "malformed group descriptor"))?;
                group_descriptors.push(Dirty::new(GroupDescriptor::from(raw_descriptor)));
            }
            group_descriptors
        };

        if block_device.sector_count() * SECTOR_SIZE
            < super_block.total_blocks() as usize * block_size
        {
            warn!("block device is smaller than the filesystem claims");
        }

        debug!(
            "ext2: {} inodes, {} blocks, block size {}",
            super_block.total_inodes(),
            super_block.total_blocks(),
            block_size
        );

        Ok(Arc::new_cyclic(|weak_self| Self {
            fsid: NEXT_FSID.fetch_add(1, Ordering::Relaxed),
            block_device,
            block_size,
            block_groups_count,
            meta: RwLock::new(MetaCache {
                super_block: Dirty::new(super_block),
                group_descriptors,
            }),
            inode_cache: Mutex::new(BTreeMap::new()),
            clock,
            weak_self: weak_self.clone(),
        }))
    }

    /// Returns the process-unique identifier of this mount.
    pub fn fsid(&self) -> u32 {
        self.fsid
    }

    /// Returns the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the number of block groups.
    pub fn block_groups_count(&self) -> u32 {
        self.block_groups_count
    }

    /// Returns a copy of the cached superblock.
    pub fn super_block(&self) -> SuperBlock {
        *self.meta.read().super_block
    }

    /// Returns a copy of the descriptor of the 1-based block group `group`.
    pub fn group_descriptor(&self, group: u32) -> Result<GroupDescriptor> {
        if group == 0 || group > self.block_groups_count {
            return_errno_with_message!(Errno::EINVAL, "block group index out of range");
        }
        Ok(*self.meta.read().group_descriptors[(group - 1) as usize])
    }

    /// Returns the root directory handle.
    pub fn root_inode(&self) -> Result<Arc<Inode>> {
        self.get_inode(ROOT_INO)
    }

    /// Obtains the shared handle of the inode `ino`.
    ///
    /// The lookup is double-checked: a cache hit is taken under the cache
    /// lock, the raw inode is read outside of it, and the insertion
    /// re-checks to avoid duplicated handles under contention.
    pub fn get_inode(&self, ino: u32) -> Result<Arc<Inode>> {
        if !self.super_block().is_valid_inode(ino) {
            return_errno_with_message!(Errno::ENOENT, "invalid inode number");
        }

        {
            let mut inode_cache = self.inode_cache.lock();
            if let Some(weak) = inode_cache.get(&ino) {
                if let Some(inode) = weak.upgrade() {
                    return Ok(inode);
                }
                inode_cache.remove(&ino);
            }
        }

        let desc = InodeDesc::try_from(self.raw_inode(ino)?)
            .map_err(|_| Error::with_message(Errno::ENOENT, "free or corrupted inode"))?;

        let mut inode_cache = self.inode_cache.lock();
        if let Some(inode) = inode_cache.get(&ino).and_then(Weak::upgrade) {
            return Ok(inode);
        }
        let inode = Inode::new(ino, desc, self.weak_self.clone());
        inode_cache.insert(ino, Arc::downgrade(&inode));
        Ok(inode)
    }

    /// Returns the metadata of the inode `ino`.
    pub fn inode_metadata(&self, ino: u32) -> Result<Metadata> {
        Ok(self.get_inode(ino)?.metadata())
    }

    /// Creates a new inode holding `size` bytes under the parent directory.
    ///
    /// The inode number and data blocks are claimed in the bitmaps by the
    /// allocators themselves, under the metadata lock; every failure after
    /// that point, such as a name conflict, releases the claims again
    /// before the error is surfaced.
    pub fn create_inode(
        &self,
        parent: InodeId,
        name: &str,
        mode: u16,
        size: usize,
    ) -> Result<InodeId> {
        if parent.fsid != self.fsid {
            return_errno_with_message!(Errno::EINVAL, "foreign inode id");
        }
        if name.is_empty() {
            return_errno_with_message!(Errno::EINVAL, "empty file name");
        }
        if name.len() > MAX_FNAME_LEN {
            return_errno!(Errno::ENAMETOOLONG);
        }
        let parent_inode = self.get_inode(parent.index)?;
        if parent_inode.inode_type() != InodeType::Dir {
            return_errno!(Errno::ENOTDIR);
        }
        let type_ = InodeType::from_raw_mode(mode)?;
        let perm = FilePerm::from_raw_mode(mode)?;

        debug!(
            "adding inode '{}' (mode {:o}) to parent directory {}",
            name, mode, parent.index
        );

        let ino = self.allocate_inode(0, size)?;
        let group = self.super_block().group_index_of_inode(ino);
        let blocks = match self.allocate_blocks(group, size.div_ceil(self.block_size)) {
            Ok(blocks) => blocks,
            Err(err) => {
                self.release_reservations(ino, group, &[]);
                return Err(err);
            }
        };
        if blocks.len() >= MAX_DIRECT_BLOCKS {
            self.release_reservations(ino, group, &blocks);
            return_errno_with_message!(Errno::EFBIG, "creation is limited to direct blocks");
        }

        // The name may already be taken; release the claims on the way out.
        if let Err(err) =
            self.add_inode_to_directory(&parent_inode, ino, name, FileType::from(type_))
        {
            self.release_reservations(ino, group, &blocks);
            return Err(err);
        }

        let now = self.clock.now();
        let mut desc = InodeDesc {
            type_,
            perm,
            uid: 0,
            gid: 0,
            size,
            atime: now,
            ctime: now,
            mtime: now,
            dtime: UnixTime::ZERO,
            // A directory is born with its "." entry and the parent's link.
            hard_links: if type_.is_directory() { 2 } else { 1 },
            blocks_count: (blocks.len() * (self.block_size / SECTOR_SIZE)) as u32,
            flags: FileFlags::empty(),
            block_ptrs: Default::default(),
        };
        for (i, bid) in blocks.iter().enumerate() {
            desc.block_ptrs.set_direct(i, *bid);
        }
        self.write_raw_inode(ino, &RawInode::from(&desc))?;

        Ok(InodeId::new(self.fsid, ino))
    }

    /// Creates a directory under the parent, bootstrapping its `.` and `..`
    /// records and maintaining the parent link count and the group
    /// directory census.
    pub fn create_directory(&self, parent: InodeId, name: &str, mode: u16) -> Result<InodeId> {
        // Whatever the caller passed, the type nibble is a directory.
        let mode = (mode & !0o170000) | InodeType::Dir as u16;

        // A new directory occupies a single block.
        let id = self.create_inode(parent, name, mode, self.block_size)?;

        let entries = vec![
            DirEntry::new(id.index, FileType::Dir, "."),
            DirEntry::new(parent.index, FileType::Dir, ".."),
        ];
        self.write_directory_inode(id.index, &entries)?;

        self.modify_link_count(parent.index, 1)?;

        let group = self.super_block().group_index_of_inode(id.index);
        let mut meta = self.meta.write();
        meta.group_descriptors[(group - 1) as usize].inc_dirs_count();
        self.sync_group_descriptors(&mut meta)?;

        Ok(id)
    }

    /// Rewrites the full content of the inode `ino`.
    ///
    /// The number of blocks implied by the current size must equal the
    /// number implied by `data.len()`; growing or shrinking the block list
    /// is not supported.
    pub fn write_inode(&self, ino: u32, data: &[u8]) -> Result<()> {
        let inode = self.get_inode(ino)?;
        let desc = inode.desc();

        if desc.type_ == InodeType::SymLink {
            return_errno_with_message!(Errno::ENOSYS, "writing symlink inodes is not supported");
        }

        let blocks_needed_before = desc.size.div_ceil(self.block_size);
        let blocks_needed_after = data.len().div_ceil(self.block_size);
        if blocks_needed_before != blocks_needed_after {
            return_errno_with_message!(Errno::EFBIG, "growing or shrinking a file is not supported");
        }
        if blocks_needed_after == 0 {
            return Ok(());
        }

        let block_list = inode.cached_block_list()?;
        if block_list.len() < blocks_needed_after {
            warn!("short block list for inode {}", ino);
            return_errno_with_message!(Errno::EIO, "block list shorter than the file size");
        }

        let mut block_buf = vec![0u8; self.block_size];
        for (i, bid) in block_list[..blocks_needed_after].iter().enumerate() {
            let chunk = &data[i * self.block_size..data.len().min((i + 1) * self.block_size)];
            block_buf[..chunk.len()].copy_from_slice(chunk);
            block_buf[chunk.len()..].fill(0);
            self.write_block(*bid, &block_buf)?;
        }
        Ok(())
    }

    /// Adjusts the link count of the inode `ino` by `delta`.
    pub fn modify_link_count(&self, ino: u32, delta: i32) -> Result<()> {
        let mut raw_inode = self.raw_inode(ino)?;
        let new_count = raw_inode.hard_links as i32 + delta;
        if !(0..=u16::MAX as i32).contains(&new_count) {
            return_errno_with_message!(Errno::EINVAL, "link count out of range");
        }
        debug!(
            "changing inode {} link count from {} to {}",
            ino, raw_inode.hard_links, new_count
        );
        raw_inode.hard_links = new_count as u16;
        self.write_raw_inode(ino, &raw_inode)
    }

    /// Sets the modification timestamp of the inode `ino`.
    pub fn set_mtime(&self, ino: u32, time: UnixTime) -> Result<()> {
        let mut raw_inode = self.raw_inode(ino)?;
        debug!(
            "changing inode {} mtime from {} to {}",
            ino, raw_inode.mtime.sec, time.sec
        );
        raw_inode.mtime = time;
        self.write_raw_inode(ino, &raw_inode)
    }

    /// Finds the directory containing the inode, scanning every directory
    /// of the inode's own group.
    ///
    /// Inodes do not point back at their parents, so upward traversal has
    /// to rediscover the parent from the directory contents.
    pub fn find_parent_of_inode(&self, id: InodeId) -> Result<Option<InodeId>> {
        let child = self.get_inode(id.index)?;
        let (group, inodes_per_group) = {
            let sb = self.super_block();
            (sb.group_index_of_inode(id.index), sb.inodes_per_group())
        };
        let first_inode_in_group = (group - 1) * inodes_per_group + 1;

        for i in 0..inodes_per_group {
            let ino = first_inode_in_group + i;
            if ino == id.index {
                // A directory's own "." record must not make it its own parent.
                continue;
            }
            let Ok(candidate) = self.get_inode(ino) else {
                continue;
            };
            if candidate.inode_type() != InodeType::Dir {
                continue;
            }
            if candidate.reverse_lookup(child.id()).is_ok() {
                return Ok(Some(candidate.id()));
            }
        }
        Ok(None)
    }

    /// Allocates an inode number, preferring `preferred_group` when it is
    /// non-zero and has room for both the inode and `expected_size` bytes
    /// of data. Falls back to the first suitable group.
    ///
    /// The group scan, the bitmap scan and the three-surface commit all
    /// run under one hold of the metadata lock, so two concurrent
    /// allocators can never be handed the same inode. A caller that fails
    /// later must release the inode with
    /// [`Ext2::set_inode_allocation_state`].
    pub(crate) fn allocate_inode(&self, preferred_group: u32, expected_size: usize) -> Result<u32> {
        let needed_blocks = expected_size.div_ceil(self.block_size);
        let mut meta = self.meta.write();

        let is_suitable = |descriptor: &GroupDescriptor| {
            descriptor.free_inodes_count() > 0
                && descriptor.free_blocks_count() as usize >= needed_blocks
        };
        let mut group = 0u32;
        if preferred_group != 0
            && preferred_group <= self.block_groups_count
            && is_suitable(&meta.group_descriptors[(preferred_group - 1) as usize])
        {
            group = preferred_group;
        } else {
            for (idx, descriptor) in meta.group_descriptors.iter().enumerate() {
                if is_suitable(descriptor) {
                    group = idx as u32 + 1;
                    break;
                }
            }
        }
        if group == 0 {
            warn!(
                "no suitable group for a new inode with {} blocks needed",
                needed_blocks
            );
            return_errno_with_message!(Errno::ENOSPC, "no suitable block group");
        }

        let inodes_per_group = meta.super_block.inodes_per_group();
        let inodes_in_group = inodes_per_group
            .min(meta.super_block.total_inodes() - (group - 1) * inodes_per_group)
            as usize;
        let inode_bitmap_bid = meta.group_descriptors[(group - 1) as usize].inode_bitmap_bid();

        // Scan the group's inode bitmap for the first clear bit and claim
        // it before the lock is released.
        let bits_per_block = self.block_size * 8;
        let mut block_buf = vec![0u8; self.block_size];
        for block_idx in 0..inodes_in_group.div_ceil(bits_per_block) {
            self.read_block(inode_bitmap_bid + block_idx as Ext2Bid, &mut block_buf)?;
            let bit_len = bits_per_block.min(inodes_in_group - block_idx * bits_per_block);
            let bitmap = BitMap::from_bytes_with_bit_len(&block_buf, bit_len)?;
            if let Some(bit) = bitmap.find_first_free() {
                let ino =
                    (group - 1) * inodes_per_group + (block_idx * bits_per_block + bit) as u32 + 1;
                self.commit_inode_allocation_state(&mut meta, ino, true)?;
                debug!("allocate_inode: reserved inode {}", ino);
                return Ok(ino);
            }
        }

        warn!("group {} claims free inodes but its bitmap has none", group);
        return_errno_with_message!(Errno::ENOSPC, "no free inode in the chosen group")
    }

    /// Collects `count` free blocks from the group's block bitmap.
    ///
    /// The scan and the three-surface commits run under one hold of the
    /// metadata lock, so two concurrent allocators can never be handed
    /// the same blocks. A caller that fails later must release them with
    /// [`Ext2::set_block_allocation_state`].
    // TODO: Prefer a contiguous run when one is available.
    pub(crate) fn allocate_blocks(&self, group: u32, count: usize) -> Result<Vec<Ext2Bid>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut meta = self.meta.write();
        if group == 0 || group > self.block_groups_count {
            return_errno_with_message!(Errno::EINVAL, "block group index out of range");
        }
        {
            let descriptor = &meta.group_descriptors[(group - 1) as usize];
            if (descriptor.free_blocks_count() as usize) < count {
                warn!(
                    "cannot allocate out of group {}, wanted {} but only {} available",
                    group,
                    count,
                    descriptor.free_blocks_count()
                );
                return_errno_with_message!(Errno::ENOSPC, "not enough free blocks in group");
            }
        }
        let first_block = meta.super_block.first_block_of_group(group);
        let blocks_in_group = meta
            .super_block
            .blocks_per_group()
            .min(meta.super_block.total_blocks() - first_block) as usize;
        let block_bitmap_bid = meta.group_descriptors[(group - 1) as usize].block_bitmap_bid();

        let bits_per_block = self.block_size * 8;
        let mut blocks = Vec::with_capacity(count);
        let mut block_buf = vec![0u8; self.block_size];
        'scan: for block_idx in 0..blocks_in_group.div_ceil(bits_per_block) {
            self.read_block(block_bitmap_bid + block_idx as Ext2Bid, &mut block_buf)?;
            let bit_len = bits_per_block.min(blocks_in_group - block_idx * bits_per_block);
            let bitmap = BitMap::from_bytes_with_bit_len(&block_buf, bit_len)?;
            for bit in 0..bit_len {
                if !bitmap.is_allocated(bit) {
                    blocks.push(first_block + (block_idx * bits_per_block + bit) as Ext2Bid);
                    if blocks.len() == count {
                        break 'scan;
                    }
                }
            }
        }
        if blocks.len() < count {
            warn!(
                "group {} claims {} free blocks but its bitmap ran out",
                group, count
            );
            return_errno_with_message!(Errno::ENOSPC, "no free blocks in the chosen group");
        }

        // Claim the collected blocks before the lock is released.
        for bid in &blocks {
            self.commit_block_allocation_state(&mut meta, group, *bid, true)?;
        }
        Ok(blocks)
    }

    /// Flips the allocation bit of the inode `ino` and updates the free
    /// counters of the superblock and the owning group descriptor.
    ///
    /// The three surfaces are written in bitmap, superblock, descriptor
    /// order, all under the metadata lock.
    pub(crate) fn set_inode_allocation_state(&self, ino: u32, allocated: bool) -> Result<()> {
        let mut meta = self.meta.write();
        self.commit_inode_allocation_state(&mut meta, ino, allocated)
    }

    fn commit_inode_allocation_state(
        &self,
        meta: &mut MetaCache,
        ino: u32,
        allocated: bool,
    ) -> Result<()> {
        let group = meta.super_block.group_index_of_inode(ino);
        if group == 0 || group > self.block_groups_count {
            return_errno_with_message!(Errno::EINVAL, "inode out of range");
        }
        let bit = ((ino - 1) % meta.super_block.inodes_per_group()) as usize;
        let bitmap_bid = meta.group_descriptors[(group - 1) as usize].inode_bitmap_bid();
        if !self.flip_bitmap_bit(bitmap_bid, bit, allocated)? {
            return Ok(());
        }
        debug!("set_inode_allocation_state({}) -> {}", ino, allocated);

        if allocated {
            meta.super_block.dec_free_inodes();
        } else {
            meta.super_block.inc_free_inodes();
        }
        self.sync_super_block(&mut meta.super_block)?;

        let descriptor = &mut meta.group_descriptors[(group - 1) as usize];
        if allocated {
            descriptor.dec_free_inodes();
        } else {
            descriptor.inc_free_inodes();
        }
        self.sync_group_descriptors(meta)
    }

    /// The block counterpart of [`Ext2::set_inode_allocation_state`].
    pub(crate) fn set_block_allocation_state(
        &self,
        group: u32,
        bid: Ext2Bid,
        allocated: bool,
    ) -> Result<()> {
        let mut meta = self.meta.write();
        self.commit_block_allocation_state(&mut meta, group, bid, allocated)
    }

    fn commit_block_allocation_state(
        &self,
        meta: &mut MetaCache,
        group: u32,
        bid: Ext2Bid,
        allocated: bool,
    ) -> Result<()> {
        if group == 0 || group > self.block_groups_count {
            return_errno_with_message!(Errno::EINVAL, "block group index out of range");
        }
        let first_block = meta.super_block.first_block_of_group(group);
        if bid < first_block || bid - first_block >= meta.super_block.blocks_per_group() {
            return_errno_with_message!(Errno::EINVAL, "block does not belong to the group");
        }
        let bit = (bid - first_block) as usize;
        let bitmap_bid = meta.group_descriptors[(group - 1) as usize].block_bitmap_bid();
        if !self.flip_bitmap_bit(bitmap_bid, bit, allocated)? {
            return Ok(());
        }
        debug!("set_block_allocation_state({}) -> {}", bid, allocated);

        if allocated {
            meta.super_block.dec_free_blocks();
        } else {
            meta.super_block.inc_free_blocks();
        }
        self.sync_super_block(&mut meta.super_block)?;

        let descriptor = &mut meta.group_descriptors[(group - 1) as usize];
        if allocated {
            descriptor.dec_free_blocks();
        } else {
            descriptor.inc_free_blocks();
        }
        self.sync_group_descriptors(meta)
    }

    /// Builds the ordered list of physical blocks of an inode from its
    /// direct and indirect pointers.
    ///
    /// A zero entry inside any indirect array marks the end of the
    /// allocation and terminates the walk.
    pub(crate) fn block_list_for_inode(&self, desc: &InodeDesc) -> Result<Vec<Ext2Bid>> {
        // The on-disk count is in 512-byte sectors, not filesystem blocks.
        let block_count = desc.blocks_count as usize / (self.block_size / SECTOR_SIZE);
        let mut list = Vec::with_capacity(block_count);
        let mut remaining = block_count;

        let direct_count = block_count.min(MAX_DIRECT_BLOCKS);
        for i in 0..direct_count {
            list.push(desc.block_ptrs.direct(i));
            remaining -= 1;
        }
        if remaining == 0 {
            return Ok(list);
        }

        self.append_block_array(desc.block_ptrs.indirect(), 0, &mut remaining, &mut list)?;
        if remaining == 0 {
            return Ok(list);
        }
        self.append_block_array(desc.block_ptrs.db_indirect(), 1, &mut remaining, &mut list)?;
        if remaining == 0 {
            return Ok(list);
        }
        self.append_block_array(desc.block_ptrs.tb_indirect(), 2, &mut remaining, &mut list)?;
        Ok(list)
    }

    /// Appends the entries of the block array at `array_bid`, recursing
    /// through `depth` further levels of indirection.
    fn append_block_array(
        &self,
        array_bid: Ext2Bid,
        depth: u8,
        remaining: &mut usize,
        list: &mut Vec<Ext2Bid>,
    ) -> Result<()> {
        if array_bid == 0 || *remaining == 0 {
            return Ok(());
        }
        let mut array_buf = vec![0u8; self.block_size];
        self.read_block(array_bid, &mut array_buf)?;
        for chunk in array_buf.chunks_exact(BID_SIZE) {
            if *remaining == 0 {
                break;
            }
            let entry = Ext2Bid::from_le_bytes(chunk.try_into().unwrap());
            if entry == 0 {
                // End of the allocation.
                *remaining = 0;
                break;
            }
            if depth == 0 {
                list.push(entry);
                *remaining -= 1;
            } else {
                self.append_block_array(entry, depth - 1, remaining, list)?;
            }
        }
        Ok(())
    }

    /// Reads the raw inode record of `ino` from its group's inode table.
    pub(crate) fn raw_inode(&self, ino: u32) -> Result<RawInode> {
        let (bid, offset) = self.block_and_offset_of_inode(ino)?;
        let mut block_buf = vec![0u8; self.block_size];
        self.read_block(bid, &mut block_buf)?;
        RawInode::read_from_prefix(&block_buf[offset..])
            .ok_or(Error::with_message(Errno::EIO, "malformed inode record"))
    }

    /// Rewrites the raw inode record of `ino`, patching the containing
    /// block. If the inode is cached, its handle is refreshed so that the
    /// derived state is recomputed.
    pub(crate) fn write_raw_inode(&self, ino: u32, raw_inode: &RawInode) -> Result<()> {
        let (bid, offset) = self.block_and_offset_of_inode(ino)?;
        let mut block_buf = vec![0u8; self.block_size];
        self.read_block(bid, &mut block_buf)?;
        block_buf[offset..offset + core::mem::size_of::<RawInode>()]
            .copy_from_slice(raw_inode.as_bytes());
        self.write_block(bid, &block_buf)?;

        let cached = self.inode_cache.lock().get(&ino).and_then(Weak::upgrade);
        if let Some(inode) = cached {
            if let Ok(desc) = InodeDesc::try_from(*raw_inode) {
                inode.update_desc(desc);
            }
        }
        Ok(())
    }

    /// Rebuilds the content of a directory from `entries` and persists it.
    pub(crate) fn write_directory_inode(&self, dir_ino: u32, entries: &[DirEntry]) -> Result<()> {
        let content = dir::serialize_entries(entries, self.block_size);
        self.write_inode(dir_ino, &content)?;

        // The name map cached on the handle no longer matches the stream.
        let cached = self.inode_cache.lock().get(&dir_ino).and_then(Weak::upgrade);
        if let Some(inode) = cached {
            inode.invalidate_lookup_cache();
        }
        Ok(())
    }

    /// Returns an inode and its data blocks claimed by the allocators to
    /// the bitmaps after a creation failed.
    fn release_reservations(&self, ino: u32, group: u32, blocks: &[Ext2Bid]) {
        for bid in blocks {
            if let Err(err) = self.set_block_allocation_state(group, *bid, false) {
                warn!("failed to release block {}: {:?}", bid, err);
            }
        }
        if let Err(err) = self.set_inode_allocation_state(ino, false) {
            warn!("failed to release inode {}: {:?}", ino, err);
        }
    }

    /// Inserts `name` into the directory, preserving the existing records.
    ///
    /// Fails with `EEXIST` before anything is written when the name is
    /// already present.
    fn add_inode_to_directory(
        &self,
        dir: &Arc<Inode>,
        ino: u32,
        name: &str,
        file_type: FileType,
    ) -> Result<()> {
        debug!(
            "adding inode {} with name '{}' to directory {}",
            ino,
            name,
            dir.ino()
        );
        let mut entries = Vec::new();
        let mut name_already_exists = false;
        dir.traverse_as_directory(|entry_name, child, type_| {
            if entry_name == name {
                name_already_exists = true;
                return false;
            }
            entries.push(DirEntry::new(child.index, type_, entry_name));
            true
        })?;
        if name_already_exists {
            return_errno_with_message!(Errno::EEXIST, "name already exists in the directory");
        }

        entries.push(DirEntry::new(ino, file_type, name));
        self.write_directory_inode(dir.ino(), &entries)
    }

    /// Locates the block holding the raw inode `ino` and the byte offset
    /// of the record within that block.
    fn block_and_offset_of_inode(&self, ino: u32) -> Result<(Ext2Bid, usize)> {
        let meta = self.meta.read();
        let sb = &meta.super_block;
        if !sb.is_valid_inode(ino) {
            return_errno_with_message!(Errno::ENOENT, "invalid inode number");
        }
        let group = sb.group_index_of_inode(ino);
        if group > self.block_groups_count {
            return_errno_with_message!(Errno::ENOENT, "inode beyond the last group");
        }
        let offset = ((ino - 1) % sb.inodes_per_group()) as usize * sb.inode_size();
        let inode_table_bid = meta.group_descriptors[(group - 1) as usize].inode_table_bid();
        let bid = inode_table_bid + (offset / self.block_size) as Ext2Bid;
        Ok((bid, offset % self.block_size))
    }

    /// Reads one block.
    pub(crate) fn read_block(&self, bid: Ext2Bid, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        self.block_device
            .read_bytes(bid as usize * self.block_size, buf)
    }

    /// Reads consecutive blocks starting at `bid`.
    pub(crate) fn read_blocks(&self, bid: Ext2Bid, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % self.block_size, 0);
        self.block_device
            .read_bytes(bid as usize * self.block_size, buf)
    }

    /// Writes one block.
    pub(crate) fn write_block(&self, bid: Ext2Bid, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        self.block_device
            .write_bytes(bid as usize * self.block_size, buf)
    }

    /// Writes consecutive blocks starting at `bid`.
    pub(crate) fn write_blocks(&self, bid: Ext2Bid, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % self.block_size, 0);
        self.block_device
            .write_bytes(bid as usize * self.block_size, buf)
    }

    /// Reads the raw superblock as two consecutive sector reads starting
    /// at sector 2.
    fn read_raw_super_block(block_device: &dyn BlockDevice) -> Result<RawSuperBlock> {
        let mut buf = [0u8; SUPER_BLOCK_SIZE];
        block_device.read_bytes(2 * SECTOR_SIZE, &mut buf[..SECTOR_SIZE])?;
        block_device.read_bytes(3 * SECTOR_SIZE, &mut buf[SECTOR_SIZE..])?;
        RawSuperBlock::read_from(&buf[..])
            .ok_or(Error::with_message(Errno::EIO, "malformed super block"))
    }

    /// Persists the cached superblock, mirroring the sector pattern of the
    /// read path.
    fn sync_super_block(&self, super_block: &mut Dirty<SuperBlock>) -> Result<()> {
        let raw = RawSuperBlock::from(&**super_block);
        let bytes = raw.as_bytes();
        self.block_device
            .write_bytes(2 * SECTOR_SIZE, &bytes[..SECTOR_SIZE])?;
        self.block_device
            .write_bytes(3 * SECTOR_SIZE, &bytes[SECTOR_SIZE..])?;
        super_block.clear_dirty();
        Ok(())
    }

    /// Persists the whole cached block group descriptor table.
    fn sync_group_descriptors(&self, meta: &mut MetaCache) -> Result<()> {
        let table_len =
            self.block_groups_count as usize * core::mem::size_of::<RawGroupDescriptor>();
        let mut buf = vec![0u8; table_len.div_ceil(self.block_size) * self.block_size];
        for (idx, descriptor) in meta.group_descriptors.iter().enumerate() {
            let raw = RawGroupDescriptor::from(&**descriptor);
            let offset = idx * core::mem::size_of::<RawGroupDescriptor>();
            buf[offset..offset + core::mem::size_of::<RawGroupDescriptor>()]
                .copy_from_slice(raw.as_bytes());
        }
        self.write_blocks(meta.super_block.group_descriptors_bid(), &buf)?;
        for descriptor in meta.group_descriptors.iter_mut() {
            descriptor.clear_dirty();
        }
        Ok(())
    }

    /// Flips a bit of the bitmap starting at `bitmap_first_bid`, writing
    /// the bitmap block back. Returns false when the bit already had the
    /// requested state.
    fn flip_bitmap_bit(&self, bitmap_first_bid: Ext2Bid, bit: usize, set: bool) -> Result<bool> {
        let bits_per_block = self.block_size * 8;
        let bid = bitmap_first_bid + (bit / bits_per_block) as Ext2Bid;
        let index = bit % bits_per_block;

        let mut block_buf = vec![0u8; self.block_size];
        self.read_block(bid, &mut block_buf)?;
        let mut bitmap = BitMap::from_bytes_with_bit_len(&block_buf, bits_per_block)?;
        if bitmap.is_allocated(index) == set {
            return Ok(false);
        }
        bitmap.set_allocated(index, set);
        self.write_block(bid, bitmap.as_bytes())?;
        Ok(true)
    }
}

impl core::fmt::Debug for Ext2 {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Ext2")
            .field("fsid", &self.fsid)
            .field("super_block", &*self.meta.read().super_block)
            .finish()
    }
}
