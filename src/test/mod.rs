// SPDX-License-Identifier: MPL-2.0

use crate::bitmap::BitMap;
use crate::dir::FileType;
use crate::fs::{Ext2, InodeId, ROOT_INO};
use crate::inode::{InodeDesc, InodeType, RawInode};
use crate::prelude::*;
use crate::super_block::FsState;
use crate::time::UnixTime;

use self::mkfs::*;


fn open_fs(image: Vec<u8>) -> (Arc<MemDisk>, Arc<Ext2>) {
    let disk = MemDisk::new(image);
    let fs = Ext2::open(disk.clone(), fixed_clock()).unwrap();
    (disk, fs)
}

fn root_id(fs: &Ext2) -> InodeId {
    fs.root_inode().unwrap().id()
}

fn list_directory(fs: &Ext2, ino: u32) -> Vec<(String, u32, FileType)> {
    let mut entries = Vec::new();
    fs.get_inode(ino)
        .unwrap()
        .traverse_as_directory(|name, id, type_| {
            entries.push((name.to_string(), id.index, type_));
            true
        })
        .unwrap();
    entries
}

#[test]
fn mounts_and_exposes_root() {
    let (_disk, fs) = open_fs(fabricate_image());
    assert_eq!(fs.block_size(), BLOCK_SIZE);
    assert_eq!(fs.block_groups_count(), 1);
    assert_eq!(fs.super_block().state(), FsState::Valid);

    let root = fs.root_inode().unwrap();
    assert_eq!(root.ino(), ROOT_INO);
    assert_eq!(root.id().fsid, fs.fsid());

    let metadata = fs.inode_metadata(ROOT_INO).unwrap();
    assert_eq!(metadata.type_, InodeType::Dir);
    assert_eq!(metadata.size, BLOCK_SIZE);
    assert_eq!(metadata.hard_links, 2);
}

#[test]
fn rejects_bad_magic() {
    let mut image = fabricate_image();
    let mut sb = raw_super_block(&image);
    sb.magic = 0x1234;
    write_val(&mut image, 1024, &sb);

    let err = Ext2::open(MemDisk::new(image), fixed_clock()).unwrap_err();
    assert_eq!(err.errno(), Errno::EINVAL);
}

#[test]
fn rejects_corrupted_state() {
    let mut image = fabricate_image();
    let mut sb = raw_super_block(&image);
    sb.state = FsState::Corrupted as u16;
    write_val(&mut image, 1024, &sb);

    let err = Ext2::open(MemDisk::new(image), fixed_clock()).unwrap_err();
    assert_eq!(err.errno(), Errno::EINVAL);
}

#[test]
fn rejects_truncated_device() {
    let err = Ext2::open(MemDisk::new(vec![0u8; 512]), fixed_clock()).unwrap_err();
    assert_eq!(err.errno(), Errno::EIO);
}

#[test]
fn lists_root_entries() {
    let (disk, fs) = open_fs(fabricate_image());
    let entries = list_directory(&fs, ROOT_INO);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], (".".to_string(), ROOT_INO, FileType::Dir));
    assert_eq!(entries[1], ("..".to_string(), ROOT_INO, FileType::Dir));

    // The root records decoded above came verbatim from the root data block.
    let mut raw_block = vec![0u8; BLOCK_SIZE];
    fs.read_blocks(ROOT_DIR_BID, &mut raw_block).unwrap();
    assert_eq!(
        raw_block.as_slice(),
        &disk.snapshot()[ROOT_DIR_BID as usize * BLOCK_SIZE..][..BLOCK_SIZE]
    );
}

#[test]
fn creates_regular_file() {
    let (_disk, fs) = open_fs(fabricate_image());
    let root = root_id(&fs);

    let free_inodes_before = fs.super_block().free_inodes_count();
    let free_blocks_before = fs.super_block().free_blocks_count();

    let id = fs.create_inode(root, "hello", 0o100644, 5).unwrap();
    assert_eq!(id.index, FIRST_FREE_INO);

    let found = fs.root_inode().unwrap().lookup("hello").unwrap();
    assert_eq!(found, id);

    let metadata = fs.inode_metadata(id.index).unwrap();
    assert_eq!(metadata.type_, InodeType::File);
    assert_eq!(metadata.size, 5);
    assert_eq!(metadata.hard_links, 1);
    assert_eq!(metadata.blocks_count, 2);
    assert_eq!(metadata.atime, TEST_TIME);
    assert_eq!(metadata.mtime, TEST_TIME);

    assert_eq!(fs.super_block().free_inodes_count(), free_inodes_before - 1);
    assert_eq!(fs.super_block().free_blocks_count(), free_blocks_before - 1);
}

#[test]
fn write_read_round_trip() {
    let (_disk, fs) = open_fs(fabricate_image());
    let root = root_id(&fs);

    let id = fs.create_inode(root, "hello", 0o100644, 5).unwrap();
    fs.write_inode(id.index, b"world").unwrap();

    let inode = fs.get_inode(id.index).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(inode.read_at(0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"world");

    // Reads clamp to the file size.
    let mut buf = [0u8; 16];
    assert_eq!(inode.read_at(1, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"orld");
    assert_eq!(inode.read_at(5, &mut buf).unwrap(), 0);
}

#[test]
fn duplicate_name_is_rejected() {
    let (_disk, fs) = open_fs(fabricate_image());
    let root = root_id(&fs);

    fs.create_inode(root, "hello", 0o100644, 5).unwrap();
    let free_inodes_before = fs.super_block().free_inodes_count();
    let free_blocks_before = fs.super_block().free_blocks_count();

    let err = fs.create_inode(root, "hello", 0o100644, 9).unwrap_err();
    assert_eq!(err.errno(), Errno::EEXIST);

    // The aborted creation must not leak its reservations.
    assert_eq!(fs.super_block().free_inodes_count(), free_inodes_before);
    assert_eq!(fs.super_block().free_blocks_count(), free_blocks_before);
    assert_eq!(list_directory(&fs, ROOT_INO).len(), 3);
}

#[test]
fn creates_directory() {
    let (_disk, fs) = open_fs(fabricate_image());
    let root = root_id(&fs);

    let dirs_before = fs.group_descriptor(1).unwrap().dirs_count();
    let id = fs.create_directory(root, "sub", 0o40755).unwrap();

    let entries = list_directory(&fs, id.index);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], (".".to_string(), id.index, FileType::Dir));
    assert_eq!(entries[1], ("..".to_string(), ROOT_INO, FileType::Dir));

    assert_eq!(fs.inode_metadata(id.index).unwrap().hard_links, 2);
    assert_eq!(fs.inode_metadata(ROOT_INO).unwrap().hard_links, 3);
    assert_eq!(fs.group_descriptor(1).unwrap().dirs_count(), dirs_before + 1);
}

#[test]
fn inline_symlink_reads_without_touching_the_device() {
    let mut image = fabricate_image();
    let mut raw = RawInode::default();
    raw.mode = 0o120777;
    raw.size_low = 7;
    raw.hard_links = 1;
    // "/tmp/ab" packed into the first two block pointers.
    raw.block_ptrs.set_direct(0, u32::from_le_bytes(*b"/tmp"));
    raw.block_ptrs.set_direct(1, u32::from_le_bytes(*b"/ab\0"));
    claim_inode(&mut image, FIRST_FREE_INO);
    install_raw_inode(&mut image, FIRST_FREE_INO, &raw);
    add_root_entry(&mut image, FIRST_FREE_INO, FileType::SymLink, "link");

    let (disk, fs) = open_fs(image);
    let symlink = fs.get_inode(FIRST_FREE_INO).unwrap();
    assert_eq!(symlink.inode_type(), InodeType::SymLink);

    let reads_before = disk.read_count();
    let mut buf = [0u8; 7];
    assert_eq!(symlink.read_at(0, &mut buf).unwrap(), 7);
    assert_eq!(&buf, b"/tmp/ab");
    let mut tail = [0u8; 4];
    assert_eq!(symlink.read_at(5, &mut tail).unwrap(), 2);
    assert_eq!(&tail[..2], b"ab");
    // The target came from the inline pointer array, not from data blocks.
    assert_eq!(disk.read_count(), reads_before);
}

#[test]
fn reads_across_indirect_and_double_indirect_blocks() {
    const DATA_BLOCKS: usize = 270;
    let mut image = fabricate_image();

    let first_data = FIRST_FREE_BID;
    let ind_bid = first_data + DATA_BLOCKS as u32;
    let dind_bid = ind_bid + 1;
    let dind_l1_bid = dind_bid + 1;

    // Every data block starts with its logical index and is filled with a
    // byte pattern derived from it.
    for logical in 0..DATA_BLOCKS as u32 {
        let bid = first_data + logical;
        let block = &mut image[bid as usize * BLOCK_SIZE..][..BLOCK_SIZE];
        block.fill(logical as u8);
        block[..4].copy_from_slice(&logical.to_le_bytes());
        claim_block(&mut image, bid);
    }
    for bid in [ind_bid, dind_bid, dind_l1_bid] {
        claim_block(&mut image, bid);
    }

    let fill_pointer_block = |image: &mut [u8], bid: u32, entries: &[u32]| {
        let base = bid as usize * BLOCK_SIZE;
        for (i, entry) in entries.iter().enumerate() {
            image[base + i * 4..base + (i + 1) * 4].copy_from_slice(&entry.to_le_bytes());
        }
    };
    let ind_entries: Vec<u32> = (12..268).map(|logical| first_data + logical).collect();
    fill_pointer_block(&mut image, ind_bid, &ind_entries);
    fill_pointer_block(&mut image, dind_bid, &[dind_l1_bid]);
    fill_pointer_block(&mut image, dind_l1_bid, &[first_data + 268, first_data + 269]);

    let mut raw = RawInode::default();
    raw.mode = 0o100644;
    raw.size_low = (DATA_BLOCKS * BLOCK_SIZE) as u32;
    raw.hard_links = 1;
    raw.blocks_count = (DATA_BLOCKS * 2) as u32;
    for i in 0..12 {
        raw.block_ptrs.set_direct(i, first_data + i as u32);
    }
    raw.block_ptrs.set_indirect(ind_bid);
    raw.block_ptrs.set_db_indirect(dind_bid);
    claim_inode(&mut image, FIRST_FREE_INO);
    install_raw_inode(&mut image, FIRST_FREE_INO, &raw);
    add_root_entry(&mut image, FIRST_FREE_INO, FileType::File, "big");

    let (_disk, fs) = open_fs(image);
    let inode = fs.get_inode(FIRST_FREE_INO).unwrap();

    let mut content = vec![0u8; DATA_BLOCKS * BLOCK_SIZE];
    assert_eq!(inode.read_at(0, &mut content).unwrap(), content.len());
    for logical in 0..DATA_BLOCKS as u32 {
        let block = &content[logical as usize * BLOCK_SIZE..][..BLOCK_SIZE];
        assert_eq!(u32::from_le_bytes(block[..4].try_into().unwrap()), logical);
        assert!(block[4..].iter().all(|byte| *byte == logical as u8));
    }

    // An unaligned read within the single-indirect region.
    let mut buf = [0u8; 16];
    assert_eq!(inode.read_at(100 * BLOCK_SIZE + 4, &mut buf).unwrap(), 16);
    assert!(buf.iter().all(|byte| *byte == 100));
}

#[test]
fn block_list_walks_all_indirection_levels() {
    let mut image = fabricate_image();

    let data_bid = 700u32;
    let leaf_bid = 701u32;
    let dind_bid = 702u32;
    let tind_bid = 703u32;

    let entries_per_block = (BLOCK_SIZE / 4) as u32;
    let fill_with = |image: &mut [u8], bid: u32, entry: u32| {
        let base = bid as usize * BLOCK_SIZE;
        for i in 0..entries_per_block as usize {
            image[base + i * 4..base + (i + 1) * 4].copy_from_slice(&entry.to_le_bytes());
        }
    };
    // Every leaf entry resolves to the same data block; the resolver does
    // not care about duplicates.
    fill_with(&mut image, leaf_bid, data_bid);
    fill_with(&mut image, dind_bid, leaf_bid);
    let tind_base = tind_bid as usize * BLOCK_SIZE;
    image[tind_base..tind_base + 4].copy_from_slice(&dind_bid.to_le_bytes());

    const TAIL: u32 = 300;
    let block_count = 12 + 256 + 256 * 256 + TAIL;
    let mut raw = RawInode::default();
    raw.mode = 0o100644;
    raw.size_low = block_count * BLOCK_SIZE as u32;
    raw.hard_links = 1;
    raw.blocks_count = block_count * 2;
    for i in 0..12 {
        raw.block_ptrs.set_direct(i, data_bid);
    }
    raw.block_ptrs.set_indirect(leaf_bid);
    raw.block_ptrs.set_db_indirect(dind_bid);
    raw.block_ptrs.set_tb_indirect(tind_bid);

    let (_disk, fs) = open_fs(image);
    let desc = InodeDesc::try_from(raw).unwrap();
    let list = fs.block_list_for_inode(&desc).unwrap();
    assert_eq!(list.len(), block_count as usize);
    assert!(list.iter().all(|bid| *bid == data_bid));
}

#[test]
fn block_list_stops_at_zero_indirect_entry() {
    let mut image = fabricate_image();

    let ind_bid = 600u32;
    let base = ind_bid as usize * BLOCK_SIZE;
    image[base..base + 4].copy_from_slice(&650u32.to_le_bytes());
    // The next entry stays zero: end of allocation.

    let mut raw = RawInode::default();
    raw.mode = 0o100644;
    raw.size_low = 14 * BLOCK_SIZE as u32;
    raw.hard_links = 1;
    // The record claims 14 blocks, but the indirect array ends early.
    raw.blocks_count = 14 * 2;
    for i in 0..12 {
        raw.block_ptrs.set_direct(i, 500 + i as u32);
    }
    raw.block_ptrs.set_indirect(ind_bid);

    let (_disk, fs) = open_fs(image);
    let desc = InodeDesc::try_from(raw).unwrap();
    let list = fs.block_list_for_inode(&desc).unwrap();
    assert_eq!(list.len(), 13);
    assert_eq!(list[12], 650);
}

#[test]
fn unsupported_writes_are_rejected() {
    let mut image = fabricate_image();
    let mut raw = RawInode::default();
    raw.mode = 0o120777;
    raw.size_low = 7;
    raw.hard_links = 1;
    raw.block_ptrs.set_direct(0, u32::from_le_bytes(*b"/tmp"));
    raw.block_ptrs.set_direct(1, u32::from_le_bytes(*b"/ab\0"));
    claim_inode(&mut image, FIRST_FREE_INO);
    install_raw_inode(&mut image, FIRST_FREE_INO, &raw);
    add_root_entry(&mut image, FIRST_FREE_INO, FileType::SymLink, "link");

    let (_disk, fs) = open_fs(image);
    let root = root_id(&fs);

    // Writing through a symlink inode is not supported.
    let err = fs.write_inode(FIRST_FREE_INO, b"/other/path").unwrap_err();
    assert_eq!(err.errno(), Errno::ENOSYS);

    // Neither is growing a file.
    let id = fs.create_inode(root, "file", 0o100644, 5).unwrap();
    let err = fs.write_inode(id.index, &[0u8; 2000]).unwrap_err();
    assert_eq!(err.errno(), Errno::EFBIG);

    // A creation that would need indirect blocks fails before the name is
    // inserted, and its claimed inode and blocks are released again.
    let free_inodes_before = fs.super_block().free_inodes_count();
    let free_blocks_before = fs.super_block().free_blocks_count();
    let err = fs
        .create_inode(root, "toobig", 0o100644, 13 * BLOCK_SIZE)
        .unwrap_err();
    assert_eq!(err.errno(), Errno::EFBIG);
    assert_eq!(fs.super_block().free_inodes_count(), free_inodes_before);
    assert_eq!(fs.super_block().free_blocks_count(), free_blocks_before);
    assert!(fs.root_inode().unwrap().lookup("toobig").is_err());
}

#[test]
fn zero_size_files_need_no_blocks() {
    let (_disk, fs) = open_fs(fabricate_image());
    let root = root_id(&fs);

    let free_blocks_before = fs.super_block().free_blocks_count();
    let id = fs.create_inode(root, "empty", 0o100644, 0).unwrap();

    let metadata = fs.inode_metadata(id.index).unwrap();
    assert_eq!(metadata.size, 0);
    assert_eq!(metadata.blocks_count, 0);
    assert_eq!(fs.super_block().free_blocks_count(), free_blocks_before);

    let mut buf = [0u8; 4];
    assert_eq!(fs.get_inode(id.index).unwrap().read_at(0, &mut buf).unwrap(), 0);
}

#[test]
fn link_count_round_trip_is_a_no_op() {
    let (_disk, fs) = open_fs(fabricate_image());
    let root = root_id(&fs);
    let id = fs.create_inode(root, "file", 0o100644, 5).unwrap();

    let before = fs.raw_inode(id.index).unwrap();
    fs.modify_link_count(id.index, 2).unwrap();
    assert_eq!(fs.inode_metadata(id.index).unwrap().hard_links, 3);
    fs.modify_link_count(id.index, -2).unwrap();
    let after = fs.raw_inode(id.index).unwrap();
    assert_eq!(before.as_bytes(), after.as_bytes());
}

#[test]
fn set_mtime_refreshes_cached_handles() {
    let (_disk, fs) = open_fs(fabricate_image());
    let root = root_id(&fs);
    let id = fs.create_inode(root, "file", 0o100644, 5).unwrap();

    // Hold a handle across the rewrite; it must observe the new stamp.
    let inode = fs.get_inode(id.index).unwrap();
    fs.set_mtime(id.index, UnixTime::new(123)).unwrap();
    assert_eq!(inode.metadata().mtime, UnixTime::new(123));
}

#[test]
fn accounting_invariants_hold_after_mutations() {
    let (disk, fs) = open_fs(fabricate_image());
    let root = root_id(&fs);

    fs.create_inode(root, "a.txt", 0o100644, 1500).unwrap();
    fs.create_directory(root, "dir", 0o40755).unwrap();
    assert!(fs.create_inode(root, "a.txt", 0o100644, 1).is_err());

    let image = disk.snapshot();
    let sb = raw_super_block(&image);
    let gd = raw_group_descriptor(&image);

    let mut bitmaps = vec![0u8; 2 * BLOCK_SIZE];
    fs.read_blocks(BLOCK_BITMAP_BID, &mut bitmaps).unwrap();
    let block_bitmap =
        BitMap::from_bytes_with_bit_len(&bitmaps[..BLOCK_SIZE], BLOCKS_COUNT as usize).unwrap();
    let inode_bitmap =
        BitMap::from_bytes_with_bit_len(&bitmaps[BLOCK_SIZE..], INODES_COUNT as usize).unwrap();

    // Bitmap populations match the group counters.
    assert_eq!(
        block_bitmap.count_allocated() as u32,
        BLOCKS_COUNT - gd.free_blocks_count as u32
    );
    assert_eq!(
        inode_bitmap.count_allocated() as u32,
        INODES_COUNT - gd.free_inodes_count as u32
    );
    // With a single group, the group counters are the global counters.
    assert_eq!(gd.free_blocks_count as u32, sb.free_blocks_count);
    assert_eq!(gd.free_inodes_count as u32, sb.free_inodes_count);
    // And the in-memory caches agree with the bytes on disk.
    assert_eq!(fs.super_block().free_blocks_count(), sb.free_blocks_count);
    assert_eq!(fs.super_block().free_inodes_count(), sb.free_inodes_count);
}

#[test]
fn inode_cache_returns_the_same_handle() {
    let (_disk, fs) = open_fs(fabricate_image());

    let first = fs.get_inode(ROOT_INO).unwrap();
    let second = fs.get_inode(ROOT_INO).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    assert_eq!(fs.get_inode(0).unwrap_err().errno(), Errno::ENOENT);
    // Reserved inodes other than the root are refused.
    assert_eq!(fs.get_inode(5).unwrap_err().errno(), Errno::ENOENT);
    assert_eq!(
        fs.get_inode(INODES_COUNT + 1).unwrap_err().errno(),
        Errno::ENOENT
    );
    // Valid but unallocated inodes read as free records.
    assert_eq!(fs.get_inode(42).unwrap_err().errno(), Errno::ENOENT);
}

#[test]
fn finds_parent_by_scanning_the_group() {
    let (_disk, fs) = open_fs(fabricate_image());
    let root = root_id(&fs);

    let sub = fs.create_directory(root, "sub", 0o40755).unwrap();
    let file = fs.create_inode(sub, "deep.txt", 0o100644, 10).unwrap();

    assert_eq!(fs.find_parent_of_inode(file).unwrap(), Some(sub));
    assert_eq!(fs.find_parent_of_inode(sub).unwrap(), Some(root));
}

#[test]
fn reverse_lookup_names_children() {
    let (_disk, fs) = open_fs(fabricate_image());
    let root = root_id(&fs);
    let id = fs.create_inode(root, "named", 0o100644, 0).unwrap();

    let root_inode = fs.root_inode().unwrap();
    assert_eq!(root_inode.reverse_lookup(id).unwrap(), "named");
    let missing = InodeId::new(fs.fsid(), 1234);
    assert_eq!(
        root_inode.reverse_lookup(missing).unwrap_err().errno(),
        Errno::ENOENT
    );
}

#[test]
fn directory_rewrite_invalidates_the_lookup_cache() {
    let (_disk, fs) = open_fs(fabricate_image());
    let root = root_id(&fs);
    let root_inode = fs.root_inode().unwrap();

    // Populate the name map, then grow the directory behind it.
    assert_eq!(root_inode.lookup("late").unwrap_err().errno(), Errno::ENOENT);
    let id = fs.create_inode(root, "late", 0o100644, 0).unwrap();
    assert_eq!(root_inode.lookup("late").unwrap(), id);
}
