// SPDX-License-Identifier: MPL-2.0

use log::warn;

use crate::block_ptr::{BlockPtrs, Ext2Bid, BID_SIZE, MAX_BLOCK_PTRS};
use crate::dir::{DirEntryReader, FileType, MAX_FNAME_LEN};
use crate::fs::{Ext2, InodeId};
use crate::prelude::*;
use crate::time::UnixTime;

/// Max length of the target of a fast symbolic link.
///
/// Targets shorter than this are stored inline inside the block pointer
/// array instead of wasting a whole data block.
pub const FAST_SYMLINK_MAX_LEN: usize = MAX_BLOCK_PTRS * BID_SIZE;

/// The type of an inode, as encoded in the high bits of the mode.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromInt)]
pub enum InodeType {
    NamedPipe = 0o010000,
    CharDevice = 0o020000,
    Dir = 0o040000,
    BlockDevice = 0o060000,
    File = 0o100000,
    SymLink = 0o120000,
    Socket = 0o140000,
}

impl InodeType {
    /// Parses the inode type out of a raw mode.
    pub fn from_raw_mode(mode: u16) -> Result<Self> {
        const TYPE_MASK: u16 = 0o170000;
        Self::try_from(mode & TYPE_MASK)
            .map_err(|_| Error::with_message(Errno::EINVAL, "invalid file type"))
    }

    pub fn is_directory(&self) -> bool {
        *self == InodeType::Dir
    }

    pub fn is_device(&self) -> bool {
        *self == InodeType::BlockDevice || *self == InodeType::CharDevice
    }
}

bitflags! {
    /// The permission bits of the mode.
    pub struct FilePerm: u16 {
        /// set-user-ID
        const S_ISUID = 0o4000;
        /// set-group-ID
        const S_ISGID = 0o2000;
        /// sticky bit
        const S_ISVTX = 0o1000;
        /// read by owner
        const S_IRUSR = 0o0400;
        /// write by owner
        const S_IWUSR = 0o0200;
        /// execute/search by owner
        const S_IXUSR = 0o0100;
        /// read by group
        const S_IRGRP = 0o0040;
        /// write by group
        const S_IWGRP = 0o0020;
        /// execute/search by group
        const S_IXGRP = 0o0010;
        /// read by others
        const S_IROTH = 0o0004;
        /// write by others
        const S_IWOTH = 0o0002;
        /// execute/search by others
        const S_IXOTH = 0o0001;
    }
}

impl FilePerm {
    pub fn from_raw_mode(mode: u16) -> Result<Self> {
        const PERM_MASK: u16 = 0o7777;
        Self::from_bits(mode & PERM_MASK)
            .ok_or(Error::with_message(Errno::EINVAL, "invalid file perm"))
    }
}

bitflags! {
    /// Inode flags.
    pub struct FileFlags: u32 {
        /// Secure deletion.
        const SECURE_DEL = 1 << 0;
        /// Undelete.
        const UNDELETE = 1 << 1;
        /// Compress file.
        const COMPRESS = 1 << 2;
        /// Synchronous updates.
        const SYNC_UPDATE = 1 << 3;
        /// Immutable file.
        const IMMUTABLE = 1 << 4;
        /// Append only.
        const APPEND_ONLY = 1 << 5;
        /// Do not dump file.
        const NO_DUMP = 1 << 6;
        /// Do not update atime.
        const NO_ATIME = 1 << 7;
        /// Dirty.
        const DIRTY = 1 << 8;
        /// One or more compressed clusters.
        const COMPRESS_BLK = 1 << 9;
        /// Do not compress.
        const NO_COMPRESS = 1 << 10;
        /// Encrypted file.
        const ENCRYPT = 1 << 11;
        /// Hash-indexed directory.
        const INDEX_DIR = 1 << 12;
        /// AFS directory.
        const IMAGIC = 1 << 13;
        /// Journal file data.
        const JOURNAL_DATA = 1 << 14;
        /// File tail should not be merged.
        const NO_TAIL = 1 << 15;
        /// Dirsync behaviour (directories only).
        const DIR_SYNC = 1 << 16;
        /// Top of directory hierarchies.
        const TOP_DIR = 1 << 17;
        /// Reserved for ext2 lib.
        const RESERVED = 1 << 31;
    }
}

/// The in-memory rust inode descriptor.
///
/// It contains the pointers to the filesystem blocks which hold the data
/// of the object and all of the metadata about the object except its name.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InodeDesc {
    /// Type.
    pub type_: InodeType,
    /// Permission.
    pub perm: FilePerm,
    /// User Id.
    pub uid: u32,
    /// Group Id.
    pub gid: u32,
    /// Size in bytes.
    pub size: usize,
    /// Access time.
    pub atime: UnixTime,
    /// Change time.
    pub ctime: UnixTime,
    /// Modification time.
    pub mtime: UnixTime,
    /// Deletion time.
    pub dtime: UnixTime,
    /// Hard links count.
    pub hard_links: u16,
    /// Number of 512-byte sectors, as kept on disk.
    pub blocks_count: u32,
    /// File flags.
    pub flags: FileFlags,
    /// Pointers to blocks.
    pub block_ptrs: BlockPtrs,
}

impl TryFrom<RawInode> for InodeDesc {
    type Error = crate::error::Error;

    fn try_from(inode: RawInode) -> Result<Self> {
        Ok(Self {
            type_: InodeType::from_raw_mode(inode.mode)?,
            perm: FilePerm::from_raw_mode(inode.mode)?,
            uid: ((inode.os_dependent_2.uid_high as u32) << 16) | inode.uid as u32,
            gid: ((inode.os_dependent_2.gid_high as u32) << 16) | inode.gid as u32,
            size: inode.size_low as usize,
            atime: inode.atime,
            ctime: inode.ctime,
            mtime: inode.mtime,
            dtime: inode.dtime,
            hard_links: inode.hard_links,
            blocks_count: inode.blocks_count,
            flags: FileFlags::from_bits(inode.flags)
                .ok_or(Error::with_message(Errno::EINVAL, "invalid file flags"))?,
            block_ptrs: inode.block_ptrs,
        })
    }
}

const_assert!(core::mem::size_of::<RawInode>() == 128);

/// The raw inode on device.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, FromZeroes, FromBytes, AsBytes)]
pub(crate) struct RawInode {
    /// File mode (type and permissions).
    pub mode: u16,
    /// Low 16 bits of User Id.
    pub uid: u16,
    /// Lower 32 bits of size in bytes.
    pub size_low: u32,
    /// Access time.
    pub atime: UnixTime,
    /// Change time.
    pub ctime: UnixTime,
    /// Modification time.
    pub mtime: UnixTime,
    /// Deletion time.
    pub dtime: UnixTime,
    /// Low 16 bits of Group Id.
    pub gid: u16,
    pub hard_links: u16,
    /// Number of 512-byte sectors.
    pub blocks_count: u32,
    /// File flags.
    pub flags: u32,
    /// OS dependent Value 1.
    reserved1: u32,
    /// Pointers to blocks.
    pub block_ptrs: BlockPtrs,
    /// File version (for NFS).
    pub generation: u32,
    /// In revision 0, this field is reserved.
    /// In revision 1, File ACL.
    pub file_acl: u32,
    /// In revision 0, this field is reserved.
    /// In revision 1, upper 32 bits of file size if it's a file,
    /// directory ACL if it's a directory.
    pub size_high: u32,
    /// Fragment address.
    pub frag_addr: u32,
    /// OS dependent 2.
    pub os_dependent_2: Osd2,
}

impl From<&InodeDesc> for RawInode {
    fn from(inode: &InodeDesc) -> Self {
        Self {
            mode: inode.type_ as u16 | inode.perm.bits(),
            uid: inode.uid as u16,
            size_low: inode.size as u32,
            atime: inode.atime,
            ctime: inode.ctime,
            mtime: inode.mtime,
            dtime: inode.dtime,
            gid: inode.gid as u16,
            hard_links: inode.hard_links,
            blocks_count: inode.blocks_count,
            flags: inode.flags.bits(),
            block_ptrs: inode.block_ptrs,
            os_dependent_2: Osd2 {
                uid_high: (inode.uid >> 16) as u16,
                gid_high: (inode.gid >> 16) as u16,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// OS dependent Value 2
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, FromZeroes, FromBytes, AsBytes)]
pub(crate) struct Osd2 {
    /// Fragment number.
    pub frag_num: u8,
    /// Fragment size.
    pub frag_size: u8,
    pad1: u16,
    /// High 16 bits of User Id.
    pub uid_high: u16,
    /// High 16 bits of Group Id.
    pub gid_high: u16,
    reserved2: u32,
}

/// The metadata of an inode.
#[derive(Clone, Copy, Debug)]
pub struct Metadata {
    pub id: InodeId,
    pub type_: InodeType,
    pub perm: FilePerm,
    pub size: usize,
    pub uid: u32,
    pub gid: u32,
    pub atime: UnixTime,
    pub ctime: UnixTime,
    pub mtime: UnixTime,
    pub dtime: UnixTime,
    pub hard_links: u16,
    /// Number of 512-byte sectors occupied.
    pub blocks_count: u32,
    pub block_size: usize,
    pub major: u32,
    pub minor: u32,
}

/// The Ext2 inode.
///
/// A shared handle to an on-disk inode, holding a mutable copy of the raw
/// record plus lazily populated derived state: the resolved block list and,
/// for directories, a name lookup map.
pub struct Inode {
    ino: u32,
    type_: InodeType,
    fs: Weak<Ext2>,
    inner: RwLock<InodeInner>,
}

struct InodeInner {
    desc: InodeDesc,
    block_list: Option<Vec<Ext2Bid>>,
    lookup_cache: Option<BTreeMap<String, u32>>,
}

impl Inode {
    pub(crate) fn new(ino: u32, desc: InodeDesc, fs: Weak<Ext2>) -> Arc<Self> {
        Arc::new(Self {
            ino,
            type_: desc.type_,
            fs,
            inner: RwLock::new(InodeInner {
                desc,
                block_list: None,
                lookup_cache: None,
            }),
        })
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn inode_type(&self) -> InodeType {
        self.type_
    }

    pub fn fs(&self) -> Arc<Ext2> {
        self.fs.upgrade().unwrap()
    }

    /// Returns the identifier of this inode within its filesystem.
    pub fn id(&self) -> InodeId {
        InodeId::new(self.fs().fsid(), self.ino)
    }

    pub fn size(&self) -> usize {
        self.inner.read().desc.size
    }

    pub fn metadata(&self) -> Metadata {
        let inner = self.inner.read();
        let desc = &inner.desc;
        let (major, minor) = if desc.type_.is_device() {
            // Device numbers live in the first block pointer, encoded the
            // way Linux packs them.
            let dev = desc.block_ptrs.direct(0);
            ((dev & 0xfff00) >> 8, (dev & 0xff) | ((dev >> 12) & 0xfff00))
        } else {
            (0, 0)
        };
        Metadata {
            id: InodeId::new(self.fs().fsid(), self.ino),
            type_: desc.type_,
            perm: desc.perm,
            size: desc.size,
            uid: desc.uid,
            gid: desc.gid,
            atime: desc.atime,
            ctime: desc.ctime,
            mtime: desc.mtime,
            dtime: desc.dtime,
            hard_links: desc.hard_links,
            blocks_count: desc.blocks_count,
            block_size: self.fs().block_size(),
            major,
            minor,
        }
    }

    /// Reads up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short only at end of
    /// file. A failure to read any data block fails the whole call.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        {
            let inner = self.inner.read();
            let size = inner.desc.size;
            if size == 0 || offset >= size || buf.is_empty() {
                return Ok(0);
            }
            // Symbolic links shorter than 60 characters are stored inline
            // inside the block pointer array.
            if self.type_ == InodeType::SymLink && size < FAST_SYMLINK_MAX_LEN {
                let nread = buf.len().min(size - offset);
                let target = inner.desc.block_ptrs.as_bytes();
                buf[..nread].copy_from_slice(&target[offset..offset + nread]);
                return Ok(nread);
            }
        }

        self.ensure_block_list()?;

        let inner = self.inner.read();
        let size = inner.desc.size;
        if offset >= size {
            return Ok(0);
        }
        let Some(block_list) = inner.block_list.as_ref() else {
            return_errno_with_message!(Errno::EIO, "missing block list");
        };
        if block_list.is_empty() {
            warn!("empty block list for inode {}", self.ino);
            return_errno_with_message!(Errno::EIO, "empty block list");
        }

        let fs = self.fs();
        let block_size = fs.block_size();
        let first_block_idx = offset / block_size;
        let last_block_idx = ((offset + buf.len()) / block_size).min(block_list.len() - 1);

        let mut remaining = buf.len().min(size - offset);
        let mut nread = 0;
        let mut block_buf = vec![0u8; block_size];
        for idx in first_block_idx..=last_block_idx {
            if remaining == 0 {
                break;
            }
            fs.read_block(block_list[idx], &mut block_buf)?;
            let offset_into_block = if idx == first_block_idx {
                offset % block_size
            } else {
                0
            };
            let copy_len = (block_size - offset_into_block).min(remaining);
            buf[nread..nread + copy_len]
                .copy_from_slice(&block_buf[offset_into_block..offset_into_block + copy_len]);
            remaining -= copy_len;
            nread += copy_len;
        }
        Ok(nread)
    }

    /// Invokes `visitor` for every live entry of this directory, in record
    /// order. Traversal stops early when `visitor` returns `false`.
    pub fn traverse_as_directory<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&str, InodeId, FileType) -> bool,
    {
        if self.type_ != InodeType::Dir {
            return_errno!(Errno::ENOTDIR);
        }
        let size = self.size();
        let mut buf = vec![0u8; size];
        let nread = self.read_at(0, &mut buf)?;
        let fsid = self.fs().fsid();
        for entry in DirEntryReader::new(&buf[..nread]) {
            if !visitor(entry.name(), InodeId::new(fsid, entry.ino()), entry.type_()) {
                break;
            }
        }
        Ok(())
    }

    /// Finds the child with the given name.
    pub fn lookup(&self, name: &str) -> Result<InodeId> {
        if self.type_ != InodeType::Dir {
            return_errno!(Errno::ENOTDIR);
        }
        if name.len() > MAX_FNAME_LEN {
            return_errno!(Errno::ENAMETOOLONG);
        }
        self.ensure_lookup_cache()?;
        let inner = self.inner.read();
        match inner.lookup_cache.as_ref().and_then(|cache| cache.get(name)) {
            Some(ino) => Ok(InodeId::new(self.fs().fsid(), *ino)),
            None => return_errno!(Errno::ENOENT),
        }
    }

    /// Finds the name under which `child` appears in this directory.
    pub fn reverse_lookup(&self, child: InodeId) -> Result<String> {
        if self.type_ != InodeType::Dir {
            return_errno!(Errno::ENOTDIR);
        }
        if child.fsid != self.fs().fsid() {
            return_errno_with_message!(Errno::EINVAL, "foreign inode id");
        }
        self.ensure_lookup_cache()?;
        let inner = self.inner.read();
        if let Some(cache) = inner.lookup_cache.as_ref() {
            for (name, ino) in cache.iter() {
                if *ino == child.index {
                    return Ok(name.clone());
                }
            }
        }
        return_errno!(Errno::ENOENT)
    }

    /// Returns the resolved block list, populating the handle's cache on
    /// first use.
    pub(crate) fn cached_block_list(&self) -> Result<Vec<Ext2Bid>> {
        self.ensure_block_list()?;
        Ok(self.inner.read().block_list.clone().unwrap_or_default())
    }

    /// Returns a copy of the raw inode descriptor.
    pub(crate) fn desc(&self) -> InodeDesc {
        self.inner.read().desc
    }

    /// Replaces the descriptor after the raw inode was rewritten on disk.
    pub(crate) fn update_desc(&self, desc: InodeDesc) {
        let mut inner = self.inner.write();
        inner.desc = desc;
        // Names cached from the old record may be stale after a rewrite.
        inner.lookup_cache = None;
    }

    /// Drops the cached name map after the directory content changed.
    pub(crate) fn invalidate_lookup_cache(&self) {
        self.inner.write().lookup_cache = None;
    }

    fn ensure_block_list(&self) -> Result<()> {
        if self.inner.read().block_list.is_some() {
            return Ok(());
        }
        let desc = self.inner.read().desc;
        let block_list = self.fs().block_list_for_inode(&desc)?;
        let mut inner = self.inner.write();
        if inner.block_list.is_none() {
            inner.block_list = Some(block_list);
        }
        Ok(())
    }

    fn ensure_lookup_cache(&self) -> Result<()> {
        if self.inner.read().lookup_cache.is_some() {
            return Ok(());
        }
        let mut children = BTreeMap::new();
        self.traverse_as_directory(|name, id, _| {
            children.insert(name.to_string(), id.index);
            true
        })?;
        let mut inner = self.inner.write();
        if inner.lookup_cache.is_none() {
            inner.lookup_cache = Some(children);
        }
        Ok(())
    }
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("desc", &self.inner.read().desc)
            .finish()
    }
}
