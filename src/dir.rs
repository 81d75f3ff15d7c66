// SPDX-License-Identifier: MPL-2.0

use log::warn;

use crate::inode::InodeType;
use crate::prelude::*;

/// Max length of a file name.
pub const MAX_FNAME_LEN: usize = 255;

/// Directory records are padded so that each starts on a 4-byte boundary.
const RECORD_ALIGN: usize = 4;

/// The file type hint carried by a directory record.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromInt)]
pub enum FileType {
    Unknown = 0,
    File = 1,
    Dir = 2,
    CharDevice = 3,
    BlockDevice = 4,
    Fifo = 5,
    Socket = 6,
    SymLink = 7,
}

impl From<InodeType> for FileType {
    fn from(type_: InodeType) -> Self {
        match type_ {
            InodeType::File => FileType::File,
            InodeType::Dir => FileType::Dir,
            InodeType::CharDevice => FileType::CharDevice,
            InodeType::BlockDevice => FileType::BlockDevice,
            InodeType::NamedPipe => FileType::Fifo,
            InodeType::Socket => FileType::Socket,
            InodeType::SymLink => FileType::SymLink,
        }
    }
}

const_assert!(core::mem::size_of::<DirEntryHeader>() == 8);

/// The header of a directory record, followed on disk by the name bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromZeroes, FromBytes, AsBytes)]
pub(crate) struct DirEntryHeader {
    /// Inode number, 0 for a tombstone.
    pub ino: u32,
    /// Byte advance to the next record.
    pub record_len: u16,
    /// Length of the name, not NUL-terminated.
    pub name_len: u8,
    /// File type hint.
    pub file_type: u8,
}

pub(crate) const DIR_ENTRY_HEADER_LEN: usize = core::mem::size_of::<DirEntryHeader>();

/// A decoded directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    ino: u32,
    type_: FileType,
    name: String,
}

impl DirEntry {
    pub fn new(ino: u32, type_: FileType, name: &str) -> Self {
        debug_assert!(name.len() <= MAX_FNAME_LEN);
        Self {
            ino,
            type_,
            name: name.to_string(),
        }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn type_(&self) -> FileType {
        self.type_
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the logical record length: the header, the name, and the
    /// padding to the next 4-byte boundary.
    pub fn record_len(&self) -> usize {
        (DIR_ENTRY_HEADER_LEN + self.name.len()).align_up(RECORD_ALIGN)
    }
}

/// Walks the records of a directory content stream.
///
/// `record_len` alone is authoritative for advancement; records with an
/// inode number of 0 are tombstones and are skipped.
pub(crate) struct DirEntryReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> DirEntryReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn read_record(&mut self) -> Option<(DirEntryHeader, DirEntry)> {
        let header = DirEntryHeader::read_from_prefix(&self.buf[self.offset..])?;
        let record_len = header.record_len as usize;
        if record_len < DIR_ENTRY_HEADER_LEN || self.offset + record_len > self.buf.len() {
            warn!(
                "malformed directory record at offset {}: rec_len {}",
                self.offset, record_len
            );
            return None;
        }
        let name_end = self.offset + DIR_ENTRY_HEADER_LEN + header.name_len as usize;
        if name_end > self.offset + record_len {
            warn!("directory record name overruns rec_len");
            return None;
        }
        let name = String::from_utf8_lossy(&self.buf[self.offset + DIR_ENTRY_HEADER_LEN..name_end])
            .into_owned();
        let type_ = FileType::try_from(header.file_type).unwrap_or(FileType::Unknown);
        self.offset += record_len;
        Some((header, DirEntry::new(header.ino, type_, &name)))
    }
}

impl Iterator for DirEntryReader<'_> {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        loop {
            let (header, entry) = self.read_record()?;
            if header.ino != 0 {
                return Some(entry);
            }
        }
    }
}

/// Serializes directory entries into a content stream.
///
/// The stream occupies a whole number of blocks; the last record's
/// `record_len` is extended so that it reaches the end of the final block.
pub(crate) fn serialize_entries(entries: &[DirEntry], block_size: usize) -> Vec<u8> {
    let directory_size: usize = entries.iter().map(DirEntry::record_len).sum();
    let occupied_size = directory_size.align_up(block_size);

    let mut buf = Vec::with_capacity(occupied_size);
    for (i, entry) in entries.iter().enumerate() {
        let mut record_len = entry.record_len();
        if i == entries.len() - 1 {
            record_len += occupied_size - directory_size;
        }
        let header = DirEntryHeader {
            ino: entry.ino(),
            record_len: record_len as u16,
            name_len: entry.name().len() as u8,
            file_type: entry.type_() as u8,
        };
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(entry.name().as_bytes());
        buf.resize(buf.len() + record_len - DIR_ENTRY_HEADER_LEN - entry.name().len(), 0);
    }
    buf.resize(occupied_size, 0);
    buf
}
