/*!
This crate decodes ext4 filesystem images without mounting them, letting you
read metadata and file contents straight from the on-disk layout.

# Example

```rust,no_run
let image = std::fs::File::open("/dev/sda1").unwrap();
let vol = ext4img::Volume::new(image).unwrap();
let target = vol.resolve_path("/etc/passwd").unwrap().inode;
let inode = vol.load_inode(target).unwrap();
let passwd = vol.read_file(&inode).unwrap();
```

Note: normal users can't read `/dev/sda1` by default. You can grant yourself
temporary access with `sudo setfacl -m u:${USER}:r /dev/sda1`, if you so
fancy. This will be lost at reboot.
*/

use std::convert::TryFrom;
use std::io::Read;

use anyhow::anyhow;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Error;
use bitflags::bitflags;
use log::debug;

pub use positioned_io::ReadAt;

mod block_groups;
mod extents;
mod parse;

use crate::block_groups::BlockGroups;
pub use crate::extents::TreeReader;

/// The number of the root directory inode, fixed by the format.
pub const ROOT_INODE: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The filesystem doesn't meet the code's expectations;
    /// maybe the code is wrong, maybe the filesystem is corrupt.
    #[error("assumption failed: {reason:?}")]
    AssumptionFailed { reason: String },

    /// The filesystem is valid, but requests a feature the code doesn't support.
    #[error("filesystem uses an unsupported feature: {reason:?}")]
    UnsupportedFeature { reason: String },

    /// The request is for something which we are sure is not there.
    #[error("not found: {reason:?}")]
    NotFound { reason: String },
}

fn assumption_failed<S: ToString>(reason: S) -> ParseError {
    ParseError::AssumptionFailed {
        reason: reason.to_string(),
    }
}

fn unsupported_feature<S: ToString>(reason: S) -> ParseError {
    ParseError::UnsupportedFeature {
        reason: reason.to_string(),
    }
}

fn not_found<S: ToString>(reason: S) -> ParseError {
    ParseError::NotFound {
        reason: reason.to_string(),
    }
}

fn parse_error(msg: String) -> Error {
    assumption_failed(msg).into()
}

bitflags! {
    pub struct InodeFlags: u32 {
        const SECRM        = 0x0000_0001; /* Secure deletion */
        const UNRM         = 0x0000_0002; /* Undelete */
        const COMPR        = 0x0000_0004; /* Compress file */
        const SYNC         = 0x0000_0008; /* Synchronous updates */
        const IMMUTABLE    = 0x0000_0010; /* Immutable file */
        const APPEND       = 0x0000_0020; /* writes to file may only append */
        const NODUMP       = 0x0000_0040; /* do not dump file */
        const NOATIME      = 0x0000_0080; /* do not update atime */
        const DIRTY        = 0x0000_0100; /* reserved for compression */
        const COMPRBLK     = 0x0000_0200; /* One or more compressed clusters */
        const NOCOMPR      = 0x0000_0400; /* Don't compress */
        const ENCRYPT      = 0x0000_0800; /* encrypted file */
        const INDEX        = 0x0000_1000; /* hash-indexed directory */
        const IMAGIC       = 0x0000_2000; /* AFS directory */
        const JOURNAL_DATA = 0x0000_4000; /* file data should be journaled */
        const NOTAIL       = 0x0000_8000; /* file tail should not be merged */
        const DIRSYNC      = 0x0001_0000; /* dirsync behaviour (directories only) */
        const TOPDIR       = 0x0002_0000; /* Top of directory hierarchies*/
        const HUGE_FILE    = 0x0004_0000; /* Set to each huge file */
        const EXTENTS      = 0x0008_0000; /* Inode uses extents */
        const EA_INODE     = 0x0020_0000; /* Inode used for large EA */
        const EOFBLOCKS    = 0x0040_0000; /* Blocks allocated beyond EOF */
        const INLINE_DATA  = 0x1000_0000; /* Inode has inline data. */
        const PROJINHERIT  = 0x2000_0000; /* Create with parents projid */
        const RESERVED     = 0x8000_0000; /* reserved for ext4 lib */
    }
}

/// Flag indicating the type of file stored in this inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,     // S_IFREG (Regular file)
    SymbolicLink,    // S_IFLNK (Symbolic link)
    CharacterDevice, // S_IFCHR (Character device)
    BlockDevice,     // S_IFBLK (Block device)
    Directory,       // S_IFDIR (Directory)
    Fifo,            // S_IFIFO (FIFO)
    Socket,          // S_IFSOCK (Socket)
}

impl FileType {
    fn from_mode(mode: u16) -> Option<FileType> {
        match mode >> 12 {
            0x1 => Some(FileType::Fifo),
            0x2 => Some(FileType::CharacterDevice),
            0x4 => Some(FileType::Directory),
            0x6 => Some(FileType::BlockDevice),
            0x8 => Some(FileType::RegularFile),
            0xA => Some(FileType::SymbolicLink),
            0xC => Some(FileType::Socket),
            _ => None,
        }
    }

    fn from_dir_hint(hint: u8) -> Option<FileType> {
        match hint {
            1 => Some(FileType::RegularFile),
            2 => Some(FileType::Directory),
            3 => Some(FileType::CharacterDevice),
            4 => Some(FileType::BlockDevice),
            5 => Some(FileType::Fifo),
            6 => Some(FileType::Socket),
            7 => Some(FileType::SymbolicLink),
            _ => None,
        }
    }
}

/// An entry in a directory, without its extra metadata.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u32,
    pub file_type: FileType,
    pub name: String,
}

/// Extended, type-specific information read from an inode.
#[derive(Debug)]
pub enum Enhanced {
    RegularFile,
    /// A symlink, with its decoded destination.
    SymbolicLink(String),
    /// A 'c' device, with its major and minor numbers.
    CharacterDevice(u16, u32),
    /// A 'b' device, with its major and minor numbers.
    BlockDevice(u16, u32),
    /// A directory, with its listing.
    Directory(Vec<DirEntry>),
    Fifo,
    Socket,
}

/// A raw filesystem time.
#[derive(Debug)]
pub struct Time {
    pub epoch_secs: i64,
    pub nanos: Option<u32>,
}

impl Time {
    // c.f. ext4_decode_extra_time
    // the lower two bits of the extra field extend the epoch,
    // the remainder are the nsec
    pub fn from_extra(epoch_secs: i32, extra: Option<u32>) -> Time {
        let mut epoch_secs = i64::from(epoch_secs);
        match extra {
            None => Time {
                epoch_secs,
                nanos: None,
            },
            Some(extra) => {
                let epoch_bits = 2;
                let epoch_mask = (1 << epoch_bits) - 1;
                let nsec_mask = !0u32 << epoch_bits;

                epoch_secs += i64::from(extra & epoch_mask) << 32;

                let nanos = (extra & nsec_mask) >> epoch_bits;
                Time {
                    epoch_secs,
                    nanos: Some(nanos.clamp(0, 999_999_999)),
                }
            }
        }
    }
}

/// Full information about a disc entry.
#[derive(Debug)]
pub struct Stat {
    pub extracted_type: FileType,
    pub file_mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Time,
    pub ctime: Time,
    pub mtime: Time,
    pub btime: Option<Time>,
    pub link_count: u16,
}

/// The inline payload area of an inode: the extent tree root for
/// extent-mapped inodes, the destination for short symlinks.
pub(crate) const INODE_CORE_SIZE: usize = 4 * 15;

/// An actual disc metadata entry.
pub struct Inode {
    pub stat: Stat,
    pub number: u32,
    flags: InodeFlags,
    core: [u8; INODE_CORE_SIZE],
    block_size: u32,
}

/// A loaded filesystem: the superblock's derived constants plus the group
/// descriptor table, decoded once. Everything else is re-read from the
/// backing image on demand.
pub struct Volume<R> {
    inner: R,
    groups: BlockGroups,
}

impl<R> Volume<R>
where
    R: ReadAt,
{
    /// Open a filesystem: read and validate the superblock, then decode the
    /// group descriptor table. Nothing else touches the image until a later
    /// request asks for it.
    pub fn new(inner: R) -> Result<Volume<R>, Error> {
        let mut sb = [0u8; parse::SUPERBLOCK_LEN];
        inner
            .read_exact_at(parse::SUPERBLOCK_OFFSET, &mut sb)
            .with_context(|| anyhow!("failed to read the full superblock record"))?;

        let layout = parse::layout(&sb).with_context(|| anyhow!("failed to parse superblock"))?;

        let table_len = usize::from(layout.desc_stride)
            .checked_mul(usize::try_from(layout.group_count)?)
            .ok_or_else(|| parse_error("group descriptor table size overflows".to_string()))?;
        let mut table = vec![0u8; table_len];
        inner
            .read_exact_at(layout.descriptor_table_offset, &mut table)
            .with_context(|| {
                anyhow!(
                    "failed to read {} group descriptors at {:#x}",
                    layout.group_count,
                    layout.descriptor_table_offset
                )
            })?;

        let groups = BlockGroups::new(&table, &layout)
            .with_context(|| anyhow!("failed to parse group descriptor table"))?;

        debug!(
            "volume loaded: block size {}, {} groups, inode size {}",
            layout.block_size, layout.group_count, layout.inode_size
        );

        Ok(Volume { inner, groups })
    }

    /// Load a filesystem entry by inode number.
    pub fn load_inode(&self, inode: u32) -> Result<Inode, Error> {
        let offset = self.groups.index_of(inode)?;
        let mut data = vec![0u8; usize::from(self.groups.inode_size)];
        self.inner
            .read_exact_at(offset, &mut data)
            .with_context(|| anyhow!("failed to read inode <{}> at {:#x}", inode, offset))?;

        let parsed = parse::inode(&data)
            .with_context(|| anyhow!("failed to parse inode <{}>", inode))?;

        Ok(Inode {
            number: inode,
            stat: parsed.stat,
            flags: parsed.flags,
            core: parsed.core,
            block_size: self.groups.block_size,
        })
    }

    /// Load the root directory of the filesystem (`/`).
    pub fn root(&self) -> Result<Inode, Error> {
        self.load_inode(ROOT_INODE)
            .with_context(|| anyhow!("failed to load root inode"))
    }

    /// Parse a path, and find the directory entry it represents.
    /// Note that "/foo/../bar" will be treated literally, not resolved to
    /// "/bar" then looked up. An empty path (or `/`) names the root.
    ///
    /// A missing component surfaces as [`ParseError::NotFound`], which can be
    /// told apart from corruption errors by downcasting.
    pub fn resolve_path(&self, path: &str) -> Result<DirEntry, Error> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            // the root has no containing entry; synthesise one
            return Ok(DirEntry {
                inode: ROOT_INODE,
                file_type: FileType::Directory,
                name: "/".to_string(),
            });
        }

        let mut curr = self.root()?;

        let mut parts = path
            .split('/')
            .filter(|part| !part.is_empty())
            .collect::<Vec<&str>>();
        let last = parts.pop().expect("non-empty path has a last component");
        for part in parts {
            let child = self.dir_entry_named(&curr, part)?;
            curr = self.load_inode(child.inode)?;
        }

        self.dir_entry_named(&curr, last)
    }

    fn dir_entry_named(&self, inode: &Inode, name: &str) -> Result<DirEntry, Error> {
        ensure!(
            FileType::Directory == inode.stat.extracted_type,
            not_found(format!("component {:?} is not inside a directory", name))
        );

        // duplicate names should never occur on disc; if a corrupt image
        // produces them anyway, the first match wins
        let mut found = None;
        self.for_each_entry(inode, |entry| {
            if entry.name == name {
                found = Some(entry.clone());
                Ok(false)
            } else {
                Ok(true)
            }
        })?;

        found.ok_or_else(|| not_found(format!("component {:?} isn't there", name)).into())
    }

    /// Enumerate a directory, invoking `visit` for each live entry in disc
    /// order. The closure returns `true` to keep going; returning `false`
    /// stops the scan early. The method returns `true` if the closure always
    /// returned `true`.
    ///
    /// Enumeration ends at the terminal sentinel (a record with inode zero
    /// or an empty name); bytes after it are never interpreted.
    pub fn for_each_entry<F>(&self, inode: &Inode, visit: F) -> Result<bool, Error>
    where
        F: FnMut(&DirEntry) -> Result<bool, Error>,
    {
        ensure!(
            FileType::Directory == inode.stat.extracted_type,
            assumption_failed(format!("inode <{}> is not a directory", inode.number))
        );

        let data = self.read_file(inode)?;
        scan_directory(&data, visit)
            .with_context(|| anyhow!("enumerating directory inode <{}>", inode.number))
    }

    /// Collect a directory's listing.
    pub fn dir_entries(&self, inode: &Inode) -> Result<Vec<DirEntry>, Error> {
        let mut entries = Vec::with_capacity(40);
        self.for_each_entry(inode, |entry| {
            entries.push(entry.clone());
            Ok(true)
        })?;
        Ok(entries)
    }

    /// Open the data of an inode as a sequential reader over its
    /// reconstructed logical byte stream.
    pub fn open(&self, inode: &Inode) -> Result<TreeReader<&R>, Error> {
        inode.reader(&self.inner)
    }

    /// Read an inode's full data into memory. The buffer is sized from the
    /// inode's recorded size up front.
    pub fn read_file(&self, inode: &Inode) -> Result<Vec<u8>, Error> {
        inode.load_all(&self.inner)
    }

    /// Load extra metadata about some types of entries.
    pub fn enhance(&self, inode: &Inode) -> Result<Enhanced, Error> {
        inode.enhance(&self.inner)
    }

    /// Visit every entry in the filesystem, depth first.
    /// The closure should return `true` if it wants walking to continue.
    /// The method returns `true` if the closure always returned true.
    pub fn walk<F>(&self, inode: &Inode, path: &str, visit: &mut F) -> Result<bool, Error>
    where
        F: FnMut(&Self, &str, &Inode, &Enhanced) -> Result<bool, Error>,
    {
        let enhanced = self.enhance(inode)?;

        if !visit(self, path, inode, &enhanced).with_context(|| anyhow!("user closure failed"))? {
            return Ok(false);
        }

        if let Enhanced::Directory(entries) = enhanced {
            for entry in entries {
                if "." == entry.name || ".." == entry.name {
                    continue;
                }

                let child = self
                    .load_inode(entry.inode)
                    .with_context(|| anyhow!("loading {} ({:?})", entry.name, entry.file_type))?;
                if !self
                    .walk(&child, &format!("{}/{}", path, entry.name), visit)
                    .with_context(|| anyhow!("processing '{}'", entry.name))?
                {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}

impl Inode {
    fn reader<R>(&self, inner: R) -> Result<TreeReader<R>, Error>
    where
        R: ReadAt,
    {
        ensure!(
            !self.flags.contains(InodeFlags::INDEX),
            unsupported_feature(format!(
                "inode <{}> uses a hashed directory index",
                self.number
            ))
        );
        ensure!(
            self.only_relevant_flag_is_extents(),
            unsupported_feature(format!(
                "inode <{}> is not extent-mapped: {:?}",
                self.number, self.flags
            ))
        );

        TreeReader::new(inner, self.block_size, self.stat.size, self.core)
            .with_context(|| anyhow!("opening inode <{}>", self.number))
    }

    fn load_all<R>(&self, inner: R) -> Result<Vec<u8>, Error>
    where
        R: ReadAt,
    {
        let size = usize::try_from(self.stat.size)?;
        let mut ret = vec![0u8; size];

        self.reader(inner)?.read_exact(&mut ret)?;

        Ok(ret)
    }

    fn enhance<R>(&self, inner: R) -> Result<Enhanced, Error>
    where
        R: ReadAt,
    {
        Ok(match self.stat.extracted_type {
            FileType::RegularFile => Enhanced::RegularFile,
            FileType::Socket => Enhanced::Socket,
            FileType::Fifo => Enhanced::Fifo,

            FileType::Directory => {
                let mut entries = Vec::with_capacity(40);
                let data = self.load_all(&inner)?;
                scan_directory(&data, |entry| {
                    entries.push(entry.clone());
                    Ok(true)
                })?;
                Enhanced::Directory(entries)
            }
            FileType::SymbolicLink => {
                Enhanced::SymbolicLink(if self.stat.size < u64::try_from(INODE_CORE_SIZE)? {
                    ensure!(
                        self.flags.is_empty(),
                        unsupported_feature(format!(
                            "symbolic links may not have flags: {:?}",
                            self.flags
                        ))
                    );
                    std::str::from_utf8(&self.core[0..usize::try_from(self.stat.size)?])
                        .with_context(|| anyhow!("short symlink is invalid utf-8"))?
                        .to_string()
                } else {
                    ensure!(
                        self.only_relevant_flag_is_extents(),
                        unsupported_feature(format!(
                            "symbolic links may not have non-extent flags: {:?}",
                            self.flags
                        ))
                    );
                    std::str::from_utf8(&self.load_all(inner)?)
                        .with_context(|| anyhow!("long symlink is invalid utf-8"))?
                        .to_string()
                })
            }
            FileType::CharacterDevice => {
                let (maj, min) = load_maj_min(self.core);
                Enhanced::CharacterDevice(maj, min)
            }
            FileType::BlockDevice => {
                let (maj, min) = load_maj_min(self.core);
                Enhanced::BlockDevice(maj, min)
            }
        })
    }

    // the flags, minus irrelevant flags, must be exactly EXTENTS; anything
    // else changes how the data is mapped and we'd read garbage
    fn only_relevant_flag_is_extents(&self) -> bool {
        self.flags
            & (InodeFlags::COMPR
                | InodeFlags::DIRTY
                | InodeFlags::COMPRBLK
                | InodeFlags::ENCRYPT
                | InodeFlags::INDEX
                | InodeFlags::IMAGIC
                | InodeFlags::NOTAIL
                | InodeFlags::TOPDIR
                | InodeFlags::HUGE_FILE
                | InodeFlags::EXTENTS
                | InodeFlags::EA_INODE
                | InodeFlags::EOFBLOCKS
                | InodeFlags::INLINE_DATA)
            == InodeFlags::EXTENTS
    }
}

// shared by Volume::for_each_entry and Inode::enhance; same record scan,
// different ownership of the surrounding inode
fn scan_directory<F>(data: &[u8], mut visit: F) -> Result<bool, Error>
where
    F: FnMut(&DirEntry) -> Result<bool, Error>,
{
    let total_len = data.len();
    let mut cursor = 0usize;
    while cursor + 8 <= total_len {
        let record = &data[cursor..];
        let child_inode = read_le32(record);
        let rec_len = usize::from(read_le16(&record[4..]));
        let name_len = usize::from(record[6]);
        let file_type = record[7];

        if 0 == child_inode || 0 == name_len {
            break;
        }

        ensure!(
            rec_len >= 8 + name_len && cursor + rec_len <= total_len,
            assumption_failed(format!(
                "directory record at {} has invalid length {}",
                cursor, rec_len
            ))
        );

        let name = std::str::from_utf8(&record[8..8 + name_len])
            .map_err(|e| parse_error(format!("invalid utf-8 in file name: {}", e)))?;

        let entry = DirEntry {
            inode: child_inode,
            name: name.to_string(),
            file_type: FileType::from_dir_hint(file_type).ok_or_else(|| {
                unsupported_feature(format!("unexpected file type in directory: {}", file_type))
            })?,
        };

        if !visit(&entry)? {
            return Ok(false);
        }

        cursor += rec_len;
    }

    Ok(true)
}

fn load_maj_min(core: [u8; INODE_CORE_SIZE]) -> (u16, u32) {
    if 0 != core[0] || 0 != core[1] {
        (u16::from(core[1]), u32::from(core[0]))
    } else {
        // new-style numbers in bytes 4..8, the minor split around the major
        (
            u16::from(core[5]) | (u16::from(core[6] & 0b0000_1111) << 8),
            u32::from(core[4])
                | (u32::from(core[7]) << 12)
                | (u32::from(core[6] & 0b1111_0000) >> 4) << 8,
        )
    }
}

#[inline]
fn read_le16(from: &[u8]) -> u16 {
    use byteorder::ByteOrder;
    byteorder::LittleEndian::read_u16(from)
}

#[inline]
fn read_le32(from: &[u8]) -> u32 {
    use byteorder::ByteOrder;
    byteorder::LittleEndian::read_u32(from)
}

#[inline]
fn read_lei32(from: &[u8]) -> i32 {
    use byteorder::ByteOrder;
    byteorder::LittleEndian::read_i32(from)
}
