use anyhow::ensure;
use anyhow::Error;
use bitflags::bitflags;
use log::debug;

use crate::assumption_failed;
use crate::parse_error;
use crate::read_le16;
use crate::read_le32;
use crate::read_lei32;
use crate::unsupported_feature;
use crate::FileType;
use crate::InodeFlags;
use crate::Stat;
use crate::Time;
use crate::INODE_CORE_SIZE;

/// The superblock always lives at this byte offset, after the boot block.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// The superblock record is exactly this long on disc, padding included.
pub const SUPERBLOCK_LEN: usize = 1024;

const EXT4_SUPER_MAGIC: u16 = 0xEF53;
const GROUP_DESC_BASE_LEN: u16 = 32;
const INODE_BASE_LEN: usize = 128;

bitflags! {
    struct IncompatibleFeature: u32 {
       const COMPRESSION = 0x0001;
       const FILETYPE    = 0x0002;
       const RECOVER     = 0x0004; /* Needs recovery */
       const JOURNAL_DEV = 0x0008; /* Journal device */
       const META_BG     = 0x0010;
       const EXTENTS     = 0x0040; /* extents support */
       const SIXTY_FOUR_BIT = 0x0080;
       const MMP         = 0x0100;
       const FLEX_BG     = 0x0200;
       const EA_INODE    = 0x0400; /* EA in inode */
       const DIRDATA     = 0x1000; /* data in dirent */
       const CSUM_SEED   = 0x2000;
       const LARGEDIR    = 0x4000; /* >2GB or 3-lvl htree */
       const INLINE_DATA = 0x8000; /* data in inode */
       const ENCRYPT     = 0x10000;
    }
}

/// Constants derived from the superblock, resolved exactly once at load
/// time. The 32-/64-bit duality lives here: everything downstream consumes
/// `desc_stride` and `long_structs` instead of re-inspecting feature flags.
#[derive(Debug)]
pub struct Layout {
    pub inodes_count: u32,
    pub inodes_per_group: u32,
    pub block_size: u32,
    pub inode_size: u16,
    /// Bytes per group descriptor record on disc; governs table slicing,
    /// not any in-memory shape.
    pub desc_stride: u16,
    /// 64-bit address extensions in effect (INCOMPAT_64BIT).
    pub long_structs: bool,
    pub descriptor_table_offset: u64,
    pub group_count: u32,
}

/// Decode the superblock record and derive the volume layout.
///
/// Field offsets follow the on-disk format; only the fields this crate
/// consumes are pulled out, the rest of the kilobyte is ignored.
pub fn layout(data: &[u8]) -> Result<Layout, Error> {
    ensure!(
        SUPERBLOCK_LEN == data.len(),
        assumption_failed(format!(
            "superblock record must be {} bytes, not {}",
            SUPERBLOCK_LEN,
            data.len()
        ))
    );

    let s_inodes_count = read_le32(&data[0x00..]); /* Inodes count */
    let s_log_block_size = read_le32(&data[0x18..]); /* Block size */
    let s_inodes_per_group = read_le32(&data[0x28..]); /* # Inodes per group */
    let s_magic = read_le16(&data[0x38..]); /* Magic signature */

    ensure!(
        EXT4_SUPER_MAGIC == s_magic,
        assumption_failed(format!("invalid magic number: {:04x}", s_magic))
    );

    let s_creator_os = read_le32(&data[0x48..]); /* OS */
    ensure!(
        0 == s_creator_os,
        unsupported_feature(format!(
            "only support filesystems created on linux, not '{}'",
            s_creator_os
        ))
    );

    let s_rev_level = read_le32(&data[0x4c..]); /* Revision level */
    ensure!(
        1 == s_rev_level,
        unsupported_feature(format!("rev level {}", s_rev_level))
    );

    let s_inode_size = read_le16(&data[0x58..]); /* size of inode structure */
    let s_feature_incompat = read_le32(&data[0x60..]); /* incompatible feature set */
    let s_desc_size = read_le16(&data[0xfe..]); /* size of group descriptor */

    let incompatible_features =
        IncompatibleFeature::from_bits(s_feature_incompat).ok_or_else(|| {
            parse_error(format!(
                "completely unsupported incompatible feature flag: {:b}",
                s_feature_incompat
            ))
        })?;

    let supported_incompatible_features = IncompatibleFeature::FILETYPE
        | IncompatibleFeature::EXTENTS
        | IncompatibleFeature::FLEX_BG
        | IncompatibleFeature::RECOVER
        | IncompatibleFeature::SIXTY_FOUR_BIT;

    if incompatible_features.intersects(!supported_incompatible_features) {
        return Err(parse_error(format!(
            "some unsupported incompatible feature flags: {:?}",
            incompatible_features & !supported_incompatible_features
        )));
    }

    let long_structs = incompatible_features.contains(IncompatibleFeature::SIXTY_FOUR_BIT);

    let block_size: u32 = match s_log_block_size {
        0 => 1024,
        1 => 2048,
        2 => 4096,
        6 => 65536,
        _ => {
            return Err(parse_error(format!(
                "unexpected block size: 2^{}",
                s_log_block_size + 10
            )));
        }
    };

    ensure!(
        0 != s_inodes_per_group,
        assumption_failed("inodes per group cannot be zero")
    );

    ensure!(
        usize::from(s_inode_size) >= INODE_BASE_LEN,
        assumption_failed(format!(
            "inode size {} is smaller than the base inode record",
            s_inode_size
        ))
    );

    let desc_stride = if long_structs {
        ensure!(
            s_desc_size >= GROUP_DESC_BASE_LEN,
            assumption_failed(format!(
                "in long mode, group desc size must be at least {}, not {}",
                GROUP_DESC_BASE_LEN, s_desc_size
            ))
        );
        s_desc_size
    } else {
        ensure!(
            0 == s_desc_size || GROUP_DESC_BASE_LEN == s_desc_size,
            assumption_failed(format!(
                "outside long mode, group desc size must be {} or absent, not {}",
                GROUP_DESC_BASE_LEN, s_desc_size
            ))
        );
        GROUP_DESC_BASE_LEN
    };

    // The descriptor table starts at the first full block boundary after the
    // superblock: block 2 for 1KiB blocks, block 1 otherwise.
    let descriptor_table_offset = if 1024 == block_size {
        1024 + 1024
    } else {
        u64::from(block_size)
    };

    let group_count =
        s_inodes_count / s_inodes_per_group + u32::from(0 != s_inodes_count % s_inodes_per_group);

    let layout = Layout {
        inodes_count: s_inodes_count,
        inodes_per_group: s_inodes_per_group,
        block_size,
        inode_size: s_inode_size,
        desc_stride,
        long_structs,
        descriptor_table_offset,
        group_count,
    };

    debug!("superblock: {:?}", layout);

    Ok(layout)
}

pub struct ParsedInode {
    pub stat: Stat,
    pub flags: InodeFlags,
    pub core: [u8; INODE_CORE_SIZE],
}

/// Decode the known prefix of an inode record. `data` holds the full
/// `inode_size` bytes; extra fields past the base record are only consulted
/// when `i_extra_isize` says they are present.
pub fn inode(data: &[u8]) -> Result<ParsedInode, Error> {
    ensure!(
        data.len() >= INODE_BASE_LEN,
        assumption_failed(format!(
            "inode record too short: {} < {}",
            data.len(),
            INODE_BASE_LEN
        ))
    );

    let i_mode = read_le16(&data[0x00..]); /* File mode */
    let i_uid = read_le16(&data[0x02..]); /* Low 16 bits of Owner Uid */
    let i_size_lo = read_le32(&data[0x04..]); /* Size in bytes */
    let i_atime = read_lei32(&data[0x08..]); /* Access time */
    let i_ctime = read_lei32(&data[0x0c..]); /* Inode Change time */
    let i_mtime = read_lei32(&data[0x10..]); /* Modification time */
    let i_gid = read_le16(&data[0x18..]); /* Low 16 bits of Group Id */
    let i_links_count = read_le16(&data[0x1a..]); /* Links count */
    let i_flags = read_le32(&data[0x20..]); /* File flags */
    let mut core = [0u8; INODE_CORE_SIZE];
    core.copy_from_slice(&data[0x28..0x64]); /* Pointers to blocks */
    let i_size_high = read_le32(&data[0x6c..]);
    let l_i_uid_high = read_le16(&data[0x78..]);
    let l_i_gid_high = read_le16(&data[0x7a..]);

    let i_extra_isize = if data.len() >= 0x82 {
        read_le16(&data[0x80..])
    } else {
        0
    };

    // extra timestamps exist only when i_extra_isize covers them and the
    // record is actually long enough
    let extra = |wanted: u16, at: usize| -> Option<u32> {
        if i_extra_isize >= wanted && data.len() >= at + 4 {
            Some(read_le32(&data[at..]))
        } else {
            None
        }
    };

    let i_ctime_extra = extra(6, 0x84); /* extra Change time      (nsec << 2 | epoch) */
    let i_mtime_extra = extra(10, 0x88); /* extra Modification time(nsec << 2 | epoch) */
    let i_atime_extra = extra(14, 0x8c); /* extra Access time      (nsec << 2 | epoch) */
    let i_crtime = extra(18, 0x90).map(|v| v as i32); /* File Creation time */
    let i_crtime_extra = extra(22, 0x94); /* extra FileCreationtime (nsec << 2 | epoch) */

    let extracted_type = FileType::from_mode(i_mode).ok_or_else(|| {
        unsupported_feature(format!("unexpected file type in mode: {:b}", i_mode))
    })?;

    let flags = InodeFlags::from_bits(i_flags)
        .ok_or_else(|| parse_error(format!("unrecognised inode flags: {:b}", i_flags)))?;

    let stat = Stat {
        extracted_type,
        file_mode: i_mode & 0b111_111_111_111,
        uid: u32::from(i_uid) | (u32::from(l_i_uid_high) << 16),
        gid: u32::from(i_gid) | (u32::from(l_i_gid_high) << 16),
        size: u64::from(i_size_lo) | (u64::from(i_size_high) << 32),
        atime: Time::from_extra(i_atime, i_atime_extra),
        ctime: Time::from_extra(i_ctime, i_ctime_extra),
        mtime: Time::from_extra(i_mtime, i_mtime_extra),
        btime: i_crtime.map(|epoch_secs| Time::from_extra(epoch_secs, i_crtime_extra)),
        link_count: i_links_count,
    };

    Ok(ParsedInode { stat, flags, core })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_superblock() -> Vec<u8> {
        let mut sb = vec![0u8; SUPERBLOCK_LEN];
        sb[0x00..0x04].copy_from_slice(&8192u32.to_le_bytes()); /* s_inodes_count */
        sb[0x18..0x1c].copy_from_slice(&0u32.to_le_bytes()); /* s_log_block_size */
        sb[0x28..0x2c].copy_from_slice(&8192u32.to_le_bytes()); /* s_inodes_per_group */
        sb[0x38..0x3a].copy_from_slice(&0xEF53u16.to_le_bytes()); /* s_magic */
        sb[0x4c..0x50].copy_from_slice(&1u32.to_le_bytes()); /* s_rev_level */
        sb[0x58..0x5a].copy_from_slice(&128u16.to_le_bytes()); /* s_inode_size */
        sb[0x60..0x64].copy_from_slice(&0x42u32.to_le_bytes()); /* FILETYPE | EXTENTS */
        sb
    }

    #[test]
    fn derives_constants() {
        let parsed = layout(&minimal_superblock()).unwrap();
        assert_eq!(1024, parsed.block_size);
        assert_eq!(1, parsed.group_count);
        assert_eq!(32, parsed.desc_stride);
        assert!(!parsed.long_structs);
        assert_eq!(2048, parsed.descriptor_table_offset);
    }

    #[test]
    fn group_count_rounds_up() {
        let mut sb = minimal_superblock();
        sb[0x00..0x04].copy_from_slice(&8193u32.to_le_bytes());
        assert_eq!(2, layout(&sb).unwrap().group_count);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut sb = minimal_superblock();
        sb[0x38] = 0x12;
        let err = layout(&sb).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn rejects_wrong_record_size() {
        let sb = vec![0u8; 512];
        assert!(layout(&sb).is_err());
    }

    #[test]
    fn rejects_desc_size_outside_long_mode() {
        let mut sb = minimal_superblock();
        sb[0xfe..0x100].copy_from_slice(&64u16.to_le_bytes());
        assert!(layout(&sb).is_err());
    }

    #[test]
    fn larger_blocks_move_the_descriptor_table() {
        let mut sb = minimal_superblock();
        sb[0x18..0x1c].copy_from_slice(&2u32.to_le_bytes()); /* 4096 */
        let parsed = layout(&sb).unwrap();
        assert_eq!(4096, parsed.block_size);
        assert_eq!(4096, parsed.descriptor_table_offset);
    }

    #[test]
    fn decodes_base_inode_record() {
        let mut raw = vec![0u8; 128];
        raw[0x00..0x02].copy_from_slice(&0x81A4u16.to_le_bytes()); /* regular, 0644 */
        raw[0x02..0x04].copy_from_slice(&1000u16.to_le_bytes());
        raw[0x04..0x08].copy_from_slice(&5u32.to_le_bytes());
        raw[0x18..0x1a].copy_from_slice(&1000u16.to_le_bytes());
        raw[0x1a..0x1c].copy_from_slice(&1u16.to_le_bytes());
        raw[0x20..0x24].copy_from_slice(&0x0008_0000u32.to_le_bytes()); /* EXTENTS */
        raw[0x28] = 0xAB; /* first core byte */

        let parsed = inode(&raw).unwrap();
        assert_eq!(FileType::RegularFile, parsed.stat.extracted_type);
        assert_eq!(0o644, parsed.stat.file_mode);
        assert_eq!(1000, parsed.stat.uid);
        assert_eq!(5, parsed.stat.size);
        assert_eq!(1, parsed.stat.link_count);
        assert!(parsed.flags.contains(InodeFlags::EXTENTS));
        assert_eq!(0xAB, parsed.core[0]);
        assert_eq!(None, parsed.stat.mtime.nanos);
    }

    #[test]
    fn unknown_mode_type_is_unsupported() {
        let mut raw = vec![0u8; 128];
        raw[0x01] = 0xF0; /* type nibble 0xF */
        assert!(inode(&raw).is_err());
    }
}
