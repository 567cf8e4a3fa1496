use std::convert::TryFrom;

use anyhow::ensure;
use anyhow::Error;
use log::trace;

use crate::assumption_failed;
use crate::not_found;
use crate::parse::Layout;
use crate::read_le32;

#[derive(Debug)]
struct Entry {
    inode_table_block: u64,
}

/// The decoded group descriptor table, plus the layout constants every
/// downstream offset computation needs.
#[derive(Debug)]
pub struct BlockGroups {
    groups: Vec<Entry>,
    inodes_count: u32,
    inodes_per_group: u32,
    pub block_size: u32,
    pub inode_size: u16,
}

impl BlockGroups {
    /// Decode the raw descriptor table. Each record occupies exactly
    /// `desc_stride` bytes on disc; the high halves of block numbers are
    /// only interpreted in long (64-bit) mode, and only when the stride
    /// actually covers them.
    pub fn new(table: &[u8], layout: &Layout) -> Result<BlockGroups, Error> {
        let stride = usize::from(layout.desc_stride);
        let group_count = usize::try_from(layout.group_count)?;
        ensure!(
            table.len() == stride * group_count,
            assumption_failed(format!(
                "descriptor table is {} bytes, expected {} groups of {}",
                table.len(),
                group_count,
                stride
            ))
        );

        let mut groups = Vec::with_capacity(group_count);

        for (number, raw) in table.chunks(stride).enumerate() {
            let bg_inode_table_lo = read_le32(&raw[0x08..]); /* Inodes table block */
            let bg_inode_table_hi = if layout.long_structs && stride >= 0x2c {
                read_le32(&raw[0x28..]) /* Inodes table block MSB */
            } else {
                0
            };

            let inode_table_block =
                u64::from(bg_inode_table_lo) | (u64::from(bg_inode_table_hi) << 32);

            trace!("group {}: inode table at block {}", number, inode_table_block);

            groups.push(Entry { inode_table_block });
        }

        Ok(BlockGroups {
            groups,
            inodes_count: layout.inodes_count,
            inodes_per_group: layout.inodes_per_group,
            block_size: layout.block_size,
            inode_size: layout.inode_size,
        })
    }

    /// Byte offset of an inode record in the backing image.
    pub fn index_of(&self, inode: u32) -> Result<u64, Error> {
        ensure!(0 != inode, not_found("there is no inode zero"));
        ensure!(
            inode <= self.inodes_count,
            assumption_failed(format!(
                "inode <{}> is beyond the {} inodes on disc",
                inode, self.inodes_count
            ))
        );

        let inode = inode - 1;
        let group_number = inode / self.inodes_per_group;
        let group = &self.groups[usize::try_from(group_number)?];
        let inode_index_in_group = inode % self.inodes_per_group;

        Ok(group.inode_table_block * u64::from(self.block_size)
            + u64::from(inode_index_in_group) * u64::from(self.inode_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(long_structs: bool, desc_stride: u16, group_count: u32) -> Layout {
        Layout {
            inodes_count: 16384,
            inodes_per_group: 8192,
            block_size: 1024,
            inode_size: 256,
            desc_stride,
            long_structs,
            descriptor_table_offset: 2048,
            group_count,
        }
    }

    fn descriptor(stride: usize, lo: u32, hi: u32) -> Vec<u8> {
        let mut raw = vec![0u8; stride];
        raw[0x08..0x0c].copy_from_slice(&lo.to_le_bytes());
        if stride >= 0x2c {
            raw[0x28..0x2c].copy_from_slice(&hi.to_le_bytes());
        }
        raw
    }

    #[test]
    fn offset_arithmetic() {
        let mut table = descriptor(32, 5, 0);
        table.extend(descriptor(32, 9, 0));
        let groups = BlockGroups::new(&table, &layout(false, 32, 2)).unwrap();

        // inode 1 is the first record of group 0's table
        assert_eq!(5 * 1024, groups.index_of(1).unwrap());
        assert_eq!(5 * 1024 + 11 * 256, groups.index_of(12).unwrap());
        // inode 8193 is the first record of group 1's table
        assert_eq!(9 * 1024, groups.index_of(8193).unwrap());
    }

    #[test]
    fn long_mode_combines_high_halves() {
        let table = descriptor(64, 5, 1);
        let groups = BlockGroups::new(&table, &layout(true, 64, 1)).unwrap();
        assert_eq!((1u64 << 32 | 5) * 1024, groups.index_of(1).unwrap());
    }

    #[test]
    fn short_mode_never_reads_high_halves() {
        // stride is 32, so the next record starts where the high halves
        // would be; filling it with junk must not disturb group 0
        let mut table = descriptor(32, 5, 0);
        table.extend(vec![0xAAu8; 32]);
        let groups = BlockGroups::new(&table, &layout(false, 32, 2)).unwrap();
        assert_eq!(5 * 1024, groups.index_of(1).unwrap());
    }

    #[test]
    fn inode_zero_is_not_found() {
        let table = descriptor(32, 5, 0);
        let mut l = layout(false, 32, 1);
        l.inodes_count = 8192;
        let groups = BlockGroups::new(&table, &l).unwrap();
        let err = groups.index_of(0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::ParseError>(),
            Some(crate::ParseError::NotFound { .. })
        ));
    }

    #[test]
    fn out_of_range_inode_is_rejected() {
        let table = descriptor(32, 5, 0);
        let mut l = layout(false, 32, 1);
        l.inodes_count = 8192;
        let groups = BlockGroups::new(&table, &l).unwrap();
        assert!(groups.index_of(8193).is_err());
    }
}
