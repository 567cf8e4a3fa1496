use std::cmp::min;
use std::convert::TryFrom;
use std::io;

use anyhow::ensure;
use anyhow::Error;
use log::trace;
use positioned_io::ReadAt;

use crate::assumption_failed;
use crate::read_le16;
use crate::read_le32;
use crate::INODE_CORE_SIZE;

const EXTENT_MAGIC: u16 = 0xF30A;
const NODE_HEADER_LEN: usize = 12;
const NODE_ENTRY_LEN: usize = 12;

/// A healthy tree is at most a handful of levels deep; anything past this
/// is treated as corruption rather than recursed into.
const MAX_TREE_DEPTH: u16 = 8;

/// A contiguous run of physical blocks mapped to a contiguous run of
/// logical blocks.
#[derive(Debug, PartialEq)]
struct Extent {
    /// First logical block this extent covers.
    block: u32,
    /// First physical block backing it.
    start: u64,
    /// Length in blocks.
    len: u16,
}

/// Streams an inode's logical byte stream off its extent tree: extents are
/// loaded eagerly at construction, data blocks are read lazily. Logical
/// ranges no extent covers (holes) read as zeros.
#[derive(Debug)]
pub struct TreeReader<R> {
    inner: R,
    block_size: u32,
    len: u64,
    pos: u64,
    extents: Vec<Extent>,
}

impl<R> TreeReader<R>
where
    R: ReadAt,
{
    pub fn new(
        inner: R,
        block_size: u32,
        size: u64,
        core: [u8; INODE_CORE_SIZE],
    ) -> Result<TreeReader<R>, Error> {
        let extents = load_extent_tree(&inner, &core, block_size)?;
        Ok(TreeReader::create(inner, block_size, size, extents))
    }

    fn create(inner: R, block_size: u32, size: u64, extents: Vec<Extent>) -> TreeReader<R> {
        TreeReader {
            inner,
            block_size,
            len: size,
            pos: 0,
            extents,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> io::Read for TreeReader<R>
where
    R: ReadAt,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }

        let block_size = u64::from(self.block_size);
        let want = min(buf.len() as u64, self.len - self.pos);

        // extents are sorted by logical block; either some extent contains
        // pos, or the bytes up to the next extent (or EOF) are a hole
        let mut data_resumes_at = self.len;
        for extent in &self.extents {
            let first_byte = u64::from(extent.block) * block_size;
            let last_byte = first_byte + u64::from(extent.len) * block_size;
            if self.pos >= last_byte {
                continue;
            }
            if self.pos < first_byte {
                data_resumes_at = first_byte;
                break;
            }

            let available = min(want, last_byte - self.pos);
            let physical = extent.start * block_size + (self.pos - first_byte);
            let read = self.inner.read_at(physical, &mut buf[..available as usize])?;
            if 0 == read {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("backing image ends inside an extent at {:#x}", physical),
                ));
            }
            self.pos += read as u64;
            return Ok(read);
        }

        // feed them the hole
        // bounded by buf.len(), so the cast is lossless
        let zeros = min(want, data_resumes_at - self.pos) as usize;
        for byte in &mut buf[..zeros] {
            *byte = 0;
        }
        self.pos += zeros as u64;
        Ok(zeros)
    }
}

/// Recursively flatten an extent tree into its leaf extents, starting from
/// the root node in the inode's inline area.
fn load_extent_tree<R>(inner: &R, root: &[u8], block_size: u32) -> Result<Vec<Extent>, Error>
where
    R: ReadAt,
{
    let root_depth = node_depth(root)?;
    ensure!(
        root_depth <= MAX_TREE_DEPTH,
        assumption_failed(format!(
            "extent tree depth {} exceeds the sane bound of {}",
            root_depth, MAX_TREE_DEPTH
        ))
    );

    let mut extents = Vec::with_capacity(4 + usize::from(root_depth) * 200);
    add_found_extents(inner, root, block_size, root_depth, &mut extents)?;

    extents.sort_by_key(|extent| extent.block);

    Ok(extents)
}

fn node_depth(node: &[u8]) -> Result<u16, Error> {
    ensure!(
        node.len() >= NODE_HEADER_LEN,
        assumption_failed("extent node is shorter than its header")
    );
    let eh_magic = read_le16(node);
    ensure!(
        EXTENT_MAGIC == eh_magic,
        assumption_failed(format!(
            "invalid extent node magic: {:04x}, expected {:04x}",
            eh_magic, EXTENT_MAGIC
        ))
    );
    Ok(read_le16(&node[6..]))
}

fn add_found_extents<R>(
    inner: &R,
    node: &[u8],
    block_size: u32,
    expected_depth: u16,
    extents: &mut Vec<Extent>,
) -> Result<(), Error>
where
    R: ReadAt,
{
    let depth = node_depth(node)?;
    // the on-disk depth must shrink by one per level, which also bounds
    // the recursion; a cycle through a corrupt image can't satisfy this
    ensure!(
        depth == expected_depth,
        assumption_failed(format!(
            "extent node depth {} does not match its position in the tree ({})",
            depth, expected_depth
        ))
    );

    let entries = usize::from(read_le16(&node[2..]));
    // 4..6: max entry capacity; not useful during read
    // 8..12: generation; not used in standard ext4
    ensure!(
        node.len() >= NODE_HEADER_LEN + entries * NODE_ENTRY_LEN,
        assumption_failed(format!(
            "extent node claims {} entries but is only {} bytes",
            entries,
            node.len()
        ))
    );

    if 0 == depth {
        for en in 0..entries {
            let raw = &node[NODE_HEADER_LEN + en * NODE_ENTRY_LEN..];
            let ee_block = read_le32(raw);
            let ee_len = read_le16(&raw[4..]);
            let ee_start_hi = read_le16(&raw[6..]);
            let ee_start_lo = read_le32(&raw[8..]);

            let start = u64::from(ee_start_lo) | (u64::from(ee_start_hi) << 32);

            // a 48-bit block number times a 64KiB block can wrap u64;
            // reject it here so the read path can multiply freely
            ensure!(
                start
                    .checked_add(u64::from(ee_len))
                    .and_then(|end| end.checked_mul(u64::from(block_size)))
                    .is_some(),
                assumption_failed(format!(
                    "extent at logical block {} points past the addressable image",
                    ee_block
                ))
            );

            extents.push(Extent {
                block: ee_block,
                start,
                len: ee_len,
            });
        }

        return Ok(());
    }

    for en in 0..entries {
        let raw = &node[NODE_HEADER_LEN + en * NODE_ENTRY_LEN..];
        // 0..4: ei_block, the first logical block the child covers; the
        // leaves repeat this information so it isn't needed here
        let ei_leaf_lo = read_le32(&raw[4..]);
        let ei_leaf_hi = read_le16(&raw[8..]);
        let child_block = u64::from(ei_leaf_lo) | (u64::from(ei_leaf_hi) << 32);

        trace!("descending into extent node at block {}", child_block);

        let child_offset = child_block
            .checked_mul(u64::from(block_size))
            .ok_or_else(|| {
                assumption_failed(format!(
                    "extent node pointer {} is past the addressable image",
                    child_block
                ))
            })?;
        let mut child = vec![0u8; usize::try_from(block_size)?];
        inner.read_exact_at(child_offset, &mut child)?;
        add_found_extents(inner, &child, block_size, depth - 1, extents)?;
    }

    Ok(())
}
