//! Checkpoint scanner (C4).
//!
//! A checkpoint is a self-consistent snapshot of container state: a
//! container superblock plus the ephemeral-object images referenced by its
//! checkpoint-mapping blocks. This module locates the latest checkpoint
//! whose superblock and mapping blocks all validate, and builds the
//! in-memory ephemeral-object table for it.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::Cursor;

use crate::block_device::BlockDevice;
use crate::error::{ApfsError, Result};
use crate::fletcher;
use crate::object::{ObjectHeader, OBJECT_TYPE_CHECKPOINT_MAP, OBJECT_TYPE_NX_SUPERBLOCK};
use crate::superblock::{NxSuperblock, NX_MAGIC};

/// High bit of `xp_desc_blocks` / `xp_data_blocks` marks a tree-referenced
/// (non-contiguous) ring. Only contiguous rings are supported by this core.
const NON_CONTIGUOUS_FLAG: u32 = 0x8000_0000;
const BLOCKS_MASK: u32 = 0x7FFF_FFFF;

pub const CHECKPOINT_MAP_LAST: u32 = 0x0000_0001;

/// One entry in a checkpoint-mapping block: an ephemeral object written
/// during this transaction, addressed directly by its physical block.
#[derive(Debug, Clone)]
pub struct CheckpointMapEntry {
    pub obj_type: u32,
    pub obj_subtype: u32,
    pub size: u32,
    pub fs_oid: u64,
    pub oid: u64,
    pub paddr: u64,
}

struct CheckpointMapBlock {
    flags: u32,
    entries: Vec<CheckpointMapEntry>,
}

impl CheckpointMapBlock {
    fn parse(block: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(&block[ObjectHeader::SIZE..]);
        let flags = cursor.read_u32::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()?;

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let obj_type = cursor.read_u32::<LittleEndian>()?;
            let obj_subtype = cursor.read_u32::<LittleEndian>()?;
            let size = cursor.read_u32::<LittleEndian>()?;
            let _pad = cursor.read_u32::<LittleEndian>()?;
            let fs_oid = cursor.read_u64::<LittleEndian>()?;
            let oid = cursor.read_u64::<LittleEndian>()?;
            let paddr = cursor.read_u64::<LittleEndian>()?;
            entries.push(CheckpointMapEntry {
                obj_type,
                obj_subtype,
                size,
                fs_oid,
                oid,
                paddr,
            });
        }

        Ok(CheckpointMapBlock { flags, entries })
    }

    fn is_last(&self) -> bool {
        self.flags & CHECKPOINT_MAP_LAST != 0
    }
}

/// Ephemeral objects loaded for a mounted checkpoint, keyed by OID (§3.2,
/// §4.4 step 4). Readers look these up rather than resolving through the
/// OMAP, since ephemeral objects live only in the checkpoint data area.
#[derive(Debug, Clone, Default)]
pub struct EphemeralTable {
    objects: HashMap<u64, Vec<u8>>,
}

impl EphemeralTable {
    pub fn get(&self, oid: u64) -> Option<&[u8]> {
        self.objects.get(&oid).map(|v| v.as_slice())
    }

    pub fn contains(&self, oid: u64) -> bool {
        self.objects.contains_key(&oid)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

fn check_contiguous(xp_desc_blocks: u32, xp_data_blocks: u32) -> Result<(u32, u32)> {
    if xp_desc_blocks & NON_CONTIGUOUS_FLAG != 0 || xp_data_blocks & NON_CONTIGUOUS_FLAG != 0 {
        return Err(ApfsError::UnsupportedNonContiguousRing);
    }
    Ok((xp_desc_blocks & BLOCKS_MASK, xp_data_blocks & BLOCKS_MASK))
}

/// Locate the latest valid container superblock in the checkpoint
/// descriptor ring (CP-1) and build the ephemeral table for it.
///
/// `sb0` is the superblock read directly from block 0; it gives the ring
/// geometry used to scan for newer candidates.
pub fn locate_latest_checkpoint(
    dev: &mut dyn BlockDevice,
    sb0: &NxSuperblock,
) -> Result<(NxSuperblock, EphemeralTable)> {
    let (desc_blocks, data_blocks) =
        check_contiguous(sb0.xp_desc_blocks, sb0.xp_data_blocks)?;

    let mut candidates: Vec<(NxSuperblock, u64)> = Vec::new(); // (sb, descriptor ring index)
    let mut map_blocks: HashMap<u64, CheckpointMapBlock> = HashMap::new();

    for i in 0..desc_blocks as u64 {
        let paddr = sb0.xp_desc_base + i;
        let block = match dev.read_block(paddr) {
            Ok(b) => b,
            Err(_) => continue,
        };
        if !fletcher::verify_object(&block).unwrap_or(false) {
            continue;
        }
        let header = match ObjectHeader::parse(&block) {
            Ok(h) => h,
            Err(_) => continue,
        };

        match header.object_type() {
            t if t == OBJECT_TYPE_NX_SUPERBLOCK => {
                let sb = match NxSuperblock::parse(&block) {
                    Ok(sb) => sb,
                    Err(_) => continue,
                };
                if sb.magic != NX_MAGIC {
                    continue;
                }
                if sb.xp_desc_base != sb0.xp_desc_base {
                    continue;
                }
                candidates.push((sb, i));
            }
            t if t == OBJECT_TYPE_CHECKPOINT_MAP => {
                if let Ok(map) = CheckpointMapBlock::parse(&block) {
                    map_blocks.insert(i, map);
                }
            }
            _ => {}
        }
    }

    candidates.sort_by_key(|(sb, _)| sb.header.xid);

    // Walk candidates from highest xid down, accepting the first one whose
    // immediately-preceding contiguous run of mapping blocks (terminated by
    // CHECKPOINT_MAP_LAST) is fully present and parses.
    while let Some((sb, idx)) = candidates.pop() {
        if let Some(entries) = collect_mapping_chain(&map_blocks, idx, desc_blocks) {
            let mut table = EphemeralTable::default();
            let mut ok = true;
            for entry in &entries {
                match read_ephemeral(dev, entry, data_blocks, sb0.xp_data_base) {
                    Ok(data) => {
                        table.objects.insert(entry.oid, data);
                    }
                    Err(_) => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                return Ok((sb, table));
            }
        }
    }

    Err(ApfsError::NoValidCheckpoint)
}

/// Walk backward from the superblock's descriptor-ring slot collecting
/// mapping blocks until one flagged `CHECKPOINT_MAP_LAST` is found.
fn collect_mapping_chain(
    map_blocks: &HashMap<u64, CheckpointMapBlock>,
    sb_index: u64,
    desc_blocks: u32,
) -> Option<Vec<CheckpointMapEntry>> {
    let mut entries = Vec::new();
    let mut i = sb_index;
    loop {
        if i == 0 {
            return None;
        }
        i -= 1;
        let map = map_blocks.get(&i)?;
        entries.extend(map.entries.iter().cloned());
        if map.is_last() {
            return Some(entries);
        }
        if entries.len() as u32 > desc_blocks {
            return None; // runaway chain, something is malformed
        }
    }
}

fn read_ephemeral(
    dev: &mut dyn BlockDevice,
    entry: &CheckpointMapEntry,
    _data_blocks: u32,
    _data_base: u64,
) -> Result<Vec<u8>> {
    // cpm_paddr addresses the ephemeral object's first block directly within
    // the checkpoint data ring. Ephemeral objects that span multiple blocks
    // are read as `size` bytes starting there.
    let block_size = dev.block_size() as usize;
    let blocks_needed = entry.size.max(block_size as u32) as usize / block_size
        + usize::from(entry.size as usize % block_size != 0);
    let blocks_needed = blocks_needed.max(1);

    let mut data = Vec::with_capacity(blocks_needed * block_size);
    for b in 0..blocks_needed as u64 {
        data.extend_from_slice(&dev.read_block(entry.paddr + b)?);
    }
    data.truncate(entry.size.max(block_size as u32) as usize);
    Ok(data)
}
