//! Synthetic on-disk fixtures shared by unit tests (§8's scenarios).
//!
//! The pack this crate was distilled from ships no binary disk image, so
//! every test builds its own minimal, checksummed container in memory
//! instead of depending on an external fixture file.

use crate::block_device::{BlockDevice, MemBlockDevice};
use crate::checkpoint::CHECKPOINT_MAP_LAST;
use crate::object::{ObjectHeader, OBJECT_TYPE_CHECKPOINT_MAP, OBJECT_TYPE_NX_SUPERBLOCK, OBJ_PHYSICAL};
use crate::superblock::{NxSuperblock, NX_MAGIC};

/// A default, not-on-disk `NxSuperblock` for tests that only need to
/// exercise pure functions over its fields (no parsing involved).
pub fn sample_nxsb() -> NxSuperblock {
    NxSuperblock {
        header: ObjectHeader {
            checksum: 0,
            oid: 1,
            xid: 1,
            type_and_flags: OBJ_PHYSICAL | OBJECT_TYPE_NX_SUPERBLOCK,
            subtype: 0,
        },
        magic: NX_MAGIC,
        block_size: 4096,
        block_count: 64,
        features: 0,
        readonly_compatible_features: 0,
        incompatible_features: 0,
        uuid: [0u8; 16],
        next_oid: 2000,
        next_xid: 2,
        xp_desc_blocks: 4,
        xp_data_blocks: 4,
        xp_desc_base: 1,
        xp_data_base: 5,
        xp_desc_next: 0,
        xp_data_next: 0,
        xp_desc_index: 0,
        xp_desc_len: 4,
        xp_data_index: 0,
        xp_data_len: 4,
        spaceman_oid: 1024,
        omap_oid: 64,
        reaper_oid: 1025,
        max_file_systems: 100,
        fs_oids: Vec::new(),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_nxsb_block(
    block_size: u32,
    xid: u64,
    spaceman_oid: u64,
    omap_oid: u64,
    reaper_oid: u64,
    xp_desc_base: u64,
    xp_desc_blocks: u32,
    xp_data_base: u64,
    xp_data_blocks: u32,
    next_oid: u64,
    next_xid: u64,
    block_count: u64,
    fs_oids: &[u64],
) -> Vec<u8> {
    let mut block = vec![0u8; block_size as usize];
    let mut pos = ObjectHeader::SIZE;

    macro_rules! put_u32 {
        ($v:expr) => {
            block[pos..pos + 4].copy_from_slice(&($v as u32).to_le_bytes());
            pos += 4;
        };
    }
    macro_rules! put_u64 {
        ($v:expr) => {
            block[pos..pos + 8].copy_from_slice(&($v as u64).to_le_bytes());
            pos += 8;
        };
    }

    put_u32!(NX_MAGIC);
    put_u32!(block_size);
    put_u64!(block_count);
    put_u64!(0u64); // features
    put_u64!(0u64); // readonly_compatible_features
    put_u64!(0u64); // incompatible_features
    pos += 16; // uuid
    put_u64!(next_oid);
    put_u64!(next_xid);
    put_u32!(xp_desc_blocks);
    put_u32!(xp_data_blocks);
    put_u64!(xp_desc_base);
    put_u64!(xp_data_base);
    put_u32!(0u32); // xp_desc_next
    put_u32!(0u32); // xp_data_next
    put_u32!(0u32); // xp_desc_index
    put_u32!(xp_desc_blocks); // xp_desc_len
    put_u32!(0u32); // xp_data_index
    put_u32!(xp_data_blocks); // xp_data_len
    put_u64!(spaceman_oid);
    put_u64!(omap_oid);
    put_u64!(reaper_oid);
    put_u32!(0u32); // test_type
    put_u32!(crate::superblock::NX_MAX_FILE_SYSTEMS as u32); // max_file_systems
    for oid in fs_oids {
        put_u64!(*oid);
    }

    let header = ObjectHeader {
        checksum: 0,
        oid: 1,
        xid,
        type_and_flags: OBJ_PHYSICAL | OBJECT_TYPE_NX_SUPERBLOCK,
        subtype: 0,
    };
    block[0..ObjectHeader::SIZE].copy_from_slice(&header.serialize());
    crate::fletcher::embed_checksum(&mut block).unwrap();
    block
}

struct MapEntrySpec {
    obj_type: u32,
    oid: u64,
    paddr: u64,
    size: u32,
}

fn build_checkpoint_map_block(block_size: u32, entries: &[MapEntrySpec], last: bool) -> Vec<u8> {
    let mut block = vec![0u8; block_size as usize];
    let mut pos = ObjectHeader::SIZE;

    let flags: u32 = if last { CHECKPOINT_MAP_LAST } else { 0 };
    block[pos..pos + 4].copy_from_slice(&flags.to_le_bytes());
    pos += 4;
    block[pos..pos + 4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    pos += 4;

    for entry in entries {
        block[pos..pos + 4].copy_from_slice(&entry.obj_type.to_le_bytes());
        pos += 4;
        block[pos..pos + 4].copy_from_slice(&0u32.to_le_bytes()); // obj_subtype
        pos += 4;
        block[pos..pos + 4].copy_from_slice(&entry.size.to_le_bytes());
        pos += 4;
        block[pos..pos + 4].copy_from_slice(&0u32.to_le_bytes()); // pad
        pos += 4;
        block[pos..pos + 8].copy_from_slice(&0u64.to_le_bytes()); // fs_oid
        pos += 8;
        block[pos..pos + 8].copy_from_slice(&entry.oid.to_le_bytes());
        pos += 8;
        block[pos..pos + 8].copy_from_slice(&entry.paddr.to_le_bytes());
        pos += 8;
    }

    let header = ObjectHeader {
        checksum: 0,
        oid: 0,
        xid: 2,
        type_and_flags: OBJ_PHYSICAL | OBJECT_TYPE_CHECKPOINT_MAP,
        subtype: 0,
    };
    block[0..ObjectHeader::SIZE].copy_from_slice(&header.serialize());
    crate::fletcher::embed_checksum(&mut block).unwrap();
    block
}

/// Build the minimal bootable image from §8 scenario S1: 4 KiB blocks, a
/// 4-block contiguous descriptor ring at block 1 holding two superblock
/// copies (xid 1, then xid 2) plus a terminal checkpoint-mapping block, and
/// a 4-block data ring at block 5 holding the ephemeral space-manager and
/// reaper payloads the xid-2 checkpoint references.
pub fn build_minimal_container() -> MemBlockDevice {
    const BLOCK_SIZE: u32 = 4096;
    const BLOCK_COUNT: u64 = 16;
    const SPACEMAN_OID: u64 = 1024;
    const OMAP_OID: u64 = 64;
    const REAPER_OID: u64 = 1025;

    let mut dev = MemBlockDevice::new(BLOCK_SIZE, BLOCK_COUNT);

    // Block 0: the "resident" superblock copy at xid 1, read directly by
    // `superblock::read_nxsb` before any checkpoint scan happens.
    let sb0 = build_nxsb_block(
        BLOCK_SIZE, 1, SPACEMAN_OID, OMAP_OID, REAPER_OID, 1, 4, 5, 4, 2000, 2, BLOCK_COUNT, &[],
    );
    dev.write_block(0, &sb0).unwrap();

    // Descriptor ring: blocks 1..5 (indices 0..4 relative to xp_desc_base).
    // The checkpoint-mapping chain for a transaction must sit immediately
    // before that transaction's superblock in the ring, since the scanner
    // walks backward from a candidate superblock collecting map blocks.
    let ring_sb_xid1 = build_nxsb_block(
        BLOCK_SIZE, 1, SPACEMAN_OID, OMAP_OID, REAPER_OID, 1, 4, 5, 4, 2000, 2, BLOCK_COUNT, &[],
    );
    dev.write_block(1, &ring_sb_xid1).unwrap(); // index 0

    let map_block = build_checkpoint_map_block(
        BLOCK_SIZE,
        &[
            MapEntrySpec { obj_type: 0, oid: SPACEMAN_OID, paddr: 5, size: BLOCK_SIZE },
            MapEntrySpec { obj_type: 0, oid: REAPER_OID, paddr: 6, size: BLOCK_SIZE },
        ],
        true,
    );
    dev.write_block(2, &map_block).unwrap(); // index 1

    let ring_sb_xid2 = build_nxsb_block(
        BLOCK_SIZE, 2, SPACEMAN_OID, OMAP_OID, REAPER_OID, 1, 4, 5, 4, 2000, 3, BLOCK_COUNT, &[],
    );
    dev.write_block(3, &ring_sb_xid2).unwrap(); // index 2
    // Block 4 (index 3) stays zeroed: unused ring slot.

    // Data ring: blocks 5..9 hold the ephemeral objects the mapping chain
    // names. Their contents don't need to parse as anything in particular
    // for the checkpoint scanner itself, only to be readable and present.
    let mut spaceman_block = vec![0u8; BLOCK_SIZE as usize];
    spaceman_block[0] = 0xAA; // distinguishing marker for assertions
    dev.write_block(5, &spaceman_block).unwrap();

    let mut reaper_block = vec![0u8; BLOCK_SIZE as usize];
    reaper_block[0] = 0xBB;
    dev.write_block(6, &reaper_block).unwrap();

    dev
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_superblock_reads_back() {
        let mut dev = build_minimal_container();
        let sb = crate::superblock::read_nxsb(&mut dev).unwrap();
        assert_eq!(sb.magic, NX_MAGIC);
        assert_eq!(sb.header.xid, 1);
        assert_eq!(sb.spaceman_oid, 1024);
    }
}
