//! Space manager (C5): the container's block allocator.
//!
//! APFS never overwrites live data in place; every write goes to a freshly
//! allocated block. The space manager tracks which physical blocks are free
//! across up to two devices (the main device and an optional tier2/Fusion
//! device) using a two-level index of chunk bitmaps, plus an internal pool
//! used for the space manager's own bookkeeping blocks, plus three
//! free-space queues that log pending frees for crash consistency (§4.5).
//!
//! This module is not adapted from a teacher file — the retrieved reference
//! crate is a read-only parser with no allocator of its own — so its shape
//! follows the same bitmap/index pattern the rest of the pack's filesystem
//! crates use for free-space tracking, parameterized to the container
//! layout described by the on-disk `SpacemanPhys` structure.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::block_device::BlockDevice;
use crate::btree::{self, BlockAllocator, PhysicalResolver};
use crate::checkpoint::EphemeralTable;
use crate::comparators::{free_queue_key_bytes, FreeQueueComparator};
use crate::error::{ApfsError, Result};
use crate::object::ObjectHeader;

/// Index into `SpacemanPhys::free_queues` / `dev` arrays (§4.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeQueueKind {
    InternalPool,
    Main,
    Tier2,
}

const FREE_QUEUE_COUNT: usize = 3;

/// One chunk's worth of allocation state, backed by a bitmap block.
#[derive(Debug, Clone)]
struct ChunkInfo {
    xid: u64,
    block_count: u32,
    free_count: u32,
    bitmap_addr: u64,
}

impl ChunkInfo {
    const SIZE: usize = 24;

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::MalformedObject("chunk info entry too short".into()));
        }
        let mut c = Cursor::new(data);
        Ok(ChunkInfo {
            xid: c.read_u64::<LittleEndian>()?,
            block_count: c.read_u32::<LittleEndian>()?,
            free_count: c.read_u32::<LittleEndian>()?,
            bitmap_addr: c.read_u64::<LittleEndian>()?,
        })
    }

    fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.xid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.free_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.bitmap_addr.to_le_bytes());
        buf
    }
}

/// A chunk-info block (CIB): a packed array of [`ChunkInfo`] entries
/// covering one contiguous run of the address space.
struct ChunkInfoBlock {
    header: ObjectHeader,
    chunk_info_count: u32,
    chunks: Vec<ChunkInfo>,
    chunk_start_index: u32,
}

const CIB_HEADER_SIZE: usize = 16; // index, count, pad, pad

impl ChunkInfoBlock {
    fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let body = &block[ObjectHeader::SIZE..];
        let mut c = Cursor::new(body);
        let chunk_start_index = c.read_u32::<LittleEndian>()?;
        let chunk_info_count = c.read_u32::<LittleEndian>()?;
        let _pad = c.read_u64::<LittleEndian>()?;

        let mut chunks = Vec::with_capacity(chunk_info_count as usize);
        let entries_off = ObjectHeader::SIZE + CIB_HEADER_SIZE;
        for i in 0..chunk_info_count as usize {
            let off = entries_off + i * ChunkInfo::SIZE;
            chunks.push(ChunkInfo::parse(&block[off..off + ChunkInfo::SIZE])?);
        }

        Ok(ChunkInfoBlock {
            header,
            chunk_info_count,
            chunks,
            chunk_start_index,
        })
    }

    fn serialize(&self, block_size: u32, oid: u64, xid: u64) -> Result<Vec<u8>> {
        let mut block = vec![0u8; block_size as usize];
        let entries_off = ObjectHeader::SIZE + CIB_HEADER_SIZE;
        block[ObjectHeader::SIZE..ObjectHeader::SIZE + 4]
            .copy_from_slice(&self.chunk_start_index.to_le_bytes());
        block[ObjectHeader::SIZE + 4..ObjectHeader::SIZE + 8]
            .copy_from_slice(&self.chunk_info_count.to_le_bytes());
        for (i, chunk) in self.chunks.iter().enumerate() {
            let off = entries_off + i * ChunkInfo::SIZE;
            block[off..off + ChunkInfo::SIZE].copy_from_slice(&chunk.serialize());
        }
        let header = ObjectHeader {
            checksum: 0,
            oid,
            xid,
            type_and_flags: self.header.type_and_flags,
            subtype: self.header.subtype,
        };
        block[0..ObjectHeader::SIZE].copy_from_slice(&header.serialize());
        crate::fletcher::embed_checksum(&mut block)?;
        Ok(block)
    }
}

/// One tracked device's allocation state (main or tier2, §4.5.2).
struct DeviceState {
    block_count: u64,
    blocks_per_chunk: u32,
    chunks_per_cib: u32,
    cib_addrs: Vec<u64>, // physical addresses of this device's CIBs, in order
    free_count: u64,
}

impl DeviceState {
    fn chunk_count(&self) -> u32 {
        ((self.block_count + self.blocks_per_chunk as u64 - 1) / self.blocks_per_chunk as u64)
            as u32
    }
}

/// Parsed `SpacemanPhys` ephemeral object (§3.4).
struct SpacemanHeader {
    block_size: u32,
    blocks_per_chunk: u32,
    chunks_per_cib: u32,
    main: DeviceDescriptor,
    tier2: Option<DeviceDescriptor>,
    free_queue_tree_oids: [u64; FREE_QUEUE_COUNT],
    free_queue_oldest_xid: [u64; FREE_QUEUE_COUNT],
    ip_bm_base: u64,
    ip_block_count: u64,
    ip_bm_size_in_blocks: u32,
}

struct DeviceDescriptor {
    block_count: u64,
    cib_addrs: Vec<u64>,
}

const SM_HEADER_FIXED_SIZE: usize = 4 + 4 + 4 + 4; // block_size, blocks_per_chunk, chunks_per_cib, pad

fn parse_spaceman_header(data: &[u8]) -> Result<SpacemanHeader> {
    // Layout (after the 32-byte object header), all little-endian:
    //   block_size: u32, blocks_per_chunk: u32, chunks_per_cib: u32, _pad: u32
    //   main_block_count: u64, main_cib_count: u32, _pad: u32
    //   main_cib_addrs: [u64; main_cib_count]
    //   has_tier2: u32, _pad: u32
    //   (if has_tier2) tier2_block_count: u64, tier2_cib_count: u32, _pad: u32, tier2_cib_addrs: [u64; tier2_cib_count]
    //   free_queue_tree_oids: [u64; 3]
    //   free_queue_oldest_xid: [u64; 3]
    //   ip_bm_base: u64, ip_block_count: u64, ip_bm_size_in_blocks: u32, _pad: u32
    let body = &data[ObjectHeader::SIZE..];
    if body.len() < SM_HEADER_FIXED_SIZE {
        return Err(ApfsError::MalformedObject("spaceman header too short".into()));
    }
    let mut c = Cursor::new(body);
    let block_size = c.read_u32::<LittleEndian>()?;
    let blocks_per_chunk = c.read_u32::<LittleEndian>()?;
    let chunks_per_cib = c.read_u32::<LittleEndian>()?;
    let _pad = c.read_u32::<LittleEndian>()?;

    let main_block_count = c.read_u64::<LittleEndian>()?;
    let main_cib_count = c.read_u32::<LittleEndian>()?;
    let _pad = c.read_u32::<LittleEndian>()?;
    let mut main_cib_addrs = Vec::with_capacity(main_cib_count as usize);
    for _ in 0..main_cib_count {
        main_cib_addrs.push(c.read_u64::<LittleEndian>()?);
    }

    let has_tier2 = c.read_u32::<LittleEndian>()?;
    let _pad = c.read_u32::<LittleEndian>()?;
    let tier2 = if has_tier2 != 0 {
        let block_count = c.read_u64::<LittleEndian>()?;
        let cib_count = c.read_u32::<LittleEndian>()?;
        let _pad = c.read_u32::<LittleEndian>()?;
        let mut cib_addrs = Vec::with_capacity(cib_count as usize);
        for _ in 0..cib_count {
            cib_addrs.push(c.read_u64::<LittleEndian>()?);
        }
        Some(DeviceDescriptor { block_count, cib_addrs })
    } else {
        None
    };

    let mut free_queue_tree_oids = [0u64; FREE_QUEUE_COUNT];
    for slot in &mut free_queue_tree_oids {
        *slot = c.read_u64::<LittleEndian>()?;
    }
    let mut free_queue_oldest_xid = [0u64; FREE_QUEUE_COUNT];
    for slot in &mut free_queue_oldest_xid {
        *slot = c.read_u64::<LittleEndian>()?;
    }

    let ip_bm_base = c.read_u64::<LittleEndian>()?;
    let ip_block_count = c.read_u64::<LittleEndian>()?;
    let ip_bm_size_in_blocks = c.read_u32::<LittleEndian>()?;
    let _pad = c.read_u32::<LittleEndian>()?;

    if blocks_per_chunk == 0 || chunks_per_cib == 0 {
        return Err(ApfsError::MalformedObject(
            "spaceman geometry fields must be non-zero".into(),
        ));
    }

    Ok(SpacemanHeader {
        block_size,
        blocks_per_chunk,
        chunks_per_cib,
        main: DeviceDescriptor {
            block_count: main_block_count,
            cib_addrs: main_cib_addrs,
        },
        tier2,
        free_queue_tree_oids,
        free_queue_oldest_xid,
        ip_bm_base,
        ip_block_count,
        ip_bm_size_in_blocks,
    })
}

/// The container's block allocator, holding loaded bitmap state for the
/// main device (and tier2, if present) and the roots of the three
/// free-space queues.
pub struct SpaceManager {
    block_size: u32,
    blocks_per_chunk: u32,
    chunks_per_cib: u32,
    main: DeviceState,
    tier2: Option<DeviceState>,
    free_queue_roots: [Option<u64>; FREE_QUEUE_COUNT],
    free_queue_oldest_xid: [u64; FREE_QUEUE_COUNT],
    ip_bm_base: u64,
    ip_block_count: u64,
}

impl SpaceManager {
    /// Load the space manager from the ephemeral table produced by the
    /// checkpoint scan (§4.4 step 4, §4.5.1).
    pub fn load(
        _dev: &mut dyn BlockDevice,
        ephemeral: &EphemeralTable,
        spaceman_oid: u64,
    ) -> Result<Self> {
        let raw = ephemeral
            .get(spaceman_oid)
            .ok_or(ApfsError::NotFound { oid: spaceman_oid, xid: 0 })?;
        let parsed = parse_spaceman_header(raw)?;

        let main = DeviceState {
            block_count: parsed.main.block_count,
            blocks_per_chunk: parsed.blocks_per_chunk,
            chunks_per_cib: parsed.chunks_per_cib,
            cib_addrs: parsed.main.cib_addrs,
            free_count: 0,
        };
        let tier2 = parsed.tier2.map(|t| DeviceState {
            block_count: t.block_count,
            blocks_per_chunk: parsed.blocks_per_chunk,
            chunks_per_cib: parsed.chunks_per_cib,
            cib_addrs: t.cib_addrs,
            free_count: 0,
        });

        let free_queue_roots = parsed.free_queue_tree_oids.map(|oid| if oid != 0 { Some(oid) } else { None });

        Ok(SpaceManager {
            block_size: parsed.block_size,
            blocks_per_chunk: parsed.blocks_per_chunk,
            chunks_per_cib: parsed.chunks_per_cib,
            main,
            tier2,
            free_queue_roots,
            free_queue_oldest_xid: parsed.free_queue_oldest_xid,
            ip_bm_base: parsed.ip_bm_base,
            ip_block_count: parsed.ip_block_count,
        })
    }

    pub fn free_queue_oldest_xid(&self, kind: FreeQueueKind) -> u64 {
        self.free_queue_oldest_xid[kind as usize]
    }

    fn device_mut(&mut self, tier2: bool) -> Option<&mut DeviceState> {
        if tier2 {
            self.tier2.as_mut()
        } else {
            Some(&mut self.main)
        }
    }

    /// Allocate a single free block on the main device (SM-1). Scans CIBs
    /// in order and returns the first free bit found.
    pub fn allocate(&mut self, dev: &mut dyn BlockDevice) -> Result<u64> {
        self.allocate_on(dev, false)
    }

    pub fn allocate_on(&mut self, dev: &mut dyn BlockDevice, tier2: bool) -> Result<u64> {
        let blocks_per_chunk = self.blocks_per_chunk;
        let chunks_per_cib = self.chunks_per_cib;
        let block_size = self.block_size;
        let device = self.device_mut(tier2).ok_or(ApfsError::NoSpace)?;

        for cib_index in 0..device.cib_addrs.len() {
            let cib_addr = device.cib_addrs[cib_index];
            let (_h, block) = crate::object::read_object(dev, cib_addr)?;
            let mut cib = ChunkInfoBlock::parse(&block)?;

            for local_idx in 0..cib.chunks.len() {
                if cib.chunks[local_idx].free_count == 0 {
                    continue;
                }
                let bitmap_addr = cib.chunks[local_idx].bitmap_addr;
                let block_count = cib.chunks[local_idx].block_count;
                let mut bitmap = dev.read_block(bitmap_addr)?;
                if let Some(bit) = find_clear_bit(&bitmap, block_count as usize) {
                    set_bit(&mut bitmap, bit, true);
                    dev.write_block(bitmap_addr, &bitmap)?;
                    cib.chunks[local_idx].free_count -= 1;
                    let xid = cib.chunks[local_idx].xid;
                    let new_cib = cib.serialize(block_size, cib_addr, xid)?;
                    dev.write_block(cib_addr, &new_cib)?;

                    let chunk_index = cib.chunk_start_index as usize + local_idx;
                    let paddr = chunk_index as u64 * blocks_per_chunk as u64 + bit as u64;
                    device.free_count = device.free_count.saturating_sub(1);
                    return Ok(paddr);
                }
            }
            let _ = chunks_per_cib;
        }

        Err(ApfsError::NoSpace)
    }

    /// Allocate `count` contiguous free blocks within a single chunk's
    /// bitmap (SM-3: never spans a chunk boundary).
    pub fn allocate_contiguous(&mut self, dev: &mut dyn BlockDevice, count: u32) -> Result<u64> {
        let blocks_per_chunk = self.blocks_per_chunk;
        let device = self.main.cib_addrs.clone();

        for cib_addr in device {
            let (_h, block) = crate::object::read_object(dev, cib_addr)?;
            let mut cib = ChunkInfoBlock::parse(&block)?;

            for local_idx in 0..cib.chunks.len() {
                if cib.chunks[local_idx].free_count < count {
                    continue;
                }
                let bitmap_addr = cib.chunks[local_idx].bitmap_addr;
                let block_count = cib.chunks[local_idx].block_count;
                let mut bitmap = dev.read_block(bitmap_addr)?;
                if let Some(start) = find_clear_run(&bitmap, block_count as usize, count) {
                    for b in start..start + count as usize {
                        set_bit(&mut bitmap, b, true);
                    }
                    dev.write_block(bitmap_addr, &bitmap)?;
                    cib.chunks[local_idx].free_count -= count;
                    let xid = cib.chunks[local_idx].xid;
                    let new_cib = cib.serialize(self.block_size, cib_addr, xid)?;
                    dev.write_block(cib_addr, &new_cib)?;

                    let chunk_index = cib.chunk_start_index as usize + local_idx;
                    let paddr = chunk_index as u64 * blocks_per_chunk as u64 + start as u64;
                    self.main.free_count = self.main.free_count.saturating_sub(count as u64);
                    return Ok(paddr);
                }
            }
        }

        Err(ApfsError::NoSpace)
    }

    /// Mark `paddr` free again (SM-2). Errors if the block was already free.
    pub fn free(&mut self, dev: &mut dyn BlockDevice, paddr: u64) -> Result<()> {
        let blocks_per_chunk = self.blocks_per_chunk;
        let chunk_index = (paddr / blocks_per_chunk as u64) as u32;
        let bit = (paddr % blocks_per_chunk as u64) as usize;

        for cib_addr in self.main.cib_addrs.clone() {
            let (_h, block) = crate::object::read_object(dev, cib_addr)?;
            let mut cib = ChunkInfoBlock::parse(&block)?;
            if chunk_index < cib.chunk_start_index
                || chunk_index >= cib.chunk_start_index + cib.chunks.len() as u32
            {
                continue;
            }
            let local_idx = (chunk_index - cib.chunk_start_index) as usize;
            let bitmap_addr = cib.chunks[local_idx].bitmap_addr;
            let mut bitmap = dev.read_block(bitmap_addr)?;
            if !get_bit(&bitmap, bit) {
                return Err(ApfsError::AlreadyFree(paddr));
            }
            set_bit(&mut bitmap, bit, false);
            dev.write_block(bitmap_addr, &bitmap)?;
            cib.chunks[local_idx].free_count += 1;
            let xid = cib.chunks[local_idx].xid;
            let new_cib = cib.serialize(self.block_size, cib_addr, xid)?;
            dev.write_block(cib_addr, &new_cib)?;
            self.main.free_count += 1;
            return Ok(());
        }

        Err(ApfsError::AddressNotTracked(paddr))
    }

    /// Record a pending free in one of the three free-space queues, keyed
    /// by `(xid, paddr)` (§4.5.4). Queue trees must already exist; this
    /// core does not create a queue tree from scratch.
    pub fn enqueue_free(
        &mut self,
        dev: &mut dyn BlockDevice,
        kind: FreeQueueKind,
        xid: u64,
        paddr: u64,
        count: u32,
    ) -> Result<()> {
        let idx = kind as usize;
        let root = self.free_queue_roots[idx].ok_or(ApfsError::InvalidArgument(
            "free queue tree is not present".into(),
        ))?;
        let key = free_queue_key_bytes(xid, paddr);
        let val = count.to_le_bytes();
        let mut resolver = PhysicalResolver;
        let new_root = btree::insert(
            dev,
            self,
            root,
            16,
            4,
            &FreeQueueComparator,
            &mut resolver,
            &key,
            &val,
            root,
            xid,
        )?;
        self.free_queue_roots[idx] = Some(new_root);
        Ok(())
    }

    pub fn free_queue_root(&self, kind: FreeQueueKind) -> Option<u64> {
        self.free_queue_roots[kind as usize]
    }
}

impl BlockAllocator for SpaceManager {
    fn allocate(&mut self, dev: &mut dyn BlockDevice) -> Result<u64> {
        SpaceManager::allocate(self, dev)
    }

    fn free(&mut self, dev: &mut dyn BlockDevice, paddr: u64) -> Result<()> {
        SpaceManager::free(self, dev, paddr)
    }
}

fn get_bit(bitmap: &[u8], bit: usize) -> bool {
    let byte = bitmap[bit / 8];
    byte & (1 << (bit % 8)) != 0
}

fn set_bit(bitmap: &mut [u8], bit: usize, value: bool) {
    let byte = &mut bitmap[bit / 8];
    if value {
        *byte |= 1 << (bit % 8);
    } else {
        *byte &= !(1 << (bit % 8));
    }
}

fn find_clear_bit(bitmap: &[u8], block_count: usize) -> Option<usize> {
    (0..block_count).find(|&bit| !get_bit(bitmap, bit))
}

fn find_clear_run(bitmap: &[u8], block_count: usize, count: u32) -> Option<usize> {
    let count = count as usize;
    if count == 0 || count > block_count {
        return None;
    }
    let mut run_start = 0usize;
    let mut run_len = 0usize;
    for bit in 0..block_count {
        if get_bit(bitmap, bit) {
            run_len = 0;
            run_start = bit + 1;
        } else {
            run_len += 1;
            if run_len == count {
                return Some(run_start);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemBlockDevice;
    use crate::object::{OBJECT_TYPE_SPACEMAN_CIB, OBJ_PHYSICAL};

    fn build_test_cib(
        dev: &mut MemBlockDevice,
        cib_addr: u64,
        bitmap_addr: u64,
        block_count: u32,
        chunk_start_index: u32,
    ) {
        let block_size = dev.block_size();
        let mut bitmap = vec![0u8; block_size as usize];
        // Mark everything past block_count as already-used so allocation
        // never wanders outside the chunk.
        for bit in block_count as usize..(block_size as usize * 8) {
            set_bit(&mut bitmap, bit, true);
        }
        dev.write_block(bitmap_addr, &bitmap).unwrap();

        let cib = ChunkInfoBlock {
            header: ObjectHeader {
                checksum: 0,
                oid: cib_addr,
                xid: 1,
                type_and_flags: OBJ_PHYSICAL | OBJECT_TYPE_SPACEMAN_CIB,
                subtype: 0,
            },
            chunk_info_count: 1,
            chunks: vec![ChunkInfo {
                xid: 1,
                block_count,
                free_count: block_count,
                bitmap_addr,
            }],
            chunk_start_index,
        };
        let block = cib.serialize(block_size, cib_addr, 1).unwrap();
        dev.write_block(cib_addr, &block).unwrap();
    }

    fn test_manager(main_block_count: u64, blocks_per_chunk: u32, cib_addrs: Vec<u64>) -> SpaceManager {
        SpaceManager {
            block_size: 4096,
            blocks_per_chunk,
            chunks_per_cib: 1,
            main: DeviceState {
                block_count: main_block_count,
                blocks_per_chunk,
                chunks_per_cib: 1,
                cib_addrs,
                free_count: main_block_count,
            },
            tier2: None,
            free_queue_roots: [None, None, None],
            free_queue_oldest_xid: [0, 0, 0],
            ip_bm_base: 0,
            ip_block_count: 0,
        }
    }

    #[test]
    fn allocate_returns_first_free_bit() {
        let mut dev = MemBlockDevice::new(4096, 64);
        build_test_cib(&mut dev, 10, 11, 32, 0);
        let mut sm = test_manager(32, 32, vec![10]);

        let p1 = sm.allocate(&mut dev).unwrap();
        let p2 = sm.allocate(&mut dev).unwrap();
        assert_eq!(p1, 0);
        assert_eq!(p2, 1);
    }

    #[test]
    fn free_then_reallocate_reuses_block() {
        let mut dev = MemBlockDevice::new(4096, 64);
        build_test_cib(&mut dev, 10, 11, 4, 0);
        let mut sm = test_manager(4, 4, vec![10]);

        let p1 = sm.allocate(&mut dev).unwrap();
        let p2 = sm.allocate(&mut dev).unwrap();
        assert_ne!(p1, p2);
        sm.free(&mut dev, p1).unwrap();
        let p3 = sm.allocate(&mut dev).unwrap();
        assert_eq!(p3, p1);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut dev = MemBlockDevice::new(4096, 64);
        build_test_cib(&mut dev, 10, 11, 4, 0);
        let mut sm = test_manager(4, 4, vec![10]);

        let p1 = sm.allocate(&mut dev).unwrap();
        sm.free(&mut dev, p1).unwrap();
        assert!(matches!(sm.free(&mut dev, p1), Err(ApfsError::AlreadyFree(_))));
    }

    #[test]
    fn exhausting_chunk_returns_no_space() {
        let mut dev = MemBlockDevice::new(4096, 64);
        build_test_cib(&mut dev, 10, 11, 2, 0);
        let mut sm = test_manager(2, 2, vec![10]);

        sm.allocate(&mut dev).unwrap();
        sm.allocate(&mut dev).unwrap();
        assert!(matches!(sm.allocate(&mut dev), Err(ApfsError::NoSpace)));
    }

    #[test]
    fn allocate_contiguous_finds_a_run() {
        let mut dev = MemBlockDevice::new(4096, 64);
        build_test_cib(&mut dev, 10, 11, 8, 0);
        let mut sm = test_manager(8, 8, vec![10]);

        let start = sm.allocate_contiguous(&mut dev, 3).unwrap();
        let bitmap = dev.read_block(11).unwrap();
        assert!(get_bit(&bitmap, start as usize));
        assert!(get_bit(&bitmap, start as usize + 1));
        assert!(get_bit(&bitmap, start as usize + 2));
    }

    #[test]
    fn allocate_contiguous_never_spans_chunks() {
        let mut dev = MemBlockDevice::new(4096, 64);
        build_test_cib(&mut dev, 10, 11, 4, 0);
        let mut sm = test_manager(4, 4, vec![10]);

        // Only 4 blocks in the one chunk; asking for 5 must fail rather
        // than reach into a second chunk.
        assert!(matches!(sm.allocate_contiguous(&mut dev, 5), Err(ApfsError::NoSpace)));
    }
}
