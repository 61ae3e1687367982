//! Object map (C7): resolves virtual object identifiers to physical
//! addresses, snapshot-aware.
//!
//! The OMAP is itself a physical B-tree keyed by `(oid, xid)` (§3.5). A
//! lookup for `(oid, target_xid)` returns the value with the largest
//! `xid <= target_xid`, which is what lets older snapshots keep resolving
//! their virtual objects to the physical blocks that were current as of
//! that transaction.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::block_device::BlockDevice;
use crate::btree::{self, BlockAllocator, ChildResolver, PhysicalResolver, RangeCursor};
use crate::comparators::{omap_key_bytes, OmapComparator};
use crate::error::{ApfsError, Result};
use crate::object::{self, ObjectHeader};

const OMAP_KEY_SIZE: u32 = 16;
const OMAP_VAL_SIZE: u32 = 16;

pub const OMAP_VAL_DELETED: u32 = 0x0000_0001;
pub const OMAP_VAL_SAVED: u32 = 0x0000_0002;
pub const OMAP_VAL_ENCRYPTED: u32 = 0x0000_0004;
pub const OMAP_VAL_NOHEADER: u32 = 0x0000_0008;
pub const OMAP_VAL_CRYPTO_GENERATION: u32 = 0x0000_0010;

/// `(oid, xid)` — an OMAP entry's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapKey {
    pub oid: u64,
    pub xid: u64,
}

/// `(flags, size, paddr)` — an OMAP entry's value (§3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapValue {
    pub flags: u32,
    pub size: u32,
    pub paddr: u64,
}

impl OmapValue {
    fn parse(val: &[u8]) -> Result<Self> {
        if val.len() < OMAP_VAL_SIZE as usize {
            return Err(ApfsError::InvalidBTree("omap value too short".into()));
        }
        let mut c = Cursor::new(val);
        Ok(OmapValue {
            flags: c.read_u32::<LittleEndian>()?,
            size: c.read_u32::<LittleEndian>()?,
            paddr: c.read_u64::<LittleEndian>()?,
        })
    }

    fn serialize(&self) -> [u8; OMAP_VAL_SIZE as usize] {
        let mut buf = [0u8; OMAP_VAL_SIZE as usize];
        buf[0..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.paddr.to_le_bytes());
        buf
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & OMAP_VAL_DELETED != 0
    }
}

/// A live object map: its own physical tree root plus the snapshot tree
/// and `most_recent_snap` watermark used to enforce SnapshotViolation
/// (§4.7.3).
pub struct ObjectMap {
    pub flags: u32,
    pub tree_oid: u64, // physical paddr of the OMAP B-tree root
    pub snapshot_tree_oid: u64,
    pub most_recent_snap: u64,
    pub pending_revert_min: u64,
    pub pending_revert_max: u64,
}

const OMAP_PHYS_FIXED_SIZE: usize = 4 + 4 + 4 + 4 + 8 + 8 + 8 + 8 + 8;

impl ObjectMap {
    /// Parse an `omap_phys_t` block (§3.5).
    pub fn parse(block: &[u8]) -> Result<Self> {
        let body = &block[ObjectHeader::SIZE..];
        if body.len() < OMAP_PHYS_FIXED_SIZE {
            return Err(ApfsError::MalformedObject("omap_phys_t too short".into()));
        }
        let mut c = Cursor::new(body);
        let flags = c.read_u32::<LittleEndian>()?;
        let _snap_count = c.read_u32::<LittleEndian>()?;
        let _tree_type = c.read_u32::<LittleEndian>()?;
        let _snapshot_tree_type = c.read_u32::<LittleEndian>()?;
        let snapshot_tree_oid = c.read_u64::<LittleEndian>()?;
        let tree_oid = c.read_u64::<LittleEndian>()?;
        let pending_revert_min = c.read_u64::<LittleEndian>()?;
        let pending_revert_max = c.read_u64::<LittleEndian>()?;
        let most_recent_snap = c.read_u64::<LittleEndian>()?;

        Ok(ObjectMap {
            flags,
            tree_oid,
            snapshot_tree_oid,
            most_recent_snap,
            pending_revert_min,
            pending_revert_max,
        })
    }

    /// Load the container or volume object map rooted at physical block
    /// `paddr`.
    pub fn load(dev: &mut dyn BlockDevice, paddr: u64) -> Result<Self> {
        let (_header, block) = object::read_object(dev, paddr)?;
        ObjectMap::parse(&block)
    }

    /// Resolve `oid` as of `target_xid`: the entry with the largest
    /// `xid <= target_xid` (§4.7.2). A `DELETED` tombstone at or below
    /// `target_xid` is treated as not found.
    pub fn resolve(
        &self,
        dev: &mut dyn BlockDevice,
        oid: u64,
        target_xid: u64,
    ) -> Result<Option<OmapValue>> {
        let end_key = omap_key_bytes(oid, target_xid);
        let start_key = omap_key_bytes(oid, 0);
        let mut resolver = PhysicalResolver;
        let entries = btree::range(
            dev,
            self.tree_oid,
            OMAP_KEY_SIZE,
            OMAP_VAL_SIZE,
            &OmapComparator,
            &mut resolver,
            Some(&start_key),
            Some(&end_key),
        )?;

        let best = entries
            .iter()
            .filter(|(k, _)| k.len() >= 16 && u64::from_le_bytes(k[0..8].try_into().unwrap()) == oid)
            .max_by_key(|(k, _)| u64::from_le_bytes(k[8..16].try_into().unwrap()));

        match best {
            Some((_, v)) => {
                let value = OmapValue::parse(v)?;
                if value.is_deleted() {
                    Ok(None)
                } else {
                    Ok(Some(value))
                }
            }
            None => Ok(None),
        }
    }

    /// Insert or overwrite the mapping for `(oid, xid)` (§4.7.3). Rejects
    /// writes at or below `most_recent_snap`, since that would mutate a
    /// snapshot's history (SnapshotViolation).
    pub fn insert(
        &mut self,
        dev: &mut dyn BlockDevice,
        alloc: &mut dyn BlockAllocator,
        oid: u64,
        xid: u64,
        paddr: u64,
        size: u32,
        flags: u32,
    ) -> Result<()> {
        if self.most_recent_snap != 0 && xid <= self.most_recent_snap {
            return Err(ApfsError::SnapshotViolation { xid, snap_xid: self.most_recent_snap });
        }

        let key = omap_key_bytes(oid, xid);
        let value = OmapValue { flags, size, paddr };
        let mut resolver = PhysicalResolver;
        let new_root = btree::insert(
            dev,
            alloc,
            self.tree_oid,
            OMAP_KEY_SIZE,
            OMAP_VAL_SIZE,
            &OmapComparator,
            &mut resolver,
            &key,
            &value.serialize(),
            self.tree_oid,
            xid,
        )?;
        self.tree_oid = new_root;
        Ok(())
    }

    /// Mark `(oid, xid)` deleted rather than physically removing the entry,
    /// preserving history for older snapshots that still reference it.
    pub fn mark_deleted(
        &mut self,
        dev: &mut dyn BlockDevice,
        alloc: &mut dyn BlockAllocator,
        oid: u64,
        xid: u64,
    ) -> Result<()> {
        self.insert(dev, alloc, oid, xid, 0, 0, OMAP_VAL_DELETED)
    }

    /// Iterate every entry for `oid` across all retained transactions, in
    /// ascending `xid` order — useful for snapshot enumeration and tests.
    pub fn history(&self, dev: &mut dyn BlockDevice, oid: u64) -> Result<Vec<(u64, OmapValue)>> {
        let start = omap_key_bytes(oid, 0);
        let end = omap_key_bytes(oid, u64::MAX);
        let mut resolver = PhysicalResolver;
        let mut cursor = RangeCursor::new(dev, self.tree_oid, OMAP_KEY_SIZE, OMAP_VAL_SIZE, Some(&end))?;
        let mut out = Vec::new();
        while let Some((k, v)) = cursor.next(dev, &OmapComparator, &mut resolver)? {
            if k.len() < 16 {
                continue;
            }
            let key_oid = u64::from_le_bytes(k[0..8].try_into().unwrap());
            if key_oid < oid {
                continue;
            }
            if key_oid > oid {
                break;
            }
            let xid = u64::from_le_bytes(k[8..16].try_into().unwrap());
            out.push((xid, OmapValue::parse(&v)?));
        }
        let _ = start;
        Ok(out)
    }
}

/// Resolves a filesystem tree's virtual child OIDs through an object map at
/// a fixed transaction (§4.7.4). Every virtual tree (the catalog, the
/// extent reference tree, …) descends through one of these rather than
/// [`PhysicalResolver`].
pub struct OmapResolver<'a> {
    pub omap: &'a ObjectMap,
    pub xid: u64,
}

impl<'a> ChildResolver for OmapResolver<'a> {
    fn resolve(&mut self, dev: &mut dyn BlockDevice, child_ref: u64) -> Result<u64> {
        self.omap
            .resolve(dev, child_ref, self.xid)?
            .map(|v| v.paddr)
            .ok_or(ApfsError::NotFound { oid: child_ref, xid: self.xid })
    }
}
