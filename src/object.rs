//! Object header codec (C3).
//!
//! Every on-disk APFS object except those flagged `NO_HEADER` begins with
//! this 32-byte prefix. `type_and_flags` packs a 16-bit type code in the low
//! bits and a set of flags — including the 2-bit storage class — in the
//! high bits.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::block_device::BlockDevice;
use crate::error::{ApfsError, Result};
use crate::fletcher;

// Object type constants (low 16 bits of type_and_flags).
pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x01;
pub const OBJECT_TYPE_BTREE: u32 = 0x02;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x03;
pub const OBJECT_TYPE_SPACEMAN: u32 = 0x05;
pub const OBJECT_TYPE_SPACEMAN_CAB: u32 = 0x06;
pub const OBJECT_TYPE_SPACEMAN_CIB: u32 = 0x07;
pub const OBJECT_TYPE_SPACEMAN_BITMAP: u32 = 0x08;
pub const OBJECT_TYPE_OMAP: u32 = 0x0B;
pub const OBJECT_TYPE_CHECKPOINT_MAP: u32 = 0x0C;
pub const OBJECT_TYPE_FS: u32 = 0x0D;
pub const OBJECT_TYPE_OMAP_SNAPSHOT: u32 = 0x16;

pub const OBJECT_TYPE_MASK: u32 = 0x0000_FFFF;

// Storage-class flags, high 2 bits of the flags half (§3.2 / §4.3).
pub const OBJ_VIRTUAL: u32 = 0x0000_0000;
pub const OBJ_EPHEMERAL: u32 = 0x8000_0000;
pub const OBJ_PHYSICAL: u32 = 0x4000_0000;
pub const OBJ_STORAGE_TYPE_MASK: u32 = 0xC000_0000;

pub const OBJ_NOHEADER: u32 = 0x2000_0000;
pub const OBJ_ENCRYPTED: u32 = 0x1000_0000;
pub const OBJ_NONPERSISTENT: u32 = 0x0800_0000;

/// Classified storage class of an object (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Virtual,
    Ephemeral,
    Physical,
}

/// 32-byte header present on every APFS on-disk object. All fields are
/// little-endian.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub checksum: u64,       // 0x00
    pub oid: u64,            // 0x08
    pub xid: u64,            // 0x10
    pub type_and_flags: u32, // 0x18
    pub subtype: u32,        // 0x1C
}

impl ObjectHeader {
    pub const SIZE: usize = 32;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::MalformedObject(format!(
                "object header too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        Ok(ObjectHeader {
            checksum: cursor.read_u64::<LittleEndian>()?,
            oid: cursor.read_u64::<LittleEndian>()?,
            xid: cursor.read_u64::<LittleEndian>()?,
            type_and_flags: cursor.read_u32::<LittleEndian>()?,
            subtype: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Serialize back to 32 bytes. `parse(serialize(h)) == h`.
    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..16].copy_from_slice(&self.oid.to_le_bytes());
        buf[16..24].copy_from_slice(&self.xid.to_le_bytes());
        buf[24..28].copy_from_slice(&self.type_and_flags.to_le_bytes());
        buf[28..32].copy_from_slice(&self.subtype.to_le_bytes());
        buf
    }

    pub fn object_type(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_MASK
    }

    pub fn storage_type_bits(&self) -> u32 {
        self.type_and_flags & OBJ_STORAGE_TYPE_MASK
    }

    /// Classify the storage class, enforcing that exactly one bit is set
    /// (§4.3: any other combination is `InvalidStorageClass`).
    pub fn storage_class(&self) -> Result<StorageClass> {
        match self.storage_type_bits() {
            OBJ_VIRTUAL => Ok(StorageClass::Virtual),
            OBJ_EPHEMERAL => Ok(StorageClass::Ephemeral),
            OBJ_PHYSICAL => Ok(StorageClass::Physical),
            other => Err(ApfsError::InvalidStorageClass(other)),
        }
    }

    pub fn is_physical(&self) -> bool {
        matches!(self.storage_class(), Ok(StorageClass::Physical))
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.storage_class(), Ok(StorageClass::Virtual))
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self.storage_class(), Ok(StorageClass::Ephemeral))
    }

    pub fn no_header(&self) -> bool {
        self.type_and_flags & OBJ_NOHEADER != 0
    }

    pub fn encrypted(&self) -> bool {
        self.type_and_flags & OBJ_ENCRYPTED != 0
    }

    pub fn non_persistent(&self) -> bool {
        self.type_and_flags & OBJ_NONPERSISTENT != 0
    }
}

/// Read a full block at `paddr`, verify its Fletcher-64 checksum (CHK-1),
/// and parse its header.
pub fn read_object(dev: &mut dyn BlockDevice, paddr: u64) -> Result<(ObjectHeader, Vec<u8>)> {
    let block = dev.read_block(paddr)?;

    if !fletcher::verify_object(&block)? {
        return Err(ApfsError::ChecksumMismatch { paddr });
    }

    let header = ObjectHeader::parse(&block)?;
    Ok((header, block))
}

/// Read a block at `paddr` without checksum verification. Used for blocks
/// whose header is flagged `NO_HEADER`, or when the caller verifies
/// separately (e.g. the checkpoint scanner tolerating individual failures).
pub fn read_block(dev: &mut dyn BlockDevice, paddr: u64) -> Result<Vec<u8>> {
    dev.read_block(paddr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = ObjectHeader {
            checksum: 0x1122_3344_5566_7788,
            oid: 42,
            xid: 7,
            type_and_flags: OBJ_PHYSICAL | OBJECT_TYPE_BTREE_NODE,
            subtype: 0,
        };
        let bytes = h.serialize();
        let parsed = ObjectHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.checksum, h.checksum);
        assert_eq!(parsed.oid, h.oid);
        assert_eq!(parsed.xid, h.xid);
        assert_eq!(parsed.type_and_flags, h.type_and_flags);
        assert_eq!(parsed.subtype, h.subtype);
    }

    #[test]
    fn storage_class_classification() {
        let mut h = ObjectHeader {
            checksum: 0,
            oid: 1,
            xid: 1,
            type_and_flags: OBJ_VIRTUAL | OBJECT_TYPE_FS,
            subtype: 0,
        };
        assert_eq!(h.storage_class().unwrap(), StorageClass::Virtual);

        h.type_and_flags = OBJ_EPHEMERAL | OBJECT_TYPE_SPACEMAN;
        assert_eq!(h.storage_class().unwrap(), StorageClass::Ephemeral);

        h.type_and_flags = OBJ_PHYSICAL | OBJECT_TYPE_OMAP;
        assert_eq!(h.storage_class().unwrap(), StorageClass::Physical);

        // Both physical and ephemeral bits set is illegal.
        h.type_and_flags = OBJ_PHYSICAL | OBJ_EPHEMERAL | OBJECT_TYPE_OMAP;
        assert!(matches!(
            h.storage_class(),
            Err(ApfsError::InvalidStorageClass(_))
        ));
    }

    #[test]
    fn flag_bits_are_independent_of_type() {
        let h = ObjectHeader {
            checksum: 0,
            oid: 1,
            xid: 1,
            type_and_flags: OBJ_PHYSICAL | OBJ_ENCRYPTED | OBJ_NOHEADER | OBJECT_TYPE_BTREE,
            subtype: 0,
        };
        assert!(h.encrypted());
        assert!(h.no_header());
        assert!(!h.non_persistent());
        assert_eq!(h.object_type(), OBJECT_TYPE_BTREE);
    }

    #[test]
    fn header_too_short_is_malformed() {
        let data = vec![0u8; 16];
        assert!(matches!(
            ObjectHeader::parse(&data),
            Err(ApfsError::MalformedObject(_))
        ));
    }
}
