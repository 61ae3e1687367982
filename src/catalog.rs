//! Filesystem catalog record codec (C10).
//!
//! The catalog is a virtual B-tree (§3.7) keyed by a compound
//! `obj_id_and_type` field plus a type-specific tail (a drec's hashed name,
//! a file extent's logical offset). All descents go through the volume's
//! object map via [`OmapResolver`], since internal node children are
//! virtual OIDs, not physical block numbers.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::block_device::BlockDevice;
use crate::btree;
use crate::comparators::{catalog_key_bytes, CatalogComparator};
use crate::error::{ApfsError, Result};
use crate::omap::{ObjectMap, OmapResolver};
use crate::{DirEntry, EntryKind};

// Catalog record types (j_obj_types), stored in the top 4 bits of a key's obj_id_and_type.
pub const J_TYPE_SNAP_METADATA: u8 = 1;
pub const J_TYPE_EXTENT: u8 = 2;
pub const J_TYPE_INODE: u8 = 3;
pub const J_TYPE_XATTR: u8 = 4;
pub const J_TYPE_SIBLING_LINK: u8 = 5;
pub const J_TYPE_DSTREAM_ID: u8 = 6;
pub const J_TYPE_CRYPTO_STATE: u8 = 7;
pub const J_TYPE_FILE_EXTENT: u8 = 8;
pub const J_TYPE_DIR_REC: u8 = 9;
pub const J_TYPE_DIR_STATS: u8 = 10;
pub const J_TYPE_SNAP_NAME: u8 = 11;
pub const J_TYPE_SIBLING_MAP: u8 = 12;

// Well-known OIDs.
pub const ROOT_DIR_PARENT: u64 = 1;
pub const ROOT_DIR_RECORD: u64 = 2;

// Inode types (from BSD mode).
pub const INODE_DIR_TYPE: u16 = 0o040000;
pub const INODE_FILE_TYPE: u16 = 0o100000;
pub const INODE_SYMLINK_TYPE: u16 = 0o120000;

const INO_EXT_TYPE_DSTREAM: u8 = 8;

/// Parsed inode value from a catalog record.
#[derive(Debug, Clone)]
pub struct InodeVal {
    pub parent_id: u64,
    pub private_id: u64,
    pub create_time: i64,
    pub modify_time: i64,
    pub change_time: i64,
    pub access_time: i64,
    pub internal_flags: u64,
    pub nchildren_or_nlink: i32,
    pub default_protection_class: u32,
    pub write_generation_counter: u32,
    pub bsd_flags: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub pad1: u16,
    pub uncompressed_size: u64,
    /// Logical file size from the dstream xfield, if present.
    pub dstream_size: Option<u64>,
}

impl InodeVal {
    const FIXED_SIZE: usize = 92;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(ApfsError::CorruptedData(format!(
                "inode value too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        let parent_id = cursor.read_u64::<LittleEndian>()?;
        let private_id = cursor.read_u64::<LittleEndian>()?;
        let create_time = cursor.read_i64::<LittleEndian>()?;
        let modify_time = cursor.read_i64::<LittleEndian>()?;
        let change_time = cursor.read_i64::<LittleEndian>()?;
        let access_time = cursor.read_i64::<LittleEndian>()?;
        let internal_flags = cursor.read_u64::<LittleEndian>()?;
        let nchildren_or_nlink = cursor.read_i32::<LittleEndian>()?;
        let default_protection_class = cursor.read_u32::<LittleEndian>()?;
        let write_generation_counter = cursor.read_u32::<LittleEndian>()?;
        let bsd_flags = cursor.read_u32::<LittleEndian>()?;
        let uid = cursor.read_u32::<LittleEndian>()?;
        let gid = cursor.read_u32::<LittleEndian>()?;
        let mode = cursor.read_u16::<LittleEndian>()?;
        let pad1 = cursor.read_u16::<LittleEndian>()?;
        let uncompressed_size = cursor.read_u64::<LittleEndian>()?;

        let dstream_size = Self::parse_dstream_size(&data[Self::FIXED_SIZE..]);

        Ok(InodeVal {
            parent_id,
            private_id,
            create_time,
            modify_time,
            change_time,
            access_time,
            internal_flags,
            nchildren_or_nlink,
            default_protection_class,
            write_generation_counter,
            bsd_flags,
            uid,
            gid,
            mode,
            pad1,
            uncompressed_size,
            dstream_size,
        })
    }

    /// Layout: `xf_blob_t { xf_num_exts: u16, xf_used_data: u16 }` followed
    /// by `x_field_t[xf_num_exts] { x_type: u8, x_flags: u8, x_size: u16 }`
    /// followed by the field data values, each padded to 8 bytes.
    fn parse_dstream_size(xfield_data: &[u8]) -> Option<u64> {
        if xfield_data.len() < 4 {
            return None;
        }
        let xf_num_exts = u16::from_le_bytes([xfield_data[0], xfield_data[1]]) as usize;
        if xf_num_exts == 0 {
            return None;
        }

        let entries_start = 4;
        let entries_end = entries_start + xf_num_exts * 4;
        if entries_end > xfield_data.len() {
            return None;
        }

        let mut data_offset = entries_end;

        for i in 0..xf_num_exts {
            let entry_off = entries_start + i * 4;
            let x_type = xfield_data[entry_off];
            let x_size =
                u16::from_le_bytes([xfield_data[entry_off + 2], xfield_data[entry_off + 3]]) as usize;

            if x_type == INO_EXT_TYPE_DSTREAM && x_size >= 8 && data_offset + 8 <= xfield_data.len() {
                let size = u64::from_le_bytes(
                    xfield_data[data_offset..data_offset + 8].try_into().unwrap(),
                );
                return Some(size);
            }

            let padded_size = (x_size + 7) & !7;
            data_offset += padded_size;
        }

        None
    }

    pub fn kind(&self) -> u16 {
        self.mode & 0o170000
    }

    /// Logical file size: dstream xfield if present, else the resident size.
    pub fn size(&self) -> u64 {
        self.dstream_size.unwrap_or(self.uncompressed_size)
    }

    pub fn nlink(&self) -> u32 {
        self.nchildren_or_nlink as u32
    }
}

/// Directory record value (`j_drec_val_t`).
#[derive(Debug, Clone)]
pub struct DrecVal {
    pub file_id: u64,
    pub date_added: i64,
    pub flags: u16,
}

impl DrecVal {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 18 {
            return Err(ApfsError::CorruptedData(format!(
                "drec value too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        Ok(DrecVal {
            file_id: cursor.read_u64::<LittleEndian>()?,
            date_added: cursor.read_i64::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// The `DT_*` file type packed into the low nibble of `flags`.
    pub fn file_type(&self) -> u16 {
        self.flags & 0x000F
    }
}

pub const DT_REG: u16 = 8;
pub const DT_DIR: u16 = 4;
pub const DT_LNK: u16 = 10;

/// File extent value (`j_file_extent_val_t`).
#[derive(Debug, Clone)]
pub struct FileExtentVal {
    pub flags_and_length: u64,
    pub phys_block_num: u64,
    pub crypto_id: u64,
}

impl FileExtentVal {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 24 {
            return Err(ApfsError::CorruptedData(format!(
                "file extent value too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        Ok(FileExtentVal {
            flags_and_length: cursor.read_u64::<LittleEndian>()?,
            phys_block_num: cursor.read_u64::<LittleEndian>()?,
            crypto_id: cursor.read_u64::<LittleEndian>()?,
        })
    }

    /// Logical length in bytes, masked to the low 56 bits.
    pub fn length(&self) -> u64 {
        self.flags_and_length & 0x00FF_FFFF_FFFF_FFFF
    }
}

/// Decode a catalog key's leading `obj_id_and_type` field.
fn decode_catalog_key(key_bytes: &[u8]) -> Result<(u64, u8)> {
    if key_bytes.len() < 8 {
        return Err(ApfsError::InvalidBTree("catalog key too short".into()));
    }
    let obj_id_and_type = u64::from_le_bytes(key_bytes[0..8].try_into().unwrap());
    let obj_id = obj_id_and_type & 0x0FFF_FFFF_FFFF_FFFF;
    let j_type = ((obj_id_and_type >> 60) & 0xF) as u8;
    Ok((obj_id, j_type))
}

/// Extract the name from a directory record key (`j_drec_hashed_key_t`).
/// After the 8-byte `obj_id_and_type` there is a 4-byte `name_len_and_hash`
/// whose low 10 bits are the name length, followed by the UTF-8 name.
fn decode_drec_name(key_bytes: &[u8]) -> Result<String> {
    if key_bytes.len() < 12 {
        return Err(ApfsError::InvalidBTree("drec key too short for name".into()));
    }
    let name_len_and_hash = u32::from_le_bytes(key_bytes[8..12].try_into().unwrap());
    let name_len = (name_len_and_hash & 0x0000_03FF) as usize;

    let name_start = 12;
    let name_end = name_start + name_len;
    if name_end > key_bytes.len() {
        return Err(ApfsError::InvalidBTree(format!(
            "drec name extends beyond key: name_end={}, key_len={}",
            name_end,
            key_bytes.len()
        )));
    }

    let name_bytes = &key_bytes[name_start..name_end];
    let nul_pos = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    Ok(String::from_utf8_lossy(&name_bytes[..nul_pos]).to_string())
}

/// Bounds covering every record of `rec_type` for `oid`.
fn type_bounds(oid: u64, rec_type: u8) -> (Vec<u8>, Vec<u8>) {
    (
        catalog_key_bytes(oid, rec_type, &[]),
        catalog_key_bytes(oid, rec_type + 1, &[]),
    )
}

fn scan_records(
    dev: &mut dyn BlockDevice,
    catalog_root: u64,
    omap: &ObjectMap,
    xid: u64,
    oid: u64,
    rec_type: u8,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let (start, end) = type_bounds(oid, rec_type);
    let mut resolver = OmapResolver { omap, xid };
    let entries = btree::range(
        dev,
        catalog_root,
        0,
        0,
        &CatalogComparator,
        &mut resolver,
        Some(&start),
        Some(&end),
    )?;

    Ok(entries
        .into_iter()
        .filter(|(k, _)| {
            matches!(decode_catalog_key(k), Ok((key_oid, key_type)) if key_oid == oid && key_type == rec_type)
        })
        .collect())
}

/// List directory entries for `parent_oid`. Scans every `J_TYPE_DIR_REC`
/// record under the parent, then looks up each child's inode for size and
/// timestamps.
pub fn list_directory(
    dev: &mut dyn BlockDevice,
    catalog_root: u64,
    omap: &ObjectMap,
    xid: u64,
    parent_oid: u64,
) -> Result<Vec<DirEntry>> {
    let records = scan_records(dev, catalog_root, omap, xid, parent_oid, J_TYPE_DIR_REC)?;

    let mut dir_entries = Vec::new();
    for (key, val) in &records {
        let name = match decode_drec_name(key) {
            Ok(n) => n,
            Err(_) => continue,
        };
        let drec = match DrecVal::parse(val) {
            Ok(d) => d,
            Err(_) => continue,
        };
        let kind = match drec.file_type() {
            DT_DIR => EntryKind::Directory,
            DT_LNK => EntryKind::Symlink,
            _ => EntryKind::File,
        };

        let (size, create_time, modify_time) =
            match lookup_inode(dev, catalog_root, omap, xid, drec.file_id) {
                Ok(inode) => (inode.size(), inode.create_time, inode.modify_time),
                Err(_) => (0, 0, 0),
            };

        dir_entries.push(DirEntry {
            name,
            oid: drec.file_id,
            kind,
            size,
            create_time,
            modify_time,
        });
    }

    Ok(dir_entries)
}

/// Look up the inode record for `oid`.
pub fn lookup_inode(
    dev: &mut dyn BlockDevice,
    catalog_root: u64,
    omap: &ObjectMap,
    xid: u64,
    oid: u64,
) -> Result<InodeVal> {
    let key = catalog_key_bytes(oid, J_TYPE_INODE, &[]);
    let mut resolver = OmapResolver { omap, xid };
    let val = btree::lookup(dev, catalog_root, 0, 0, &CatalogComparator, &mut resolver, &key)?;
    match val {
        Some(data) => InodeVal::parse(&data),
        None => Err(ApfsError::FileNotFound(format!("inode OID {}", oid))),
    }
}

/// Look up all file extent records for a file's dstream (`private_id`).
pub fn lookup_extents(
    dev: &mut dyn BlockDevice,
    catalog_root: u64,
    omap: &ObjectMap,
    xid: u64,
    file_oid: u64,
) -> Result<Vec<FileExtentVal>> {
    let records = scan_records(dev, catalog_root, omap, xid, file_oid, J_TYPE_FILE_EXTENT)?;
    records.iter().map(|(_, v)| FileExtentVal::parse(v)).collect()
}

/// Look up a single directory record by name under `parent_oid`.
fn lookup_drec(
    dev: &mut dyn BlockDevice,
    catalog_root: u64,
    omap: &ObjectMap,
    xid: u64,
    parent_oid: u64,
    name: &str,
) -> Result<DrecVal> {
    let records = scan_records(dev, catalog_root, omap, xid, parent_oid, J_TYPE_DIR_REC)?;
    for (key, val) in &records {
        if let Ok(entry_name) = decode_drec_name(key) {
            if entry_name == name {
                return DrecVal::parse(val);
            }
        }
    }
    Err(ApfsError::FileNotFound(name.to_string()))
}

/// Resolve a slash-separated path to its `(OID, InodeVal)`.
pub fn resolve_path(
    dev: &mut dyn BlockDevice,
    catalog_root: u64,
    omap: &ObjectMap,
    xid: u64,
    path: &str,
) -> Result<(u64, InodeVal)> {
    let path = path.trim_matches('/');
    if path.is_empty() {
        let inode = lookup_inode(dev, catalog_root, omap, xid, ROOT_DIR_RECORD)?;
        return Ok((ROOT_DIR_RECORD, inode));
    }

    let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut current_parent = ROOT_DIR_RECORD;

    for (i, component) in components.iter().enumerate() {
        let drec = lookup_drec(dev, catalog_root, omap, xid, current_parent, component)?;

        if i == components.len() - 1 {
            let inode = lookup_inode(dev, catalog_root, omap, xid, drec.file_id)?;
            return Ok((drec.file_id, inode));
        }

        if drec.file_type() != DT_DIR {
            return Err(ApfsError::NotADirectory(components[..=i].join("/")));
        }
        current_parent = drec.file_id;
    }

    unreachable!()
}
