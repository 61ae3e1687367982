//! Container and volume superblock parsing (part of C8's input, §3.3/§3.8).

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::block_device::BlockDevice;
use crate::error::{ApfsError, Result};
use crate::fletcher;
use crate::object::ObjectHeader;

/// NX_MAGIC = "NXSB" as little-endian u32.
pub const NX_MAGIC: u32 = 0x4253584E;
/// APSB_MAGIC = "APSB" as little-endian u32.
pub const APSB_MAGIC: u32 = 0x42535041;

/// Maximum number of volume OIDs in a container.
pub const NX_MAX_FILE_SYSTEMS: usize = 100;

/// Incompatible feature bits this core implementation understands.
pub const NX_INCOMPAT_VERSION2: u64 = 0x2;
pub const NX_INCOMPAT_FUSION: u64 = 0x100;
pub const SUPPORTED_INCOMPAT_MASK: u64 = NX_INCOMPAT_VERSION2 | NX_INCOMPAT_FUSION;

/// Read-only-compatible feature bits this core implementation understands.
/// None, currently — any set bit is unknown and is only tolerated when the
/// container is mounted read-only.
pub const SUPPORTED_RO_COMPAT_MASK: u64 = 0x0;

/// Container superblock (NXSB) — the root structure of an APFS container.
#[derive(Debug, Clone)]
pub struct NxSuperblock {
    pub header: ObjectHeader,
    pub magic: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub uuid: [u8; 16],
    pub next_oid: u64,
    pub next_xid: u64,
    pub xp_desc_blocks: u32,
    pub xp_data_blocks: u32,
    pub xp_desc_base: u64,
    pub xp_data_base: u64,
    pub xp_desc_next: u32,
    pub xp_data_next: u32,
    pub xp_desc_index: u32,
    pub xp_desc_len: u32,
    pub xp_data_index: u32,
    pub xp_data_len: u32,
    pub spaceman_oid: u64,
    pub omap_oid: u64,
    pub reaper_oid: u64,
    pub max_file_systems: u32,
    pub fs_oids: Vec<u64>,
}

impl NxSuperblock {
    /// Minimum on-disk size per NX-1.
    pub const MIN_SIZE: usize = 1376;

    /// Parse the container superblock from a raw block and check NX-1..NX-3.
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < Self::MIN_SIZE {
            return Err(ApfsError::MalformedObject(format!(
                "container superblock block too short: {} bytes",
                block.len()
            )));
        }

        let header = ObjectHeader::parse(block)?;
        let mut cursor = Cursor::new(block);
        cursor.set_position(ObjectHeader::SIZE as u64);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != NX_MAGIC {
            return Err(ApfsError::InvalidMagic(magic));
        }

        let block_size = cursor.read_u32::<LittleEndian>()?;
        let block_count = cursor.read_u64::<LittleEndian>()?;
        let features = cursor.read_u64::<LittleEndian>()?;
        let readonly_compatible_features = cursor.read_u64::<LittleEndian>()?;
        let incompatible_features = cursor.read_u64::<LittleEndian>()?;

        let mut uuid = [0u8; 16];
        cursor.read_exact(&mut uuid)?;

        let next_oid = cursor.read_u64::<LittleEndian>()?;
        let next_xid = cursor.read_u64::<LittleEndian>()?;

        let xp_desc_blocks = cursor.read_u32::<LittleEndian>()?;
        let xp_data_blocks = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_base = cursor.read_u64::<LittleEndian>()?;
        let xp_data_base = cursor.read_u64::<LittleEndian>()?;
        let xp_desc_next = cursor.read_u32::<LittleEndian>()?;
        let xp_data_next = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_index = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_len = cursor.read_u32::<LittleEndian>()?;
        let xp_data_index = cursor.read_u32::<LittleEndian>()?;
        let xp_data_len = cursor.read_u32::<LittleEndian>()?;

        let spaceman_oid = cursor.read_u64::<LittleEndian>()?;
        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let reaper_oid = cursor.read_u64::<LittleEndian>()?;

        let _test_type = cursor.read_u32::<LittleEndian>()?;
        let max_file_systems = cursor.read_u32::<LittleEndian>()?;

        let fs_count = std::cmp::min(max_file_systems as usize, NX_MAX_FILE_SYSTEMS);
        let mut fs_oids = Vec::with_capacity(fs_count);
        for _ in 0..fs_count {
            fs_oids.push(cursor.read_u64::<LittleEndian>()?);
        }

        let sb = NxSuperblock {
            header,
            magic,
            block_size,
            block_count,
            features,
            readonly_compatible_features,
            incompatible_features,
            uuid,
            next_oid,
            next_xid,
            xp_desc_blocks,
            xp_data_blocks,
            xp_desc_base,
            xp_data_base,
            xp_desc_next,
            xp_data_next,
            xp_desc_index,
            xp_desc_len,
            xp_data_index,
            xp_data_len,
            spaceman_oid,
            omap_oid,
            reaper_oid,
            max_file_systems,
            fs_oids,
        };

        sb.validate()?;
        Ok(sb)
    }

    /// NX-1, NX-2, NX-3.
    fn validate(&self) -> Result<()> {
        if !(4096..=65536).contains(&self.block_size) {
            return Err(ApfsError::MalformedObject(format!(
                "block size {} out of range [4096, 65536]",
                self.block_size
            )));
        }
        if self.block_count == 0 {
            return Err(ApfsError::MalformedObject("block count is zero".into()));
        }
        if self.max_file_systems == 0 || self.max_file_systems as usize > NX_MAX_FILE_SYSTEMS {
            return Err(ApfsError::MalformedObject(format!(
                "max_file_systems {} out of range (0, {}]",
                self.max_file_systems, NX_MAX_FILE_SYSTEMS
            )));
        }
        if self.spaceman_oid == 0 || self.omap_oid == 0 || self.reaper_oid == 0 {
            return Err(ApfsError::MalformedObject(
                "space-manager, omap, or reaper oid is zero".into(),
            ));
        }
        if self.next_oid <= 1024 {
            return Err(ApfsError::MalformedObject(format!(
                "next_oid {} must exceed the reserved range",
                self.next_oid
            )));
        }
        Ok(())
    }
}

/// Volume superblock (APSB) — one per filesystem within a container.
#[derive(Debug, Clone)]
pub struct ApfsSuperblock {
    pub header: ObjectHeader,
    pub magic: u32,
    pub fs_index: u32,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub unmount_time: u64,
    pub fs_reserve_block_count: u64,
    pub fs_quota_block_count: u64,
    pub fs_alloc_count: u64,
    pub root_tree_type: u32,
    pub extentref_tree_type: u32,
    pub snap_meta_tree_type: u32,
    pub omap_oid: u64,
    pub root_tree_oid: u64,
    pub extentref_tree_oid: u64,
    pub snap_meta_tree_oid: u64,
    pub revert_to_xid: u64,
    pub revert_to_sblock_oid: u64,
    pub next_obj_id: u64,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
    pub num_other_fsobjects: u64,
    pub num_snapshots: u64,
    pub total_blocks_alloced: u64,
    pub total_blocks_freed: u64,
    pub uuid: [u8; 16],
    pub last_mod_time: u64,
    pub fs_flags: u64,
    pub volume_name: String,
}

impl ApfsSuperblock {
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let mut cursor = Cursor::new(block);
        cursor.set_position(ObjectHeader::SIZE as u64);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != APSB_MAGIC {
            return Err(ApfsError::InvalidMagic(magic));
        }

        let fs_index = cursor.read_u32::<LittleEndian>()?;
        let features = cursor.read_u64::<LittleEndian>()?;
        let readonly_compatible_features = cursor.read_u64::<LittleEndian>()?;
        let incompatible_features = cursor.read_u64::<LittleEndian>()?;
        let unmount_time = cursor.read_u64::<LittleEndian>()?;
        let fs_reserve_block_count = cursor.read_u64::<LittleEndian>()?;
        let fs_quota_block_count = cursor.read_u64::<LittleEndian>()?;
        let fs_alloc_count = cursor.read_u64::<LittleEndian>()?;

        // wrapped_meta_crypto_state_t: major/minor version, cpflags,
        // persistent_class, key_os_version, key_revision, unused = 20 bytes.
        let mut _skip = [0u8; 20];
        cursor.read_exact(&mut _skip)?;

        let root_tree_type = cursor.read_u32::<LittleEndian>()?;
        let extentref_tree_type = cursor.read_u32::<LittleEndian>()?;
        let snap_meta_tree_type = cursor.read_u32::<LittleEndian>()?;

        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let root_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let extentref_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let snap_meta_tree_oid = cursor.read_u64::<LittleEndian>()?;

        let revert_to_xid = cursor.read_u64::<LittleEndian>()?;
        let revert_to_sblock_oid = cursor.read_u64::<LittleEndian>()?;

        let next_obj_id = cursor.read_u64::<LittleEndian>()?;
        let num_files = cursor.read_u64::<LittleEndian>()?;
        let num_directories = cursor.read_u64::<LittleEndian>()?;
        let num_symlinks = cursor.read_u64::<LittleEndian>()?;
        let num_other_fsobjects = cursor.read_u64::<LittleEndian>()?;
        let num_snapshots = cursor.read_u64::<LittleEndian>()?;
        let total_blocks_alloced = cursor.read_u64::<LittleEndian>()?;
        let total_blocks_freed = cursor.read_u64::<LittleEndian>()?;

        let mut uuid = [0u8; 16];
        cursor.read_exact(&mut uuid)?;

        let last_mod_time = cursor.read_u64::<LittleEndian>()?;
        let fs_flags = cursor.read_u64::<LittleEndian>()?;

        // apfs_modified_by_t: 32-byte name + 8-byte timestamp + 8-byte last_xid.
        let mut _formatted_by = [0u8; 48];
        cursor.read_exact(&mut _formatted_by)?;

        let mut _modified_by = [0u8; 48];
        for _ in 0..8 {
            cursor.read_exact(&mut _modified_by)?;
        }

        let mut name_buf = [0u8; 256];
        cursor.read_exact(&mut name_buf)?;
        let volume_name = {
            let nul_pos = name_buf.iter().position(|&b| b == 0).unwrap_or(256);
            String::from_utf8_lossy(&name_buf[..nul_pos]).to_string()
        };

        if omap_oid == 0 || root_tree_oid == 0 {
            return Err(ApfsError::MalformedObject(
                "volume superblock has a zero omap or root tree oid".into(),
            ));
        }

        Ok(ApfsSuperblock {
            header,
            magic,
            fs_index,
            features,
            readonly_compatible_features,
            incompatible_features,
            unmount_time,
            fs_reserve_block_count,
            fs_quota_block_count,
            fs_alloc_count,
            root_tree_type,
            extentref_tree_type,
            snap_meta_tree_type,
            omap_oid,
            root_tree_oid,
            extentref_tree_oid,
            snap_meta_tree_oid,
            revert_to_xid,
            revert_to_sblock_oid,
            next_obj_id,
            num_files,
            num_directories,
            num_symlinks,
            num_other_fsobjects,
            num_snapshots,
            total_blocks_alloced,
            total_blocks_freed,
            uuid,
            last_mod_time,
            fs_flags,
            volume_name,
        })
    }
}

/// Read and parse the container superblock from block 0, probing the real
/// block size if it differs from the default 4 KiB guess.
pub fn read_nxsb(dev: &mut dyn BlockDevice) -> Result<NxSuperblock> {
    let probe = dev.read_block(0)?;
    if !fletcher::verify_object(&probe)? {
        return Err(ApfsError::ChecksumMismatch { paddr: 0 });
    }
    NxSuperblock::parse(&probe)
}
