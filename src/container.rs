//! Container mount (C8): ties the checkpoint scan, space manager, and
//! container object map together into the single entry point a volume
//! reader mounts against.

use crate::block_device::BlockDevice;
use crate::checkpoint::{self, EphemeralTable};
use crate::error::{ApfsError, Result};
use crate::object;
use crate::omap::{ObjectMap, OmapValue};
use crate::spaceman::SpaceManager;
use crate::superblock::{
    self, ApfsSuperblock, NxSuperblock, SUPPORTED_INCOMPAT_MASK, SUPPORTED_RO_COMPAT_MASK,
};

/// Options gating how `Container::mount` treats a container's feature bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// When set, unknown `ro_compat_features` bits are tolerated instead of
    /// rejected: a reader that never writes back doesn't care that it can't
    /// safely round-trip a read-only-compatible feature it doesn't
    /// understand. Unknown `incompat_features` bits are always rejected
    /// regardless of this flag.
    pub read_only: bool,
}

/// A mounted APFS container: the resolved checkpoint superblock, its
/// ephemeral objects, the block allocator, and the container object map.
pub struct Container<D: BlockDevice> {
    device: D,
    superblock: NxSuperblock,
    ephemeral: EphemeralTable,
    spaceman: SpaceManager,
    omap: ObjectMap,
}

impl<D: BlockDevice> Container<D> {
    /// Mount a container (§4.4):
    /// 1. read the resident superblock at block 0
    /// 2. reject unsupported incompatible feature bits (NX-4), and unknown
    ///    ro_compat bits unless `options.read_only` is set
    /// 3. scan the checkpoint descriptor ring for the latest valid checkpoint
    /// 4. load the space manager from the checkpoint's ephemeral table
    /// 5. load the container object map
    pub fn mount(mut device: D, options: MountOptions) -> Result<Self> {
        let sb0 = superblock::read_nxsb(&mut device)?;
        check_feature_gates(&sb0, options)?;

        let (superblock, ephemeral) = checkpoint::locate_latest_checkpoint(&mut device, &sb0)?;
        check_feature_gates(&superblock, options)?;

        let spaceman = SpaceManager::load(&mut device, &ephemeral, superblock.spaceman_oid)?;
        let omap = ObjectMap::load(&mut device, superblock.omap_oid)?;

        Ok(Container {
            device,
            superblock,
            ephemeral,
            spaceman,
            omap,
        })
    }

    pub fn superblock(&self) -> &NxSuperblock {
        &self.superblock
    }

    pub fn ephemeral(&self) -> &EphemeralTable {
        &self.ephemeral
    }

    /// OIDs of every mountable volume, in on-disk slot order.
    pub fn volumes(&self) -> Vec<u64> {
        self.superblock.fs_oids.iter().copied().filter(|&oid| oid != 0).collect()
    }

    /// Resolve a volume OID through the container object map and parse its
    /// superblock.
    pub fn volume_superblock(&mut self, vol_oid: u64) -> Result<ApfsSuperblock> {
        let target_xid = self.superblock.header.xid;
        let value = self
            .omap
            .resolve(&mut self.device, vol_oid, target_xid)?
            .ok_or(ApfsError::NoVolume)?;
        let (_header, block) = object::read_object(&mut self.device, value.paddr)?;
        ApfsSuperblock::parse(&block)
    }

    /// Resolve an arbitrary virtual OID through the container object map,
    /// as of `xid`.
    pub fn resolve(&mut self, oid: u64, xid: u64) -> Result<Option<OmapValue>> {
        self.omap.resolve(&mut self.device, oid, xid)
    }

    pub fn read_block(&mut self, paddr: u64) -> Result<Vec<u8>> {
        self.device.read_block(paddr)
    }

    pub fn spaceman(&mut self) -> &mut SpaceManager {
        &mut self.spaceman
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn close(mut self) -> Result<()> {
        self.device.close()
    }
}

/// NX-4: unknown `incompatible_features` bits are always rejected. Unknown
/// `readonly_compatible_features` bits are rejected too unless the mount is
/// read-only, in which case a reader with no write path doesn't need to
/// understand them to serve correct reads.
fn check_feature_gates(sb: &NxSuperblock, options: MountOptions) -> Result<()> {
    if sb.incompatible_features & !SUPPORTED_INCOMPAT_MASK != 0 {
        return Err(ApfsError::IncompatibleFeatures(sb.incompatible_features));
    }
    if !options.read_only && sb.readonly_compatible_features & !SUPPORTED_RO_COMPAT_MASK != 0 {
        return Err(ApfsError::IncompatibleFeatures(sb.readonly_compatible_features));
    }
    Ok(())
}
