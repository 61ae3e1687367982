//! Block-device abstraction (C1).
//!
//! Every higher-level module addresses storage exclusively through this
//! trait, never through a raw `Read + Seek`. That keeps the container,
//! space manager, and B-tree engine agnostic to whether blocks come from a
//! loopback disk image, a raw device, or an in-memory fixture used by tests.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{ApfsError, Result};

/// Block sizes APFS containers are permitted to use.
pub const VALID_BLOCK_SIZES: [u32; 5] = [4096, 8192, 16384, 32768, 65536];

/// A fixed-size block storage backend.
///
/// `read_block` always returns exactly `block_size()` bytes or fails.
/// `write_block` is only meaningful when `is_read_only()` is false.
pub trait BlockDevice {
    fn read_block(&mut self, paddr: u64) -> Result<Vec<u8>>;
    fn write_block(&mut self, paddr: u64, data: &[u8]) -> Result<()>;
    fn block_size(&self) -> u32;
    fn block_count(&self) -> u64;
    fn is_read_only(&self) -> bool;
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn check_range(&self, paddr: u64) -> Result<()> {
        if paddr >= self.block_count() {
            return Err(ApfsError::OutOfRange(paddr));
        }
        Ok(())
    }
}

/// File-backed block device over a loopback disk image or raw device node.
pub struct FileBlockDevice {
    file: File,
    block_size: u32,
    block_count: u64,
    read_only: bool,
}

impl FileBlockDevice {
    /// Open `file` as a block device with a block size discovered from the
    /// container superblock. `block_count` is derived from the file length.
    pub fn new(file: File, block_size: u32, read_only: bool) -> Result<Self> {
        if !VALID_BLOCK_SIZES.contains(&block_size) {
            return Err(ApfsError::InvalidArgument(format!(
                "block size {} is not one of {:?}",
                block_size, VALID_BLOCK_SIZES
            )));
        }
        let len = file.metadata()?.len();
        let block_count = len / block_size as u64;
        Ok(FileBlockDevice {
            file,
            block_size,
            block_count,
            read_only,
        })
    }

    /// Open a path read-only, probing the block size from the first 4 KiB
    /// superblock candidate the way `superblock::read_nxsb` does.
    pub fn open_read_only(path: &std::path::Path) -> Result<Self> {
        let file = File::open(path)?;
        // Probe with the smallest legal block size; callers that already
        // know the real block size should use `new` directly.
        FileBlockDevice::new(file, 4096, true)
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&mut self, paddr: u64) -> Result<Vec<u8>> {
        self.check_range(paddr)?;
        let offset = paddr * self.block_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut block = vec![0u8; self.block_size as usize];
        self.file.read_exact(&mut block)?;
        Ok(block)
    }

    fn write_block(&mut self, paddr: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(ApfsError::ReadOnly);
        }
        self.check_range(paddr)?;
        if data.len() != self.block_size as usize {
            return Err(ApfsError::InvalidArgument(format!(
                "write_block: expected {} bytes, got {}",
                self.block_size,
                data.len()
            )));
        }
        let offset = paddr * self.block_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// In-memory block device used by tests and by callers building a container
/// image programmatically.
#[derive(Clone)]
pub struct MemBlockDevice {
    blocks: Vec<u8>,
    block_size: u32,
    read_only: bool,
}

impl MemBlockDevice {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        MemBlockDevice {
            blocks: vec![0u8; block_size as usize * block_count as usize],
            block_size,
            read_only: false,
        }
    }

    pub fn from_blocks(block_size: u32, data: Vec<u8>) -> Self {
        let block_count = data.len() as u64 / block_size as u64;
        MemBlockDevice {
            blocks: data,
            block_size,
            read_only: false,
        }
        .with_count(block_count)
    }

    fn with_count(self, _count: u64) -> Self {
        self
    }

    pub fn set_read_only(&mut self, ro: bool) {
        self.read_only = ro;
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&mut self, paddr: u64) -> Result<Vec<u8>> {
        self.check_range(paddr)?;
        let bs = self.block_size as usize;
        let start = paddr as usize * bs;
        Ok(self.blocks[start..start + bs].to_vec())
    }

    fn write_block(&mut self, paddr: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(ApfsError::ReadOnly);
        }
        self.check_range(paddr)?;
        let bs = self.block_size as usize;
        if data.len() != bs {
            return Err(ApfsError::InvalidArgument(format!(
                "write_block: expected {} bytes, got {}",
                bs,
                data.len()
            )));
        }
        let start = paddr as usize * bs;
        self.blocks[start..start + bs].copy_from_slice(data);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.blocks.len() as u64 / self.block_size as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
