//! File data reader (C11): walks a file's physical extents through a
//! [`BlockDevice`] and presents them as a contiguous byte stream.

use std::io::{Read, Seek, SeekFrom};

use crate::block_device::BlockDevice;
use crate::catalog::FileExtentVal;
use crate::error::Result;

/// Read file data from extents, streaming into `out`. Returns the number of
/// bytes written. Stops at `logical_size`, since the last extent is rounded
/// up to a block boundary and may carry trailing garbage past EOF.
pub fn read_file_data(
    dev: &mut dyn BlockDevice,
    extents: &[FileExtentVal],
    logical_size: u64,
    out: &mut Vec<u8>,
) -> Result<u64> {
    if logical_size == 0 {
        return Ok(0);
    }

    let block_size = dev.block_size() as u64;
    let mut bytes_written: u64 = 0;

    for extent in extents {
        if bytes_written >= logical_size {
            break;
        }

        let extent_length = extent.length();
        let mut extent_offset = 0u64;

        while extent_offset < extent_length && bytes_written < logical_size {
            let block_index = extent.phys_block_num + extent_offset / block_size;
            let block = dev.read_block(block_index)?;

            let offset_in_block = (extent_offset % block_size) as usize;
            let remaining_in_file = (logical_size - bytes_written) as usize;
            let remaining_in_extent = (extent_length - extent_offset) as usize;
            let remaining_in_block = block.len() - offset_in_block;
            let to_copy = remaining_in_file.min(remaining_in_extent).min(remaining_in_block);

            out.extend_from_slice(&block[offset_in_block..offset_in_block + to_copy]);
            bytes_written += to_copy as u64;
            extent_offset += to_copy as u64;
        }
    }

    Ok(bytes_written)
}

/// Presents a file's extents as a contiguous `Read + Seek` stream, pulling
/// blocks from a [`BlockDevice`] on demand rather than buffering the whole
/// file up front.
pub struct ApfsForkReader<'a> {
    dev: &'a mut dyn BlockDevice,
    logical_size: u64,
    /// `(logical_start, phys_block_num, length_bytes)`, contiguous runs
    /// sorted by logical offset.
    extent_map: Vec<(u64, u64, u64)>,
    position: u64,
}

impl<'a> ApfsForkReader<'a> {
    pub fn new(dev: &'a mut dyn BlockDevice, extents: Vec<FileExtentVal>, logical_size: u64) -> Self {
        let mut extent_map = Vec::new();
        let mut logical_offset = 0u64;

        for extent in &extents {
            let length = extent.length();
            if length == 0 {
                continue;
            }
            extent_map.push((logical_offset, extent.phys_block_num, length));
            logical_offset += length;
        }

        ApfsForkReader {
            dev,
            logical_size,
            extent_map,
            position: 0,
        }
    }

    fn locate(&self, logical_offset: u64) -> Option<(u64, u64, u64)> {
        self.extent_map
            .iter()
            .copied()
            .find(|&(log_start, _, length)| logical_offset >= log_start && logical_offset < log_start + length)
    }
}

impl Read for ApfsForkReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.logical_size {
            return Ok(0);
        }

        let remaining = (self.logical_size - self.position) as usize;
        let to_read = buf.len().min(remaining);
        if to_read == 0 {
            return Ok(0);
        }

        let block_size = self.dev.block_size() as u64;
        let mut total_read = 0;

        while total_read < to_read {
            let logical_pos = self.position + total_read as u64;
            let (log_start, phys_block_num, length) = self.locate(logical_pos).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "logical offset beyond extent map")
            })?;

            let offset_in_extent = logical_pos - log_start;
            let block_index = phys_block_num + offset_in_extent / block_size;
            let offset_in_block = (offset_in_extent % block_size) as usize;

            let block = self
                .dev
                .read_block(block_index)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

            let extent_remaining = (length - offset_in_extent) as usize;
            let block_remaining = block.len() - offset_in_block;
            let chunk_size = (to_read - total_read).min(extent_remaining).min(block_remaining);

            buf[total_read..total_read + chunk_size]
                .copy_from_slice(&block[offset_in_block..offset_in_block + chunk_size]);
            total_read += chunk_size;
        }

        self.position += total_read as u64;
        Ok(total_read)
    }
}

impl Seek for ApfsForkReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.logical_size as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek before start of file"));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemBlockDevice;

    fn extent(phys_block_num: u64, length: u64) -> FileExtentVal {
        FileExtentVal {
            flags_and_length: length & 0x00FF_FFFF_FFFF_FFFF,
            phys_block_num,
            crypto_id: 0,
        }
    }

    fn fill_block(dev: &mut MemBlockDevice, block: u64, byte: u8) {
        let data = vec![byte; dev.block_size() as usize];
        dev.write_block(block, &data).unwrap();
    }

    #[test]
    fn read_file_data_spans_multiple_extents() {
        let mut dev = MemBlockDevice::new(512, 16);
        fill_block(&mut dev, 1, 0xAA);
        fill_block(&mut dev, 2, 0xBB);
        fill_block(&mut dev, 5, 0xCC);

        let extents = vec![extent(1, 1024), extent(5, 512)];
        let mut out = Vec::new();
        let written = read_file_data(&mut dev, &extents, 1200, &mut out).unwrap();

        assert_eq!(written, 1200);
        assert_eq!(out.len(), 1200);
        assert!(out[..512].iter().all(|&b| b == 0xAA));
        assert!(out[512..1024].iter().all(|&b| b == 0xBB));
        assert!(out[1024..1200].iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn read_file_data_stops_at_logical_size() {
        let mut dev = MemBlockDevice::new(512, 8);
        fill_block(&mut dev, 0, 0x11);

        let extents = vec![extent(0, 512)];
        let mut out = Vec::new();
        let written = read_file_data(&mut dev, &extents, 200, &mut out).unwrap();
        assert_eq!(written, 200);
        assert_eq!(out.len(), 200);
    }

    #[test]
    fn fork_reader_supports_seek_and_partial_reads() {
        let mut dev = MemBlockDevice::new(512, 8);
        fill_block(&mut dev, 0, 0x01);
        fill_block(&mut dev, 1, 0x02);

        let extents = vec![extent(0, 1024)];
        let mut reader = ApfsForkReader::new(&mut dev, extents, 1024);

        let mut buf = [0u8; 16];
        reader.seek(SeekFrom::Start(510)).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert!(buf[..2].iter().all(|&b| b == 0x01));
        assert!(buf[2..].iter().all(|&b| b == 0x02));
    }

    #[test]
    fn fork_reader_reports_eof_past_logical_size() {
        let mut dev = MemBlockDevice::new(512, 8);
        fill_block(&mut dev, 0, 0x01);

        let extents = vec![extent(0, 512)];
        let mut reader = ApfsForkReader::new(&mut dev, extents, 512);
        reader.seek(SeekFrom::Start(512)).unwrap();

        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    }
}
