//! Fletcher-64 checksum used by APFS (C2).
//!
//! Every on-disk object has a 64-bit checksum at offset 0, computed over
//! bytes 8..block_size with the checksum field itself treated as zero.

use crate::error::{ApfsError, Result};

const MOD_VAL: u64 = 0xFFFF_FFFF;
const CHUNK_WORDS: usize = 1024;

/// Compute the APFS Fletcher-64 checksum over a byte slice.
///
/// `data` must have a length that is a multiple of 4; each 4-byte group is
/// read as a little-endian `u32` word. Reduction happens every 1024 words
/// (matching the reference algorithm's chunking) as well as once more at
/// the end, which is numerically equivalent to reducing after every word.
pub fn fletcher64(data: &[u8]) -> Result<u64> {
    if data.len() % 4 != 0 {
        return Err(ApfsError::MalformedObject(format!(
            "fletcher64 input length {} is not a multiple of 4",
            data.len()
        )));
    }

    let mut sum1: u64 = 0;
    let mut sum2: u64 = 0;

    for chunk in data.chunks(4 * CHUNK_WORDS) {
        for word in chunk.chunks_exact(4) {
            let w = u32::from_le_bytes([word[0], word[1], word[2], word[3]]) as u64;
            sum1 += w;
            sum2 += sum1;
        }
        sum1 %= MOD_VAL;
        sum2 %= MOD_VAL;
    }

    let ck_low = MOD_VAL - ((sum1 + sum2) % MOD_VAL);
    let ck_high = MOD_VAL - ((sum1 + ck_low) % MOD_VAL);

    Ok(ck_low | (ck_high << 32))
}

/// Verify the Fletcher-64 checksum of an on-disk object block.
///
/// The block's first 8 bytes hold the stored checksum; the checksum is
/// computed over the remainder of the block (bytes 8..).
pub fn verify_object(block: &[u8]) -> Result<bool> {
    if block.len() < 8 {
        return Err(ApfsError::MalformedObject(format!(
            "block too short to hold a checksum: {} bytes",
            block.len()
        )));
    }
    let stored = u64::from_le_bytes(block[0..8].try_into().unwrap());
    let computed = fletcher64(&block[8..])?;
    Ok(stored == computed)
}

/// Compute and embed a checksum into a block in place, writing bytes 0..8.
/// After this call `verify_object(block)` returns `Ok(true)`.
pub fn embed_checksum(block: &mut [u8]) -> Result<()> {
    if block.len() < 8 {
        return Err(ApfsError::MalformedObject(format!(
            "block too short to hold a checksum: {} bytes",
            block.len()
        )));
    }
    block[0..8].copy_from_slice(&[0u8; 8]);
    let checksum = fletcher64(&block[8..])?;
    block[0..8].copy_from_slice(&checksum.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_generate_then_verify() {
        let mut block = vec![0u8; 64];
        for (i, b) in block.iter_mut().enumerate().skip(8) {
            *b = i as u8;
        }
        embed_checksum(&mut block).unwrap();
        assert!(verify_object(&block).unwrap());
    }

    #[test]
    fn flipping_a_bit_breaks_verification() {
        let mut block = vec![0u8; 64];
        for (i, b) in block.iter_mut().enumerate().skip(8) {
            *b = i as u8;
        }
        embed_checksum(&mut block).unwrap();
        block[40] ^= 0x01;
        assert!(!verify_object(&block).unwrap());
    }

    #[test]
    fn rejects_non_multiple_of_four() {
        let data = vec![0u8; 7];
        assert!(matches!(fletcher64(&data), Err(ApfsError::MalformedObject(_))));
    }

    #[test]
    fn chunk_boundary_matches_naive_reduction() {
        // Exercise the >1024-word chunking path and confirm it still
        // round-trips through embed/verify.
        let mut block = vec![0u8; 8 + 4 * 2000];
        for (i, b) in block.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        embed_checksum(&mut block).unwrap();
        assert!(verify_object(&block).unwrap());
    }
}
