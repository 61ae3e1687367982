//! Reusable B-tree key comparators (C9).
//!
//! The generic engine in [`crate::btree`] is comparator-agnostic; each tree
//! that lives on top of it supplies one of these.

use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::btree::Comparator;

/// OMAP key order: `(oid, xid)` lexicographic, both ascending (§3.5).
pub struct OmapComparator;

impl Comparator for OmapComparator {
    fn compare(&self, node_key: &[u8], search_key: &[u8]) -> Ordering {
        compare_oid_xid(node_key, search_key)
    }
}

fn compare_oid_xid(a: &[u8], b: &[u8]) -> Ordering {
    let mut ca = Cursor::new(a);
    let mut cb = Cursor::new(b);
    let (oid_a, xid_a) = (
        ca.read_u64::<LittleEndian>().unwrap_or(0),
        ca.read_u64::<LittleEndian>().unwrap_or(0),
    );
    let (oid_b, xid_b) = (
        cb.read_u64::<LittleEndian>().unwrap_or(0),
        cb.read_u64::<LittleEndian>().unwrap_or(0),
    );
    oid_a.cmp(&oid_b).then(xid_a.cmp(&xid_b))
}

/// Free-queue key order: `(xid, paddr)` lexicographic (§4.5.4).
pub struct FreeQueueComparator;

impl Comparator for FreeQueueComparator {
    fn compare(&self, node_key: &[u8], search_key: &[u8]) -> Ordering {
        let mut ca = Cursor::new(node_key);
        let mut cb = Cursor::new(search_key);
        let (xid_a, paddr_a) = (
            ca.read_u64::<LittleEndian>().unwrap_or(0),
            ca.read_u64::<LittleEndian>().unwrap_or(0),
        );
        let (xid_b, paddr_b) = (
            cb.read_u64::<LittleEndian>().unwrap_or(0),
            cb.read_u64::<LittleEndian>().unwrap_or(0),
        );
        xid_a.cmp(&xid_b).then(paddr_a.cmp(&paddr_b))
    }
}

/// Filesystem catalog key order: `obj_id_and_type` compound field, then a
/// type-specific tiebreaker (§3.7). `obj_id_and_type` packs a 60-bit OID in
/// the low bits and a 4-bit record type in the high nibble of the u64; APFS
/// orders records primarily by OID, then by type, then by payload.
pub struct CatalogComparator;

const OBJ_ID_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;
const OBJ_TYPE_SHIFT: u32 = 60;

impl Comparator for CatalogComparator {
    fn compare(&self, node_key: &[u8], search_key: &[u8]) -> Ordering {
        let a = parse_key(node_key);
        let b = parse_key(search_key);
        let (oid_a, type_a, tail_a) = a;
        let (oid_b, type_b, tail_b) = b;
        oid_a.cmp(&oid_b).then(type_a.cmp(&type_b)).then_with(|| tail_a.cmp(tail_b))
    }
}

fn parse_key(key: &[u8]) -> (u64, u8, &[u8]) {
    let raw = if key.len() >= 8 {
        u64::from_le_bytes(key[0..8].try_into().unwrap())
    } else {
        0
    };
    let oid = raw & OBJ_ID_MASK;
    let rec_type = (raw >> OBJ_TYPE_SHIFT) as u8;
    let tail = if key.len() > 8 { &key[8..] } else { &[] };
    (oid, rec_type, tail)
}

/// Pack `(oid, xid)` into an 8+8 byte OMAP key.
pub fn omap_key_bytes(oid: u64, xid: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&oid.to_le_bytes());
    buf.extend_from_slice(&xid.to_le_bytes());
    buf
}

/// Pack `(xid, paddr)` into an 8+8 byte free-queue key.
pub fn free_queue_key_bytes(xid: u64, paddr: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&xid.to_le_bytes());
    buf.extend_from_slice(&paddr.to_le_bytes());
    buf
}

/// Pack a catalog record's leading `obj_id_and_type` field plus an optional
/// type-specific tail (e.g. a drec's name) into a full key.
pub fn catalog_key_bytes(oid: u64, rec_type: u8, tail: &[u8]) -> Vec<u8> {
    let packed = (oid & OBJ_ID_MASK) | ((rec_type as u64) << OBJ_TYPE_SHIFT);
    let mut buf = Vec::with_capacity(8 + tail.len());
    buf.extend_from_slice(&packed.to_le_bytes());
    buf.extend_from_slice(tail);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omap_comparator_orders_by_oid_then_xid() {
        let a = omap_key_bytes(5, 1);
        let b = omap_key_bytes(5, 2);
        let c = omap_key_bytes(6, 1);
        assert_eq!(OmapComparator.compare(&a, &b), Ordering::Less);
        assert_eq!(OmapComparator.compare(&b, &c), Ordering::Less);
        assert_eq!(OmapComparator.compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn free_queue_comparator_orders_by_xid_then_paddr() {
        let a = free_queue_key_bytes(1, 100);
        let b = free_queue_key_bytes(1, 200);
        let c = free_queue_key_bytes(2, 0);
        assert_eq!(FreeQueueComparator.compare(&a, &b), Ordering::Less);
        assert_eq!(FreeQueueComparator.compare(&b, &c), Ordering::Less);
    }

    #[test]
    fn catalog_comparator_orders_by_oid_then_type() {
        let a = catalog_key_bytes(10, 3, b"");
        let b = catalog_key_bytes(10, 4, b"");
        let c = catalog_key_bytes(11, 0, b"");
        assert_eq!(CatalogComparator.compare(&a, &b), Ordering::Less);
        assert_eq!(CatalogComparator.compare(&b, &c), Ordering::Less);
    }

    #[test]
    fn catalog_comparator_breaks_ties_on_tail() {
        let a = catalog_key_bytes(10, 4, b"alice");
        let b = catalog_key_bytes(10, 4, b"bob");
        assert_eq!(CatalogComparator.compare(&a, &b), Ordering::Less);
    }
}
