//! Generic persistent B-tree engine (C6).
//!
//! A node is a single block laid out with a table-of-contents growing
//! forward from just after the header and key/value data growing backward
//! from the tail (§3.6). The engine is parameterized by a caller-supplied
//! key comparator (C9) and an optional child resolver for virtual trees,
//! and never embeds tree-specific key semantics itself.

use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::block_device::BlockDevice;
use crate::error::{ApfsError, Result};
use crate::object::{ObjectHeader, OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE, OBJ_PHYSICAL};

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;
pub const BTNODE_HASHED: u16 = 0x0008;
pub const BTNODE_NOHEADER: u16 = 0x0010;

pub const BTREE_UINT64_KEYS: u32 = 0x0001;
pub const BTREE_SEQUENTIAL_INSERT: u32 = 0x0002;
pub const BTREE_ALLOW_GHOSTS: u32 = 0x0004;
pub const BTREE_EPHEMERAL: u32 = 0x0008;
pub const BTREE_PHYSICAL: u32 = 0x0010;
pub const BTREE_NONPERSISTENT: u32 = 0x0020;
pub const BTREE_KV_NONALIGNED: u32 = 0x0040;
pub const BTREE_HASHED: u32 = 0x0080;
pub const BTREE_NOHEADER: u32 = 0x0100;

/// A comparator over raw key bytes, supplied by the tree's owner (C9).
/// `compare(node_key, search_key)`.
pub trait Comparator {
    fn compare(&self, node_key: &[u8], search_key: &[u8]) -> Ordering;
}

impl<F> Comparator for F
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    fn compare(&self, node_key: &[u8], search_key: &[u8]) -> Ordering {
        self(node_key, search_key)
    }
}

/// Resolves a B-tree child pointer to a physical block.
///
/// For a `PHYSICAL` tree the 8-byte pointer already is a PAddr. For a
/// virtual tree (the default filesystem trees) it is a virtual OID that
/// must be resolved through the owning object map.
pub trait ChildResolver {
    fn resolve(&mut self, dev: &mut dyn BlockDevice, child_ref: u64) -> Result<u64>;
}

/// Identity resolver for physical trees (e.g. the container OMAP itself).
pub struct PhysicalResolver;

impl ChildResolver for PhysicalResolver {
    fn resolve(&mut self, _dev: &mut dyn BlockDevice, child_ref: u64) -> Result<u64> {
        Ok(child_ref)
    }
}

/// Allocates and frees blocks for copy-on-write B-tree mutation (C5's
/// interface as seen by the engine).
pub trait BlockAllocator {
    fn allocate(&mut self, dev: &mut dyn BlockDevice) -> Result<u64>;
    fn free(&mut self, dev: &mut dyn BlockDevice, paddr: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Nloc {
    off: u16,
    len: u16,
}

/// B-tree node header — 24 bytes immediately after the object header.
#[derive(Debug, Clone)]
pub struct BTreeNodeHeader {
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    table_space: Nloc,
    free_space: Nloc,
    key_free_list: Nloc,
    val_free_list: Nloc,
}

impl BTreeNodeHeader {
    pub const SIZE: usize = 24;

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::InvalidBTree("btree node header too short".into()));
        }
        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u16::<LittleEndian>()?;
        let level = cursor.read_u16::<LittleEndian>()?;
        let nkeys = cursor.read_u32::<LittleEndian>()?;
        let read_nloc = |c: &mut Cursor<&[u8]>| -> Result<Nloc> {
            Ok(Nloc {
                off: c.read_u16::<LittleEndian>()?,
                len: c.read_u16::<LittleEndian>()?,
            })
        };
        Ok(BTreeNodeHeader {
            flags,
            level,
            nkeys,
            table_space: read_nloc(&mut cursor)?,
            free_space: read_nloc(&mut cursor)?,
            key_free_list: read_nloc(&mut cursor)?,
            val_free_list: read_nloc(&mut cursor)?,
        })
    }

    fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.flags.to_le_bytes());
        buf[2..4].copy_from_slice(&self.level.to_le_bytes());
        buf[4..8].copy_from_slice(&self.nkeys.to_le_bytes());
        let put_nloc = |buf: &mut [u8], off: usize, n: Nloc| {
            buf[off..off + 2].copy_from_slice(&n.off.to_le_bytes());
            buf[off + 2..off + 4].copy_from_slice(&n.len.to_le_bytes());
        };
        put_nloc(&mut buf, 8, self.table_space);
        put_nloc(&mut buf, 12, self.free_space);
        put_nloc(&mut buf, 16, self.key_free_list);
        put_nloc(&mut buf, 20, self.val_free_list);
        buf
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    pub fn is_fixed_kv(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }
}

/// `btree_info_t` — 40 bytes trailing a root node (BT-5).
#[derive(Debug, Clone, Copy)]
pub struct BTreeInfo {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BTreeInfo {
    pub const SIZE: usize = 40;

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::InvalidBTree("btree info too short".into()));
        }
        let mut cursor = Cursor::new(data);
        Ok(BTreeInfo {
            flags: cursor.read_u32::<LittleEndian>()?,
            node_size: cursor.read_u32::<LittleEndian>()?,
            key_size: cursor.read_u32::<LittleEndian>()?,
            val_size: cursor.read_u32::<LittleEndian>()?,
            longest_key: cursor.read_u32::<LittleEndian>()?,
            longest_val: cursor.read_u32::<LittleEndian>()?,
            key_count: cursor.read_u64::<LittleEndian>()?,
            node_count: cursor.read_u64::<LittleEndian>()?,
        })
    }

    fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..8].copy_from_slice(&self.node_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.key_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.val_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.longest_key.to_le_bytes());
        buf[20..24].copy_from_slice(&self.longest_val.to_le_bytes());
        buf[24..32].copy_from_slice(&self.key_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.node_count.to_le_bytes());
        buf
    }

    pub fn is_physical(&self) -> bool {
        self.flags & BTREE_PHYSICAL != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct TocEntry {
    key_off: u16,
    key_len: u16,
    val_off: u16,
    val_len: u16,
}

/// A parsed B-tree node with its table of contents resolved against the
/// underlying block bytes.
#[derive(Clone)]
pub struct BTreeNode {
    pub header: ObjectHeader,
    pub node_header: BTreeNodeHeader,
    toc: Vec<TocEntry>,
    data: Vec<u8>,
    key_area_off: usize,
    val_area_end: usize,
    pub info: Option<BTreeInfo>,
}

impl BTreeNode {
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let node_header = BTreeNodeHeader::parse(&block[ObjectHeader::SIZE..])?;

        if node_header.level == 0 && !node_header.is_leaf() {
            return Err(ApfsError::InvalidBTree(
                "level 0 node must carry the LEAF flag (BT-1)".into(),
            ));
        }
        if node_header.level != 0 && node_header.is_leaf() {
            return Err(ApfsError::InvalidBTree(
                "non-zero level node must not carry the LEAF flag (BT-1)".into(),
            ));
        }

        let toc_start =
            ObjectHeader::SIZE + BTreeNodeHeader::SIZE + node_header.table_space.off as usize;
        let fixed_kv = node_header.is_fixed_kv();

        let key_area_off = toc_start + node_header.table_space.len as usize;

        let info = if node_header.is_root() {
            if block.len() < BTreeInfo::SIZE {
                return Err(ApfsError::InvalidBTree("root node too small for btree_info".into()));
            }
            Some(BTreeInfo::parse(&block[block.len() - BTreeInfo::SIZE..])?)
        } else {
            None
        };

        let val_area_end = if node_header.is_root() {
            block.len() - BTreeInfo::SIZE
        } else {
            block.len()
        };

        let mut toc = Vec::with_capacity(node_header.nkeys as usize);
        let mut cursor = Cursor::new(&block[toc_start..]);
        for _ in 0..node_header.nkeys {
            if fixed_kv {
                let key_off = cursor.read_u16::<LittleEndian>()?;
                let val_off = cursor.read_u16::<LittleEndian>()?;
                toc.push(TocEntry {
                    key_off,
                    key_len: 0,
                    val_off,
                    val_len: 0,
                });
            } else {
                let key_off = cursor.read_u16::<LittleEndian>()?;
                let key_len = cursor.read_u16::<LittleEndian>()?;
                let val_off = cursor.read_u16::<LittleEndian>()?;
                let val_len = cursor.read_u16::<LittleEndian>()?;
                toc.push(TocEntry {
                    key_off,
                    key_len,
                    val_off,
                    val_len,
                });
            }
        }

        Ok(BTreeNode {
            header,
            node_header,
            toc,
            data: block.to_vec(),
            key_area_off,
            val_area_end,
            info,
        })
    }

    fn fixed_sizes(&self, fallback_key: u32, fallback_val: u32) -> (u32, u32) {
        match &self.info {
            Some(info) if info.key_size > 0 || info.val_size > 0 => (
                if info.key_size > 0 { info.key_size } else { fallback_key },
                if info.val_size > 0 { info.val_size } else { fallback_val },
            ),
            _ => (fallback_key, fallback_val),
        }
    }

    pub fn key(&self, index: usize, fixed_key_size: u32) -> Result<&[u8]> {
        let entry = self.toc[index];
        let start = self.key_area_off + entry.key_off as usize;
        let len = if self.node_header.is_fixed_kv() {
            fixed_key_size as usize
        } else {
            entry.key_len as usize
        };
        let end = start + len;
        if end > self.data.len() {
            return Err(ApfsError::InvalidBTree(format!(
                "key out of bounds: start={start}, len={len}, block_size={}",
                self.data.len()
            )));
        }
        Ok(&self.data[start..end])
    }

    pub fn raw_value(&self, index: usize, fixed_val_size: u32) -> Result<&[u8]> {
        let entry = self.toc[index];
        let len = if !self.node_header.is_leaf() {
            8
        } else if self.node_header.is_fixed_kv() {
            fixed_val_size as usize
        } else {
            entry.val_len as usize
        };
        let val_off = entry.val_off as usize;
        if val_off > self.val_area_end {
            return Err(ApfsError::InvalidBTree("value offset beyond node tail".into()));
        }
        let start = self.val_area_end - val_off;
        let end = start + len;
        if end > self.data.len() || start < self.key_area_off {
            return Err(ApfsError::InvalidBTree(format!(
                "value out of bounds: start={start}, len={len}, val_area_end={}",
                self.val_area_end
            )));
        }
        Ok(&self.data[start..end])
    }

    pub fn child_ref(&self, index: usize) -> Result<u64> {
        let val = self.raw_value(index, 8)?;
        if val.len() < 8 {
            return Err(ApfsError::InvalidBTree("child pointer too short".into()));
        }
        Ok(u64::from_le_bytes(val[0..8].try_into().unwrap()))
    }

    pub fn nkeys(&self) -> usize {
        self.node_header.nkeys as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.node_header.is_leaf()
    }

    pub fn is_physical_tree(&self) -> bool {
        self.info.map(|i| i.is_physical()).unwrap_or(false)
    }
}

fn read_node(dev: &mut dyn BlockDevice, paddr: u64) -> Result<BTreeNode> {
    let (_header, block) = crate::object::read_object(dev, paddr)?;
    BTreeNode::parse(&block)
}

/// Binary search a node's keys for `search_key`. Returns `(index, exact)`
/// where `index` is the last position whose key is `<= search_key` (or
/// `None` if every key is greater), and `exact` indicates an equal match.
fn binary_search(
    node: &BTreeNode,
    fixed_key_size: u32,
    cmp: &dyn Comparator,
    search_key: &[u8],
) -> Result<(Option<usize>, bool)> {
    let n = node.nkeys();
    if n == 0 {
        return Ok((None, false));
    }
    let (mut lo, mut hi) = (0usize, n); // hi exclusive, invariant: keys[0..lo] <= search_key
    let mut exact_at: Option<usize> = None;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let key = node.key(mid, fixed_key_size)?;
        match cmp.compare(key, search_key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Equal => {
                exact_at = Some(mid);
                lo = mid + 1; // keep scanning right in case of duplicate keys; last wins
            }
            Ordering::Greater => hi = mid,
        }
    }
    let idx = if lo == 0 { None } else { Some(lo - 1) };
    Ok((idx, exact_at.is_some()))
}

/// Resolve a key to its value, descending from `root_paddr` (§4.6.3).
pub fn lookup(
    dev: &mut dyn BlockDevice,
    root_paddr: u64,
    fixed_key_size: u32,
    fixed_val_size: u32,
    cmp: &dyn Comparator,
    resolver: &mut dyn ChildResolver,
    search_key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let mut node = read_node(dev, root_paddr)?;
    let (fks, fvs) = node.fixed_sizes(fixed_key_size, fixed_val_size);
    let (mut fks, mut fvs) = (fks, fvs);

    loop {
        let (idx, exact) = binary_search(&node, fks, cmp, search_key)?;
        if node.is_leaf() {
            return match (idx, exact) {
                (Some(i), true) => Ok(Some(node.raw_value(i, fvs)?.to_vec())),
                _ => Ok(None),
            };
        }
        let child_idx = match idx {
            Some(i) => i,
            None => return Ok(None),
        };
        let child_ref = node.child_ref(child_idx)?;
        let child_paddr = resolver.resolve(dev, child_ref)?;
        let child = read_node(dev, child_paddr)?;
        let (nfks, nfvs) = child.fixed_sizes(fixed_key_size, fixed_val_size);
        fks = nfks;
        fvs = nfvs;
        node = child;
    }
}

/// Depth-first range scan over `[start_key, end_key]` inclusive, producing
/// results in ascending key order (§4.6.4). Bounds of `None` are open.
pub fn range(
    dev: &mut dyn BlockDevice,
    root_paddr: u64,
    fixed_key_size: u32,
    fixed_val_size: u32,
    cmp: &dyn Comparator,
    resolver: &mut dyn ChildResolver,
    start_key: Option<&[u8]>,
    end_key: Option<&[u8]>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut results = Vec::new();
    let node = read_node(dev, root_paddr)?;
    let (fks, fvs) = node.fixed_sizes(fixed_key_size, fixed_val_size);
    range_node(
        dev, &node, fks, fvs, cmp, resolver, start_key, end_key, &mut results,
    )?;
    Ok(results)
}

#[allow(clippy::too_many_arguments)]
fn range_node(
    dev: &mut dyn BlockDevice,
    node: &BTreeNode,
    fixed_key_size: u32,
    fixed_val_size: u32,
    cmp: &dyn Comparator,
    resolver: &mut dyn ChildResolver,
    start_key: Option<&[u8]>,
    end_key: Option<&[u8]>,
    results: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<()> {
    if node.is_leaf() {
        for i in 0..node.nkeys() {
            let key = node.key(i, fixed_key_size)?;
            if let Some(start) = start_key {
                if cmp.compare(key, start) == Ordering::Less {
                    continue;
                }
            }
            if let Some(end) = end_key {
                if cmp.compare(key, end) == Ordering::Greater {
                    break;
                }
            }
            let val = node.raw_value(i, fixed_val_size)?.to_vec();
            results.push((key.to_vec(), val));
        }
        return Ok(());
    }

    for i in 0..node.nkeys() {
        let key = node.key(i, fixed_key_size)?;
        // Prune subtrees whose interval lies wholly left of start_key: a
        // child at index i covers [key_i, key_{i+1}); it's safe to skip
        // while the *next* key is still <= start_key.
        if let Some(start) = start_key {
            if i + 1 < node.nkeys() {
                let next_key = node.key(i + 1, fixed_key_size)?;
                if cmp.compare(next_key, start) != Ordering::Greater {
                    continue;
                }
            }
        }
        if let Some(end) = end_key {
            if cmp.compare(key, end) == Ordering::Greater {
                break;
            }
        }
        let child_ref = node.child_ref(i)?;
        let child_paddr = resolver.resolve(dev, child_ref)?;
        let child = read_node(dev, child_paddr)?;
        let (cfks, cfvs) = child.fixed_sizes(fixed_key_size, fixed_val_size);
        range_node(
            dev, &child, cfks, cfvs, cmp, resolver, start_key, end_key, results,
        )?;
    }
    Ok(())
}

/// A restartable cursor over a range scan (§4.6.4). Holds a path of
/// `(node, next_index)` frames so iteration can resume without re-walking
/// from the root on every call.
pub struct RangeCursor {
    stack: Vec<(BTreeNode, usize)>,
    fixed_key_size: u32,
    fixed_val_size: u32,
    end_key: Option<Vec<u8>>,
    done: bool,
}

impl RangeCursor {
    pub fn new(
        dev: &mut dyn BlockDevice,
        root_paddr: u64,
        fixed_key_size: u32,
        fixed_val_size: u32,
        end_key: Option<&[u8]>,
    ) -> Result<Self> {
        let root = read_node(dev, root_paddr)?;
        let (fks, fvs) = root.fixed_sizes(fixed_key_size, fixed_val_size);
        Ok(RangeCursor {
            stack: vec![(root, 0)],
            fixed_key_size: fks,
            fixed_val_size: fvs,
            end_key: end_key.map(|k| k.to_vec()),
            done: false,
        })
    }

    pub fn next(
        &mut self,
        dev: &mut dyn BlockDevice,
        cmp: &dyn Comparator,
        resolver: &mut dyn ChildResolver,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let (node, idx) = match self.stack.last_mut() {
                Some(frame) => frame,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };

            if *idx >= node.nkeys() {
                self.stack.pop();
                continue;
            }

            if node.is_leaf() {
                let key = node.key(*idx, self.fixed_key_size)?.to_vec();
                if let Some(end) = &self.end_key {
                    if cmp.compare(&key, end) == Ordering::Greater {
                        self.done = true;
                        return Ok(None);
                    }
                }
                let val = node.raw_value(*idx, self.fixed_val_size)?.to_vec();
                *idx += 1;
                return Ok(Some((key, val)));
            } else {
                let child_ref = node.child_ref(*idx)?;
                *idx += 1;
                let child_paddr = resolver.resolve(dev, child_ref)?;
                let child = read_node(dev, child_paddr)?;
                let (cfks, cfvs) = child.fixed_sizes(self.fixed_key_size, self.fixed_val_size);
                self.fixed_key_size = cfks;
                self.fixed_val_size = cfvs;
                self.stack.push((child, 0));
            }
        }
    }
}

// ---------------------------------------------------------------------
// Node construction (used by insert/split and by tests)
// ---------------------------------------------------------------------

/// Build the bytes of a leaf or internal node from an ordered slice of
/// `(key, value)` entries. Internal-node "values" must be 8-byte child
/// refs. `info` is attached only when `is_root` is true (BT-5).
#[allow(clippy::too_many_arguments)]
pub fn build_node(
    block_size: u32,
    oid: u64,
    xid: u64,
    subtype: u32,
    level: u16,
    is_root: bool,
    fixed_kv: Option<(u32, u32)>,
    storage_flags: u32,
    entries: &[(&[u8], &[u8])],
    info_flags: u32,
) -> Result<Vec<u8>> {
    let mut flags = 0u16;
    if is_root {
        flags |= BTNODE_ROOT;
    }
    if level == 0 {
        flags |= BTNODE_LEAF;
    }
    if fixed_kv.is_some() {
        flags |= BTNODE_FIXED_KV_SIZE;
    }

    let block_size = block_size as usize;
    let info_size = if is_root { BTreeInfo::SIZE } else { 0 };
    let mut block = vec![0u8; block_size];

    let toc_entry_size = if fixed_kv.is_some() { 4 } else { 8 };
    let toc_len = entries.len() * toc_entry_size;
    let toc_start = ObjectHeader::SIZE + BTreeNodeHeader::SIZE;

    let key_area_off = toc_start + toc_len;
    let val_area_end = block_size - info_size;

    let mut key_cursor = key_area_off;
    let mut val_cursor_from_end = 0usize; // grows as values are appended from the tail

    let mut toc_bytes = Vec::with_capacity(toc_len);
    let mut longest_key = 0u32;
    let mut longest_val = 0u32;

    for (key, value) in entries {
        let key_off = key_cursor - key_area_off;
        block[key_cursor..key_cursor + key.len()].copy_from_slice(key);
        key_cursor += key.len();
        longest_key = longest_key.max(key.len() as u32);

        val_cursor_from_end += value.len();
        let val_start = val_area_end - val_cursor_from_end;
        block[val_start..val_start + value.len()].copy_from_slice(value);
        let val_off = val_cursor_from_end;
        longest_val = longest_val.max(value.len() as u32);

        if fixed_kv.is_some() {
            toc_bytes.extend_from_slice(&(key_off as u16).to_le_bytes());
            toc_bytes.extend_from_slice(&(val_off as u16).to_le_bytes());
        } else {
            toc_bytes.extend_from_slice(&(key_off as u16).to_le_bytes());
            toc_bytes.extend_from_slice(&(key.len() as u16).to_le_bytes());
            toc_bytes.extend_from_slice(&(val_off as u16).to_le_bytes());
            toc_bytes.extend_from_slice(&(value.len() as u16).to_le_bytes());
        }
    }

    if key_cursor > val_area_end - val_cursor_from_end {
        return Err(ApfsError::InvalidBTree(
            "entries do not fit in one node (caller must split)".into(),
        ));
    }

    block[toc_start..toc_start + toc_len].copy_from_slice(&toc_bytes);

    let free_space_off = toc_len;
    let free_space_len = (val_area_end - val_cursor_from_end)
        .saturating_sub(key_area_off + (key_cursor - key_area_off)) as u16;

    let node_header = BTreeNodeHeader {
        flags,
        level,
        nkeys: entries.len() as u32,
        table_space: Nloc { off: 0, len: toc_len as u16 },
        free_space: Nloc {
            off: free_space_off as u16,
            len: free_space_len,
        },
        key_free_list: Nloc { off: 0, len: 0 },
        val_free_list: Nloc { off: 0, len: 0 },
    };
    block[ObjectHeader::SIZE..ObjectHeader::SIZE + BTreeNodeHeader::SIZE]
        .copy_from_slice(&node_header.serialize());

    if is_root {
        let (key_size, val_size) = fixed_kv.unwrap_or((0, 0));
        let info = BTreeInfo {
            flags: info_flags,
            node_size: block_size as u32,
            key_size,
            val_size,
            longest_key,
            longest_val,
            key_count: entries.len() as u64,
            node_count: 1,
        };
        block[block_size - BTreeInfo::SIZE..].copy_from_slice(&info.serialize());
    }

    let obj_type = if is_root { OBJECT_TYPE_BTREE } else { OBJECT_TYPE_BTREE_NODE };
    let header = ObjectHeader {
        checksum: 0,
        oid,
        xid,
        type_and_flags: storage_flags | obj_type,
        subtype,
    };
    block[0..ObjectHeader::SIZE].copy_from_slice(&header.serialize());
    crate::fletcher::embed_checksum(&mut block)?;

    Ok(block)
}

/// Conservative fit check: does this entry set (plus header/toc/info
/// overhead) pack into one node of `block_size`?
fn fits(block_size: u32, is_root: bool, entries: &[(&[u8], &[u8])], fixed_kv: bool) -> bool {
    let toc_entry_size = if fixed_kv { 4 } else { 8 };
    let toc_len = entries.len() * toc_entry_size;
    let kv_len: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
    let overhead =
        ObjectHeader::SIZE + BTreeNodeHeader::SIZE + if is_root { BTreeInfo::SIZE } else { 0 };
    overhead + toc_len + kv_len <= block_size as usize
}

/// Insert `(key, value)` into the tree rooted at `root_paddr`, performing
/// copy-on-write and splitting as needed (§4.6.5, BTO-1..3). Returns the
/// new root's physical address. This engine only ever allocates and
/// addresses physical storage; a caller using it for a virtual-OID tree
/// must re-register the new root address with its object map itself.
#[allow(clippy::too_many_arguments)]
pub fn insert(
    dev: &mut dyn BlockDevice,
    alloc: &mut dyn BlockAllocator,
    root_paddr: u64,
    fixed_key_size: u32,
    fixed_val_size: u32,
    cmp: &dyn Comparator,
    resolver: &mut dyn ChildResolver,
    key: &[u8],
    value: &[u8],
    oid: u64,
    xid: u64,
) -> Result<u64> {
    let root = read_node(dev, root_paddr)?;
    let fixed_kv = root.node_header.is_fixed_kv();
    let subtype = root.header.subtype;
    let storage_flags = root.header.type_and_flags & OBJ_PHYSICAL;
    let info_flags = root.info.map(|i| i.flags).unwrap_or(0);

    let result = insert_into(
        dev,
        alloc,
        &root,
        fixed_key_size,
        fixed_val_size,
        cmp,
        resolver,
        key,
        value,
        xid,
        subtype,
        storage_flags,
        fixed_kv,
    )?;

    match result {
        InsertOutcome::Updated(new_paddr) => Ok(new_paddr),
        InsertOutcome::Split(left_paddr, sep_key, right_paddr) => {
            let left_ref = left_paddr.to_le_bytes();
            let right_ref = right_paddr.to_le_bytes();
            let entries: Vec<(&[u8], &[u8])> =
                vec![(sep_key.as_slice(), &left_ref), (&[], &right_ref)];
            let new_root_paddr = alloc.allocate(dev)?;
            let new_level = root.node_header.level + 1;
            let block = build_node(
                dev.block_size(),
                oid,
                xid,
                subtype,
                new_level,
                true,
                Some((fixed_key_size, 8)),
                storage_flags,
                &entries,
                info_flags,
            )?;
            dev.write_block(new_root_paddr, &block)?;
            Ok(new_root_paddr)
        }
    }
}

enum InsertOutcome {
    Updated(u64),
    Split(u64, Vec<u8>, u64),
}

#[allow(clippy::too_many_arguments)]
fn insert_into(
    dev: &mut dyn BlockDevice,
    alloc: &mut dyn BlockAllocator,
    node: &BTreeNode,
    fixed_key_size: u32,
    fixed_val_size: u32,
    cmp: &dyn Comparator,
    resolver: &mut dyn ChildResolver,
    key: &[u8],
    value: &[u8],
    xid: u64,
    subtype: u32,
    storage_flags: u32,
    fixed_kv: bool,
) -> Result<InsertOutcome> {
    let (fks, fvs) = node.fixed_sizes(fixed_key_size, fixed_val_size);

    if node.is_leaf() {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(node.nkeys() + 1);
        let mut inserted = false;
        for i in 0..node.nkeys() {
            let k = node.key(i, fks)?.to_vec();
            let v = node.raw_value(i, fvs)?.to_vec();
            if !inserted {
                match cmp.compare(&k, key) {
                    Ordering::Greater => {
                        entries.push((key.to_vec(), value.to_vec()));
                        inserted = true;
                    }
                    Ordering::Equal => {
                        entries.push((key.to_vec(), value.to_vec()));
                        inserted = true;
                        continue; // overwrite: drop the old value for this key
                    }
                    Ordering::Less => {}
                }
            }
            entries.push((k, v));
        }
        if !inserted {
            entries.push((key.to_vec(), value.to_vec()));
        }

        let is_root = node.node_header.is_root();
        let refs: Vec<(&[u8], &[u8])> =
            entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
        let fkv = if fixed_kv { Some((fks, fvs)) } else { None };

        if fits(dev.block_size(), is_root, &refs, fixed_kv) {
            let new_paddr = alloc.allocate(dev)?;
            let block = build_node(
                dev.block_size(),
                node.header.oid,
                xid,
                subtype,
                0,
                is_root,
                fkv,
                storage_flags,
                &refs,
                node.info.map(|i| i.flags).unwrap_or(0),
            )?;
            dev.write_block(new_paddr, &block)?;
            return Ok(InsertOutcome::Updated(new_paddr));
        }

        // Split at the median (§4.6.5).
        let mid = refs.len() / 2;
        let (left, right) = refs.split_at(mid);
        let left_paddr = alloc.allocate(dev)?;
        let right_paddr = alloc.allocate(dev)?;
        let left_block = build_node(
            dev.block_size(),
            left_paddr,
            xid,
            subtype,
            0,
            false,
            fkv,
            storage_flags,
            left,
            0,
        )?;
        let right_block = build_node(
            dev.block_size(),
            right_paddr,
            xid,
            subtype,
            0,
            false,
            fkv,
            storage_flags,
            right,
            0,
        )?;
        dev.write_block(left_paddr, &left_block)?;
        dev.write_block(right_paddr, &right_block)?;
        let sep_key = right[0].0.to_vec();
        return Ok(InsertOutcome::Split(left_paddr, sep_key, right_paddr));
    }

    // Internal node: descend into the child covering `key`.
    let (idx, _) = binary_search(node, fks, cmp, key)?;
    let child_idx = idx.unwrap_or(0);
    let child_ref = node.child_ref(child_idx)?;
    let child_paddr = resolver.resolve(dev, child_ref)?;
    let child = read_node(dev, child_paddr)?;

    let child_outcome = insert_into(
        dev, alloc, &child, fixed_key_size, fixed_val_size, cmp, resolver, key, value, xid,
        subtype, storage_flags, fixed_kv,
    )?;

    let mut child_refs: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(node.nkeys() + 1);
    for i in 0..node.nkeys() {
        let k = node.key(i, fks)?.to_vec();
        let v = if i == child_idx {
            Vec::new() // placeholder, filled in below
        } else {
            node.raw_value(i, 8)?.to_vec()
        };
        child_refs.push((k, v));
    }

    match child_outcome {
        InsertOutcome::Updated(new_child_paddr) => {
            child_refs[child_idx].1 = new_child_paddr.to_le_bytes().to_vec();
        }
        InsertOutcome::Split(left_paddr, sep_key, right_paddr) => {
            child_refs[child_idx].1 = left_paddr.to_le_bytes().to_vec();
            child_refs.insert(child_idx + 1, (sep_key, right_paddr.to_le_bytes().to_vec()));
        }
    }

    let is_root = node.node_header.is_root();
    let refs: Vec<(&[u8], &[u8])> =
        child_refs.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
    let fkv = if fixed_kv { Some((fks, 8)) } else { None };

    if fits(dev.block_size(), is_root, &refs, fixed_kv) {
        let new_paddr = alloc.allocate(dev)?;
        let block = build_node(
            dev.block_size(),
            node.header.oid,
            xid,
            subtype,
            node.node_header.level,
            is_root,
            fkv,
            storage_flags,
            &refs,
            node.info.map(|i| i.flags).unwrap_or(0),
        )?;
        dev.write_block(new_paddr, &block)?;
        return Ok(InsertOutcome::Updated(new_paddr));
    }

    let mid = refs.len() / 2;
    let (left, right) = refs.split_at(mid);
    let left_paddr = alloc.allocate(dev)?;
    let right_paddr = alloc.allocate(dev)?;
    let left_block = build_node(
        dev.block_size(),
        left_paddr,
        xid,
        subtype,
        node.node_header.level,
        false,
        fkv,
        storage_flags,
        left,
        0,
    )?;
    let right_block = build_node(
        dev.block_size(),
        right_paddr,
        xid,
        subtype,
        node.node_header.level,
        false,
        fkv,
        storage_flags,
        right,
        0,
    )?;
    dev.write_block(left_paddr, &left_block)?;
    dev.write_block(right_paddr, &right_block)?;
    let sep_key = right[0].0.to_vec();
    Ok(InsertOutcome::Split(left_paddr, sep_key, right_paddr))
}

/// Delete `key` from the tree rooted at `root_paddr` (§4.6.6, BTO-4).
/// Underflow merging is not performed; APFS tolerates under-full nodes.
#[allow(clippy::too_many_arguments)]
pub fn delete(
    dev: &mut dyn BlockDevice,
    alloc: &mut dyn BlockAllocator,
    root_paddr: u64,
    fixed_key_size: u32,
    fixed_val_size: u32,
    cmp: &dyn Comparator,
    resolver: &mut dyn ChildResolver,
    key: &[u8],
    xid: u64,
) -> Result<u64> {
    let root = read_node(dev, root_paddr)?;
    let fixed_kv = root.node_header.is_fixed_kv();
    let subtype = root.header.subtype;
    let storage_flags = root.header.type_and_flags & OBJ_PHYSICAL;
    delete_from(
        dev, alloc, &root, fixed_key_size, fixed_val_size, cmp, resolver, key, xid, subtype,
        storage_flags, fixed_kv,
    )
}

#[allow(clippy::too_many_arguments)]
fn delete_from(
    dev: &mut dyn BlockDevice,
    alloc: &mut dyn BlockAllocator,
    node: &BTreeNode,
    fixed_key_size: u32,
    fixed_val_size: u32,
    cmp: &dyn Comparator,
    resolver: &mut dyn ChildResolver,
    key: &[u8],
    xid: u64,
    subtype: u32,
    storage_flags: u32,
    fixed_kv: bool,
) -> Result<u64> {
    let (fks, fvs) = node.fixed_sizes(fixed_key_size, fixed_val_size);
    let is_root = node.node_header.is_root();
    let fkv = |val_size: u32| if fixed_kv { Some((fks, val_size)) } else { None };

    if node.is_leaf() {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(node.nkeys());
        let mut found = false;
        for i in 0..node.nkeys() {
            let k = node.key(i, fks)?.to_vec();
            if cmp.compare(&k, key) == Ordering::Equal {
                found = true;
                continue;
            }
            let v = node.raw_value(i, fvs)?.to_vec();
            entries.push((k, v));
        }
        if !found {
            return Err(ApfsError::NotFound { oid: node.header.oid, xid });
        }
        let refs: Vec<(&[u8], &[u8])> =
            entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
        let new_paddr = alloc.allocate(dev)?;
        let block = build_node(
            dev.block_size(),
            node.header.oid,
            xid,
            subtype,
            0,
            is_root,
            fkv(fvs),
            storage_flags,
            &refs,
            node.info.map(|i| i.flags).unwrap_or(0),
        )?;
        dev.write_block(new_paddr, &block)?;
        return Ok(new_paddr);
    }

    let (idx, _) = binary_search(node, fks, cmp, key)?;
    let child_idx = idx.ok_or(ApfsError::NotFound { oid: node.header.oid, xid })?;
    let child_ref = node.child_ref(child_idx)?;
    let child_paddr = resolver.resolve(dev, child_ref)?;
    let child = read_node(dev, child_paddr)?;
    let new_child_paddr = delete_from(
        dev, alloc, &child, fixed_key_size, fixed_val_size, cmp, resolver, key, xid, subtype,
        storage_flags, fixed_kv,
    )?;

    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(node.nkeys());
    for i in 0..node.nkeys() {
        let k = node.key(i, fks)?.to_vec();
        let v = if i == child_idx {
            new_child_paddr.to_le_bytes().to_vec()
        } else {
            node.raw_value(i, 8)?.to_vec()
        };
        entries.push((k, v));
    }
    let refs: Vec<(&[u8], &[u8])> =
        entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
    let new_paddr = alloc.allocate(dev)?;
    let block = build_node(
        dev.block_size(),
        node.header.oid,
        xid,
        subtype,
        node.node_header.level,
        is_root,
        fkv(8),
        storage_flags,
        &refs,
        node.info.map(|i| i.flags).unwrap_or(0),
    )?;
    dev.write_block(new_paddr, &block)?;
    Ok(new_paddr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemBlockDevice;
    use crate::object::OBJ_PHYSICAL;
    use std::cmp::Ordering as Ord2;

    struct TestAllocator {
        next: u64,
    }
    impl BlockAllocator for TestAllocator {
        fn allocate(&mut self, _dev: &mut dyn BlockDevice) -> Result<u64> {
            let p = self.next;
            self.next += 1;
            Ok(p)
        }
        fn free(&mut self, _dev: &mut dyn BlockDevice, _paddr: u64) -> Result<()> {
            Ok(())
        }
    }

    fn byte_cmp(a: &[u8], b: &[u8]) -> Ord2 {
        a.cmp(b)
    }

    fn empty_root(dev: &mut MemBlockDevice) -> u64 {
        let block = build_node(
            dev.block_size(),
            2,
            1,
            0,
            0,
            true,
            None,
            OBJ_PHYSICAL,
            &[],
            BTREE_PHYSICAL,
        )
        .unwrap();
        dev.write_block(0, &block).unwrap();
        0
    }

    #[test]
    fn empty_root_range_scan_is_empty() {
        let mut dev = MemBlockDevice::new(4096, 16);
        let root = empty_root(&mut dev);
        let mut resolver = PhysicalResolver;
        let results = range(&mut dev, root, 0, 0, &byte_cmp, &mut resolver, None, None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn insert_then_lookup_returns_value() {
        let mut dev = MemBlockDevice::new(4096, 64);
        let mut root = empty_root(&mut dev);
        let mut alloc = TestAllocator { next: 10 };
        let mut resolver = PhysicalResolver;

        root =
            insert(&mut dev, &mut alloc, root, 0, 0, &byte_cmp, &mut resolver, b"k1", b"v1", 2, 2)
                .unwrap();
        let v = lookup(&mut dev, root, 0, 0, &byte_cmp, &mut resolver, b"k1").unwrap();
        assert_eq!(v, Some(b"v1".to_vec()));
    }

    #[test]
    fn insert_ordering_ascending_s3() {
        let mut dev = MemBlockDevice::new(4096, 64);
        let mut root = empty_root(&mut dev);
        let mut alloc = TestAllocator { next: 10 };
        let mut resolver = PhysicalResolver;

        for k in [0x03u8, 0x01, 0x02] {
            root = insert(
                &mut dev, &mut alloc, root, 0, 0, &byte_cmp, &mut resolver, &[k], &[k], 2, 2,
            )
            .unwrap();
            let scanned =
                range(&mut dev, root, 0, 0, &byte_cmp, &mut resolver, None, None).unwrap();
            let keys: Vec<u8> = scanned.iter().map(|(k, _)| k[0]).collect();
            let mut sorted = keys.clone();
            sorted.sort();
            assert_eq!(keys, sorted, "range scan must stay in ascending order after each insert");
        }

        let scanned = range(&mut dev, root, 0, 0, &byte_cmp, &mut resolver, None, None).unwrap();
        let keys: Vec<u8> = scanned.iter().map(|(k, _)| k[0]).collect();
        assert_eq!(keys, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn delete_then_lookup_not_found() {
        let mut dev = MemBlockDevice::new(4096, 64);
        let mut root = empty_root(&mut dev);
        let mut alloc = TestAllocator { next: 10 };
        let mut resolver = PhysicalResolver;

        root =
            insert(&mut dev, &mut alloc, root, 0, 0, &byte_cmp, &mut resolver, b"k1", b"v1", 2, 2)
                .unwrap();
        root = delete(&mut dev, &mut alloc, root, 0, 0, &byte_cmp, &mut resolver, b"k1", 3).unwrap();
        let v = lookup(&mut dev, root, 0, 0, &byte_cmp, &mut resolver, b"k1").unwrap();
        assert_eq!(v, None);
    }

    #[test]
    fn insert_overwrites_existing_key() {
        let mut dev = MemBlockDevice::new(4096, 64);
        let mut root = empty_root(&mut dev);
        let mut alloc = TestAllocator { next: 10 };
        let mut resolver = PhysicalResolver;

        root =
            insert(&mut dev, &mut alloc, root, 0, 0, &byte_cmp, &mut resolver, b"k1", b"v1", 2, 2)
                .unwrap();
        root =
            insert(&mut dev, &mut alloc, root, 0, 0, &byte_cmp, &mut resolver, b"k1", b"v2", 2, 3)
                .unwrap();
        let v = lookup(&mut dev, root, 0, 0, &byte_cmp, &mut resolver, b"k1").unwrap();
        assert_eq!(v, Some(b"v2".to_vec()));
    }

    #[test]
    fn many_inserts_trigger_a_split_and_stay_sorted() {
        let mut dev = MemBlockDevice::new(4096, 4096);
        let mut root = empty_root(&mut dev);
        let mut alloc = TestAllocator { next: 100 };
        let mut resolver = PhysicalResolver;

        let mut expected: Vec<u32> = Vec::new();
        for i in 0..80u32 {
            let key = i.to_be_bytes(); // big-endian so byte order == numeric order
            let val = [0xAAu8; 28];
            root = insert(
                &mut dev, &mut alloc, root, 0, 0, &byte_cmp, &mut resolver, &key, &val, 2, 2,
            )
            .unwrap();
            expected.push(i);
        }

        let scanned = range(&mut dev, root, 0, 0, &byte_cmp, &mut resolver, None, None).unwrap();
        let keys: Vec<u32> = scanned
            .iter()
            .map(|(k, _)| u32::from_be_bytes(k.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn range_cursor_matches_eager_scan() {
        let mut dev = MemBlockDevice::new(4096, 4096);
        let mut root = empty_root(&mut dev);
        let mut alloc = TestAllocator { next: 200 };
        let mut resolver = PhysicalResolver;

        for i in 0..40u32 {
            let key = i.to_be_bytes();
            let val = [i as u8; 8];
            root = insert(
                &mut dev, &mut alloc, root, 0, 0, &byte_cmp, &mut resolver, &key, &val, 2, 2,
            )
            .unwrap();
        }

        let eager = range(&mut dev, root, 0, 0, &byte_cmp, &mut resolver, None, None).unwrap();

        let mut cursor = RangeCursor::new(&mut dev, root, 0, 0, None).unwrap();
        let mut via_cursor = Vec::new();
        while let Some(pair) = cursor.next(&mut dev, &byte_cmp, &mut resolver).unwrap() {
            via_cursor.push(pair);
        }

        assert_eq!(eager, via_cursor);
    }
}
