use thiserror::Error;

/// Error taxonomy surfaced to callers of the core engine.
///
/// Checksum failures are reported against the specific physical address that
/// failed; they do not abort a mount unless the failing block was the only
/// candidate on the superblock resolution path. `NotFound` is a normal
/// outcome of a lookup, not a fault.
#[derive(Error, Debug)]
pub enum ApfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch at paddr {paddr}")]
    ChecksumMismatch { paddr: u64 },

    #[error("invalid magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("malformed object: {0}")]
    MalformedObject(String),

    #[error("invalid B-tree: {0}")]
    InvalidBTree(String),

    #[error("invalid storage class in type field 0x{0:08X}")]
    InvalidStorageClass(u32),

    #[error("incompatible features: 0x{0:016X}")]
    IncompatibleFeatures(u64),

    #[error("checkpoint descriptor or data ring is non-contiguous (tree-referenced)")]
    UnsupportedNonContiguousRing,

    #[error("no valid checkpoint found in descriptor ring")]
    NoValidCheckpoint,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    #[error("no volume found in container")]
    NoVolume,

    #[error("object oid={oid} xid={xid} not found")]
    NotFound { oid: u64, xid: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("paddr {0} is out of range for this device")]
    OutOfRange(u64),

    #[error("space manager exhausted: no free blocks remain")]
    NoSpace,

    #[error("paddr {0} is already free")]
    AlreadyFree(u64),

    #[error("paddr {0} is not tracked by any chunk")]
    AddressNotTracked(u64),

    #[error("write at xid {xid} is at or before the most recent snapshot xid {snap_xid}")]
    SnapshotViolation { xid: u64, snap_xid: u64 },

    #[error("device is read-only")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, ApfsError>;
