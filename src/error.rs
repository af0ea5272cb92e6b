// Error types shared by the cache, snapshot codec and persistence layer
use std::io;
use std::path::PathBuf;

/// Errors surfaced by cache construction and snapshot import/export.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache size must be bigger than 1, got {0}")]
    InvalidCapacity(usize),

    #[error("snapshot decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("snapshot validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("snapshot encode error: {0}")]
    Encode(#[source] bincode::Error),

    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// True when the snapshot file simply does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

/// The snapshot bytes are structurally broken.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("snapshot truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("not a cache snapshot (bad magic)")]
    BadMagic,

    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u16),

    #[error("payload length {declared} does not match {actual} available bytes")]
    LengthMismatch { declared: u64, actual: usize },

    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    #[error("malformed payload: {0}")]
    Malformed(#[source] bincode::Error),
}

/// The snapshot decoded cleanly but its content is unusable.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid cache size in import: {0}")]
    CapacityTooSmall(u64),

    #[error("cache size {0} does not fit this platform")]
    CapacityOverflow(u64),
}

/// Reasons a persistence path is rejected.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("resolve absolute path: {0}")]
    Absolute(#[source] io::Error),

    #[error("path has no file name: {}", .0.display())]
    NoFileName(PathBuf),

    #[error("resolve parent symlinks for {}: {source}", .path.display())]
    ResolveParent {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("eval symlinks for {}: {source}", .path.display())]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parent folder does not exist: {}", .0.display())]
    ParentMissing(PathBuf),

    #[error("parent path is not a folder: {}", .0.display())]
    ParentNotDirectory(PathBuf),

    #[error("stat parent folder {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parent folder not writable: {}: {source}", .path.display())]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("remove probe file: {0}")]
    ProbeCleanup(#[source] io::Error),
}

/// A flush attempt failed at the named step. The cache stays dirty.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("snapshot encode error: {0}")]
    Snapshot(#[source] CacheError),

    #[error("snapshot target is not a file path: {}", .0.display())]
    InvalidTarget(PathBuf),

    #[error("snapshot temp file error: {0}")]
    TempFile(#[source] io::Error),

    #[error("snapshot write error: {0}")]
    Write(#[source] io::Error),

    #[error("snapshot fsync error: {0}")]
    Sync(#[source] io::Error),

    #[error("snapshot rename error: {0}")]
    Rename(#[source] io::Error),
}
